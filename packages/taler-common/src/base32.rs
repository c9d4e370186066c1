//! Crockford base32, the encoding used for keys, signatures and hashes on
//! the wire. Decoding folds lowercase and the usual confusables (I/L -> 1,
//! O -> 0); `U` is not part of the alphabet.

use data_encoding::{Encoding, Specification};
use lazy_static::lazy_static;

lazy_static! {
    static ref CROCKFORD: Encoding = {
        let mut spec = Specification::new();
        spec.symbols.push_str("0123456789ABCDEFGHJKMNPQRSTVWXYZ");
        spec.translate
            .from
            .push_str("abcdefghjkmnpqrstvwxyzILOilo");
        spec.translate.to.push_str("ABCDEFGHJKMNPQRSTVWXYZ110110");
        spec.encoding().expect("static base32 spec is valid")
    };
}

/// Errors from decoding wire strings
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid base32 string")]
pub struct Base32Error;

pub fn encode(data: &[u8]) -> String {
    CROCKFORD.encode(data)
}

pub fn decode(s: &str) -> Result<Vec<u8>, Base32Error> {
    CROCKFORD.decode(s.as_bytes()).map_err(|_| Base32Error)
}

/// Decode into a fixed-size array, rejecting any other length.
pub fn decode_fixed<const N: usize>(s: &str) -> Result<[u8; N], Base32Error> {
    let bytes = decode(s)?;
    bytes.try_into().map_err(|_| Base32Error)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let data = [0u8, 1, 2, 3, 250, 251, 252, 253, 254, 255];
        let s = encode(&data);
        assert_eq!(decode(&s).unwrap(), data);
    }

    #[test]
    fn test_case_folding_and_confusables() {
        let data = b"merchant";
        let s = encode(data);
        assert_eq!(decode(&s.to_lowercase()).unwrap(), data);
        let folded: String = s
            .chars()
            .map(|c| match c {
                '1' => 'I',
                '0' => 'O',
                c => c,
            })
            .collect();
        assert_eq!(decode(&folded).unwrap(), data);
    }

    #[test]
    fn test_rejects_invalid() {
        assert!(decode("U").is_err());
        assert!(decode("!!").is_err());
    }

    #[test]
    fn test_fixed_length() {
        let data = [7u8; 32];
        let s = encode(&data);
        let back: [u8; 32] = decode_fixed(&s).unwrap();
        assert_eq!(back, data);
        assert!(decode_fixed::<16>(&s).is_err());
    }
}
