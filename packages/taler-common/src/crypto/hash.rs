use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha512};

use crate::base32;

/// A SHA-512 hash (64 bytes). Serializes as Crockford base32.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha512Hash(pub [u8; 64]);

impl Sha512Hash {
    /// Hash a byte string
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(data);
        Sha512Hash(hasher.finalize().into())
    }

    /// Hash the concatenation of several byte strings
    pub fn compute_concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let mut hasher = Sha512::new();
        for part in parts {
            hasher.update(part);
        }
        Sha512Hash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Sha512Hash)
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.0)
    }

    pub fn from_base32(s: &str) -> Result<Self, base32::Base32Error> {
        base32::decode_fixed::<64>(s).map(Sha512Hash)
    }
}

impl fmt::Debug for Sha512Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sha512Hash({})", &self.to_base32()[..16])
    }
}

impl fmt::Display for Sha512Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

impl Serialize for Sha512Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for Sha512Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Sha512Hash::from_base32(&s).map_err(|_| D::Error::custom("invalid hash encoding"))
    }
}

/// Hash a contract (or any JSON document) in canonical form: object keys
/// sorted, compact separators. serde_json's map is ordered by key, so
/// serializing a `Value` built through it is already canonical.
pub fn hash_json_contract(value: &serde_json::Value) -> Sha512Hash {
    let canonical = canonical_json_bytes(value);
    Sha512Hash::compute(&canonical)
}

/// Canonical (sorted-key, compact) serialization of a JSON value
pub fn canonical_json_bytes(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(&sort_keys(value)).unwrap_or_default()
}

fn sort_keys(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                sorted.insert(key.clone(), sort_keys(&map[key]));
            }
            serde_json::Value::Object(sorted)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(sort_keys).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_hash_is_64_bytes_and_stable() {
        let h1 = Sha512Hash::compute(b"contract");
        let h2 = Sha512Hash::compute(b"contract");
        assert_eq!(h1, h2);
        assert_ne!(h1, Sha512Hash::compute(b"contract2"));
    }

    #[test]
    fn test_concat_matches_manual() {
        let joined = Sha512Hash::compute(b"abcdef");
        let parts = Sha512Hash::compute_concat([b"abc".as_slice(), b"def".as_slice()]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn test_base32_round_trip() {
        let h = Sha512Hash::compute(b"x");
        let s = h.to_base32();
        assert_eq!(Sha512Hash::from_base32(&s).unwrap(), h);
    }

    #[test]
    fn test_canonical_json_key_order_does_not_matter() {
        let a = json!({"b": 1, "a": {"z": true, "y": [1, 2]}});
        let b = json!({"a": {"y": [1, 2], "z": true}, "b": 1});
        assert_eq!(hash_json_contract(&a), hash_json_contract(&b));
    }

    #[test]
    fn test_canonical_json_value_changes_hash() {
        let a = json!({"amount": "KUDOS:5"});
        let b = json!({"amount": "KUDOS:6"});
        assert_ne!(hash_json_contract(&a), hash_json_contract(&b));
    }

    #[test]
    fn test_canonical_form_is_compact_and_sorted() {
        let v = json!({"b": 1, "a": 2});
        assert_eq!(canonical_json_bytes(&v), br#"{"a":2,"b":1}"#.to_vec());
    }
}
