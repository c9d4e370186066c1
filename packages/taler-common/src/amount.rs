use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Smallest representable unit: one fraction is 1e-8 of the base unit.
pub const FRACTION_BASE: u32 = 100_000_000;

/// Longest accepted currency code, per the wire protocol.
pub const MAX_CURRENCY_LEN: usize = 11;

/// A currency amount in `"CUR:value.fraction"` form.
///
/// `fraction` is always normalized to `0..FRACTION_BASE`; arithmetic is
/// checked and currency-aware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Amount {
    pub currency: String,
    pub value: u64,
    pub fraction: u32,
}

/// Errors from parsing or combining amounts
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AmountError {
    #[error("malformed amount string: {0}")]
    Malformed(String),
    #[error("currency mismatch: {0} vs {1}")]
    CurrencyMismatch(String, String),
    #[error("amount overflow")]
    Overflow,
    #[error("amount would be negative")]
    Negative,
}

impl Amount {
    /// Zero in the given currency
    pub fn zero(currency: &str) -> Self {
        Amount {
            currency: currency.to_string(),
            value: 0,
            fraction: 0,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.value == 0 && self.fraction == 0
    }

    /// Checked addition; both operands must share a currency.
    pub fn checked_add(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.require_same_currency(other)?;
        let mut fraction = self.fraction as u64 + other.fraction as u64;
        let carry = fraction / FRACTION_BASE as u64;
        fraction %= FRACTION_BASE as u64;
        let value = self
            .value
            .checked_add(other.value)
            .and_then(|v| v.checked_add(carry))
            .ok_or(AmountError::Overflow)?;
        Ok(Amount {
            currency: self.currency.clone(),
            value,
            fraction: fraction as u32,
        })
    }

    /// Checked subtraction (`self - other`); fails if the result would be negative.
    pub fn checked_sub(&self, other: &Amount) -> Result<Amount, AmountError> {
        self.require_same_currency(other)?;
        let self_units = self.as_units().ok_or(AmountError::Overflow)?;
        let other_units = other.as_units().ok_or(AmountError::Overflow)?;
        let diff = self_units.checked_sub(other_units).ok_or(AmountError::Negative)?;
        Ok(Amount {
            currency: self.currency.clone(),
            value: (diff / FRACTION_BASE as u128) as u64,
            fraction: (diff % FRACTION_BASE as u128) as u32,
        })
    }

    /// Currency-aware comparison
    pub fn cmp_checked(&self, other: &Amount) -> Result<Ordering, AmountError> {
        self.require_same_currency(other)?;
        Ok(self
            .value
            .cmp(&other.value)
            .then(self.fraction.cmp(&other.fraction)))
    }

    /// Total number of fraction units; `None` on overflow of the intermediate.
    fn as_units(&self) -> Option<u128> {
        (self.value as u128)
            .checked_mul(FRACTION_BASE as u128)?
            .checked_add(self.fraction as u128)
    }

    fn require_same_currency(&self, other: &Amount) -> Result<(), AmountError> {
        if self.currency != other.currency {
            return Err(AmountError::CurrencyMismatch(
                self.currency.clone(),
                other.currency.clone(),
            ));
        }
        Ok(())
    }

    /// Fixed-layout binary encoding used inside signature purposes:
    /// value (u64 BE), fraction (u32 BE), currency (12 bytes, NUL padded).
    pub fn to_purpose_bytes(&self) -> [u8; 24] {
        let mut out = [0u8; 24];
        out[0..8].copy_from_slice(&self.value.to_be_bytes());
        out[8..12].copy_from_slice(&self.fraction.to_be_bytes());
        let cur = self.currency.as_bytes();
        out[12..12 + cur.len().min(12)].copy_from_slice(&cur[..cur.len().min(12)]);
        out
    }
}

impl FromStr for Amount {
    type Err = AmountError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AmountError::Malformed(s.to_string());
        let (currency, number) = s.split_once(':').ok_or_else(malformed)?;
        if currency.is_empty()
            || currency.len() > MAX_CURRENCY_LEN
            || !currency.chars().all(|c| c.is_ascii_alphabetic())
        {
            return Err(malformed());
        }
        let (value_str, frac_str) = match number.split_once('.') {
            Some((v, f)) => (v, f),
            None => (number, ""),
        };
        if value_str.is_empty() || !value_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }
        let value: u64 = value_str.parse().map_err(|_| malformed())?;
        if frac_str.len() > 8 || !frac_str.chars().all(|c| c.is_ascii_digit()) {
            return Err(malformed());
        }
        let mut fraction: u32 = 0;
        let mut digit_value = FRACTION_BASE / 10;
        for c in frac_str.chars() {
            fraction += (c as u32 - '0' as u32) * digit_value;
            digit_value /= 10;
        }
        Ok(Amount {
            currency: currency.to_uppercase(),
            value,
            fraction,
        })
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fraction == 0 {
            return write!(f, "{}:{}", self.currency, self.value);
        }
        let mut frac = self.fraction;
        let mut digits = String::new();
        while frac != 0 {
            digits.push(char::from_digit(frac / (FRACTION_BASE / 10), 10).unwrap_or('0'));
            frac = (frac % (FRACTION_BASE / 10)) * 10;
        }
        write!(f, "{}:{}.{}", self.currency, self.value, digits)
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Amount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_format() {
        let a: Amount = "KUDOS:5.00".parse().unwrap();
        assert_eq!(a.currency, "KUDOS");
        assert_eq!(a.value, 5);
        assert_eq!(a.fraction, 0);
        assert_eq!(a.to_string(), "KUDOS:5");

        let b: Amount = "EUR:0.5".parse().unwrap();
        assert_eq!(b.fraction, FRACTION_BASE / 2);
        assert_eq!(b.to_string(), "EUR:0.5");

        let c: Amount = "EUR:1.00000001".parse().unwrap();
        assert_eq!(c.fraction, 1);
        assert_eq!(c.to_string(), "EUR:1.00000001");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("KUDOS".parse::<Amount>().is_err());
        assert!(":5".parse::<Amount>().is_err());
        assert!("KUDOS:".parse::<Amount>().is_err());
        assert!("KUDOS:1.123456789".parse::<Amount>().is_err());
        assert!("KUDOS:-1".parse::<Amount>().is_err());
        assert!("TOOLONGCURRENCY:1".parse::<Amount>().is_err());
        assert!("KU DOS:1".parse::<Amount>().is_err());
    }

    #[test]
    fn test_add_with_carry() {
        let a: Amount = "EUR:1.75".parse().unwrap();
        let b: Amount = "EUR:2.50".parse().unwrap();
        let sum = a.checked_add(&b).unwrap();
        assert_eq!(sum.to_string(), "EUR:4.25");
    }

    #[test]
    fn test_add_overflow_detected() {
        let a = Amount {
            currency: "EUR".into(),
            value: u64::MAX,
            fraction: 0,
        };
        let b: Amount = "EUR:1".parse().unwrap();
        assert_eq!(a.checked_add(&b), Err(AmountError::Overflow));
    }

    #[test]
    fn test_sub_and_negative() {
        let a: Amount = "EUR:2.25".parse().unwrap();
        let b: Amount = "EUR:1.50".parse().unwrap();
        assert_eq!(a.checked_sub(&b).unwrap().to_string(), "EUR:0.75");
        assert_eq!(b.checked_sub(&a), Err(AmountError::Negative));
    }

    #[test]
    fn test_currency_mismatch() {
        let a: Amount = "EUR:1".parse().unwrap();
        let b: Amount = "USD:1".parse().unwrap();
        assert!(matches!(
            a.checked_add(&b),
            Err(AmountError::CurrencyMismatch(_, _))
        ));
        assert!(a.cmp_checked(&b).is_err());
    }

    #[test]
    fn test_ordering() {
        let small: Amount = "EUR:1.50".parse().unwrap();
        let big: Amount = "EUR:2".parse().unwrap();
        assert_eq!(small.cmp_checked(&big).unwrap(), Ordering::Less);
        assert_eq!(big.cmp_checked(&small).unwrap(), Ordering::Greater);
        assert_eq!(small.cmp_checked(&small).unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_purpose_bytes_layout() {
        let a: Amount = "KUDOS:5.5".parse().unwrap();
        let bytes = a.to_purpose_bytes();
        assert_eq!(&bytes[0..8], &5u64.to_be_bytes());
        assert_eq!(&bytes[8..12], &(FRACTION_BASE / 2).to_be_bytes());
        assert_eq!(&bytes[12..17], b"KUDOS");
        assert_eq!(&bytes[17..24], &[0u8; 7]);
    }

    #[test]
    fn test_serde_round_trip() {
        let a: Amount = "KUDOS:3.25".parse().unwrap();
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, "\"KUDOS:3.25\"");
        let back: Amount = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);
    }
}
