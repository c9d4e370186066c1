use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A protocol timestamp: milliseconds since the epoch, with a distinguished
/// "never" value. Serializes as `{"t_ms": <ms>}` or `{"t_ms": "never"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const NEVER: Timestamp = Timestamp(u64::MAX);

    pub fn from_millis(ms: u64) -> Self {
        Timestamp(ms)
    }

    pub fn now() -> Self {
        let ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Timestamp(ms)
    }

    pub fn is_never(&self) -> bool {
        self.0 == u64::MAX
    }

    pub fn millis(&self) -> u64 {
        self.0
    }

    /// Saturating addition; "never" absorbs everything.
    pub fn saturating_add(&self, d: Duration) -> Timestamp {
        if self.is_never() {
            return *self;
        }
        Timestamp(self.0.saturating_add(d.as_millis() as u64))
    }

    /// Whether this instant is in the past
    pub fn is_expired(&self) -> bool {
        !self.is_never() && *self < Timestamp::now()
    }

    /// Big-endian milliseconds, used inside signature purposes
    pub fn to_purpose_bytes(&self) -> [u8; 8] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            write!(f, "never")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct TimestampRepr {
    t_ms: serde_json::Value,
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let t_ms = if self.is_never() {
            serde_json::Value::String("never".to_string())
        } else {
            serde_json::Value::Number(self.0.into())
        };
        TimestampRepr { t_ms }.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = TimestampRepr::deserialize(deserializer)?;
        match repr.t_ms {
            serde_json::Value::String(s) if s == "never" => Ok(Timestamp::NEVER),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Timestamp)
                .ok_or_else(|| D::Error::custom("t_ms out of range")),
            other => Err(D::Error::custom(format!("bad t_ms: {}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_round_trip() {
        let json = serde_json::to_string(&Timestamp::NEVER).unwrap();
        assert_eq!(json, r#"{"t_ms":"never"}"#);
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert!(back.is_never());
    }

    #[test]
    fn test_millis_round_trip() {
        let t = Timestamp::from_millis(1_234_567);
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"t_ms":1234567}"#);
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn test_saturating_add() {
        let t = Timestamp::from_millis(1000);
        assert_eq!(
            t.saturating_add(Duration::from_secs(1)),
            Timestamp::from_millis(2000)
        );
        assert!(Timestamp::NEVER.saturating_add(Duration::from_secs(1)).is_never());
    }

    #[test]
    fn test_expiry() {
        assert!(Timestamp::from_millis(1).is_expired());
        assert!(!Timestamp::NEVER.is_expired());
        assert!(!Timestamp::now()
            .saturating_add(Duration::from_secs(3600))
            .is_expired());
    }
}
