//! The stable numeric error code enumeration shared with wallets. Clients
//! key their retry/abort logic on the code; the hint is for humans only.

use serde::{Deserialize, Serialize};

/// Error codes carried in every failure reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ErrorCode {
    None = 0,
    /// Generic invalid request
    Invalid = 1,
    /// A required parameter is missing
    ParameterMissing = 13,
    /// A parameter is present but unparseable
    ParameterMalformed = 14,

    /// Transient database error survived the retry budget
    DbSoftFailure = 1001,
    /// Hard database error
    DbHardFailure = 1002,
    /// Failed to serialize a JSON reply
    JsonInvalid = 1003,

    /// Order with this id already exists
    OrderIdAlreadyExists = 2001,
    /// Order/proposal not found
    ProposalLookupNotFound = 2002,
    /// Stored nonce differs from the supplied one
    ProposalNonceMismatch = 2003,

    /// Contract terms for the pay request not found
    PayOrderNotFound = 2100,
    /// Supplied contract hash does not match the stored terms
    PayContractHashMismatch = 2101,
    /// A coin references a denomination the exchange does not list
    PayDenominationUnknown = 2102,
    /// Denomination signature on a coin is invalid
    PayDenominationSignatureInvalid = 2103,
    /// Coin signature over the deposit permission is invalid
    PayCoinSignatureInvalid = 2104,
    /// Coin contributions do not cover the contract amount
    PayAmountInsufficient = 2105,
    /// Deposit fees exceed the contract's fee cap
    PayFeesExceedCap = 2106,
    /// The exchange rejected a coin as already spent
    PayCoinDoubleSpend = 2107,
    /// The exchange could not be reached or has no keys
    PayExchangeDown = 2108,
    /// The exchange replied with an error
    PayExchangeFailed = 2109,
    /// The order was aborted; no further deposits are accepted
    PayAborted = 2110,
    /// Wrong merchant public key for this instance
    PayMerchantMismatch = 2111,
    /// The order's pay deadline has passed
    PayDeadlineExpired = 2112,

    /// Poll-payment: contract hash mismatch
    PollContractHashMismatch = 2200,

    /// Instance has no tipping reserve configured
    TipInstanceDisabled = 2300,
    /// Tipping reserve lacks the funds for this authorization
    TipInsufficientFunds = 2301,
    /// Unknown tip id
    TipIdUnknown = 2302,
    /// Pickup exceeds the remaining tip amount
    TipPickupNoFunds = 2303,
    /// Planchet references an unknown denomination
    TipPickupDenominationUnknown = 2304,
    /// The tip exchange could not be reached
    TipPickupExchangeDown = 2305,
    /// Planchet amounts overflow
    TipPickupAmountOverflow = 2306,
    /// The exchange's reserve status was unusable
    TipQueryReserveUnknown = 2307,
    /// The tip authorization expired
    TipExpired = 2308,

    /// Refund request references an unknown order
    RefundOrderNotFound = 2400,
    /// Refund would exceed the deposited amount
    RefundExceedsDeposit = 2401,

    /// Unknown merchant instance
    InstanceUnknown = 2500,

    /// Internal invariant violation
    InternalInvariantFailure = 9000,
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        *self as u32
    }
}

impl From<ErrorCode> for u32 {
    fn from(ec: ErrorCode) -> u32 {
        ec as u32
    }
}

impl TryFrom<u32> for ErrorCode {
    type Error = String;

    fn try_from(v: u32) -> Result<Self, Self::Error> {
        use ErrorCode::*;
        let ec = match v {
            0 => None,
            1 => Invalid,
            13 => ParameterMissing,
            14 => ParameterMalformed,
            1001 => DbSoftFailure,
            1002 => DbHardFailure,
            1003 => JsonInvalid,
            2001 => OrderIdAlreadyExists,
            2002 => ProposalLookupNotFound,
            2003 => ProposalNonceMismatch,
            2100 => PayOrderNotFound,
            2101 => PayContractHashMismatch,
            2102 => PayDenominationUnknown,
            2103 => PayDenominationSignatureInvalid,
            2104 => PayCoinSignatureInvalid,
            2105 => PayAmountInsufficient,
            2106 => PayFeesExceedCap,
            2107 => PayCoinDoubleSpend,
            2108 => PayExchangeDown,
            2109 => PayExchangeFailed,
            2110 => PayAborted,
            2111 => PayMerchantMismatch,
            2112 => PayDeadlineExpired,
            2200 => PollContractHashMismatch,
            2300 => TipInstanceDisabled,
            2301 => TipInsufficientFunds,
            2302 => TipIdUnknown,
            2303 => TipPickupNoFunds,
            2304 => TipPickupDenominationUnknown,
            2305 => TipPickupExchangeDown,
            2306 => TipPickupAmountOverflow,
            2307 => TipQueryReserveUnknown,
            2308 => TipExpired,
            2400 => RefundOrderNotFound,
            2401 => RefundExceedsDeposit,
            2500 => InstanceUnknown,
            9000 => InternalInvariantFailure,
            other => return Err(format!("unknown error code {}", other)),
        };
        Ok(ec)
    }
}

/// The JSON error envelope every failing endpoint returns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub code: ErrorCode,
    pub hint: String,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, hint: impl Into<String>) -> Self {
        ErrorEnvelope {
            code,
            hint: hint.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_round_trip_through_serde() {
        let env = ErrorEnvelope::new(ErrorCode::ProposalNonceMismatch, "mismatched nonce");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("2003"));
        let back: ErrorEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::ProposalNonceMismatch);
    }

    #[test]
    fn test_unknown_code_rejected() {
        assert!(serde_json::from_str::<ErrorCode>("424242").is_err());
    }

    #[test]
    fn test_code_values_are_stable() {
        assert_eq!(ErrorCode::ParameterMissing.code(), 13);
        assert_eq!(ErrorCode::TipPickupNoFunds.code(), 2303);
        assert_eq!(ErrorCode::PayCoinDoubleSpend.code(), 2107);
    }
}
