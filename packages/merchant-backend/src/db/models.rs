use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;

use taler_common::amount::{Amount, AmountError};

// Amounts are stored in wire form ("CUR:value.fraction") as VARCHAR and
// parsed with checked arithmetic on the way out. Hashes and keys are raw
// BYTEA; length checks live in the schema.

/// A bare order awaiting its first proposal lookup
#[derive(Debug, Clone, FromRow)]
pub struct OrderRow {
    pub order_id: String,
    pub merchant_pub: Vec<u8>,
    pub order_json: String,
    pub created_at: DateTime<Utc>,
}

/// Signed contract terms, promoted from an order
#[derive(Debug, Clone, FromRow)]
pub struct ContractTermsRow {
    pub order_id: String,
    pub merchant_pub: Vec<u8>,
    pub contract_json: String,
    pub h_contract: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub paid: bool,
    pub aborted: bool,
}

impl ContractTermsRow {
    pub fn contract(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_str(&self.contract_json)
    }
}

/// One coin's outcome against one contract
#[derive(Debug, Clone, FromRow)]
pub struct DepositRow {
    pub h_contract: Vec<u8>,
    pub coin_pub: Vec<u8>,
    pub exchange_url: String,
    pub amount_with_fee: String,
    pub deposit_fee: String,
    pub refund_fee: String,
    pub exchange_sig: Option<Vec<u8>>,
    pub exchange_pub: Option<Vec<u8>>,
    pub rejected: bool,
    pub rejection_proof: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl DepositRow {
    pub fn amount_with_fee(&self) -> Result<Amount, AmountError> {
        self.amount_with_fee.parse()
    }

    pub fn refund_fee(&self) -> Result<Amount, AmountError> {
        self.refund_fee.parse()
    }
}

/// For inserting a successful deposit
#[derive(Debug, Clone)]
pub struct NewDeposit {
    pub h_contract: Vec<u8>,
    pub coin_pub: Vec<u8>,
    pub exchange_url: String,
    pub amount_with_fee: String,
    pub deposit_fee: String,
    pub refund_fee: String,
    pub exchange_sig: Vec<u8>,
    pub exchange_pub: Vec<u8>,
}

/// One refund increment for one coin
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct RefundRow {
    pub rtransaction_id: i64,
    pub h_contract: Vec<u8>,
    pub coin_pub: Vec<u8>,
    pub exchange_url: String,
    pub reason: String,
    pub refund_amount: String,
    pub refund_fee: String,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

impl RefundRow {
    pub fn refund_amount(&self) -> Result<Amount, AmountError> {
        self.refund_amount.parse()
    }
}

/// For inserting a refund increment
#[derive(Debug, Clone)]
pub struct NewRefund {
    pub h_contract: Vec<u8>,
    pub coin_pub: Vec<u8>,
    pub exchange_url: String,
    pub reason: String,
    pub refund_amount: String,
    pub refund_fee: String,
}

/// Ledger mirror of a tipping reserve at the exchange
#[derive(Debug, Clone, FromRow)]
pub struct TipReserveRow {
    pub reserve_priv: Vec<u8>,
    pub exchange_url: String,
    pub expiration: DateTime<Utc>,
    pub amount_deposited: String,
    pub amount_withdrawn: String,
    pub amount_authorized: String,
}

impl TipReserveRow {
    pub fn amount_deposited(&self) -> Result<Amount, AmountError> {
        self.amount_deposited.parse()
    }

    pub fn amount_withdrawn(&self) -> Result<Amount, AmountError> {
        self.amount_withdrawn.parse()
    }

    pub fn amount_authorized(&self) -> Result<Amount, AmountError> {
        self.amount_authorized.parse()
    }
}

/// One authorized tip
#[derive(Debug, Clone, FromRow)]
pub struct TipRow {
    pub tip_id: Vec<u8>,
    pub reserve_priv: Vec<u8>,
    pub exchange_url: String,
    pub justification: String,
    pub amount: String,
    pub amount_left: String,
    pub expiration: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl TipRow {
    pub fn amount(&self) -> Result<Amount, AmountError> {
        self.amount.parse()
    }

    pub fn amount_left(&self) -> Result<Amount, AmountError> {
        self.amount_left.parse()
    }
}

