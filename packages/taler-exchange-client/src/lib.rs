//! HTTP client for the exchange.
//!
//! The merchant backend consumes a small slice of the exchange protocol:
//!
//! - `GET /keys` - denomination keys, wire fees, master public key
//! - `POST /deposit` - deposit a coin against a contract
//! - `GET /reserves/{reserve_pub}` - reserve balance and history
//! - `POST /reserves/{reserve_pub}/withdraw` - withdraw a blinded coin
//! - `POST /refund` - apply a merchant-signed refund
//!
//! All replies are strongly typed; error replies keep the raw JSON where the
//! caller has to forward it upstream (double-spend proofs).

pub mod client;
pub mod error;
pub mod types;

pub use client::{canonical_base_url, ExchangeClient};
pub use error::ExchangeError;
pub use types::{
    CoinEnvelope, DenominationKey, DepositConfirmation, DepositPermission, ExchangeKeys,
    RefundConfirmation, RefundRequest, ReserveHistoryEntry, ReserveHistoryKind, ReserveStatus,
    WireFee, WithdrawRequest, WithdrawResponse,
};
