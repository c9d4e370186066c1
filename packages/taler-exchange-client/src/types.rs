use std::collections::HashMap;
use std::fmt;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use taler_common::amount::{Amount, AmountError};
use taler_common::base32;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::crypto::keys::{EddsaPublicKey, EddsaSignature};
use taler_common::time::Timestamp;

/// A blinded coin envelope: opaque bytes, base32 on the wire
#[derive(Clone, PartialEq, Eq)]
pub struct CoinEnvelope(pub Vec<u8>);

impl CoinEnvelope {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Hash of the envelope, used inside withdraw signatures
    pub fn hash(&self) -> Sha512Hash {
        Sha512Hash::compute(&self.0)
    }
}

impl fmt::Debug for CoinEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CoinEnvelope({} bytes)", self.0.len())
    }
}

impl Serialize for CoinEnvelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base32::encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for CoinEnvelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        base32::decode(&s)
            .map(CoinEnvelope)
            .map_err(|_| D::Error::custom("invalid coin envelope encoding"))
    }
}

/// One denomination key advertised under `/keys`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenominationKey {
    pub denom_pub: EddsaPublicKey,
    pub value: Amount,
    pub fee_deposit: Amount,
    pub fee_withdraw: Amount,
    pub fee_refund: Amount,
    pub stamp_start: Timestamp,
    pub stamp_expire_withdraw: Timestamp,
    pub stamp_expire_deposit: Timestamp,
}

impl DenominationKey {
    /// Hash identifying this denomination in planchets
    pub fn pub_hash(&self) -> Sha512Hash {
        Sha512Hash::compute(self.denom_pub.as_bytes())
    }
}

/// Wire fee structure for one wire method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFee {
    pub wire_fee: Amount,
    pub closing_fee: Amount,
}

/// The `/keys` response, reduced to what the merchant consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeKeys {
    pub master_public_key: EddsaPublicKey,
    pub list_issue_date: Timestamp,
    pub denoms: Vec<DenominationKey>,
    #[serde(default)]
    pub wire_fees: HashMap<String, WireFee>,
}

impl ExchangeKeys {
    pub fn find_denom(&self, denom_pub: &EddsaPublicKey) -> Option<&DenominationKey> {
        self.denoms.iter().find(|d| &d.denom_pub == denom_pub)
    }

    pub fn find_denom_by_hash(&self, h_denom_pub: &Sha512Hash) -> Option<&DenominationKey> {
        self.denoms.iter().find(|d| &d.pub_hash() == h_denom_pub)
    }

    pub fn wire_fee(&self, method: &str) -> Option<&WireFee> {
        self.wire_fees.get(method)
    }
}

/// Everything the exchange needs to accept one coin for one contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositPermission {
    /// The coin's contribution including the deposit fee
    #[serde(rename = "f")]
    pub amount_with_fee: Amount,
    pub h_contract_terms: Sha512Hash,
    #[serde(rename = "H_wire")]
    pub h_wire: Sha512Hash,
    pub coin_pub: EddsaPublicKey,
    pub denom_pub: EddsaPublicKey,
    #[serde(rename = "ub_sig")]
    pub denom_sig: EddsaSignature,
    pub coin_sig: EddsaSignature,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub merchant_pub: EddsaPublicKey,
}

/// The exchange's signed acknowledgement of a deposit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositConfirmation {
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: EddsaPublicKey,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReserveHistoryKind {
    Deposit,
    Withdraw,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveHistoryEntry {
    #[serde(rename = "type")]
    pub kind: ReserveHistoryKind,
    pub amount: Amount,
}

/// `GET /reserves/{reserve_pub}` response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReserveStatus {
    pub balance: Amount,
    pub history: Vec<ReserveHistoryEntry>,
    /// When the exchange will close the reserve, if advertised
    #[serde(default)]
    pub expiration_date: Option<Timestamp>,
}

impl ReserveStatus {
    /// Sum the history into (total deposited, total withdrawn)
    pub fn totals(&self, currency: &str) -> Result<(Amount, Amount), AmountError> {
        let mut deposited = Amount::zero(currency);
        let mut withdrawn = Amount::zero(currency);
        for entry in &self.history {
            match entry.kind {
                ReserveHistoryKind::Deposit => deposited = deposited.checked_add(&entry.amount)?,
                ReserveHistoryKind::Withdraw => withdrawn = withdrawn.checked_add(&entry.amount)?,
            }
        }
        Ok((deposited, withdrawn))
    }
}

/// `POST /reserves/{reserve_pub}/withdraw` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub reserve_pub: EddsaPublicKey,
    pub denom_pub_hash: Sha512Hash,
    pub coin_ev: CoinEnvelope,
    pub reserve_sig: EddsaSignature,
}

/// The exchange's blind signature over the coin envelope (opaque)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawResponse {
    pub ev_sig: String,
}

/// `POST /refund` request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundRequest {
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub h_contract_terms: Sha512Hash,
    pub coin_pub: EddsaPublicKey,
    pub rtransaction_id: u64,
    pub merchant_pub: EddsaPublicKey,
    pub merchant_sig: EddsaSignature,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundConfirmation {
    pub exchange_sig: EddsaSignature,
    pub exchange_pub: EddsaPublicKey,
}
