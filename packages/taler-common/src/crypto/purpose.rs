//! Signature purposes: every EdDSA signature in the protocol covers a
//! fixed-layout buffer `{ size: u32 BE, purpose: u32 BE, payload }` so a
//! signature made for one operation can never be replayed for another.

use crate::amount::Amount;
use crate::crypto::hash::Sha512Hash;
use crate::crypto::keys::{CryptoError, EddsaPrivateKey, EddsaPublicKey, EddsaSignature};
use crate::time::Timestamp;

/// Purpose numbers. Disjoint per signing party.
pub mod numbers {
    /// Merchant commits to contract terms
    pub const MERCHANT_CONTRACT: u32 = 1101;
    /// Merchant authorizes a refund for a deposited coin
    pub const MERCHANT_REFUND: u32 = 1102;
    /// Merchant confirms a completed payment
    pub const MERCHANT_PAYMENT_OK: u32 = 1104;
    /// Wallet spends a coin on a contract
    pub const WALLET_COIN_DEPOSIT: u32 = 1201;
    /// Reserve owner withdraws a coin
    pub const RESERVE_WITHDRAW: u32 = 1200;
}

/// A purpose buffer under construction
pub struct SignaturePurpose {
    purpose: u32,
    payload: Vec<u8>,
}

impl SignaturePurpose {
    pub fn new(purpose: u32) -> Self {
        SignaturePurpose {
            purpose,
            payload: Vec::new(),
        }
    }

    pub fn hash(mut self, h: &Sha512Hash) -> Self {
        self.payload.extend_from_slice(h.as_bytes());
        self
    }

    pub fn public_key(mut self, key: &EddsaPublicKey) -> Self {
        self.payload.extend_from_slice(key.as_bytes());
        self
    }

    pub fn amount(mut self, amount: &Amount) -> Self {
        self.payload.extend_from_slice(&amount.to_purpose_bytes());
        self
    }

    pub fn timestamp(mut self, t: &Timestamp) -> Self {
        self.payload.extend_from_slice(&t.to_purpose_bytes());
        self
    }

    pub fn u64(mut self, v: u64) -> Self {
        self.payload.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// The full buffer that is signed
    pub fn to_bytes(&self) -> Vec<u8> {
        let size = (8 + self.payload.len()) as u32;
        let mut out = Vec::with_capacity(size as usize);
        out.extend_from_slice(&size.to_be_bytes());
        out.extend_from_slice(&self.purpose.to_be_bytes());
        out.extend_from_slice(&self.payload);
        out
    }

    pub fn sign(&self, key: &EddsaPrivateKey) -> EddsaSignature {
        key.sign(&self.to_bytes())
    }

    pub fn verify(&self, key: &EddsaPublicKey, sig: &EddsaSignature) -> Result<(), CryptoError> {
        key.verify(&self.to_bytes(), sig)
    }
}

/// Purpose for the merchant's signature over contract terms
pub fn merchant_contract(h_contract: &Sha512Hash) -> SignaturePurpose {
    SignaturePurpose::new(numbers::MERCHANT_CONTRACT).hash(h_contract)
}

/// Purpose for the merchant's payment confirmation
pub fn merchant_payment_ok(h_contract: &Sha512Hash) -> SignaturePurpose {
    SignaturePurpose::new(numbers::MERCHANT_PAYMENT_OK).hash(h_contract)
}

/// Purpose for a merchant-authorized refund of one coin
pub fn merchant_refund(
    h_contract: &Sha512Hash,
    coin_pub: &EddsaPublicKey,
    rtransaction_id: u64,
    refund_amount: &Amount,
    refund_fee: &Amount,
) -> SignaturePurpose {
    SignaturePurpose::new(numbers::MERCHANT_REFUND)
        .hash(h_contract)
        .public_key(coin_pub)
        .u64(rtransaction_id)
        .amount(refund_amount)
        .amount(refund_fee)
}

/// Purpose the wallet signs with the coin key to spend it on a contract
#[allow(clippy::too_many_arguments)]
pub fn wallet_coin_deposit(
    h_contract: &Sha512Hash,
    h_wire: &Sha512Hash,
    timestamp: &Timestamp,
    refund_deadline: &Timestamp,
    merchant_pub: &EddsaPublicKey,
    amount_with_fee: &Amount,
    deposit_fee: &Amount,
) -> SignaturePurpose {
    SignaturePurpose::new(numbers::WALLET_COIN_DEPOSIT)
        .hash(h_contract)
        .hash(h_wire)
        .timestamp(timestamp)
        .timestamp(refund_deadline)
        .public_key(merchant_pub)
        .amount(amount_with_fee)
        .amount(deposit_fee)
}

/// Purpose the reserve key signs to withdraw a coin from its reserve
pub fn reserve_withdraw(
    amount_with_fee: &Amount,
    withdraw_fee: &Amount,
    h_denom_pub: &Sha512Hash,
    h_coin_envelope: &Sha512Hash,
) -> SignaturePurpose {
    SignaturePurpose::new(numbers::RESERVE_WITHDRAW)
        .amount(amount_with_fee)
        .amount(withdraw_fee)
        .hash(h_denom_pub)
        .hash(h_coin_envelope)
}
