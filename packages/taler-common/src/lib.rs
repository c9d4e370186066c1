//! Shared library for the merchant backend packages.
//!
//! This crate provides the types every other package needs:
//!
//! - **Amounts** - `"CUR:value.fraction"` currency amounts with checked arithmetic
//! - **Time** - protocol timestamps with a distinguished "never" value
//! - **Base32** - the Crockford base32 codec used on the wire
//! - **Crypto** - EdDSA key/signature wrappers, SHA-512 hashing, signature purposes
//! - **Error codes** - the stable numeric error code enumeration and JSON envelope
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! taler-common = { path = "../taler-common" }
//! ```

pub mod amount;
pub mod base32;
pub mod crypto;
pub mod errors;
pub mod time;

// Re-export commonly used items at the crate root
pub use amount::{Amount, AmountError, FRACTION_BASE};
pub use crypto::hash::{hash_json_contract, Sha512Hash};
pub use crypto::keys::{EddsaPrivateKey, EddsaPublicKey, EddsaSignature};
pub use crypto::purpose::SignaturePurpose;
pub use errors::{ErrorCode, ErrorEnvelope};
pub use time::Timestamp;
