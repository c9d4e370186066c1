pub mod hash;
pub mod keys;
pub mod purpose;

pub use hash::{hash_json_contract, Sha512Hash};
pub use keys::{EddsaPrivateKey, EddsaPublicKey, EddsaSignature};
pub use purpose::SignaturePurpose;
