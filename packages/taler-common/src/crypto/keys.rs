use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::base32;

/// Errors from key and signature handling
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid public key")]
    InvalidKey,
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("invalid key/signature encoding")]
    BadEncoding,
}

/// An Ed25519 public key (32 bytes). Serializes as Crockford base32.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct EddsaPublicKey([u8; 32]);

impl EddsaPublicKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        EddsaPublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.0)
    }

    pub fn from_base32(s: &str) -> Result<Self, CryptoError> {
        base32::decode_fixed::<32>(s)
            .map(EddsaPublicKey)
            .map_err(|_| CryptoError::BadEncoding)
    }

    /// Verify an Ed25519 signature over `message`
    pub fn verify(&self, message: &[u8], sig: &EddsaSignature) -> Result<(), CryptoError> {
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidKey)?;
        let signature = Signature::from_bytes(&sig.0);
        key.verify(message, &signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

impl fmt::Debug for EddsaPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EddsaPublicKey({})", &self.to_base32()[..8])
    }
}

impl fmt::Display for EddsaPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base32())
    }
}

impl Serialize for EddsaPublicKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for EddsaPublicKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EddsaPublicKey::from_base32(&s).map_err(|_| D::Error::custom("invalid public key"))
    }
}

/// An Ed25519 private key. `Debug` never prints key material.
#[derive(Clone)]
pub struct EddsaPrivateKey(SigningKey);

impl EddsaPrivateKey {
    pub fn generate() -> Self {
        EddsaPrivateKey(SigningKey::generate(&mut OsRng))
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        EddsaPrivateKey(SigningKey::from_bytes(&seed))
    }

    pub fn from_hex(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s.trim()).map_err(|_| CryptoError::BadEncoding)?;
        let seed: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::BadEncoding)?;
        Ok(Self::from_seed(seed))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn seed_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    pub fn public(&self) -> EddsaPublicKey {
        EddsaPublicKey(self.0.verifying_key().to_bytes())
    }

    /// Sign `message` (deterministic per RFC 8032)
    pub fn sign(&self, message: &[u8]) -> EddsaSignature {
        EddsaSignature(self.0.sign(message).to_bytes())
    }
}

impl fmt::Debug for EddsaPrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EddsaPrivateKey")
            .field("pub", &self.public())
            .finish()
    }
}

/// An Ed25519 signature (64 bytes). Serializes as Crockford base32.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct EddsaSignature(pub [u8; 64]);

impl EddsaSignature {
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    pub fn to_base32(&self) -> String {
        base32::encode(&self.0)
    }

    pub fn from_base32(s: &str) -> Result<Self, CryptoError> {
        base32::decode_fixed::<64>(s)
            .map(EddsaSignature)
            .map_err(|_| CryptoError::BadEncoding)
    }
}

impl fmt::Debug for EddsaSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EddsaSignature({})", &self.to_base32()[..8])
    }
}

impl Serialize for EddsaSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_base32())
    }
}

impl<'de> Deserialize<'de> for EddsaSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        EddsaSignature::from_base32(&s).map_err(|_| D::Error::custom("invalid signature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_verify_round_trip() {
        let key = EddsaPrivateKey::generate();
        let sig = key.sign(b"message");
        assert!(key.public().verify(b"message", &sig).is_ok());
        assert_eq!(
            key.public().verify(b"other", &sig),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_signing_is_deterministic() {
        let key = EddsaPrivateKey::from_seed([42u8; 32]);
        assert_eq!(key.sign(b"m").as_bytes(), key.sign(b"m").as_bytes());
    }

    #[test]
    fn test_hex_seed_round_trip() {
        let key = EddsaPrivateKey::from_seed([7u8; 32]);
        let restored = EddsaPrivateKey::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.public(), restored.public());
        assert!(EddsaPrivateKey::from_hex("zz").is_err());
        assert!(EddsaPrivateKey::from_hex("aabb").is_err());
    }

    #[test]
    fn test_base32_codecs() {
        let key = EddsaPrivateKey::generate();
        let pubkey = key.public();
        assert_eq!(
            EddsaPublicKey::from_base32(&pubkey.to_base32()).unwrap(),
            pubkey
        );
        let sig = key.sign(b"x");
        assert_eq!(EddsaSignature::from_base32(&sig.to_base32()).unwrap(), sig);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let key = EddsaPrivateKey::from_seed([9u8; 32]);
        let rendered = format!("{:?}", key);
        assert!(!rendered.contains(&key.to_hex()));
    }
}
