//! Merchant instances: one identity (signing key, wire accounts, optional
//! tipping reserve) per configured instance. Loaded once at startup and
//! immutable for the process lifetime.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use eyre::{eyre, Result, WrapErr};
use tracing::info;

use taler_common::crypto::hash::{hash_json_contract, Sha512Hash};
use taler_common::crypto::keys::{EddsaPrivateKey, EddsaPublicKey};

use crate::config::InstanceConfig;

/// A wire method record with its precomputed details hash
#[derive(Debug, Clone)]
pub struct WireMethod {
    pub method: String,
    pub details: serde_json::Value,
    pub h_wire: Sha512Hash,
}

/// Tipping configuration of an instance
#[derive(Debug, Clone)]
pub struct TipReserve {
    pub reserve_priv: EddsaPrivateKey,
    pub exchange_url: String,
}

/// One merchant identity inside the backend
#[derive(Debug)]
pub struct Instance {
    pub id: String,
    pub name: String,
    pub key: EddsaPrivateKey,
    pub pubkey: EddsaPublicKey,
    pub wires: Vec<WireMethod>,
    pub tip: Option<TipReserve>,
}

impl Instance {
    pub fn from_config(cfg: &InstanceConfig) -> Result<Self> {
        let key = load_or_generate_key(&cfg.keyfile)
            .wrap_err_with(|| format!("instance {:?}: cannot load keyfile", cfg.id))?;
        let pubkey = key.public();

        let wires = cfg
            .wires
            .iter()
            .map(|w| WireMethod {
                method: w.method.clone(),
                details: w.details.clone(),
                h_wire: hash_json_contract(&w.details),
            })
            .collect();

        let tip = match (&cfg.tip_exchange, &cfg.tip_reserve_keyfile) {
            (Some(exchange_url), Some(keyfile)) => {
                let reserve_priv = load_or_generate_key(keyfile).wrap_err_with(|| {
                    format!("instance {:?}: cannot load tip reserve keyfile", cfg.id)
                })?;
                Some(TipReserve {
                    reserve_priv,
                    exchange_url: exchange_url.clone(),
                })
            }
            _ => None,
        };

        Ok(Instance {
            id: cfg.id.clone(),
            name: cfg.name.clone(),
            key,
            pubkey,
            wires,
            tip,
        })
    }

    /// The wire method used when an order does not name one
    pub fn default_wire(&self) -> &WireMethod {
        &self.wires[0]
    }

    pub fn find_wire(&self, method: &str) -> Option<&WireMethod> {
        self.wires.iter().find(|w| w.method == method)
    }
}

/// Build the process-wide instance map
pub fn load_instances(configs: &[InstanceConfig]) -> Result<HashMap<String, Arc<Instance>>> {
    let mut map = HashMap::new();
    for cfg in configs {
        let instance = Instance::from_config(cfg)?;
        info!(
            instance = %instance.id,
            merchant_pub = %instance.pubkey,
            wire_methods = instance.wires.len(),
            tipping = instance.tip.is_some(),
            "Instance loaded"
        );
        if map.insert(cfg.id.clone(), Arc::new(instance)).is_some() {
            return Err(eyre!("duplicate instance id {:?}", cfg.id));
        }
    }
    Ok(map)
}

/// Read a hex Ed25519 seed from `path`; generate and persist one if the
/// file does not exist yet.
fn load_or_generate_key(path: &Path) -> Result<EddsaPrivateKey> {
    if path.exists() {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("cannot read {}", path.display()))?;
        return EddsaPrivateKey::from_hex(&contents)
            .map_err(|e| eyre!("{} does not hold a valid key: {}", path.display(), e));
    }
    let key = EddsaPrivateKey::generate();
    std::fs::write(path, key.to_hex())
        .wrap_err_with(|| format!("cannot write fresh key to {}", path.display()))?;
    info!(keyfile = %path.display(), "Generated new signing key");
    Ok(key)
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// An in-memory instance (no keyfiles touched) for unit tests
    pub fn sample_instance() -> Instance {
        let key = EddsaPrivateKey::from_seed([5u8; 32]);
        let details = serde_json::json!({"account": "shop"});
        Instance {
            id: "default".to_string(),
            name: "Example Shop".to_string(),
            pubkey: key.public(),
            key,
            wires: vec![WireMethod {
                method: "x-taler-bank".to_string(),
                h_wire: hash_json_contract(&details),
                details,
            }],
            tip: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WireConfig;

    fn instance_config(dir: &Path) -> InstanceConfig {
        InstanceConfig {
            id: "default".to_string(),
            name: "Example Shop".to_string(),
            keyfile: dir.join("merchant.priv"),
            wires: vec![WireConfig {
                method: "x-taler-bank".to_string(),
                details: serde_json::json!({"account": "shop", "bank": "b"}),
            }],
            tip_exchange: None,
            tip_reserve_keyfile: None,
        }
    }

    #[test]
    fn test_key_generated_then_reloaded() {
        let dir = std::env::temp_dir().join(format!("merchant-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cfg = instance_config(&dir);

        let first = Instance::from_config(&cfg).unwrap();
        let second = Instance::from_config(&cfg).unwrap();
        assert_eq!(first.pubkey, second.pubkey);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_wire_hash_is_stable_and_method_lookup_works() {
        let dir = std::env::temp_dir().join(format!("merchant-test-wire-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cfg = instance_config(&dir);

        let instance = Instance::from_config(&cfg).unwrap();
        let wire = instance.default_wire();
        assert_eq!(wire.h_wire, hash_json_contract(&wire.details));
        assert!(instance.find_wire("x-taler-bank").is_some());
        assert!(instance.find_wire("sepa").is_none());

        std::fs::remove_dir_all(&dir).ok();
    }
}
