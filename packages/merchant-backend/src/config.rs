use std::fmt;
use std::path::PathBuf;

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;

use taler_common::amount::Amount;

/// Main configuration for the merchant backend
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Currency every amount in this deployment must carry
    pub currency: String,
    /// Listen address for the HTTP API
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Public base URL advertised in pay URIs and contract URLs
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Delay before deposits are wired to the merchant's account
    #[serde(default = "default_wire_transfer_delay")]
    pub wire_transfer_delay_secs: u64,
    /// Default pay deadline applied to orders that omit one
    #[serde(default = "default_pay_deadline")]
    pub default_pay_deadline_secs: u64,
    /// Default refund deadline applied to orders that omit one
    #[serde(default = "default_refund_deadline")]
    pub default_refund_deadline_secs: u64,
    /// Cap on aggregated wire fees a contract accepts by default
    pub default_max_wire_fee: Amount,
    /// Cap on aggregated deposit fees a contract accepts by default
    pub default_max_deposit_fee: Amount,
    /// How many payments a wire fee may be amortized over
    #[serde(default = "default_wire_fee_amortization")]
    pub default_wire_fee_amortization: u32,
    /// Lifetime of a tip authorization
    #[serde(default = "default_tip_expiration")]
    pub tip_expiration_secs: u64,
    /// How long request handlers wait for an exchange's keys
    #[serde(default = "default_exchange_wait")]
    pub exchange_wait_secs: u64,

    pub database: DatabaseConfig,

    #[serde(default, rename = "instance")]
    pub instances: Vec<InstanceConfig>,

    #[serde(default, rename = "exchange")]
    pub exchanges: Vec<ExchangeConfig>,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// One merchant instance: identity, signing key location, wire accounts,
/// optional tipping reserve.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    pub name: String,
    /// Hex-encoded Ed25519 seed; generated on first start if the file is absent
    pub keyfile: PathBuf,
    #[serde(default, rename = "wire")]
    pub wires: Vec<WireConfig>,
    /// Base URL of the exchange backing this instance's tip reserve
    #[serde(default)]
    pub tip_exchange: Option<String>,
    /// Keyfile of the tip reserve's private key
    #[serde(default)]
    pub tip_reserve_keyfile: Option<PathBuf>,
}

/// One wire method record of an instance
#[derive(Debug, Clone, Deserialize)]
pub struct WireConfig {
    pub method: String,
    /// The wire details document, hashed into `H_wire`
    pub details: serde_json::Value,
}

/// One pre-configured exchange
#[derive(Debug, Clone, Deserialize)]
pub struct ExchangeConfig {
    pub base_url: String,
    /// Base32 Ed25519 master public key; presence marks the exchange trusted
    #[serde(default)]
    pub master_key: Option<String>,
}

fn default_bind() -> String {
    "127.0.0.1:8888".to_string()
}

fn default_base_url() -> String {
    "http://localhost:8888".to_string()
}

fn default_wire_transfer_delay() -> u64 {
    2 * 24 * 3600
}

fn default_pay_deadline() -> u64 {
    2 * 3600
}

fn default_refund_deadline() -> u64 {
    3600
}

fn default_wire_fee_amortization() -> u32 {
    1
}

fn default_tip_expiration() -> u64 {
    24 * 3600
}

fn default_exchange_wait() -> u64 {
    10
}

impl Config {
    /// Load configuration: `.env` if present, then the TOML file named by
    /// `MERCHANT_CONFIG` (default `merchant.toml`), with `MERCHANT__*`
    /// environment overrides on top.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let path = std::env::var("MERCHANT_CONFIG").unwrap_or_else(|_| "merchant.toml".to_string());
        Self::load_from_file(&path)
    }

    pub fn load_from_file(path: &str) -> Result<Self> {
        let raw = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("MERCHANT").separator("__"))
            .build()
            .wrap_err_with(|| format!("Failed to read configuration from {}", path))?;
        let cfg: Config = raw
            .try_deserialize()
            .wrap_err("Failed to parse configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.currency.is_empty()
            || self.currency.len() > 11
            || !self.currency.chars().all(|c| c.is_ascii_uppercase())
        {
            return Err(eyre!(
                "currency must be 1-11 uppercase ASCII letters, got {:?}",
                self.currency
            ));
        }

        for amount in [&self.default_max_wire_fee, &self.default_max_deposit_fee] {
            if amount.currency != self.currency {
                return Err(eyre!(
                    "configured fee cap {} does not use currency {}",
                    amount,
                    self.currency
                ));
            }
        }

        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        if self.instances.is_empty() {
            return Err(eyre!("at least one [[instance]] is required"));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for instance in &self.instances {
            if instance.id.is_empty() {
                return Err(eyre!("instance id cannot be empty"));
            }
            if !seen_ids.insert(&instance.id) {
                return Err(eyre!("duplicate instance id {:?}", instance.id));
            }
            if instance.wires.is_empty() {
                return Err(eyre!(
                    "instance {:?} needs at least one [[instance.wire]] section",
                    instance.id
                ));
            }
            // Tipping needs both the reserve key and the exchange
            match (&instance.tip_exchange, &instance.tip_reserve_keyfile) {
                (Some(_), Some(_)) | (None, None) => {}
                _ => {
                    return Err(eyre!(
                        "instance {:?} must set both tip_exchange and tip_reserve_keyfile (or neither)",
                        instance.id
                    ));
                }
            }
        }

        let mut seen_urls = std::collections::HashSet::new();
        for exchange in &self.exchanges {
            let canonical = taler_exchange_client::canonical_base_url(&exchange.base_url)
                .map_err(|e| eyre!("bad exchange base_url {:?}: {}", exchange.base_url, e))?;
            if !seen_urls.insert(canonical) {
                return Err(eyre!(
                    "duplicate exchange base_url {:?}",
                    exchange.base_url
                ));
            }
            if let Some(master) = &exchange.master_key {
                taler_common::EddsaPublicKey::from_base32(master).map_err(|_| {
                    eyre!(
                        "exchange {:?} has an unparseable master_key",
                        exchange.base_url
                    )
                })?;
            }
        }

        Ok(())
    }

    pub fn exchange_wait(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.exchange_wait_secs)
    }
}

#[cfg(test)]
pub mod tests_support {
    use super::*;

    /// A minimal valid configuration for unit tests
    pub fn sample_config() -> Config {
        Config {
            currency: "KUDOS".to_string(),
            bind: default_bind(),
            base_url: default_base_url(),
            wire_transfer_delay_secs: default_wire_transfer_delay(),
            default_pay_deadline_secs: default_pay_deadline(),
            default_refund_deadline_secs: default_refund_deadline(),
            default_max_wire_fee: "KUDOS:0.1".parse().unwrap(),
            default_max_deposit_fee: "KUDOS:0.1".parse().unwrap(),
            default_wire_fee_amortization: 1,
            tip_expiration_secs: default_tip_expiration(),
            exchange_wait_secs: default_exchange_wait(),
            database: DatabaseConfig {
                url: "postgres://localhost/merchant".to_string(),
            },
            instances: vec![InstanceConfig {
                id: "default".to_string(),
                name: "Example Shop".to_string(),
                keyfile: PathBuf::from("merchant.priv"),
                wires: vec![WireConfig {
                    method: "x-taler-bank".to_string(),
                    details: serde_json::json!({"account": "shop"}),
                }],
                tip_exchange: None,
                tip_reserve_keyfile: None,
            }],
            exchanges: vec![ExchangeConfig {
                base_url: "https://exchange.example.com/".to_string(),
                master_key: None,
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::tests_support::sample_config;
    use super::*;

    #[test]
    fn test_sample_config_is_valid() {
        assert!(sample_config().validate().is_ok());
    }

    #[test]
    fn test_currency_validation() {
        let mut cfg = sample_config();
        cfg.currency = "kudos".to_string();
        assert!(cfg.validate().is_err());
        cfg.currency = "WAYTOOLONGCUR".to_string();
        assert!(cfg.validate().is_err());
        cfg.currency = String::new();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_fee_currency_must_match() {
        let mut cfg = sample_config();
        cfg.default_max_wire_fee = "EUR:0.1".parse().unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_duplicate_instance_rejected() {
        let mut cfg = sample_config();
        let dup = cfg.instances[0].clone();
        cfg.instances.push(dup);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_instance_without_wire_rejected() {
        let mut cfg = sample_config();
        cfg.instances[0].wires.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_tip_config_must_be_paired() {
        let mut cfg = sample_config();
        cfg.instances[0].tip_exchange = Some("https://exchange.example.com/".to_string());
        assert!(cfg.validate().is_err());
        cfg.instances[0].tip_reserve_keyfile = Some(PathBuf::from("tip.priv"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_duplicate_exchange_detected_after_canonicalization() {
        let mut cfg = sample_config();
        cfg.exchanges.push(ExchangeConfig {
            base_url: "HTTPS://Exchange.Example.COM/".to_string(),
            master_key: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_bad_master_key_rejected() {
        let mut cfg = sample_config();
        cfg.exchanges[0].master_key = Some("not-base32!!".to_string());
        assert!(cfg.validate().is_err());
    }
}
