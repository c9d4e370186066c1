//! Contract-terms helpers: filling order defaults, extracting the typed
//! fields the engines validate against, and building pay/contract URLs.

use std::time::Duration;

use serde_json::{json, Value};

use taler_common::amount::Amount;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::time::Timestamp;

use crate::config::Config;
use crate::instance::Instance;

/// The typed slice of a contract the engines care about
#[derive(Debug, Clone)]
pub struct ContractInfo {
    pub amount: Amount,
    pub max_fee: Amount,
    pub fulfillment_url: Option<String>,
    pub timestamp: Timestamp,
    pub refund_deadline: Timestamp,
    pub pay_deadline: Timestamp,
    pub h_wire: Sha512Hash,
}

impl ContractInfo {
    /// Extract the typed fields; `Err` carries the offending field name
    pub fn from_json(contract: &Value) -> Result<Self, String> {
        let amount = parse_amount(contract, "amount")?;
        let max_fee = parse_amount(contract, "max_fee")?;
        let timestamp = parse_timestamp(contract, "timestamp")?;
        let refund_deadline = parse_timestamp(contract, "refund_deadline")?;
        let pay_deadline = parse_timestamp(contract, "pay_deadline")?;
        let h_wire = contract
            .get("H_wire")
            .and_then(|v| v.as_str())
            .and_then(|s| Sha512Hash::from_base32(s).ok())
            .ok_or("H_wire")?;
        let fulfillment_url = contract
            .get("fulfillment_url")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(ContractInfo {
            amount,
            max_fee,
            fulfillment_url,
            timestamp,
            refund_deadline,
            pay_deadline,
            h_wire,
        })
    }
}

fn parse_amount(contract: &Value, field: &'static str) -> Result<Amount, String> {
    contract
        .get(field)
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| field.to_string())
}

fn parse_timestamp(contract: &Value, field: &'static str) -> Result<Timestamp, String> {
    let value = contract.get(field).ok_or(field)?;
    serde_json::from_value(value.clone()).map_err(|_| field.to_string())
}

/// Fill in everything an order may omit. The order id itself is only ever
/// a randomly generated placeholder, never derived from order content.
pub fn fill_order_defaults(
    order: &mut Value,
    order_id: &str,
    cfg: &Config,
    instance: &Instance,
) -> Result<(), String> {
    let now = Timestamp::now();
    let object = order.as_object_mut().ok_or("order")?;

    object.insert("order_id".to_string(), json!(order_id));
    object.insert(
        "merchant_pub".to_string(),
        json!(instance.pubkey.to_base32()),
    );
    object.insert(
        "merchant".to_string(),
        json!({"name": instance.name, "instance": instance.id}),
    );

    if !object.contains_key("timestamp") {
        object.insert("timestamp".to_string(), timestamp_json(now));
    }
    if !object.contains_key("refund_deadline") {
        let deadline = now.saturating_add(Duration::from_secs(cfg.default_refund_deadline_secs));
        object.insert("refund_deadline".to_string(), timestamp_json(deadline));
    }
    if !object.contains_key("pay_deadline") {
        let deadline = now.saturating_add(Duration::from_secs(cfg.default_pay_deadline_secs));
        object.insert("pay_deadline".to_string(), timestamp_json(deadline));
    }
    if !object.contains_key("wire_transfer_deadline") {
        let deadline = now.saturating_add(Duration::from_secs(cfg.wire_transfer_delay_secs));
        object.insert("wire_transfer_deadline".to_string(), timestamp_json(deadline));
    }
    if !object.contains_key("max_fee") {
        object.insert(
            "max_fee".to_string(),
            json!(cfg.default_max_deposit_fee.to_string()),
        );
    }
    if !object.contains_key("max_wire_fee") {
        object.insert(
            "max_wire_fee".to_string(),
            json!(cfg.default_max_wire_fee.to_string()),
        );
    }
    if !object.contains_key("wire_fee_amortization") {
        object.insert(
            "wire_fee_amortization".to_string(),
            json!(cfg.default_wire_fee_amortization),
        );
    }

    // The wire account the coins will be deposited against
    let wire = instance.default_wire();
    object.insert("H_wire".to_string(), json!(wire.h_wire.to_base32()));
    object.insert("wire_method".to_string(), json!(wire.method));

    // Amount is the one field the front-end must always supply
    let amount: Amount = object
        .get("amount")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
        .ok_or("amount")?;
    if amount.currency != cfg.currency {
        return Err("amount".to_string());
    }

    Ok(())
}

fn timestamp_json(t: Timestamp) -> Value {
    serde_json::to_value(t).unwrap_or(Value::Null)
}

/// The URI a wallet opens to pay for an order
pub fn taler_pay_uri(cfg: &Config, instance: &Instance, order_id: &str) -> String {
    let authority = cfg
        .base_url
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/');
    format!("taler://pay/{}/{}/{}", authority, instance.id, order_id)
}

/// Where the wallet can re-fetch the signed proposal
pub fn contract_url(cfg: &Config, order_id: &str) -> String {
    format!(
        "{}/public/proposal?order_id={}",
        cfg.base_url.trim_end_matches('/'),
        order_id
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests_support::sample_config;
    use crate::instance::tests_support::sample_instance;

    #[test]
    fn test_fill_defaults_and_extract() {
        let cfg = sample_config();
        let instance = sample_instance();
        let mut order = json!({
            "amount": "KUDOS:5.00",
            "fulfillment_url": "https://shop.example.com/article"
        });
        fill_order_defaults(&mut order, "ord-A", &cfg, &instance).unwrap();

        assert_eq!(order["order_id"], "ord-A");
        assert_eq!(order["merchant_pub"], instance.pubkey.to_base32());
        assert!(order.get("timestamp").is_some());
        assert!(order.get("pay_deadline").is_some());

        let info = ContractInfo::from_json(&order).unwrap();
        assert_eq!(info.amount.to_string(), "KUDOS:5");
        assert_eq!(info.max_fee, cfg.default_max_deposit_fee);
        assert_eq!(
            info.fulfillment_url.as_deref(),
            Some("https://shop.example.com/article")
        );
        assert_eq!(info.h_wire, instance.default_wire().h_wire);
    }

    #[test]
    fn test_missing_amount_is_rejected() {
        let cfg = sample_config();
        let instance = sample_instance();
        let mut order = json!({"fulfillment_url": "https://shop.example.com/x"});
        assert_eq!(
            fill_order_defaults(&mut order, "ord-A", &cfg, &instance),
            Err("amount".to_string())
        );
    }

    #[test]
    fn test_wrong_currency_is_rejected() {
        let cfg = sample_config();
        let instance = sample_instance();
        let mut order = json!({"amount": "EUR:5"});
        assert_eq!(
            fill_order_defaults(&mut order, "ord-A", &cfg, &instance),
            Err("amount".to_string())
        );
    }

    #[test]
    fn test_caller_supplied_deadlines_survive() {
        let cfg = sample_config();
        let instance = sample_instance();
        let mut order = json!({
            "amount": "KUDOS:5",
            "pay_deadline": {"t_ms": 42},
        });
        fill_order_defaults(&mut order, "ord-A", &cfg, &instance).unwrap();
        assert_eq!(order["pay_deadline"]["t_ms"], 42);
    }

    #[test]
    fn test_pay_uri_shape() {
        let cfg = sample_config();
        let instance = sample_instance();
        let uri = taler_pay_uri(&cfg, &instance, "ord-A");
        assert!(uri.starts_with("taler://pay/"));
        assert!(uri.ends_with("/default/ord-A"));
        assert!(contract_url(&cfg, "ord-A").contains("/public/proposal?order_id=ord-A"));
    }
}
