use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use taler_common::crypto::keys::EddsaPublicKey;

use crate::error::ExchangeError;
use crate::types::{
    DepositConfirmation, DepositPermission, ExchangeKeys, RefundConfirmation, RefundRequest,
    ReserveStatus, WithdrawRequest, WithdrawResponse,
};

/// Canonical form of an exchange base URL: scheme and host lowercased by the
/// URL parser, path (and any trailing slash) preserved byte-for-byte.
/// Distinct canonical URLs never share an exchange session.
pub fn canonical_base_url(raw: &str) -> Result<String, url::ParseError> {
    let parsed = Url::parse(raw)?;
    Ok(parsed.to_string())
}

/// A connected exchange. Cheap to clone; the underlying `reqwest::Client`
/// is shared across all sessions.
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    http: reqwest::Client,
    base_url: String,
}

impl ExchangeClient {
    /// Bind a shared HTTP client to an exchange base URL (canonical form)
    pub fn connect(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        ExchangeClient { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch and parse `/keys`
    pub async fn get_keys(&self) -> Result<ExchangeKeys, ExchangeError> {
        let url = self.endpoint("keys");
        debug!(%url, "fetching exchange keys");
        let resp = self.http.get(&url).send().await?;
        parse_reply(resp).await
    }

    /// Fetch `/keys` and require the advertised master key to match
    pub async fn get_keys_verified(
        &self,
        expected_master: &EddsaPublicKey,
    ) -> Result<ExchangeKeys, ExchangeError> {
        let keys = self.get_keys().await?;
        if &keys.master_public_key != expected_master {
            return Err(ExchangeError::MasterKeyMismatch);
        }
        Ok(keys)
    }

    /// Deposit one coin. HTTP 403 is mapped to `DoubleSpend` with the raw
    /// proof body retained.
    pub async fn deposit(
        &self,
        permission: &DepositPermission,
    ) -> Result<DepositConfirmation, ExchangeError> {
        let url = self.endpoint("deposit");
        debug!(coin_pub = %permission.coin_pub, "submitting deposit");
        let resp = self.http.post(&url).json(permission).send().await?;
        if resp.status() == StatusCode::FORBIDDEN {
            let proof = resp
                .json::<serde_json::Value>()
                .await
                .unwrap_or(serde_json::Value::Null);
            return Err(ExchangeError::DoubleSpend { proof });
        }
        parse_reply(resp).await
    }

    /// Fetch the status and history of a reserve
    pub async fn reserve_status(
        &self,
        reserve_pub: &EddsaPublicKey,
    ) -> Result<ReserveStatus, ExchangeError> {
        let url = self.endpoint(&format!("reserves/{}", reserve_pub.to_base32()));
        let resp = self.http.get(&url).send().await?;
        parse_reply(resp).await
    }

    /// Withdraw a blinded coin against a reserve
    pub async fn reserve_withdraw(
        &self,
        request: &WithdrawRequest,
    ) -> Result<WithdrawResponse, ExchangeError> {
        let url = self.endpoint(&format!(
            "reserves/{}/withdraw",
            request.reserve_pub.to_base32()
        ));
        let resp = self.http.post(&url).json(request).send().await?;
        parse_reply(resp).await
    }

    /// Apply a merchant-signed refund to a deposited coin
    pub async fn refund(
        &self,
        request: &RefundRequest,
    ) -> Result<RefundConfirmation, ExchangeError> {
        let url = self.endpoint("refund");
        let resp = self.http.post(&url).json(request).send().await?;
        parse_reply(resp).await
    }
}

/// Parse a reply body, mapping error statuses to `ExchangeError::Status`
/// with the exchange's `{code, hint}` envelope when one is present.
async fn parse_reply<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, ExchangeError> {
    let status = resp.status();
    if status.is_success() {
        let body = resp.text().await?;
        return serde_json::from_str(&body)
            .map_err(|e| ExchangeError::MalformedReply(format!("{}: {}", e, truncated(&body))));
    }
    let body = resp.text().await.unwrap_or_default();
    let envelope: Option<serde_json::Value> = serde_json::from_str(&body).ok();
    let code = envelope
        .as_ref()
        .and_then(|v| v.get("code"))
        .and_then(|c| c.as_u64())
        .map(|c| c as u32);
    let hint = envelope
        .as_ref()
        .and_then(|v| v.get("hint"))
        .and_then(|h| h.as_str())
        .unwrap_or("no hint supplied")
        .to_string();
    Err(ExchangeError::Status {
        status: status.as_u16(),
        code,
        hint,
    })
}

fn truncated(body: &str) -> &str {
    &body[..body.len().min(200)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use taler_common::crypto::keys::EddsaPrivateKey;
    use taler_common::time::Timestamp;

    #[test]
    fn test_canonical_base_url_folds_scheme_and_host() {
        assert_eq!(
            canonical_base_url("HTTP://Exchange.Example.COM").unwrap(),
            "http://exchange.example.com/"
        );
        assert_eq!(
            canonical_base_url("https://exchange.example.com/Sub/Path").unwrap(),
            "https://exchange.example.com/Sub/Path"
        );
    }

    #[test]
    fn test_canonical_base_url_distinguishes_paths() {
        let a = canonical_base_url("https://x.example.com/a").unwrap();
        let b = canonical_base_url("https://x.example.com/b").unwrap();
        assert_ne!(a, b);
        // A trailing slash is part of the identity
        let c = canonical_base_url("https://x.example.com/a/").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_canonical_base_url_rejects_garbage() {
        assert!(canonical_base_url("not a url").is_err());
    }

    fn keys_body() -> serde_json::Value {
        let master = EddsaPrivateKey::from_seed([1; 32]).public();
        let denom = EddsaPrivateKey::from_seed([2; 32]).public();
        serde_json::json!({
            "master_public_key": master.to_base32(),
            "list_issue_date": {"t_ms": 1000},
            "denoms": [{
                "denom_pub": denom.to_base32(),
                "value": "KUDOS:5",
                "fee_deposit": "KUDOS:0.01",
                "fee_withdraw": "KUDOS:0.01",
                "fee_refund": "KUDOS:0.01",
                "stamp_start": {"t_ms": 0},
                "stamp_expire_withdraw": {"t_ms": "never"},
                "stamp_expire_deposit": {"t_ms": "never"}
            }],
            "wire_fees": {
                "x-taler-bank": {"wire_fee": "KUDOS:0.05", "closing_fee": "KUDOS:0.01"}
            }
        })
    }

    #[tokio::test]
    async fn test_get_keys_parses_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/keys")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(keys_body().to_string())
            .create_async()
            .await;

        let client = ExchangeClient::connect(reqwest::Client::new(), server.url());
        let keys = client.get_keys().await.unwrap();
        assert_eq!(keys.denoms.len(), 1);
        assert_eq!(keys.denoms[0].value.to_string(), "KUDOS:5");
        assert!(keys.wire_fee("x-taler-bank").is_some());
        assert_eq!(keys.list_issue_date, Timestamp::from_millis(1000));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_keys_verified_detects_mismatch() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/keys")
            .with_status(200)
            .with_body(keys_body().to_string())
            .create_async()
            .await;

        let client = ExchangeClient::connect(reqwest::Client::new(), server.url());
        let wrong_master = EddsaPrivateKey::from_seed([9; 32]).public();
        let err = client.get_keys_verified(&wrong_master).await.unwrap_err();
        assert!(matches!(err, ExchangeError::MasterKeyMismatch));

        let right_master = EddsaPrivateKey::from_seed([1; 32]).public();
        assert!(client.get_keys_verified(&right_master).await.is_ok());
    }

    #[tokio::test]
    async fn test_error_envelope_is_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/keys")
            .with_status(503)
            .with_body(r#"{"code": 71, "hint": "keys not ready"}"#)
            .create_async()
            .await;

        let client = ExchangeClient::connect(reqwest::Client::new(), server.url());
        match client.get_keys().await.unwrap_err() {
            ExchangeError::Status { status, code, hint } => {
                assert_eq!(status, 503);
                assert_eq!(code, Some(71));
                assert_eq!(hint, "keys not ready");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_deposit_double_spend_keeps_proof() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/deposit")
            .with_status(403)
            .with_body(r#"{"history": [{"type": "DEPOSIT", "amount": "KUDOS:5"}]}"#)
            .create_async()
            .await;

        let coin = EddsaPrivateKey::from_seed([3; 32]);
        let permission = DepositPermission {
            amount_with_fee: "KUDOS:5".parse().unwrap(),
            h_contract_terms: taler_common::Sha512Hash::compute(b"c"),
            h_wire: taler_common::Sha512Hash::compute(b"w"),
            coin_pub: coin.public(),
            denom_pub: EddsaPrivateKey::from_seed([2; 32]).public(),
            denom_sig: coin.sign(b"d"),
            coin_sig: coin.sign(b"c"),
            timestamp: Timestamp::from_millis(0),
            refund_deadline: Timestamp::NEVER,
            merchant_pub: EddsaPrivateKey::from_seed([4; 32]).public(),
        };

        let client = ExchangeClient::connect(reqwest::Client::new(), server.url());
        match client.deposit(&permission).await.unwrap_err() {
            ExchangeError::DoubleSpend { proof } => {
                assert!(proof.get("history").is_some());
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_transient_classification() {
        let transient = ExchangeError::Status {
            status: 503,
            code: None,
            hint: String::new(),
        };
        assert!(transient.is_transient());
        let permanent = ExchangeError::Status {
            status: 404,
            code: None,
            hint: String::new(),
        };
        assert!(!permanent.is_transient());
        assert!(!ExchangeError::MasterKeyMismatch.is_transient());
    }
}
