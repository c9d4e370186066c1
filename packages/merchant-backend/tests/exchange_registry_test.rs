//! Exchange registry tests against a mocked exchange.

use std::time::Duration;

use merchant_backend::config::ExchangeConfig;
use merchant_backend::exchanges::ExchangeManager;
use taler_common::crypto::keys::EddsaPrivateKey;

fn keys_body(master_seed: u8, denom_seed: u8) -> String {
    let master = EddsaPrivateKey::from_seed([master_seed; 32]).public();
    let denom = EddsaPrivateKey::from_seed([denom_seed; 32]).public();
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
    .to_string()
}

#[tokio::test]
async fn test_one_session_per_canonical_url() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/keys")
        .with_status(200)
        .with_body(keys_body(1, 2))
        .create_async()
        .await;

    let manager = ExchangeManager::new(reqwest::Client::new(), &[]);

    // Same exchange, three spellings
    let plain = server.url();
    let slashed = format!("{}/", server.url());
    let shouty = server.url().replace("http://", "HTTP://");

    for url in [&plain, &slashed, &shouty] {
        let found = tokio::time::timeout(Duration::from_secs(10), manager.find(url, None))
            .await
            .expect("find timed out")
            .expect("find failed");
        assert_eq!(found.handle.keys.denoms.len(), 1);
        assert!(!found.trusted);
    }
    assert_eq!(manager.session_count(), 1);
}

#[tokio::test]
async fn test_configured_master_key_marks_trusted() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/keys")
        .with_status(200)
        .with_body(keys_body(1, 2))
        .create_async()
        .await;

    let master = EddsaPrivateKey::from_seed([1; 32]).public();
    let configs = vec![ExchangeConfig {
        base_url: server.url(),
        master_key: Some(master.to_base32()),
    }];
    let manager = ExchangeManager::new(reqwest::Client::new(), &configs);

    let found = tokio::time::timeout(
        Duration::from_secs(10),
        manager.find(&server.url(), Some("x-taler-bank")),
    )
    .await
    .expect("find timed out")
    .expect("find failed");
    assert!(found.trusted);
    let fee = found.wire_fee.expect("wire fee for the requested method");
    assert_eq!(fee.wire_fee.to_string(), "KUDOS:0.05");
}

#[tokio::test]
async fn test_find_survives_initial_failures() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/keys")
        .with_status(503)
        .with_body(r#"{"code": 71, "hint": "not ready"}"#)
        .create_async()
        .await;

    let manager = ExchangeManager::new(reqwest::Client::new(), &[]);

    // Let the fetch task burn through a few failed attempts first
    let server_url = server.url();
    let pending = manager.find(&server_url, None);
    tokio::pin!(pending);
    tokio::select! {
        _ = &mut pending => panic!("find resolved while the exchange was failing"),
        _ = tokio::time::sleep(Duration::from_millis(200)) => {}
    }

    // The exchange comes back; the armed retry must pick it up
    server
        .mock("GET", "/keys")
        .with_status(200)
        .with_body(keys_body(1, 2))
        .create_async()
        .await;

    let found = tokio::time::timeout(Duration::from_secs(20), pending)
        .await
        .expect("find timed out after recovery")
        .expect("find failed after recovery");
    assert_eq!(found.handle.keys.denoms.len(), 1);
}

#[tokio::test]
async fn test_shutdown_fails_pending_finds() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/keys")
        .with_status(503)
        .with_body("{}")
        .create_async()
        .await;

    let manager = ExchangeManager::new(reqwest::Client::new(), &[]);
    let server_url = server.url();
    let pending = manager.find(&server_url, None);
    tokio::pin!(pending);
    tokio::select! {
        _ = &mut pending => panic!("find resolved against a failing exchange"),
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }

    manager.shutdown();
    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("find did not resolve after shutdown");
    assert!(result.is_err());

    // New lookups fail immediately once the registry is down
    assert!(manager.find(&server.url(), None).await.is_err());
}
