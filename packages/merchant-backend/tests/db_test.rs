//! Database gateway tests.
//!
//! Run with: cargo test --test db_test -- --ignored --nocapture
//!
//! Prerequisites:
//! - Postgres running
//! - DATABASE_URL set

use chrono::{Duration, Utc};

use merchant_backend::db::{self, AuthorizeOutcome, NewDeposit, NewRefund, PickupOutcome};
use taler_common::amount::Amount;
use taler_common::crypto::hash::Sha512Hash;

mod helpers {
    use rand::Rng;
    use sqlx::PgPool;

    pub async fn pool() -> PgPool {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required for db tests");
        let pool = merchant_backend::db::create_pool(&url)
            .await
            .expect("failed to connect to database");
        merchant_backend::db::run_migrations(&pool)
            .await
            .expect("failed to run migrations");
        pool
    }

    pub fn random_bytes<const N: usize>() -> [u8; N] {
        let mut bytes = [0u8; N];
        rand::thread_rng().fill(&mut bytes[..]);
        bytes
    }
}

fn amount(s: &str) -> Amount {
    s.parse().unwrap()
}

#[tokio::test]
#[ignore]
async fn test_order_promotion_first_writer_wins() {
    let pool = helpers::pool().await;
    let merchant_pub = helpers::random_bytes::<32>();
    let order_id = format!("ord-{}", hex::encode(helpers::random_bytes::<8>()));

    db::insert_order(&pool, &merchant_pub, &order_id, r#"{"amount":"KUDOS:5"}"#)
        .await
        .unwrap();

    // Duplicate order ids conflict
    let dup = db::insert_order(&pool, &merchant_pub, &order_id, "{}").await;
    assert!(matches!(dup, Err(db::DbError::UniqueViolation)));

    let h_first = Sha512Hash::compute(b"contract-with-nonce-A");
    let h_second = Sha512Hash::compute(b"contract-with-nonce-B");

    let won = db::promote_order_to_contract(
        &pool,
        &merchant_pub,
        &order_id,
        r#"{"nonce":"A"}"#,
        h_first.as_bytes(),
    )
    .await
    .unwrap();
    assert!(won);

    // The losing racer must not replace the committed terms
    let lost = db::promote_order_to_contract(
        &pool,
        &merchant_pub,
        &order_id,
        r#"{"nonce":"B"}"#,
        h_second.as_bytes(),
    )
    .await
    .unwrap();
    assert!(!lost);

    let row = db::lookup_contract_terms(&pool, &merchant_pub, &order_id)
        .await
        .unwrap()
        .expect("contract row exists");
    assert_eq!(row.h_contract, h_first.as_bytes().to_vec());
    assert!(!row.paid);

    // The bare order is gone after promotion
    assert!(db::lookup_order(&pool, &merchant_pub, &order_id)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
#[ignore]
async fn test_deposit_idempotence_and_paid_transition() {
    let pool = helpers::pool().await;
    let h_contract = helpers::random_bytes::<64>();
    let merchant_pub = helpers::random_bytes::<32>();
    let order_id = format!("ord-{}", hex::encode(helpers::random_bytes::<8>()));

    db::insert_order(&pool, &merchant_pub, &order_id, "{}")
        .await
        .unwrap();
    db::promote_order_to_contract(&pool, &merchant_pub, &order_id, "{}", &h_contract)
        .await
        .unwrap();

    let deposit = NewDeposit {
        h_contract: h_contract.to_vec(),
        coin_pub: helpers::random_bytes::<32>().to_vec(),
        exchange_url: "https://exchange.example.com/".to_string(),
        amount_with_fee: "KUDOS:5".to_string(),
        deposit_fee: "KUDOS:0.01".to_string(),
        refund_fee: "KUDOS:0.01".to_string(),
        exchange_sig: vec![0u8; 64],
        exchange_pub: vec![0u8; 32],
    };
    db::insert_deposit(&pool, &deposit).await.unwrap();
    db::insert_deposit(&pool, &deposit).await.unwrap();
    assert_eq!(db::lookup_deposits(&pool, &h_contract).await.unwrap().len(), 1);
    assert!(db::has_paid_deposit(&pool, &h_contract).await.unwrap());

    // Exactly one observable paid transition
    assert!(db::mark_contract_paid(&pool, &h_contract).await.unwrap());
    assert!(!db::mark_contract_paid(&pool, &h_contract).await.unwrap());
}

#[tokio::test]
#[ignore]
async fn test_tip_pickup_is_idempotent_and_conserves_funds() {
    let pool = helpers::pool().await;
    let reserve_priv = helpers::random_bytes::<32>();
    let tip_id = helpers::random_bytes::<32>();
    let expiration = Utc::now() + Duration::days(1);

    db::upsert_tip_reserve(
        &pool,
        &reserve_priv,
        "https://exchange.example.com/",
        expiration,
        "KUDOS:10",
        "KUDOS:0",
        "KUDOS:0",
    )
    .await
    .unwrap();

    let outcome = db::authorize_tip(
        &pool,
        &reserve_priv,
        &tip_id,
        "https://exchange.example.com/",
        "thanks for testing",
        &amount("KUDOS:2"),
        expiration,
    )
    .await
    .unwrap();
    assert!(matches!(outcome, AuthorizeOutcome::Ok));

    // Authorizing beyond the reserve's balance must fail
    let over = db::authorize_tip(
        &pool,
        &reserve_priv,
        &helpers::random_bytes::<32>(),
        "https://exchange.example.com/",
        "too much",
        &amount("KUDOS:9"),
        expiration,
    )
    .await
    .unwrap();
    assert!(matches!(over, AuthorizeOutcome::InsufficientFunds));

    let pickup_id = helpers::random_bytes::<64>();
    let first = db::pickup_tip(&pool, &amount("KUDOS:2"), &tip_id, &pickup_id)
        .await
        .unwrap();
    assert!(matches!(&first, PickupOutcome::Fresh { .. }));

    // Replaying the same pickup_id returns the same reserve, no decrement
    let replay = db::pickup_tip(&pool, &amount("KUDOS:2"), &tip_id, &pickup_id)
        .await
        .unwrap();
    match (first, replay) {
        (
            PickupOutcome::Fresh { reserve_priv: a },
            PickupOutcome::Replay { reserve_priv: b },
        ) => assert_eq!(a, b),
        other => panic!("unexpected outcomes: {:?}", other),
    }

    let tip = db::lookup_tip(&pool, &tip_id).await.unwrap().unwrap();
    assert_eq!(tip.amount_left, "KUDOS:0");

    // A different pickup against the drained tip reports no funds
    let drained = db::pickup_tip(
        &pool,
        &amount("KUDOS:0.00000001"),
        &tip_id,
        &helpers::random_bytes::<64>(),
    )
    .await
    .unwrap();
    assert!(matches!(drained, PickupOutcome::NoFunds));
}

#[tokio::test]
#[ignore]
async fn test_refund_accumulation_is_monotonic() {
    let pool = helpers::pool().await;
    let h_contract = helpers::random_bytes::<64>();
    let coin_pub = helpers::random_bytes::<32>();

    let mut last_rtx = 0i64;
    for (i, step) in ["KUDOS:1", "KUDOS:0.5"].iter().enumerate() {
        let rtx = db::insert_refund(
            &pool,
            &NewRefund {
                h_contract: h_contract.to_vec(),
                coin_pub: coin_pub.to_vec(),
                exchange_url: "https://exchange.example.com/".to_string(),
                reason: format!("increment {}", i),
                refund_amount: step.to_string(),
                refund_fee: "KUDOS:0.01".to_string(),
            },
        )
        .await
        .unwrap();
        assert!(rtx > last_rtx, "rtransaction_id must be strictly increasing");
        last_rtx = rtx;
    }

    let total = db::refund_total(&pool, &h_contract, "KUDOS").await.unwrap();
    assert_eq!(total.to_string(), "KUDOS:1.5");
}
