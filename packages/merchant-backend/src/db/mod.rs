//! Database gateway.
//!
//! One async function per query. Every failure is classified into the
//! soft/hard taxonomy: soft errors (serialization failures, deadlocks, pool
//! timeouts) are worth a bounded retry, hard errors abort the request.
//! `test_before_acquire` on the pool pings each connection before use.

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

use taler_common::amount::Amount;

pub mod models;

pub use models::*;

/// Retry budget for simple inserts and upserts
pub const RETRY_BUDGET_INSERT: u32 = 3;
/// Retry budget for refund accumulation
pub const RETRY_BUDGET_REFUND: u32 = 5;

/// Database errors, split by whether a retry can help
#[derive(Debug, thiserror::Error)]
pub enum DbError {
    /// Transient: serialization failure, deadlock, pool timeout
    #[error("transient database error: {0}")]
    Soft(sqlx::Error),
    /// Permanent: constraint violations other than uniqueness, bad SQL, I/O
    #[error("database error: {0}")]
    Hard(sqlx::Error),
    /// A uniqueness constraint fired; callers map this to a conflict
    #[error("uniqueness constraint violated")]
    UniqueViolation,
    /// A stored value (usually an amount) failed to parse
    #[error("corrupt row in database: {0}")]
    Corrupt(String),
}

impl DbError {
    pub fn is_soft(&self) -> bool {
        matches!(self, DbError::Soft(_))
    }
}

/// Classify an sqlx error into the soft/hard taxonomy
fn classify(e: sqlx::Error) -> DbError {
    let sqlstate = match &e {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    };
    match sqlstate.as_deref() {
        // serialization_failure, deadlock_detected
        Some("40001") | Some("40P01") => return DbError::Soft(e),
        Some("23505") => return DbError::UniqueViolation,
        Some(_) => return DbError::Hard(e),
        None => {}
    }
    if matches!(&e, sqlx::Error::PoolTimedOut | sqlx::Error::Io(_)) {
        DbError::Soft(e)
    } else {
        DbError::Hard(e)
    }
}

fn corrupt_amount(context: &str, raw: &str) -> DbError {
    error!(context, raw, "stored amount failed to parse");
    DbError::Corrupt(format!("{}: {:?}", context, raw))
}

/// Create the connection pool. Each checkout pings the connection first so
/// stale sockets surface as soft errors instead of failing mid-request.
pub async fn create_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .test_before_acquire(true)
        .connect(database_url)
        .await
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

// ============ Orders ============

/// Insert a bare order; a duplicate id surfaces as `UniqueViolation`
pub async fn insert_order(
    pool: &PgPool,
    merchant_pub: &[u8],
    order_id: &str,
    order_json: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO merchant_orders (order_id, merchant_pub, order_json) VALUES ($1, $2, $3)"#,
    )
    .bind(order_id)
    .bind(merchant_pub)
    .bind(order_json)
    .execute(pool)
    .await
    .map_err(classify)?;
    Ok(())
}

pub async fn lookup_order(
    pool: &PgPool,
    merchant_pub: &[u8],
    order_id: &str,
) -> Result<Option<OrderRow>, DbError> {
    sqlx::query_as::<_, OrderRow>(
        r#"SELECT order_id, merchant_pub, order_json, created_at
           FROM merchant_orders WHERE order_id = $1 AND merchant_pub = $2"#,
    )
    .bind(order_id)
    .bind(merchant_pub)
    .fetch_optional(pool)
    .await
    .map_err(classify)
}

// ============ Contract terms ============

const CONTRACT_SELECT: &str = r#"order_id, merchant_pub, contract_json, h_contract,
    created_at, paid, aborted"#;

/// Promote an order into signed contract terms. Inserts the contract row
/// (first writer wins via ON CONFLICT DO NOTHING) and deletes the bare order
/// in the same transaction. Returns whether this call did the promotion.
pub async fn promote_order_to_contract(
    pool: &PgPool,
    merchant_pub: &[u8],
    order_id: &str,
    contract_json: &str,
    h_contract: &[u8],
) -> Result<bool, DbError> {
    let mut tx = pool.begin().await.map_err(classify)?;
    let inserted = sqlx::query(
        r#"INSERT INTO merchant_contract_terms (order_id, merchant_pub, contract_json, h_contract)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (order_id, merchant_pub) DO NOTHING"#,
    )
    .bind(order_id)
    .bind(merchant_pub)
    .bind(contract_json)
    .bind(h_contract)
    .execute(&mut *tx)
    .await
    .map_err(classify)?
    .rows_affected()
        > 0;
    if inserted {
        sqlx::query(r#"DELETE FROM merchant_orders WHERE order_id = $1 AND merchant_pub = $2"#)
            .bind(order_id)
            .bind(merchant_pub)
            .execute(&mut *tx)
            .await
            .map_err(classify)?;
    }
    tx.commit().await.map_err(classify)?;
    Ok(inserted)
}

pub async fn lookup_contract_terms(
    pool: &PgPool,
    merchant_pub: &[u8],
    order_id: &str,
) -> Result<Option<ContractTermsRow>, DbError> {
    let query = format!(
        "SELECT {} FROM merchant_contract_terms WHERE order_id = $1 AND merchant_pub = $2",
        CONTRACT_SELECT
    );
    sqlx::query_as::<_, ContractTermsRow>(&query)
        .bind(order_id)
        .bind(merchant_pub)
        .fetch_optional(pool)
        .await
        .map_err(classify)
}

pub async fn lookup_contract_terms_by_hash(
    pool: &PgPool,
    merchant_pub: &[u8],
    h_contract: &[u8],
) -> Result<Option<ContractTermsRow>, DbError> {
    let query = format!(
        "SELECT {} FROM merchant_contract_terms WHERE h_contract = $1 AND merchant_pub = $2",
        CONTRACT_SELECT
    );
    sqlx::query_as::<_, ContractTermsRow>(&query)
        .bind(h_contract)
        .bind(merchant_pub)
        .fetch_optional(pool)
        .await
        .map_err(classify)
}

/// First paid transition wins; returns whether this call flipped the flag
pub async fn mark_contract_paid(pool: &PgPool, h_contract: &[u8]) -> Result<bool, DbError> {
    let result = sqlx::query(
        r#"UPDATE merchant_contract_terms SET paid = TRUE WHERE h_contract = $1 AND paid = FALSE"#,
    )
    .bind(h_contract)
    .execute(pool)
    .await
    .map_err(classify)?;
    Ok(result.rows_affected() > 0)
}

/// After an abort no further deposits are accepted for the contract
pub async fn mark_contract_aborted(pool: &PgPool, h_contract: &[u8]) -> Result<(), DbError> {
    sqlx::query(r#"UPDATE merchant_contract_terms SET aborted = TRUE WHERE h_contract = $1"#)
        .bind(h_contract)
        .execute(pool)
        .await
        .map_err(classify)?;
    Ok(())
}

// ============ Deposits ============

const DEPOSIT_SELECT: &str = r#"h_contract, coin_pub, exchange_url, amount_with_fee,
    deposit_fee, refund_fee, exchange_sig, exchange_pub, rejected, rejection_proof, created_at"#;

/// Record a successful deposit. Replays hit the primary key and are no-ops.
pub async fn insert_deposit(pool: &PgPool, deposit: &NewDeposit) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO merchant_deposits
             (h_contract, coin_pub, exchange_url, amount_with_fee, deposit_fee, refund_fee,
              exchange_sig, exchange_pub)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
           ON CONFLICT (h_contract, coin_pub) DO NOTHING"#,
    )
    .bind(&deposit.h_contract)
    .bind(&deposit.coin_pub)
    .bind(&deposit.exchange_url)
    .bind(&deposit.amount_with_fee)
    .bind(&deposit.deposit_fee)
    .bind(&deposit.refund_fee)
    .bind(&deposit.exchange_sig)
    .bind(&deposit.exchange_pub)
    .execute(pool)
    .await
    .map_err(classify)?;
    Ok(())
}

/// Record the permanent double-spend state for a coin, proof included
pub async fn insert_rejected_deposit(
    pool: &PgPool,
    h_contract: &[u8],
    coin_pub: &[u8],
    exchange_url: &str,
    amount_with_fee: &str,
    zero_fee: &str,
    proof_json: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO merchant_deposits
             (h_contract, coin_pub, exchange_url, amount_with_fee, deposit_fee, refund_fee,
              rejected, rejection_proof)
           VALUES ($1, $2, $3, $4, $5, $5, TRUE, $6)
           ON CONFLICT (h_contract, coin_pub) DO NOTHING"#,
    )
    .bind(h_contract)
    .bind(coin_pub)
    .bind(exchange_url)
    .bind(amount_with_fee)
    .bind(zero_fee)
    .bind(proof_json)
    .execute(pool)
    .await
    .map_err(classify)?;
    Ok(())
}

pub async fn lookup_deposits(pool: &PgPool, h_contract: &[u8]) -> Result<Vec<DepositRow>, DbError> {
    let query = format!(
        "SELECT {} FROM merchant_deposits WHERE h_contract = $1 ORDER BY created_at",
        DEPOSIT_SELECT
    );
    sqlx::query_as::<_, DepositRow>(&query)
        .bind(h_contract)
        .fetch_all(pool)
        .await
        .map_err(classify)
}

/// Whether any accepted (non-rejected) deposit exists for the contract
pub async fn has_paid_deposit(pool: &PgPool, h_contract: &[u8]) -> Result<bool, DbError> {
    let row: (bool,) = sqlx::query_as(
        r#"SELECT EXISTS(
             SELECT 1 FROM merchant_deposits WHERE h_contract = $1 AND rejected = FALSE)"#,
    )
    .bind(h_contract)
    .fetch_one(pool)
    .await
    .map_err(classify)?;
    Ok(row.0)
}

// ============ Session bindings ============

pub async fn upsert_session_binding(
    pool: &PgPool,
    session_id: &str,
    fulfillment_url: &str,
    merchant_pub: &[u8],
    order_id: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO merchant_session_info (session_id, fulfillment_url, merchant_pub, order_id)
           VALUES ($1, $2, $3, $4)
           ON CONFLICT (session_id, fulfillment_url, merchant_pub) DO NOTHING"#,
    )
    .bind(session_id)
    .bind(fulfillment_url)
    .bind(merchant_pub)
    .bind(order_id)
    .execute(pool)
    .await
    .map_err(classify)?;
    Ok(())
}

/// The order id this browser session already paid under, if any
pub async fn find_session_binding(
    pool: &PgPool,
    session_id: &str,
    fulfillment_url: &str,
    merchant_pub: &[u8],
) -> Result<Option<String>, DbError> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"SELECT order_id FROM merchant_session_info
           WHERE session_id = $1 AND fulfillment_url = $2 AND merchant_pub = $3"#,
    )
    .bind(session_id)
    .bind(fulfillment_url)
    .bind(merchant_pub)
    .fetch_optional(pool)
    .await
    .map_err(classify)?;
    Ok(row.map(|r| r.0))
}

// ============ Refunds ============

/// Insert one refund increment; returns the fresh rtransaction_id
pub async fn insert_refund(pool: &PgPool, refund: &NewRefund) -> Result<i64, DbError> {
    let row: (i64,) = sqlx::query_as(
        r#"INSERT INTO merchant_refunds
             (h_contract, coin_pub, exchange_url, reason, refund_amount, refund_fee)
           VALUES ($1, $2, $3, $4, $5, $6)
           RETURNING rtransaction_id"#,
    )
    .bind(&refund.h_contract)
    .bind(&refund.coin_pub)
    .bind(&refund.exchange_url)
    .bind(&refund.reason)
    .bind(&refund.refund_amount)
    .bind(&refund.refund_fee)
    .fetch_one(pool)
    .await
    .map_err(classify)?;
    Ok(row.0)
}

pub async fn lookup_refunds(pool: &PgPool, h_contract: &[u8]) -> Result<Vec<RefundRow>, DbError> {
    sqlx::query_as::<_, RefundRow>(
        r#"SELECT rtransaction_id, h_contract, coin_pub, exchange_url, reason,
                  refund_amount, refund_fee, created_at
           FROM merchant_refunds WHERE h_contract = $1 ORDER BY rtransaction_id"#,
    )
    .bind(h_contract)
    .fetch_all(pool)
    .await
    .map_err(classify)
}

/// Cumulative refund across all coins of a contract
pub async fn refund_total(
    pool: &PgPool,
    h_contract: &[u8],
    currency: &str,
) -> Result<Amount, DbError> {
    let refunds = lookup_refunds(pool, h_contract).await?;
    let mut total = Amount::zero(currency);
    for refund in &refunds {
        let amount = refund
            .refund_amount()
            .map_err(|_| corrupt_amount("refund_amount", &refund.refund_amount))?;
        total = total
            .checked_add(&amount)
            .map_err(|e| DbError::Corrupt(format!("refund sum: {}", e)))?;
    }
    Ok(total)
}

// ============ Tip reserves ============

/// Refresh the ledger mirror of a reserve from the exchange's history.
/// `amount_authorized` is preserved across refreshes and seeded to zero.
pub async fn upsert_tip_reserve(
    pool: &PgPool,
    reserve_priv: &[u8],
    exchange_url: &str,
    expiration: DateTime<Utc>,
    amount_deposited: &str,
    amount_withdrawn: &str,
    zero: &str,
) -> Result<(), DbError> {
    sqlx::query(
        r#"INSERT INTO merchant_tip_reserves
             (reserve_priv, exchange_url, expiration, amount_deposited, amount_withdrawn,
              amount_authorized)
           VALUES ($1, $2, $3, $4, $5, $6)
           ON CONFLICT (reserve_priv) DO UPDATE SET
             exchange_url = EXCLUDED.exchange_url,
             expiration = EXCLUDED.expiration,
             amount_deposited = EXCLUDED.amount_deposited,
             amount_withdrawn = EXCLUDED.amount_withdrawn"#,
    )
    .bind(reserve_priv)
    .bind(exchange_url)
    .bind(expiration)
    .bind(amount_deposited)
    .bind(amount_withdrawn)
    .bind(zero)
    .execute(pool)
    .await
    .map_err(classify)?;
    Ok(())
}

pub async fn get_tip_reserve(
    pool: &PgPool,
    reserve_priv: &[u8],
) -> Result<Option<TipReserveRow>, DbError> {
    sqlx::query_as::<_, TipReserveRow>(
        r#"SELECT reserve_priv, exchange_url, expiration, amount_deposited, amount_withdrawn,
                  amount_authorized
           FROM merchant_tip_reserves WHERE reserve_priv = $1"#,
    )
    .bind(reserve_priv)
    .fetch_optional(pool)
    .await
    .map_err(classify)
}

/// Outcome of a tip authorization attempt
#[derive(Debug)]
pub enum AuthorizeOutcome {
    Ok,
    InsufficientFunds,
    ReserveUnknown,
}

/// Authorize a tip against the reserve's ledger, atomically: the funds check
/// and the `amount_authorized` bump happen under a row lock.
pub async fn authorize_tip(
    pool: &PgPool,
    reserve_priv: &[u8],
    tip_id: &[u8],
    exchange_url: &str,
    justification: &str,
    amount: &Amount,
    expiration: DateTime<Utc>,
) -> Result<AuthorizeOutcome, DbError> {
    let mut tx = pool.begin().await.map_err(classify)?;

    let reserve = sqlx::query_as::<_, TipReserveRow>(
        r#"SELECT reserve_priv, exchange_url, expiration, amount_deposited, amount_withdrawn,
                  amount_authorized
           FROM merchant_tip_reserves WHERE reserve_priv = $1 FOR UPDATE"#,
    )
    .bind(reserve_priv)
    .fetch_optional(&mut *tx)
    .await
    .map_err(classify)?;
    let reserve = match reserve {
        Some(r) => r,
        None => return Ok(AuthorizeOutcome::ReserveUnknown),
    };

    let deposited = reserve
        .amount_deposited()
        .map_err(|_| corrupt_amount("amount_deposited", &reserve.amount_deposited))?;
    let withdrawn = reserve
        .amount_withdrawn()
        .map_err(|_| corrupt_amount("amount_withdrawn", &reserve.amount_withdrawn))?;
    let authorized = reserve
        .amount_authorized()
        .map_err(|_| corrupt_amount("amount_authorized", &reserve.amount_authorized))?;

    let available = match deposited.checked_sub(&withdrawn) {
        Ok(a) => a,
        Err(_) => return Ok(AuthorizeOutcome::InsufficientFunds),
    };
    let new_authorized = authorized
        .checked_add(amount)
        .map_err(|e| DbError::Corrupt(format!("authorized sum: {}", e)))?;
    if new_authorized
        .cmp_checked(&available)
        .map_err(|e| DbError::Corrupt(format!("authorized cmp: {}", e)))?
        == std::cmp::Ordering::Greater
    {
        return Ok(AuthorizeOutcome::InsufficientFunds);
    }

    sqlx::query(
        r#"UPDATE merchant_tip_reserves SET amount_authorized = $1 WHERE reserve_priv = $2"#,
    )
    .bind(new_authorized.to_string())
    .bind(reserve_priv)
    .execute(&mut *tx)
    .await
    .map_err(classify)?;

    sqlx::query(
        r#"INSERT INTO merchant_tips
             (tip_id, reserve_priv, exchange_url, justification, amount, amount_left, expiration)
           VALUES ($1, $2, $3, $4, $5, $5, $6)"#,
    )
    .bind(tip_id)
    .bind(reserve_priv)
    .bind(exchange_url)
    .bind(justification)
    .bind(amount.to_string())
    .bind(expiration)
    .execute(&mut *tx)
    .await
    .map_err(classify)?;

    tx.commit().await.map_err(classify)?;
    Ok(AuthorizeOutcome::Ok)
}

// ============ Tips ============

const TIP_SELECT: &str = r#"tip_id, reserve_priv, exchange_url, justification, amount,
    amount_left, expiration, created_at"#;

pub async fn lookup_tip(pool: &PgPool, tip_id: &[u8]) -> Result<Option<TipRow>, DbError> {
    let query = format!("SELECT {} FROM merchant_tips WHERE tip_id = $1", TIP_SELECT);
    sqlx::query_as::<_, TipRow>(&query)
        .bind(tip_id)
        .fetch_optional(pool)
        .await
        .map_err(classify)
}

pub async fn tips_for_reserve(pool: &PgPool, reserve_priv: &[u8]) -> Result<Vec<TipRow>, DbError> {
    let query = format!(
        "SELECT {} FROM merchant_tips WHERE reserve_priv = $1",
        TIP_SELECT
    );
    sqlx::query_as::<_, TipRow>(&query)
        .bind(reserve_priv)
        .fetch_all(pool)
        .await
        .map_err(classify)
}

/// Outcome of the transactional pickup step
#[derive(Debug)]
pub enum PickupOutcome {
    /// Fresh pickup: `tip_amount_left` was decremented
    Fresh { reserve_priv: Vec<u8> },
    /// Same pickup_id seen before: serve the stored outcome, mutate nothing
    Replay { reserve_priv: Vec<u8> },
    UnknownTip,
    Expired,
    NoFunds,
}

/// The transactional core of tip pickup. Holds a row lock on the tip while
/// checking the balance, so concurrent pickups serialize.
pub async fn pickup_tip(
    pool: &PgPool,
    total: &Amount,
    tip_id: &[u8],
    pickup_id: &[u8],
) -> Result<PickupOutcome, DbError> {
    let mut tx = pool.begin().await.map_err(classify)?;

    // Replay check first: a stored pickup answers without touching the tip
    let replay: Option<(Vec<u8>,)> = sqlx::query_as(
        r#"SELECT t.reserve_priv FROM merchant_tip_pickups p
           JOIN merchant_tips t ON t.tip_id = p.tip_id
           WHERE p.pickup_id = $1"#,
    )
    .bind(pickup_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(classify)?;
    if let Some((reserve_priv,)) = replay {
        tx.commit().await.map_err(classify)?;
        return Ok(PickupOutcome::Replay { reserve_priv });
    }

    let query = format!(
        "SELECT {} FROM merchant_tips WHERE tip_id = $1 FOR UPDATE",
        TIP_SELECT
    );
    let tip = sqlx::query_as::<_, TipRow>(&query)
        .bind(tip_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(classify)?;
    let tip = match tip {
        Some(t) => t,
        None => return Ok(PickupOutcome::UnknownTip),
    };
    if tip.expiration < Utc::now() {
        return Ok(PickupOutcome::Expired);
    }

    let left = tip
        .amount_left()
        .map_err(|_| corrupt_amount("amount_left", &tip.amount_left))?;
    let remaining = match left.checked_sub(total) {
        Ok(r) => r,
        Err(_) => return Ok(PickupOutcome::NoFunds),
    };

    sqlx::query(r#"UPDATE merchant_tips SET amount_left = $1 WHERE tip_id = $2"#)
        .bind(remaining.to_string())
        .bind(tip_id)
        .execute(&mut *tx)
        .await
        .map_err(classify)?;

    sqlx::query(
        r#"INSERT INTO merchant_tip_pickups (pickup_id, tip_id, amount) VALUES ($1, $2, $3)"#,
    )
    .bind(pickup_id)
    .bind(tip_id)
    .bind(total.to_string())
    .execute(&mut *tx)
    .await
    .map_err(classify)?;

    tx.commit().await.map_err(classify)?;
    Ok(PickupOutcome::Fresh {
        reserve_priv: tip.reserve_priv,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_hard_split() {
        assert!(classify(sqlx::Error::PoolTimedOut).is_soft());
        assert!(!classify(sqlx::Error::RowNotFound).is_soft());
        assert!(classify(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset"
        )))
        .is_soft());
    }

    #[test]
    fn test_retry_budgets() {
        // The engines count on these exact values
        assert_eq!(RETRY_BUDGET_INSERT, 3);
        assert_eq!(RETRY_BUDGET_REFUND, 5);
    }
}
