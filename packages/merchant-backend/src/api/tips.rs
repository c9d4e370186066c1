//! Tip engine: reserve-backed authorization, planchet-based pickup that is
//! transactional against the reserve balance observed from the exchange,
//! and idempotent retry via the deterministic pickup identifier.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use taler_common::amount::Amount;
use taler_common::base32;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::crypto::keys::{EddsaPrivateKey, EddsaPublicKey, EddsaSignature};
use taler_common::crypto::purpose;
use taler_common::errors::ErrorCode;
use taler_common::time::Timestamp;
use taler_exchange_client::types::CoinEnvelope;

use crate::api::{ApiError, ServerState};
use crate::db::{self, AuthorizeOutcome, PickupOutcome};
use crate::instance::{Instance, TipReserve};
use crate::metrics;

/// Upper bound on planchets per pickup
pub const MAX_PLANCHETS: usize = 1024;

// ============ POST /tip-authorize ============

#[derive(Deserialize)]
pub struct TipAuthorizeRequest {
    pub amount: Amount,
    pub justification: String,
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Serialize)]
pub struct TipAuthorizeReply {
    pub tip_id: String,
    pub expiration: Timestamp,
    pub exchange_url: String,
}

pub async fn tip_authorize(
    State(server): State<ServerState>,
    Json(request): Json<TipAuthorizeRequest>,
) -> Result<Json<TipAuthorizeReply>, ApiError> {
    let instance = server
        .instance(request.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;
    let tip = tip_reserve(instance)?;
    if request.amount.currency != server.cfg.currency {
        return Err(ApiError::bad_request(
            ErrorCode::ParameterMalformed,
            "tip amount uses the wrong currency",
        ));
    }

    refresh_reserve(&server, tip).await?;

    let mut tip_id = [0u8; 32];
    rand::thread_rng().fill(&mut tip_id[..]);
    let expiration =
        Utc::now() + chrono::Duration::seconds(server.cfg.tip_expiration_secs as i64);

    match db::authorize_tip(
        &server.db,
        &tip.reserve_priv.seed_bytes(),
        &tip_id,
        &tip.exchange_url,
        &request.justification,
        &request.amount,
        expiration,
    )
    .await?
    {
        AuthorizeOutcome::Ok => {}
        AuthorizeOutcome::InsufficientFunds => {
            return Err(ApiError::new(
                StatusCode::PRECONDITION_FAILED,
                ErrorCode::TipInsufficientFunds,
                "tipping reserve lacks the funds for this authorization",
            ));
        }
        AuthorizeOutcome::ReserveUnknown => {
            return Err(ApiError::internal(
                ErrorCode::InternalInvariantFailure,
                "reserve vanished between refresh and authorization",
            ));
        }
    }

    metrics::TIPS_AUTHORIZED.inc();
    tracing::info!(
        instance = %instance.id,
        amount = %request.amount,
        "tip authorized"
    );
    Ok(Json(TipAuthorizeReply {
        tip_id: base32::encode(&tip_id),
        expiration: chrono_to_timestamp(expiration),
        exchange_url: tip.exchange_url.clone(),
    }))
}

// ============ POST /tip-pickup ============

#[derive(Deserialize)]
pub struct Planchet {
    pub denom_pub_hash: Sha512Hash,
    pub coin_ev: CoinEnvelope,
}

#[derive(Deserialize)]
pub struct TipPickupRequest {
    pub tip_id: String,
    pub planchets: Vec<Planchet>,
}

#[derive(Serialize)]
pub struct TipPickupReply {
    pub reserve_pub: EddsaPublicKey,
    pub reserve_sigs: Vec<EddsaSignature>,
}

pub async fn tip_pickup(
    State(server): State<ServerState>,
    Json(request): Json<TipPickupRequest>,
) -> Result<Json<TipPickupReply>, ApiError> {
    if request.planchets.is_empty() || request.planchets.len() > MAX_PLANCHETS {
        return Err(ApiError::bad_request(
            ErrorCode::ParameterMalformed,
            format!("between 1 and {} planchets required", MAX_PLANCHETS),
        ));
    }
    let tip_id = decode_tip_id(&request.tip_id)?;

    let tip = db::lookup_tip(&server.db, &tip_id)
        .await?
        .ok_or_else(|| ApiError::not_found(ErrorCode::TipIdUnknown, "unknown tip id"))?;

    // Denomination lookup against the tip exchange's published keys
    let found = tokio::time::timeout(
        server.cfg.exchange_wait(),
        server.exchanges.find(&tip.exchange_url, None),
    )
    .await
    .map_err(|_| {
        ApiError::dependency(
            ErrorCode::TipPickupExchangeDown,
            "tip exchange unreachable or keys unavailable",
        )
    })?
    .map_err(ApiError::from)?;

    let mut total = Amount::zero(&server.cfg.currency);
    let mut amounts = Vec::with_capacity(request.planchets.len());
    for planchet in &request.planchets {
        let denom = found
            .handle
            .keys
            .find_denom_by_hash(&planchet.denom_pub_hash)
            .ok_or_else(|| {
                ApiError::not_found(
                    ErrorCode::TipPickupDenominationUnknown,
                    "planchet references an unknown denomination",
                )
            })?;
        let amount_with_fee = denom
            .value
            .checked_add(&denom.fee_withdraw)
            .map_err(overflow)?;
        total = total.checked_add(&amount_with_fee).map_err(overflow)?;
        amounts.push((amount_with_fee, denom.fee_withdraw.clone()));
    }

    // The idempotency key is derived from the request body alone;
    // reordering planchets is a different pickup.
    let pickup_id = Sha512Hash::compute_concat(
        request
            .planchets
            .iter()
            .flat_map(|p| [p.denom_pub_hash.as_bytes().as_slice(), p.coin_ev.as_bytes()]),
    );

    let reserve_priv = match db::pickup_tip(&server.db, &total, &tip_id, pickup_id.as_bytes())
        .await?
    {
        PickupOutcome::Fresh { reserve_priv } | PickupOutcome::Replay { reserve_priv } => {
            reserve_key(&reserve_priv)?
        }
        PickupOutcome::UnknownTip => {
            return Err(ApiError::not_found(ErrorCode::TipIdUnknown, "unknown tip id"));
        }
        PickupOutcome::Expired => {
            return Err(ApiError::new(
                StatusCode::GONE,
                ErrorCode::TipExpired,
                "tip authorization expired",
            ));
        }
        PickupOutcome::NoFunds => {
            return Err(ApiError::conflict(
                ErrorCode::TipPickupNoFunds,
                "no funds",
            ));
        }
    };

    // Deterministic signatures: a replayed pickup yields byte-identical sigs
    let reserve_sigs = request
        .planchets
        .iter()
        .zip(&amounts)
        .map(|(planchet, (amount_with_fee, withdraw_fee))| {
            purpose::reserve_withdraw(
                amount_with_fee,
                withdraw_fee,
                &planchet.denom_pub_hash,
                &planchet.coin_ev.hash(),
            )
            .sign(&reserve_priv)
        })
        .collect();

    metrics::TIPS_PICKED_UP.inc();
    Ok(Json(TipPickupReply {
        reserve_pub: reserve_priv.public(),
        reserve_sigs,
    }))
}

// ============ GET /tip-pickup ============

#[derive(Deserialize)]
pub struct TipStatusQuery {
    pub tip_id: String,
}

#[derive(Serialize)]
pub struct TipStatusReply {
    pub exchange_url: String,
    pub amount: Amount,
    pub amount_left: Amount,
    pub stamp_created: Timestamp,
    pub stamp_expire: Timestamp,
    pub extra: String,
}

pub async fn tip_pickup_status(
    State(server): State<ServerState>,
    Query(query): Query<TipStatusQuery>,
) -> Result<Json<TipStatusReply>, ApiError> {
    let tip_id = decode_tip_id(&query.tip_id)?;
    let tip = db::lookup_tip(&server.db, &tip_id)
        .await?
        .ok_or_else(|| ApiError::not_found(ErrorCode::TipIdUnknown, "unknown tip id"))?;
    Ok(Json(TipStatusReply {
        exchange_url: tip.exchange_url.clone(),
        amount: parse_stored(&tip.amount)?,
        amount_left: parse_stored(&tip.amount_left)?,
        stamp_created: chrono_to_timestamp(tip.created_at),
        stamp_expire: chrono_to_timestamp(tip.expiration),
        extra: tip.justification,
    }))
}

// ============ GET /tip-query ============

#[derive(Deserialize)]
pub struct TipQueryParams {
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Serialize)]
pub struct TipQueryReply {
    pub reserve_pub: EddsaPublicKey,
    pub reserve_expiration: Timestamp,
    pub amount_authorized: Amount,
    pub amount_picked_up: Amount,
    pub amount_available: Amount,
}

pub async fn tip_query(
    State(server): State<ServerState>,
    Query(params): Query<TipQueryParams>,
) -> Result<Json<TipQueryReply>, ApiError> {
    let instance = server
        .instance(params.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;
    let tip = tip_reserve(instance)?;

    refresh_reserve(&server, tip).await?;

    let reserve_priv = tip.reserve_priv.seed_bytes();
    let reserve = db::get_tip_reserve(&server.db, &reserve_priv)
        .await?
        .ok_or_else(|| {
            ApiError::internal(
                ErrorCode::InternalInvariantFailure,
                "reserve vanished after refresh",
            )
        })?;

    let deposited = parse_stored(&reserve.amount_deposited)?;
    let withdrawn = parse_stored(&reserve.amount_withdrawn)?;
    let authorized = parse_stored(&reserve.amount_authorized)?;
    let available = deposited
        .checked_sub(&withdrawn)
        .and_then(|a| a.checked_sub(&authorized))
        .unwrap_or_else(|_| Amount::zero(&server.cfg.currency));

    let mut picked_up = Amount::zero(&server.cfg.currency);
    for tip_row in db::tips_for_reserve(&server.db, &reserve_priv).await? {
        let amount = parse_stored(&tip_row.amount)?;
        let left = parse_stored(&tip_row.amount_left)?;
        let consumed = amount
            .checked_sub(&left)
            .unwrap_or_else(|_| Amount::zero(&server.cfg.currency));
        picked_up = picked_up.checked_add(&consumed).map_err(overflow)?;
    }

    Ok(Json(TipQueryReply {
        reserve_pub: tip.reserve_priv.public(),
        reserve_expiration: chrono_to_timestamp(reserve.expiration),
        amount_authorized: authorized,
        amount_picked_up: picked_up,
        amount_available: available,
    }))
}

// ============ Shared helpers ============

fn tip_reserve(instance: &Instance) -> Result<&TipReserve, ApiError> {
    instance.tip.as_ref().ok_or_else(|| {
        ApiError::new(
            StatusCode::PRECONDITION_FAILED,
            ErrorCode::TipInstanceDisabled,
            "instance has no tipping reserve configured",
        )
    })
}

/// Pull the reserve's history from the tip exchange and mirror the totals
/// into the database. The tip engine is the only writer of this row.
async fn refresh_reserve(server: &ServerState, tip: &TipReserve) -> Result<(), ApiError> {
    let found = tokio::time::timeout(
        server.cfg.exchange_wait(),
        server.exchanges.find(&tip.exchange_url, None),
    )
    .await
    .map_err(|_| {
        ApiError::dependency(
            ErrorCode::TipPickupExchangeDown,
            "tip exchange unreachable or keys unavailable",
        )
    })?
    .map_err(ApiError::from)?;

    let reserve_pub = tip.reserve_priv.public();
    let status = found
        .handle
        .client
        .reserve_status(&reserve_pub)
        .await
        .map_err(|e| {
            tracing::warn!(exchange = %tip.exchange_url, error = %e, "reserve status failed");
            if e.is_transient() {
                server.exchanges.report_failure(&tip.exchange_url);
                ApiError::dependency(
                    ErrorCode::TipPickupExchangeDown,
                    "tip exchange unreachable",
                )
            } else {
                ApiError::dependency(
                    ErrorCode::TipQueryReserveUnknown,
                    format!("exchange rejected the reserve status query: {}", e),
                )
            }
        })?;

    let (deposited, withdrawn) = status.totals(&server.cfg.currency).map_err(|e| {
        ApiError::dependency(
            ErrorCode::TipQueryReserveUnknown,
            format!("reserve history unusable: {}", e),
        )
    })?;
    let expiration = status
        .expiration_date
        .map(timestamp_to_chrono)
        .unwrap_or_else(|| Utc::now() + chrono::Duration::days(365));

    db::upsert_tip_reserve(
        &server.db,
        &tip.reserve_priv.seed_bytes(),
        &tip.exchange_url,
        expiration,
        &deposited.to_string(),
        &withdrawn.to_string(),
        &Amount::zero(&server.cfg.currency).to_string(),
    )
    .await?;
    Ok(())
}

fn decode_tip_id(s: &str) -> Result<[u8; 32], ApiError> {
    base32::decode_fixed::<32>(s)
        .map_err(|_| ApiError::bad_request(ErrorCode::ParameterMalformed, "tip_id is not base32"))
}

fn reserve_key(bytes: &[u8]) -> Result<EddsaPrivateKey, ApiError> {
    let seed: [u8; 32] = bytes.try_into().map_err(|_| {
        ApiError::internal(
            ErrorCode::InternalInvariantFailure,
            "stored reserve key has the wrong length",
        )
    })?;
    Ok(EddsaPrivateKey::from_seed(seed))
}

fn parse_stored(raw: &str) -> Result<Amount, ApiError> {
    raw.parse().map_err(|_| {
        ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt stored amount")
    })
}

fn overflow(_: taler_common::amount::AmountError) -> ApiError {
    ApiError::bad_request(ErrorCode::TipPickupAmountOverflow, "amounts overflow")
}

fn chrono_to_timestamp(t: DateTime<Utc>) -> Timestamp {
    Timestamp::from_millis(t.timestamp_millis().max(0) as u64)
}

fn timestamp_to_chrono(t: Timestamp) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(t.millis() as i64).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn planchet(seed: u8) -> Planchet {
        Planchet {
            denom_pub_hash: Sha512Hash::compute(&[seed]),
            coin_ev: CoinEnvelope(vec![seed; 16]),
        }
    }

    fn pickup_id(planchets: &[Planchet]) -> Sha512Hash {
        Sha512Hash::compute_concat(
            planchets
                .iter()
                .flat_map(|p| [p.denom_pub_hash.as_bytes().as_slice(), p.coin_ev.as_bytes()]),
        )
    }

    #[test]
    fn test_pickup_id_is_deterministic() {
        let planchets = vec![planchet(1), planchet(2)];
        assert_eq!(pickup_id(&planchets), pickup_id(&planchets));
    }

    #[test]
    fn test_pickup_id_is_order_sensitive() {
        let forward = vec![planchet(1), planchet(2)];
        let reversed = vec![planchet(2), planchet(1)];
        assert_ne!(pickup_id(&forward), pickup_id(&reversed));
    }

    #[test]
    fn test_pickup_id_covers_the_envelope() {
        let a = vec![planchet(1)];
        let mut b = vec![planchet(1)];
        b[0].coin_ev = CoinEnvelope(vec![9; 16]);
        assert_ne!(pickup_id(&a), pickup_id(&b));
    }

    #[test]
    fn test_timestamp_chrono_round_trip() {
        let now = Utc::now();
        let ts = chrono_to_timestamp(now);
        let back = timestamp_to_chrono(ts);
        assert_eq!(back.timestamp_millis(), now.timestamp_millis());
    }
}
