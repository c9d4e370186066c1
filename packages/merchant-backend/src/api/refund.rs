//! Refund engine: merchant-triggered refund increases distributed across a
//! contract's deposited coins, and the public refund listing. Cumulative
//! refunds per coin never exceed that coin's deposited amount.

use std::cmp::Ordering;

use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};

use taler_common::amount::Amount;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::crypto::keys::{EddsaPublicKey, EddsaSignature};
use taler_common::crypto::purpose;
use taler_common::errors::ErrorCode;

use crate::api::{ApiError, ServerState};
use crate::db::{self, NewRefund, RETRY_BUDGET_REFUND};
use crate::longpoll::{PayKey, WakeEvent};
use crate::metrics;

#[derive(Deserialize)]
pub struct RefundIncreaseRequest {
    pub order_id: String,
    /// Target cumulative refund for the whole contract
    pub refund: Amount,
    pub reason: String,
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Serialize)]
pub struct RefundDetail {
    pub coin_pub: EddsaPublicKey,
    pub rtransaction_id: u64,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub exchange_url: String,
    pub reason: String,
    pub merchant_sig: EddsaSignature,
}

#[derive(Serialize)]
pub struct RefundReply {
    pub h_contract_terms: Sha512Hash,
    pub merchant_pub: EddsaPublicKey,
    pub refunds: Vec<RefundDetail>,
}

/// POST /refund
///
/// Raises the contract's cumulative refund to the requested total. A target
/// at or below the current total is an idempotent no-op; a target beyond
/// what was deposited is a conflict. Nothing is written unless the whole
/// increase fits.
pub async fn increase_refund(
    State(server): State<ServerState>,
    Json(request): Json<RefundIncreaseRequest>,
) -> Result<Json<RefundReply>, ApiError> {
    let instance = server
        .instance(request.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;
    if request.refund.currency != server.cfg.currency {
        return Err(ApiError::bad_request(
            ErrorCode::ParameterMalformed,
            "refund amount uses the wrong currency",
        ));
    }

    let row = db::lookup_contract_terms(&server.db, instance.pubkey.as_bytes(), &request.order_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(ErrorCode::RefundOrderNotFound, "unknown order id")
        })?;
    if !row.paid {
        return Err(ApiError::conflict(
            ErrorCode::Invalid,
            "order is not paid; an unpaid order is aborted, not refunded",
        ));
    }
    let h_contract = Sha512Hash::from_slice(&row.h_contract).ok_or_else(|| {
        ApiError::internal(
            ErrorCode::InternalInvariantFailure,
            "stored contract hash has the wrong length",
        )
    })?;

    let deposits = db::lookup_deposits(&server.db, &row.h_contract).await?;
    let refunds = db::lookup_refunds(&server.db, &row.h_contract).await?;

    let current = db::refund_total(&server.db, &row.h_contract, &server.cfg.currency).await?;
    if matches!(
        request.refund.cmp_checked(&current),
        Ok(Ordering::Less) | Ok(Ordering::Equal)
    ) {
        // Already at or beyond the requested total
        return reply_with_refunds(&server, instance.pubkey, h_contract).await;
    }
    let mut remaining = request
        .refund
        .checked_sub(&current)
        .map_err(|_| ApiError::bad_request(ErrorCode::ParameterMalformed, "bad refund total"))?;

    // Per-coin capacity: deposited amount_with_fee minus refunds so far.
    // The whole increase must fit before anything is written.
    let mut plan = Vec::new();
    for deposit in deposits.iter().filter(|d| !d.rejected) {
        if remaining.is_zero() {
            break;
        }
        let amount_with_fee = deposit.amount_with_fee().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt deposit amount")
        })?;
        let mut refunded = Amount::zero(&server.cfg.currency);
        for refund in refunds.iter().filter(|r| r.coin_pub == deposit.coin_pub) {
            let amount = refund.refund_amount().map_err(|_| {
                ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt refund amount")
            })?;
            refunded = refunded.checked_add(&amount).map_err(|_| {
                ApiError::internal(ErrorCode::InternalInvariantFailure, "refund sum overflow")
            })?;
        }
        let capacity = match amount_with_fee.checked_sub(&refunded) {
            Ok(c) => c,
            Err(_) => continue,
        };
        if capacity.is_zero() {
            continue;
        }
        let share = if matches!(remaining.cmp_checked(&capacity), Ok(Ordering::Greater)) {
            capacity
        } else {
            remaining.clone()
        };
        remaining = remaining
            .checked_sub(&share)
            .map_err(|_| ApiError::internal(ErrorCode::InternalInvariantFailure, "plan underflow"))?;
        let refund_fee = deposit.refund_fee().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt refund fee")
        })?;
        plan.push((deposit, share, refund_fee));
    }
    if !remaining.is_zero() {
        return Err(ApiError::conflict(
            ErrorCode::RefundExceedsDeposit,
            "requested refund exceeds what was deposited",
        ));
    }

    for (deposit, share, refund_fee) in &plan {
        let refund = NewRefund {
            h_contract: row.h_contract.clone(),
            coin_pub: deposit.coin_pub.clone(),
            exchange_url: deposit.exchange_url.clone(),
            reason: request.reason.clone(),
            refund_amount: share.to_string(),
            refund_fee: refund_fee.to_string(),
        };
        let mut attempt = 0;
        loop {
            match db::insert_refund(&server.db, &refund).await {
                Ok(_) => break,
                Err(e) if e.is_soft() && attempt < RETRY_BUDGET_REFUND => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        }
        metrics::REFUNDS_RECORDED.inc();
    }

    let total = db::refund_total(&server.db, &row.h_contract, &server.cfg.currency).await?;
    tracing::info!(
        order_id = %request.order_id,
        total = %total,
        "refund increased"
    );
    server.longpoll.wake(
        PayKey::compute(&request.order_id, &instance.pubkey),
        WakeEvent::RefundIncreased(total),
    );

    reply_with_refunds(&server, instance.pubkey, h_contract).await
}

#[derive(Deserialize)]
pub struct RefundQuery {
    pub order_id: String,
    #[serde(default)]
    pub instance: Option<String>,
}

/// GET /refund
pub async fn query_refunds(
    State(server): State<ServerState>,
    Query(query): Query<RefundQuery>,
) -> Result<Json<RefundReply>, ApiError> {
    let instance = server
        .instance(query.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;
    let row = db::lookup_contract_terms(&server.db, instance.pubkey.as_bytes(), &query.order_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(ErrorCode::RefundOrderNotFound, "unknown order id")
        })?;
    let h_contract = Sha512Hash::from_slice(&row.h_contract).ok_or_else(|| {
        ApiError::internal(
            ErrorCode::InternalInvariantFailure,
            "stored contract hash has the wrong length",
        )
    })?;
    reply_with_refunds(&server, instance.pubkey, h_contract).await
}

/// Build the refund listing; merchant signatures re-derive deterministically
async fn reply_with_refunds(
    server: &ServerState,
    merchant_pub: EddsaPublicKey,
    h_contract: Sha512Hash,
) -> Result<Json<RefundReply>, ApiError> {
    let instance = server
        .instances
        .values()
        .find(|i| i.pubkey == merchant_pub)
        .ok_or_else(ApiError::unknown_instance)?;

    let rows = db::lookup_refunds(&server.db, h_contract.as_bytes()).await?;
    let mut refunds = Vec::with_capacity(rows.len());
    for row in rows {
        let coin_pub: [u8; 32] = row.coin_pub.as_slice().try_into().map_err(|_| {
            ApiError::internal(
                ErrorCode::InternalInvariantFailure,
                "stored coin key has the wrong length",
            )
        })?;
        let coin_pub = EddsaPublicKey::from_bytes(coin_pub);
        let refund_amount = row.refund_amount().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt refund amount")
        })?;
        let refund_fee: Amount = row.refund_fee.parse().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt refund fee")
        })?;
        let merchant_sig = purpose::merchant_refund(
            &h_contract,
            &coin_pub,
            row.rtransaction_id as u64,
            &refund_amount,
            &refund_fee,
        )
        .sign(&instance.key);
        refunds.push(RefundDetail {
            coin_pub,
            rtransaction_id: row.rtransaction_id as u64,
            refund_amount,
            refund_fee,
            exchange_url: row.exchange_url,
            reason: row.reason,
            merchant_sig,
        });
    }

    Ok(Json(RefundReply {
        h_contract_terms: h_contract,
        merchant_pub,
        refunds,
    }))
}
