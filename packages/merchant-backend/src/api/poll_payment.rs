//! Poll-payment engine: long-polled status query. Unpaid requests may park
//! on the long-poll registry until a payment (or sufficient refund) event
//! fires or the deadline passes; the database is re-checked after every
//! registration so a wake racing the suspend is never lost.

use std::cmp::Ordering;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use taler_common::amount::Amount;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::errors::ErrorCode;

use crate::api::contract::{contract_url, taler_pay_uri, ContractInfo};
use crate::api::{ApiError, ServerState};
use crate::db;
use crate::longpoll::PayKey;

#[derive(Deserialize)]
pub struct PollPaymentQuery {
    pub order_id: String,
    pub h_contract: String,
    /// Long-poll timeout in seconds; 0 (the default) answers immediately
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub session_id: Option<String>,
    /// Minimum cumulative refund to wait for
    #[serde(default)]
    pub refund: Option<Amount>,
    #[serde(default)]
    pub instance: Option<String>,
}

#[derive(Serialize)]
pub struct PollPaymentReply {
    pub paid: bool,
    pub refunded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refund_amount: Option<Amount>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub taler_pay_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract_url: Option<String>,
    pub already_paid_order_id: Option<String>,
}

/// GET /public/poll-payment
pub async fn poll_payment(
    State(server): State<ServerState>,
    Query(query): Query<PollPaymentQuery>,
) -> Result<Json<PollPaymentReply>, ApiError> {
    let instance = server
        .instance(query.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;

    let row = db::lookup_contract_terms(&server.db, instance.pubkey.as_bytes(), &query.order_id)
        .await?
        .ok_or_else(|| ApiError::not_found(ErrorCode::ProposalLookupNotFound, "unknown order"))?;
    let supplied_hash = Sha512Hash::from_base32(&query.h_contract).map_err(|_| {
        ApiError::bad_request(ErrorCode::ParameterMalformed, "h_contract is not base32")
    })?;
    if supplied_hash.as_bytes().as_slice() != row.h_contract.as_slice() {
        return Err(ApiError::bad_request(
            ErrorCode::PollContractHashMismatch,
            "h_contract does not match the stored contract terms",
        ));
    }
    if let Some(min_refund) = &query.refund {
        if min_refund.currency != server.cfg.currency {
            return Err(ApiError::bad_request(
                ErrorCode::ParameterMalformed,
                "refund threshold uses the wrong currency",
            ));
        }
    }

    let contract = row.contract()?;
    let info = ContractInfo::from_json(&contract).map_err(|field| {
        ApiError::internal(
            ErrorCode::InternalInvariantFailure,
            format!("stored contract field {:?} is unusable", field),
        )
    })?;

    let deadline = Instant::now() + Duration::from_secs(query.timeout.unwrap_or(0));
    let pay_key = PayKey::compute(&query.order_id, &instance.pubkey);

    loop {
        let status =
            payment_status(&server, instance.pubkey.as_bytes(), &row.h_contract, &query, &info)
                .await?;

        match status {
            PaymentStatus::Unpaid => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(Json(unpaid_reply(&server, instance, &query)));
                }
                let mut handle = server.longpoll.suspend(pay_key, None);
                // Re-check after registering: a pay may have committed
                // between our read and the suspend.
                if !matches!(
                    payment_status(
                        &server,
                        instance.pubkey.as_bytes(),
                        &row.h_contract,
                        &query,
                        &info
                    )
                    .await?,
                    PaymentStatus::Unpaid
                ) {
                    continue;
                }
                let remaining = deadline.saturating_duration_since(Instant::now());
                handle.wait(remaining).await;
            }
            PaymentStatus::Paid { already_paid } => {
                let total =
                    db::refund_total(&server.db, &row.h_contract, &server.cfg.currency).await?;
                if let Some(min_refund) = &query.refund {
                    let below = matches!(total.cmp_checked(min_refund), Ok(Ordering::Less));
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if below && !remaining.is_zero() {
                        let mut handle =
                            server.longpoll.suspend(pay_key, Some(min_refund.clone()));
                        let rechecked =
                            db::refund_total(&server.db, &row.h_contract, &server.cfg.currency)
                                .await?;
                        if matches!(rechecked.cmp_checked(min_refund), Ok(Ordering::Less)) {
                            let remaining = deadline.saturating_duration_since(Instant::now());
                            handle.wait(remaining).await;
                        }
                        continue;
                    }
                }
                let refunded = !total.is_zero();
                return Ok(Json(PollPaymentReply {
                    paid: true,
                    refunded,
                    refund_amount: refunded.then_some(total),
                    taler_pay_uri: None,
                    contract_url: None,
                    already_paid_order_id: already_paid,
                }));
            }
        }
    }
}

enum PaymentStatus {
    Unpaid,
    Paid {
        /// Set when a session binding answered for a different order
        already_paid: Option<String>,
    },
}

/// Paid-ness per the session rules: with a session id, the binding for
/// (session, fulfillment URL) decides; otherwise any accepted deposit does.
async fn payment_status(
    server: &ServerState,
    merchant_pub: &[u8],
    h_contract: &[u8],
    query: &PollPaymentQuery,
    info: &ContractInfo,
) -> Result<PaymentStatus, ApiError> {
    if let Some(session_id) = &query.session_id {
        let Some(fulfillment_url) = &info.fulfillment_url else {
            return Ok(PaymentStatus::Unpaid);
        };
        let bound =
            db::find_session_binding(&server.db, session_id, fulfillment_url, merchant_pub).await?;
        return Ok(match bound {
            Some(order_id) => PaymentStatus::Paid {
                already_paid: (order_id != query.order_id).then_some(order_id),
            },
            None => PaymentStatus::Unpaid,
        });
    }
    if db::has_paid_deposit(&server.db, h_contract).await? {
        Ok(PaymentStatus::Paid { already_paid: None })
    } else {
        Ok(PaymentStatus::Unpaid)
    }
}

fn unpaid_reply(
    server: &ServerState,
    instance: &crate::instance::Instance,
    query: &PollPaymentQuery,
) -> PollPaymentReply {
    PollPaymentReply {
        paid: false,
        refunded: false,
        refund_amount: None,
        taler_pay_uri: Some(taler_pay_uri(&server.cfg, instance, &query.order_id)),
        contract_url: Some(contract_url(&server.cfg, &query.order_id)),
        already_paid_order_id: None,
    }
}
