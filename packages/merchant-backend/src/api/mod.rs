//! HTTP surface. Public endpoints are consumed by wallets, the rest by the
//! merchant's own front-end. Every failure path returns the JSON error
//! envelope `{code, hint}`; no handler panics outward.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;

use taler_common::errors::{ErrorCode, ErrorEnvelope};

use crate::db::DbError;
use crate::exchanges::FindError;
use crate::server::Server;

pub mod contract;
pub mod orders;
pub mod pay;
pub mod poll_payment;
pub mod proposal;
pub mod refund;
pub mod tips;

/// Protocol version in libtool current:revision:age form
pub const PROTOCOL_VERSION: &str = "0:0:0";

pub type ServerState = Arc<Server>;

/// Build the full router
pub fn router(server: ServerState) -> Router {
    Router::new()
        // Wallet-facing endpoints
        .route("/public/proposal", get(proposal::lookup_proposal))
        .route("/public/pay", post(pay::handle_pay))
        .route("/public/poll-payment", get(poll_payment::poll_payment))
        // Front-end endpoints
        .route("/orders", post(orders::create_order))
        .route("/refund", get(refund::query_refunds).post(refund::increase_refund))
        .route("/tip-authorize", post(tips::tip_authorize))
        .route("/tip-pickup", get(tips::tip_pickup_status).post(tips::tip_pickup))
        .route("/tip-query", get(tips::tip_query))
        // Operational endpoints
        .route("/config", get(advertise_config))
        .route("/healthz", get(liveness))
        .route("/metrics", get(prometheus_metrics))
        .with_state(server)
}

/// A failed request: HTTP status plus the stable error envelope
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub envelope: ErrorEnvelope,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, hint: impl Into<String>) -> Self {
        ApiError {
            status,
            envelope: ErrorEnvelope::new(code, hint),
        }
    }

    pub fn bad_request(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, hint)
    }

    pub fn not_found(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, code, hint)
    }

    pub fn conflict(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, code, hint)
    }

    pub fn internal(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, code, hint)
    }

    /// 424: a dependency (the exchange) failed us
    pub fn dependency(code: ErrorCode, hint: impl Into<String>) -> Self {
        Self::new(StatusCode::FAILED_DEPENDENCY, code, hint)
    }

    pub fn unknown_instance() -> Self {
        Self::not_found(ErrorCode::InstanceUnknown, "unknown merchant instance")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.envelope)).into_response()
    }
}

impl From<DbError> for ApiError {
    fn from(e: DbError) -> Self {
        tracing::error!(error = %e, "database failure reached the handler");
        match e {
            DbError::Soft(_) => ApiError::internal(
                ErrorCode::DbSoftFailure,
                "transient database failure, retry later",
            ),
            DbError::UniqueViolation => {
                ApiError::conflict(ErrorCode::Invalid, "conflicting row already exists")
            }
            _ => ApiError::internal(ErrorCode::DbHardFailure, "database failure"),
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        tracing::error!(error = %e, "JSON (de)serialization failed in a handler");
        ApiError::internal(ErrorCode::JsonInvalid, "could not serialize reply")
    }
}

impl From<FindError> for ApiError {
    fn from(e: FindError) -> Self {
        match e {
            FindError::BadUrl => {
                ApiError::bad_request(ErrorCode::ParameterMalformed, "bad exchange URL")
            }
            FindError::Shutdown => ApiError::new(
                StatusCode::SERVICE_UNAVAILABLE,
                ErrorCode::InternalInvariantFailure,
                "backend is shutting down",
            ),
        }
    }
}

// ============ /config ============

#[derive(Serialize)]
struct ConfigInstance {
    id: String,
    name: String,
    merchant_pub: String,
    payment_targets: Vec<String>,
}

#[derive(Serialize)]
struct ConfigReply {
    currency: String,
    version: &'static str,
    instances: Vec<ConfigInstance>,
}

/// Advertise currency, protocol version and the configured instances
async fn advertise_config(State(server): State<ServerState>) -> Json<ConfigReply> {
    let mut instances: Vec<ConfigInstance> = server
        .instances
        .values()
        .map(|i| ConfigInstance {
            id: i.id.clone(),
            name: i.name.clone(),
            merchant_pub: i.pubkey.to_base32(),
            payment_targets: i.wires.iter().map(|w| w.method.clone()).collect(),
        })
        .collect();
    instances.sort_by(|a, b| a.id.cmp(&b.id));
    Json(ConfigReply {
        currency: server.cfg.currency.clone(),
        version: PROTOCOL_VERSION,
        instances,
    })
}

// ============ Operational endpoints ============

async fn liveness() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics",
        )
            .into_response();
    }
    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}
