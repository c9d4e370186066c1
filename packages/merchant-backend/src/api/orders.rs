//! Order intake: the front-end posts a proposal skeleton, the backend
//! completes it with instance identity and configured defaults.

use axum::extract::{Query, State};
use axum::response::Json;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taler_common::errors::ErrorCode;

use crate::api::contract::fill_order_defaults;
use crate::api::{ApiError, ServerState};
use crate::db::{self, DbError, RETRY_BUDGET_INSERT};
use crate::metrics;

#[derive(Deserialize)]
pub struct CreateOrderQuery {
    pub instance: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub order: Value,
}

#[derive(Serialize)]
pub struct CreateOrderReply {
    pub order_id: String,
}

/// POST /orders
pub async fn create_order(
    State(server): State<ServerState>,
    Query(query): Query<CreateOrderQuery>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<Json<CreateOrderReply>, ApiError> {
    let instance = server
        .instance(query.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;

    let order_id = request
        .order
        .get("order_id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(random_order_id);

    let mut order = request.order.clone();
    fill_order_defaults(&mut order, &order_id, &server.cfg, instance).map_err(|field| {
        ApiError::bad_request(
            ErrorCode::ParameterMalformed,
            format!("order field {:?} missing or malformed", field),
        )
    })?;

    // (order_id, instance) must be unique across orders and contract terms
    if db::lookup_contract_terms(&server.db, instance.pubkey.as_bytes(), &order_id)
        .await?
        .is_some()
    {
        return Err(ApiError::conflict(
            ErrorCode::OrderIdAlreadyExists,
            "an order with this id was already processed",
        ));
    }

    let order_json = serde_json::to_string(&order)?;
    let mut attempt = 0;
    loop {
        match db::insert_order(
            &server.db,
            instance.pubkey.as_bytes(),
            &order_id,
            &order_json,
        )
        .await
        {
            Ok(()) => break,
            Err(DbError::UniqueViolation) => {
                return Err(ApiError::conflict(
                    ErrorCode::OrderIdAlreadyExists,
                    "an order with this id already exists",
                ));
            }
            Err(e) if e.is_soft() && attempt < RETRY_BUDGET_INSERT => {
                attempt += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }

    metrics::ORDERS_CREATED.inc();
    tracing::info!(order_id = %order_id, instance = %instance.id, "order created");
    Ok(Json(CreateOrderReply { order_id }))
}

/// Placeholder id for orders that arrive without one
fn random_order_id() -> String {
    let mut bytes = [0u8; 10];
    rand::thread_rng().fill(&mut bytes[..]);
    format!(
        "order-{}",
        taler_common::base32::encode(&bytes).to_lowercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_order_ids_are_distinct() {
        let a = random_order_id();
        let b = random_order_id();
        assert_ne!(a, b);
        assert!(a.starts_with("order-"));
    }
}
