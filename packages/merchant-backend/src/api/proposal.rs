//! Proposal lookup: binds an order to the wallet's nonce on first contact,
//! signs the resulting contract terms, and serves idempotent retrievals.

use axum::extract::{Query, State};
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use taler_common::crypto::hash::{hash_json_contract, Sha512Hash};
use taler_common::crypto::keys::EddsaSignature;
use taler_common::crypto::purpose;
use taler_common::errors::ErrorCode;
use taler_common::time::Timestamp;

use crate::api::{ApiError, ServerState};
use crate::db::{self, RETRY_BUDGET_INSERT};
use crate::metrics;

#[derive(Deserialize)]
pub struct ProposalQuery {
    pub order_id: String,
    pub nonce: String,
    pub instance: Option<String>,
}

#[derive(Serialize)]
pub struct ProposalReply {
    pub contract_terms: Value,
    pub sig: EddsaSignature,
}

/// GET /public/proposal
///
/// Two concurrent lookups on the same unsigned order converge on exactly
/// one contract-terms row: the insert uses ON CONFLICT DO NOTHING, and the
/// loser re-reads the winner's row. The first nonce to commit wins.
pub async fn lookup_proposal(
    State(server): State<ServerState>,
    Query(query): Query<ProposalQuery>,
) -> Result<Json<ProposalReply>, ApiError> {
    let instance = server
        .instance(query.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;
    let merchant_pub = instance.pubkey;

    let mut soft_retries = 0;
    let mut race_retries = 0;
    loop {
        // Signed terms already exist: enforce the committed nonce
        if let Some(row) =
            db::lookup_contract_terms(&server.db, merchant_pub.as_bytes(), &query.order_id).await?
        {
            let contract = row.contract()?;
            let stored_nonce = contract.get("nonce").and_then(|v| v.as_str());
            if stored_nonce != Some(query.nonce.as_str()) {
                return Err(ApiError::bad_request(
                    ErrorCode::ProposalNonceMismatch,
                    "mismatched nonce",
                ));
            }
            let h_contract = Sha512Hash::from_slice(&row.h_contract).ok_or_else(|| {
                ApiError::internal(
                    ErrorCode::InternalInvariantFailure,
                    "stored contract hash has the wrong length",
                )
            })?;
            // The signature re-derives deterministically from the hash
            let sig = purpose::merchant_contract(&h_contract).sign(&instance.key);
            return Ok(Json(ProposalReply {
                contract_terms: contract,
                sig,
            }));
        }

        // No terms yet: find the bare order and promote it
        let Some(order_row) =
            db::lookup_order(&server.db, merchant_pub.as_bytes(), &query.order_id).await?
        else {
            return Err(ApiError::not_found(
                ErrorCode::ProposalLookupNotFound,
                "unknown order id",
            ));
        };

        let mut contract: Value = serde_json::from_str(&order_row.order_json)?;
        let object = contract.as_object_mut().ok_or_else(|| {
            ApiError::internal(
                ErrorCode::InternalInvariantFailure,
                "stored order is not a JSON object",
            )
        })?;
        object.insert("nonce".to_string(), json!(query.nonce));
        if !object.contains_key("timestamp") {
            object.insert(
                "timestamp".to_string(),
                serde_json::to_value(Timestamp::now())?,
            );
        }

        let h_contract = hash_json_contract(&contract);
        let contract_json = serde_json::to_string(&contract)?;
        match db::promote_order_to_contract(
            &server.db,
            merchant_pub.as_bytes(),
            &query.order_id,
            &contract_json,
            h_contract.as_bytes(),
        )
        .await
        {
            Ok(true) => {
                metrics::PROPOSALS_SIGNED.inc();
                tracing::info!(
                    order_id = %query.order_id,
                    h_contract = %h_contract,
                    "order promoted to signed contract terms"
                );
                let sig = purpose::merchant_contract(&h_contract).sign(&instance.key);
                return Ok(Json(ProposalReply {
                    contract_terms: contract,
                    sig,
                }));
            }
            // Lost the race: some other lookup committed first; re-read its
            // row and apply the nonce check against the committed terms.
            Ok(false) if race_retries < RETRY_BUDGET_INSERT => {
                race_retries += 1;
                continue;
            }
            Ok(false) => {
                return Err(ApiError::internal(
                    ErrorCode::InternalInvariantFailure,
                    "contract promotion kept losing races",
                ));
            }
            Err(e) if e.is_soft() && soft_retries < RETRY_BUDGET_INSERT => {
                soft_retries += 1;
                continue;
            }
            Err(e) => return Err(e.into()),
        }
    }
}
