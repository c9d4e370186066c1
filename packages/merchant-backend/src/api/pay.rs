//! Pay engine: validates deposit permissions, forwards coin deposits to
//! their exchanges grouped by base URL, records outcomes, and signals the
//! long-poll registry. Replaying a successful pay is a no-op; a pay that
//! adds coins after a partial failure extends the earlier one. The abort
//! variant turns the deposits made so far into signed refund permissions.

use std::collections::HashMap;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use taler_common::amount::Amount;
use taler_common::crypto::hash::Sha512Hash;
use taler_common::crypto::keys::{EddsaPublicKey, EddsaSignature};
use taler_common::crypto::purpose;
use taler_common::errors::ErrorCode;
use taler_exchange_client::types::DepositPermission;
use taler_exchange_client::ExchangeError;

use crate::api::contract::ContractInfo;
use crate::api::{ApiError, ServerState};
use crate::db::{self, DbError, DepositRow, NewDeposit, NewRefund, RETRY_BUDGET_INSERT};
use crate::exchanges::ExchangeHandle;
use crate::instance::Instance;
use crate::longpoll::{PayKey, WakeEvent};
use crate::metrics;

#[derive(Deserialize)]
pub struct PayQuery {
    pub instance: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayMode {
    #[default]
    Pay,
    Abort,
}

/// One coin offered in a pay request
#[derive(Debug, Clone, Deserialize)]
pub struct PayCoin {
    pub coin_pub: EddsaPublicKey,
    pub denom_pub: EddsaPublicKey,
    pub denom_sig: EddsaSignature,
    pub coin_sig: EddsaSignature,
    /// Contribution including the deposit fee
    pub contribution: Amount,
    pub exchange_url: String,
}

#[derive(Deserialize)]
pub struct PayRequest {
    pub order_id: String,
    pub merchant_pub: EddsaPublicKey,
    #[serde(default)]
    pub mode: PayMode,
    #[serde(default)]
    pub session_id: Option<String>,
    pub coins: Vec<PayCoin>,
}

#[derive(Serialize)]
pub struct PayReply {
    pub sig: EddsaSignature,
    pub h_contract_terms: Sha512Hash,
}

#[derive(Serialize)]
pub struct RefundPermission {
    pub coin_pub: EddsaPublicKey,
    pub rtransaction_id: u64,
    pub refund_amount: Amount,
    pub refund_fee: Amount,
    pub exchange_url: String,
    pub merchant_sig: EddsaSignature,
}

#[derive(Serialize)]
pub struct AbortReply {
    pub h_contract_terms: Sha512Hash,
    pub merchant_pub: EddsaPublicKey,
    pub refund_permissions: Vec<RefundPermission>,
}

/// Per-coin facts established during validation
struct ValidatedCoin {
    index: usize,
    fee_deposit: Amount,
    fee_refund: Amount,
}

/// Why one exchange group could not be committed
enum GroupFailure {
    DoubleSpend { proof: Value },
    ExchangeDown { url: String },
    ExchangeFailed { url: String, hint: String },
    Db(DbError),
    Validation(ApiError),
}

/// POST /public/pay
pub async fn handle_pay(
    State(server): State<ServerState>,
    Query(query): Query<PayQuery>,
    Json(request): Json<PayRequest>,
) -> Result<Response, ApiError> {
    let instance = server
        .instance(query.instance.as_deref())
        .ok_or_else(ApiError::unknown_instance)?;
    if request.merchant_pub != instance.pubkey {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::PayMerchantMismatch,
            "merchant_pub does not belong to this instance",
        ));
    }

    let row = db::lookup_contract_terms(&server.db, instance.pubkey.as_bytes(), &request.order_id)
        .await?
        .ok_or_else(|| {
            ApiError::not_found(ErrorCode::PayOrderNotFound, "unknown order id for pay")
        })?;
    let contract = row.contract()?;
    let info = ContractInfo::from_json(&contract).map_err(|field| {
        ApiError::internal(
            ErrorCode::InternalInvariantFailure,
            format!("stored contract field {:?} is unusable", field),
        )
    })?;
    let h_contract = Sha512Hash::from_slice(&row.h_contract).ok_or_else(|| {
        ApiError::internal(
            ErrorCode::InternalInvariantFailure,
            "stored contract hash has the wrong length",
        )
    })?;

    if request.mode == PayMode::Abort {
        return abort_with_refund(&server, instance, &row, h_contract).await;
    }

    if row.aborted {
        return Err(ApiError::conflict(
            ErrorCode::PayAborted,
            "order was aborted; no further deposits are accepted",
        ));
    }
    if info.pay_deadline.is_expired() {
        return Err(ApiError::bad_request(
            ErrorCode::PayDeadlineExpired,
            "pay deadline has passed",
        ));
    }
    if request.coins.is_empty() {
        return Err(ApiError::bad_request(
            ErrorCode::ParameterMissing,
            "no coins supplied",
        ));
    }
    for coin in &request.coins {
        if coin.contribution.currency != server.cfg.currency {
            return Err(ApiError::bad_request(
                ErrorCode::ParameterMalformed,
                "coin contribution uses the wrong currency",
            ));
        }
    }

    let wire_method = contract.get("wire_method").and_then(|v| v.as_str());

    // Group coins by exchange; each group talks to one exchange session
    let groups = group_by_exchange(&request.coins);

    // Resolve each exchange's keys and validate every coin against them
    let validations = join_all(groups.iter().map(|(url, indices)| {
        validate_group(&server, instance, &request, &info, h_contract, url, indices, wire_method)
    }))
    .await;
    let mut handles: HashMap<&str, ExchangeHandle> = HashMap::new();
    let mut validated: Vec<ValidatedCoin> = Vec::new();
    for ((url, _), result) in groups.iter().zip(validations) {
        let (handle, coins) = result.map_err(api_error_from_group)?;
        handles.insert(url.as_str(), handle);
        validated.extend(coins);
    }
    validated.sort_by_key(|c| c.index);

    check_totals(&server.cfg.currency, &request.coins, &validated, &info)?;

    // Replay handling: coins with a recorded outcome are not re-sent
    let deposits = db::lookup_deposits(&server.db, h_contract.as_bytes()).await?;
    let mut existing: HashMap<Vec<u8>, &DepositRow> = HashMap::new();
    for deposit in &deposits {
        existing.insert(deposit.coin_pub.clone(), deposit);
    }
    for coin in &request.coins {
        if let Some(prior) = existing.get(coin.coin_pub.as_bytes().as_slice()) {
            if prior.rejected {
                // Permanent double-spend state: serve the stored proof
                // without contacting the exchange again.
                let proof: Value = prior
                    .rejection_proof
                    .as_deref()
                    .and_then(|p| serde_json::from_str(p).ok())
                    .unwrap_or(Value::Null);
                return Ok((StatusCode::FORBIDDEN, Json(proof)).into_response());
            }
        }
    }

    // Submit the fresh coins, one task per exchange group
    let outcomes = join_all(groups.iter().map(|(url, indices)| {
        let handle = handles.get(url.as_str()).cloned();
        let existing = &existing;
        let validated = &validated;
        let request = &request;
        let server = &server;
        let info = &info;
        async move {
            let handle = handle.expect("validated group has a handle");
            deposit_group(
                server, request, validated, existing, info, h_contract, url, indices, handle,
            )
            .await
        }
    }))
    .await;
    for outcome in outcomes {
        if let Err(failure) = outcome {
            // A double-spend proof travels upstream unchanged
            if let GroupFailure::DoubleSpend { proof } = failure {
                return Ok((StatusCode::FORBIDDEN, Json(proof)).into_response());
            }
            return Err(api_error_from_group(failure));
        }
    }

    // Determine paid-ness over everything deposited so far
    let total_deposited = deposited_total(&server, h_contract).await?;
    let required = required_total(&server.cfg.currency, &validated, &info)
        .map_err(|e| ApiError::internal(ErrorCode::InternalInvariantFailure, e))?;
    let pay_key = PayKey::compute(&request.order_id, &instance.pubkey);
    if matches!(
        total_deposited.cmp_checked(&required),
        Ok(std::cmp::Ordering::Greater) | Ok(std::cmp::Ordering::Equal)
    ) {
        if db::mark_contract_paid(&server.db, h_contract.as_bytes()).await? {
            metrics::PAYMENTS_COMPLETED.inc();
            tracing::info!(order_id = %request.order_id, "contract paid");
        }
        server.longpoll.wake(pay_key, WakeEvent::Paid);

        // Bind the browser session so later status queries short-circuit
        if let (Some(session_id), Some(fulfillment_url)) =
            (&request.session_id, &info.fulfillment_url)
        {
            db::upsert_session_binding(
                &server.db,
                session_id,
                fulfillment_url,
                instance.pubkey.as_bytes(),
                &request.order_id,
            )
            .await?;
            server.longpoll.wake(pay_key, WakeEvent::SessionBound);
        }
    }

    let sig = purpose::merchant_payment_ok(&h_contract).sign(&instance.key);
    Ok(Json(PayReply {
        sig,
        h_contract_terms: h_contract,
    })
    .into_response())
}

fn group_by_exchange(coins: &[PayCoin]) -> Vec<(String, Vec<usize>)> {
    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    for (i, coin) in coins.iter().enumerate() {
        match groups.iter_mut().find(|(url, _)| url == &coin.exchange_url) {
            Some((_, indices)) => indices.push(i),
            None => groups.push((coin.exchange_url.clone(), vec![i])),
        }
    }
    groups
}

/// Resolve one exchange and validate the group's coins against its keys
#[allow(clippy::too_many_arguments)]
async fn validate_group(
    server: &ServerState,
    instance: &Instance,
    request: &PayRequest,
    info: &ContractInfo,
    h_contract: Sha512Hash,
    url: &str,
    indices: &[usize],
    wire_method: Option<&str>,
) -> Result<(ExchangeHandle, Vec<ValidatedCoin>), GroupFailure> {
    let found = tokio::time::timeout(
        server.cfg.exchange_wait(),
        server.exchanges.find(url, wire_method),
    )
    .await
    .map_err(|_| GroupFailure::ExchangeDown {
        url: url.to_string(),
    })?
    .map_err(|e| GroupFailure::Validation(e.into()))?;

    let mut validated = Vec::with_capacity(indices.len());
    for &index in indices {
        let coin = &request.coins[index];
        let denom = found
            .handle
            .keys
            .find_denom(&coin.denom_pub)
            .ok_or_else(|| {
                GroupFailure::Validation(ApiError::not_found(
                    ErrorCode::PayDenominationUnknown,
                    "unknown denomination",
                ))
            })?;
        if denom.stamp_expire_deposit.is_expired() {
            return Err(GroupFailure::Validation(ApiError::not_found(
                ErrorCode::PayDenominationUnknown,
                "denomination expired for deposits",
            )));
        }
        if coin
            .denom_pub
            .verify(coin.coin_pub.as_bytes(), &coin.denom_sig)
            .is_err()
        {
            return Err(GroupFailure::Validation(ApiError::bad_request(
                ErrorCode::PayDenominationSignatureInvalid,
                "denomination signature does not cover the coin",
            )));
        }
        let deposit_purpose = purpose::wallet_coin_deposit(
            &h_contract,
            &info.h_wire,
            &info.timestamp,
            &info.refund_deadline,
            &instance.pubkey,
            &coin.contribution,
            &denom.fee_deposit,
        );
        if deposit_purpose.verify(&coin.coin_pub, &coin.coin_sig).is_err() {
            return Err(GroupFailure::Validation(ApiError::bad_request(
                ErrorCode::PayCoinSignatureInvalid,
                "coin signature over the deposit permission is invalid",
            )));
        }
        validated.push(ValidatedCoin {
            index,
            fee_deposit: denom.fee_deposit.clone(),
            fee_refund: denom.fee_refund.clone(),
        });
    }
    Ok((found.handle, validated))
}

/// `amount`, plus any deposit-fee overhang beyond the merchant's cap
fn required_total(
    currency: &str,
    validated: &[ValidatedCoin],
    info: &ContractInfo,
) -> Result<Amount, String> {
    let mut total_fee = Amount::zero(currency);
    for coin in validated {
        total_fee = total_fee
            .checked_add(&coin.fee_deposit)
            .map_err(|e| e.to_string())?;
    }
    match total_fee.checked_sub(&info.max_fee) {
        Ok(overhang) => info.amount.checked_add(&overhang).map_err(|e| e.to_string()),
        Err(_) => Ok(info.amount.clone()),
    }
}

fn check_totals(
    currency: &str,
    coins: &[PayCoin],
    validated: &[ValidatedCoin],
    info: &ContractInfo,
) -> Result<(), ApiError> {
    let mut total = Amount::zero(currency);
    for coin in coins {
        total = total.checked_add(&coin.contribution).map_err(|_| {
            ApiError::bad_request(ErrorCode::ParameterMalformed, "coin contributions overflow")
        })?;
    }
    if matches!(
        total.cmp_checked(&info.amount),
        Ok(std::cmp::Ordering::Less)
    ) {
        return Err(ApiError::bad_request(
            ErrorCode::PayAmountInsufficient,
            "coin contributions do not cover the contract amount",
        ));
    }
    let required = required_total(currency, validated, info)
        .map_err(|e| ApiError::internal(ErrorCode::InternalInvariantFailure, e))?;
    if matches!(total.cmp_checked(&required), Ok(std::cmp::Ordering::Less)) {
        return Err(ApiError::bad_request(
            ErrorCode::PayFeesExceedCap,
            "deposit fees exceed the contract's fee cap",
        ));
    }
    Ok(())
}

/// Submit all fresh coins of one exchange group, in coin-index order
#[allow(clippy::too_many_arguments)]
async fn deposit_group(
    server: &ServerState,
    request: &PayRequest,
    validated: &[ValidatedCoin],
    existing: &HashMap<Vec<u8>, &DepositRow>,
    info: &ContractInfo,
    h_contract: Sha512Hash,
    url: &str,
    indices: &[usize],
    handle: ExchangeHandle,
) -> Result<(), GroupFailure> {
    for &index in indices {
        let coin = &request.coins[index];
        if existing.contains_key(coin.coin_pub.as_bytes().as_slice()) {
            continue;
        }
        let facts = validated
            .iter()
            .find(|v| v.index == index)
            .expect("every submitted coin was validated");

        let permission = DepositPermission {
            amount_with_fee: coin.contribution.clone(),
            h_contract_terms: h_contract,
            h_wire: info.h_wire,
            coin_pub: coin.coin_pub,
            denom_pub: coin.denom_pub,
            denom_sig: coin.denom_sig,
            coin_sig: coin.coin_sig,
            timestamp: info.timestamp,
            refund_deadline: info.refund_deadline,
            merchant_pub: request.merchant_pub,
        };

        match handle.client.deposit(&permission).await {
            Ok(confirmation) => {
                metrics::DEPOSITS_SUBMITTED
                    .with_label_values(&[url, "ok"])
                    .inc();
                let deposit = NewDeposit {
                    h_contract: h_contract.as_bytes().to_vec(),
                    coin_pub: coin.coin_pub.as_bytes().to_vec(),
                    exchange_url: url.to_string(),
                    amount_with_fee: coin.contribution.to_string(),
                    deposit_fee: facts.fee_deposit.to_string(),
                    refund_fee: facts.fee_refund.to_string(),
                    exchange_sig: confirmation.exchange_sig.as_bytes().to_vec(),
                    exchange_pub: confirmation.exchange_pub.as_bytes().to_vec(),
                };
                insert_deposit_with_retries(server, &deposit)
                    .await
                    .map_err(GroupFailure::Db)?;
            }
            Err(ExchangeError::DoubleSpend { proof }) => {
                metrics::DEPOSITS_SUBMITTED
                    .with_label_values(&[url, "double_spend"])
                    .inc();
                tracing::warn!(
                    coin_pub = %coin.coin_pub,
                    exchange = url,
                    "exchange proved a double-spend; recording permanent rejection"
                );
                let proof_json = serde_json::to_string(&proof).unwrap_or_default();
                let zero = Amount::zero(&server.cfg.currency).to_string();
                db::insert_rejected_deposit(
                    &server.db,
                    h_contract.as_bytes(),
                    coin.coin_pub.as_bytes(),
                    url,
                    &coin.contribution.to_string(),
                    &zero,
                    &proof_json,
                )
                .await
                .map_err(GroupFailure::Db)?;
                return Err(GroupFailure::DoubleSpend { proof });
            }
            Err(e) if e.is_transient() => {
                metrics::DEPOSITS_SUBMITTED
                    .with_label_values(&[url, "unreachable"])
                    .inc();
                tracing::warn!(exchange = url, error = %e, "deposit failed; exchange unreachable");
                server.exchanges.report_failure(url);
                return Err(GroupFailure::ExchangeDown {
                    url: url.to_string(),
                });
            }
            Err(e) => {
                metrics::DEPOSITS_SUBMITTED
                    .with_label_values(&[url, "failed"])
                    .inc();
                return Err(GroupFailure::ExchangeFailed {
                    url: url.to_string(),
                    hint: e.to_string(),
                });
            }
        }
    }
    Ok(())
}

async fn insert_deposit_with_retries(
    server: &ServerState,
    deposit: &NewDeposit,
) -> Result<(), DbError> {
    let mut attempt = 0;
    loop {
        match db::insert_deposit(&server.db, deposit).await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_soft() && attempt < RETRY_BUDGET_INSERT => {
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Sum of everything successfully deposited against the contract
async fn deposited_total(server: &ServerState, h_contract: Sha512Hash) -> Result<Amount, ApiError> {
    let deposits = db::lookup_deposits(&server.db, h_contract.as_bytes()).await?;
    let mut total = Amount::zero(&server.cfg.currency);
    for deposit in deposits.iter().filter(|d| !d.rejected) {
        let amount = deposit.amount_with_fee().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt deposit amount")
        })?;
        total = total.checked_add(&amount).map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "deposit sum overflow")
        })?;
    }
    Ok(total)
}

fn api_error_from_group(failure: GroupFailure) -> ApiError {
    match failure {
        // Handled by the caller, which forwards the raw proof body
        GroupFailure::DoubleSpend { .. } => ApiError::new(
            StatusCode::FORBIDDEN,
            ErrorCode::PayCoinDoubleSpend,
            "coin already spent",
        ),
        GroupFailure::ExchangeDown { url } => ApiError::dependency(
            ErrorCode::PayExchangeDown,
            format!("exchange {} unreachable or keys unavailable", url),
        ),
        GroupFailure::ExchangeFailed { url, hint } => ApiError::new(
            StatusCode::BAD_GATEWAY,
            ErrorCode::PayExchangeFailed,
            format!("exchange {} failed the deposit: {}", url, hint),
        ),
        GroupFailure::Db(e) => e.into(),
        GroupFailure::Validation(e) => e,
    }
}

/// The abort variant: no further deposits; instead sign refund permissions
/// for everything deposited so far on this contract.
async fn abort_with_refund(
    server: &ServerState,
    instance: &Instance,
    row: &db::ContractTermsRow,
    h_contract: Sha512Hash,
) -> Result<Response, ApiError> {
    if row.paid {
        return Err(ApiError::conflict(
            ErrorCode::Invalid,
            "contract is already paid; use a refund instead of abort",
        ));
    }

    let mut attempt = 0;
    loop {
        match db::mark_contract_aborted(&server.db, h_contract.as_bytes()).await {
            Ok(()) => break,
            Err(e) if e.is_soft() && attempt < RETRY_BUDGET_INSERT => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }

    let deposits = db::lookup_deposits(&server.db, h_contract.as_bytes()).await?;
    let refunds = db::lookup_refunds(&server.db, h_contract.as_bytes()).await?;

    let mut permissions = Vec::new();
    for deposit in deposits.iter().filter(|d| !d.rejected) {
        let coin_pub = match deposit.coin_pub.as_slice().try_into() {
            Ok(bytes) => EddsaPublicKey::from_bytes(bytes),
            Err(_) => {
                return Err(ApiError::internal(
                    ErrorCode::InternalInvariantFailure,
                    "stored coin key has the wrong length",
                ))
            }
        };
        let amount_with_fee = deposit.amount_with_fee().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt deposit amount")
        })?;
        let refund_fee = deposit.refund_fee().map_err(|_| {
            ApiError::internal(ErrorCode::InternalInvariantFailure, "corrupt refund fee")
        })?;

        // Replayed aborts re-issue the permission for the refund already on
        // record instead of stacking a second full refund onto the coin.
        let prior: Vec<&db::RefundRow> = refunds
            .iter()
            .filter(|r| r.coin_pub == deposit.coin_pub)
            .collect();
        let (rtransaction_id, refund_amount) = if prior.is_empty() {
            let refund = NewRefund {
                h_contract: h_contract.as_bytes().to_vec(),
                coin_pub: deposit.coin_pub.clone(),
                exchange_url: deposit.exchange_url.clone(),
                reason: "order aborted".to_string(),
                refund_amount: amount_with_fee.to_string(),
                refund_fee: refund_fee.to_string(),
            };
            let rtx = insert_refund_with_retries(server, &refund).await?;
            metrics::REFUNDS_RECORDED.inc();
            (rtx as u64, amount_with_fee.clone())
        } else {
            let mut total = Amount::zero(&server.cfg.currency);
            let mut max_rtx = 0i64;
            for refund in &prior {
                let amount = refund.refund_amount().map_err(|_| {
                    ApiError::internal(
                        ErrorCode::InternalInvariantFailure,
                        "corrupt refund amount",
                    )
                })?;
                total = total.checked_add(&amount).map_err(|_| {
                    ApiError::internal(ErrorCode::InternalInvariantFailure, "refund sum overflow")
                })?;
                max_rtx = max_rtx.max(refund.rtransaction_id);
            }
            (max_rtx as u64, total)
        };

        let merchant_sig = purpose::merchant_refund(
            &h_contract,
            &coin_pub,
            rtransaction_id,
            &refund_amount,
            &refund_fee,
        )
        .sign(&instance.key);
        permissions.push(RefundPermission {
            coin_pub,
            rtransaction_id,
            refund_amount,
            refund_fee,
            exchange_url: deposit.exchange_url.clone(),
            merchant_sig,
        });
    }

    if !permissions.is_empty() {
        let total = db::refund_total(&server.db, h_contract.as_bytes(), &server.cfg.currency)
            .await?;
        server.longpoll.wake(
            PayKey::compute(&row.order_id, &instance.pubkey),
            WakeEvent::RefundIncreased(total),
        );
    }

    tracing::info!(
        order_id = %row.order_id,
        coins = permissions.len(),
        "order aborted with refund permissions"
    );
    Ok(Json(AbortReply {
        h_contract_terms: h_contract,
        merchant_pub: instance.pubkey,
        refund_permissions: permissions,
    })
    .into_response())
}

async fn insert_refund_with_retries(
    server: &ServerState,
    refund: &NewRefund,
) -> Result<i64, ApiError> {
    let mut attempt = 0;
    loop {
        match db::insert_refund(&server.db, refund).await {
            Ok(rtx) => return Ok(rtx),
            Err(e) if e.is_soft() && attempt < db::RETRY_BUDGET_REFUND => attempt += 1,
            Err(e) => return Err(e.into()),
        }
    }
}
