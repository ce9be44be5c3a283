//! Route handlers. These stay thin: validate, call the owning component,
//! shape the response.

use crate::auth::{is_admin, require_admin, AuthedUser};
use crate::driver;
use crate::error::ApiError;
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use crashline_types::api::{
    BetRequest, CommitmentResponse, PaymentRequest, RevealResponse, RoundDetailResponse,
    RoundHistoryResponse, RoundStatusResponse,
};
use crashline_types::now_ms;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Serialize)]
struct HealthzResponse {
    ok: bool,
}

pub(super) async fn healthz() -> Response {
    Json(HealthzResponse { ok: true }).into_response()
}

pub(super) async fn place_bet(
    AuthedUser(user_id): AuthedUser,
    State(state): State<Arc<AppState>>,
    Json(request): Json<BetRequest>,
) -> Result<Response, ApiError> {
    let response = state
        .coordinator
        .place_bet(user_id, request.bet_amount)
        .await?;
    Ok(Json(response).into_response())
}

pub(super) async fn cashout(
    AuthedUser(user_id): AuthedUser,
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let response = state.coordinator.cashout(user_id).await?;
    Ok(Json(response).into_response())
}

pub(super) async fn round_status(State(state): State<Arc<AppState>>) -> Response {
    let status = state.engine.lock().await.status(now_ms());
    let frame = driver::frame_from(&status);
    Json(RoundStatusResponse {
        round_id: frame.round_id,
        status: frame.status,
        multiplier: frame.multiplier,
        started_at: frame.started_at,
        commit_idx: frame.commit_idx,
        server_seed_hash: frame.server_seed_hash,
    })
    .into_response()
}

#[derive(Deserialize)]
pub(super) struct HistoryQuery {
    limit: Option<i64>,
}

pub(super) async fn round_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let limit = query
        .limit
        .unwrap_or(state.config.round_history_limit)
        .clamp(1, 200);
    let cache_key = format!("round:history:{limit}");

    if !is_admin(&state, &headers) {
        if let Some(cached) = state.cache.get(&cache_key) {
            return Ok(cached_json(cached));
        }
    }

    let rounds = state.ledger.round_history(limit).await?;
    let body = RoundHistoryResponse { rounds };
    let encoded = serde_json::to_vec(&body)
        .map_err(|err| ApiError::internal(format!("serialize history: {err}")))?;
    state.cache.set(
        &cache_key,
        encoded.clone(),
        Duration::from_millis(state.config.cache_ttl_ms),
    );
    Ok(cached_json(encoded))
}

pub(super) async fn round_detail(
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let cache_key = format!("round:detail:{round_id}");
    if !is_admin(&state, &headers) {
        if let Some(cached) = state.cache.get(&cache_key) {
            return Ok(cached_json(cached));
        }
    }

    let (round, bets) = state.ledger.round_detail(round_id).await?;
    let body = RoundDetailResponse { round, bets };
    let encoded = serde_json::to_vec(&body)
        .map_err(|err| ApiError::internal(format!("serialize round: {err}")))?;
    state.cache.set(
        &cache_key,
        encoded.clone(),
        Duration::from_millis(state.config.cache_ttl_ms),
    );
    Ok(cached_json(encoded))
}

pub(super) async fn latest_commitment(
    State(state): State<Arc<AppState>>,
) -> Result<Response, ApiError> {
    let commit = state
        .seed_store
        .latest()
        .await?
        .ok_or(ApiError::NotFound("commitment"))?;
    Ok(Json(CommitmentResponse::from(commit)).into_response())
}

pub(super) async fn reveal(
    State(state): State<Arc<AppState>>,
    Path(round_id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let round = state.ledger.reveal(round_id).await?;
    let (Some(server_seed), Some(ended_at), Some(crash_point)) =
        (round.server_seed, round.ended_at, round.crash_point)
    else {
        return Err(ApiError::validation("round is still running"));
    };
    Ok(Json(RevealResponse {
        round_id: round.round_id,
        commit_idx: round.commit_idx,
        server_seed,
        server_seed_hash: round.server_seed_hash,
        revealed_at: ended_at,
        crash_point,
        started_at: round.started_at,
        ended_at,
    })
    .into_response())
}

pub(super) async fn deposit(
    AuthedUser(user_id): AuthedUser,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PaymentRequest>,
) -> Result<Response, ApiError> {
    let accepted = state.payments.deposit(user_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

pub(super) async fn withdraw(
    AuthedUser(user_id): AuthedUser,
    State(state): State<Arc<AppState>>,
    Json(request): Json<PaymentRequest>,
) -> Result<Response, ApiError> {
    let accepted = state.payments.withdraw(user_id, request).await?;
    Ok((StatusCode::ACCEPTED, Json(accepted)).into_response())
}

pub(super) async fn payment_status(
    AuthedUser(user_id): AuthedUser,
    State(state): State<Arc<AppState>>,
    Path(transaction_id): Path<String>,
) -> Result<Response, ApiError> {
    let status = state.payments.status(user_id, &transaction_id).await?;
    Ok(Json(status).into_response())
}

#[derive(Deserialize)]
pub(super) struct PaymentHistoryQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

pub(super) async fn payment_history(
    AuthedUser(user_id): AuthedUser,
    State(state): State<Arc<AppState>>,
    Query(query): Query<PaymentHistoryQuery>,
) -> Result<Response, ApiError> {
    let limit = query.limit.unwrap_or(20).clamp(1, 100);
    let offset = query.offset.unwrap_or(0).max(0);
    let history = state.payments.history(user_id, limit, offset).await?;
    Ok(Json(history).into_response())
}

pub(super) async fn admin_refund(
    State(state): State<Arc<AppState>>,
    Path(bet_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    require_admin(&state, &headers)?;
    let outcome = state.ledger.admin_refund(bet_id).await?;
    let bet = state.ledger.bet_by_id(bet_id).await?;
    Ok(Json(serde_json::json!({
        "bet": bet,
        "alreadyRefunded": outcome.already_refunded,
    }))
    .into_response())
}

fn cached_json(body: Vec<u8>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
