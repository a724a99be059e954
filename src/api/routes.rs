use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use crate::ledger::{
    Actor, LedgerError, LedgerService, OrderStatus, Replay, Resolution, RewardKind,
};
use crate::models::{Dispute, PointChange, Relationship, SponsorLimits};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<LedgerService>,
}

/// Create the API router
pub fn create_router(ledger: Arc<LedgerService>) -> Router {
    let state = AppState { ledger };

    Router::new()
        .route("/health", get(health_check))
        .route("/api/relationships", post(enroll))
        .route("/api/relationships/:id", get(get_relationship))
        .route("/api/relationships/:id/deactivate", post(deactivate))
        .route("/api/relationships/:id/changes", post(apply_change))
        .route("/api/relationships/:id/history", get(get_history))
        .route("/api/relationships/:id/replay", get(get_replay))
        .route("/api/orders/debit", post(debit_for_order))
        .route("/api/orders/:order_ref/refund", post(refund_order))
        .route("/api/orders/:order_ref/cancel", post(cancel_order))
        .route("/api/rewards", post(credit_reward))
        .route("/api/disputes", post(file_dispute))
        .route("/api/disputes/:id", get(get_dispute))
        .route("/api/disputes/:id/review", post(review_dispute))
        .route("/api/disputes/:id/resolve", post(resolve_dispute))
        .route(
            "/api/sponsors/:sponsor_id/limits",
            get(get_limits).put(set_limits),
        )
        .with_state(state)
}

// ===== Route Handlers =====

/// Health check endpoint
async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn enroll(
    State(state): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> Result<Json<Relationship>, ApiError> {
    let rel = state.ledger.enroll(&req.driver_id, &req.sponsor_id).await?;
    Ok(Json(rel))
}

async fn get_relationship(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Relationship>, ApiError> {
    Ok(Json(state.ledger.get_relationship(id).await?))
}

async fn deactivate(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.ledger.deactivate(id).await?;
    Ok(Json(json!({ "deactivated": id })))
}

/// Sponsor/admin award or deduction. Limits apply.
async fn apply_change(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<ApplyChangeRequest>,
) -> Result<Json<PointChange>, ApiError> {
    let record = state
        .ledger
        .apply_change(id, req.delta, &req.reason, &req.actor, None)
        .await?;
    Ok(Json(record))
}

async fn get_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let records = state
        .ledger
        .history(id, params.limit.unwrap_or(50).min(1000) as usize)
        .await?;
    Ok(Json(HistoryResponse {
        count: records.len(),
        records,
    }))
}

async fn get_replay(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Replay>, ApiError> {
    Ok(Json(state.ledger.replay_balance(id).await?))
}

async fn debit_for_order(
    State(state): State<AppState>,
    Json(req): Json<OrderDebitRequest>,
) -> Result<Json<PointChange>, ApiError> {
    let record = state
        .ledger
        .debit_for_order(req.relationship_id, req.total_points, &req.order_ref)
        .await?;
    Ok(Json(record))
}

async fn refund_order(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
    Json(req): Json<RefundRequest>,
) -> Result<Json<PointChange>, ApiError> {
    let record = state
        .ledger
        .credit_for_refund(&order_ref, req.amount, &req.reason)
        .await?;
    Ok(Json(record))
}

async fn cancel_order(
    State(state): State<AppState>,
    Path(order_ref): Path<String>,
    Json(req): Json<CancelRequest>,
) -> Result<Json<PointChange>, ApiError> {
    let record = state
        .ledger
        .credit_for_cancellation(&order_ref, req.amount, req.order_status)
        .await?;
    Ok(Json(record))
}

async fn credit_reward(
    State(state): State<AppState>,
    Json(req): Json<RewardRequest>,
) -> Result<Json<PointChange>, ApiError> {
    let record = state
        .ledger
        .credit_for_reward(req.relationship_id, req.amount, req.kind, &req.reward_ref)
        .await?;
    Ok(Json(record))
}

async fn file_dispute(
    State(state): State<AppState>,
    Json(req): Json<FileDisputeRequest>,
) -> Result<Json<Dispute>, ApiError> {
    let dispute = state.ledger.file_dispute(&req.record_id, &req.reason).await?;
    Ok(Json(dispute))
}

async fn get_dispute(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Dispute>, ApiError> {
    Ok(Json(state.ledger.get_dispute(&id).await?))
}

async fn review_dispute(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Dispute>, ApiError> {
    Ok(Json(state.ledger.begin_dispute_review(&id).await?))
}

async fn resolve_dispute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveDisputeRequest>,
) -> Result<Json<ResolveDisputeResponse>, ApiError> {
    let (dispute, compensation) = state
        .ledger
        .resolve_dispute(&id, req.resolution, &req.actor, &req.note)
        .await?;
    Ok(Json(ResolveDisputeResponse {
        dispute,
        compensation,
    }))
}

async fn get_limits(
    State(state): State<AppState>,
    Path(sponsor_id): Path<String>,
) -> Result<Json<SponsorLimits>, ApiError> {
    Ok(Json(state.ledger.get_limits(&sponsor_id).await?))
}

async fn set_limits(
    State(state): State<AppState>,
    Path(sponsor_id): Path<String>,
    Json(req): Json<SetLimitsRequest>,
) -> Result<Json<SponsorLimits>, ApiError> {
    let limits = SponsorLimits {
        sponsor_id,
        min_points_per_txn: req.min_points_per_txn,
        max_points_per_txn: req.max_points_per_txn,
        point_value_cents: req.point_value_cents,
        refund_window_days: req.refund_window_days,
        updated_at: Utc::now(),
    };
    state.ledger.set_limits(&limits).await?;
    Ok(Json(limits))
}

// ===== Request/Response Types =====

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Deserialize)]
struct EnrollRequest {
    driver_id: String,
    sponsor_id: String,
}

#[derive(Deserialize)]
struct ApplyChangeRequest {
    delta: i64,
    reason: String,
    actor: Actor,
}

#[derive(Deserialize)]
struct HistoryQuery {
    limit: Option<u32>,
}

#[derive(Serialize)]
struct HistoryResponse {
    count: usize,
    records: Vec<PointChange>,
}

#[derive(Deserialize)]
struct OrderDebitRequest {
    relationship_id: i64,
    total_points: i64,
    order_ref: String,
}

#[derive(Deserialize)]
struct RefundRequest {
    amount: i64,
    reason: String,
}

#[derive(Deserialize)]
struct CancelRequest {
    amount: i64,
    order_status: OrderStatus,
}

#[derive(Deserialize)]
struct RewardRequest {
    relationship_id: i64,
    amount: i64,
    kind: RewardKind,
    reward_ref: String,
}

#[derive(Deserialize)]
struct FileDisputeRequest {
    record_id: String,
    reason: String,
}

#[derive(Deserialize)]
struct ResolveDisputeRequest {
    resolution: Resolution,
    actor: Actor,
    note: String,
}

#[derive(Serialize)]
struct ResolveDisputeResponse {
    dispute: Dispute,
    compensation: Option<PointChange>,
}

#[derive(Deserialize)]
struct SetLimitsRequest {
    min_points_per_txn: i64,
    max_points_per_txn: i64,
    point_value_cents: i64,
    refund_window_days: i64,
}

// ===== Error Handling =====

struct ApiError(LedgerError);

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            LedgerError::RelationshipNotFound { .. }
            | LedgerError::OrderNotFound { .. }
            | LedgerError::RecordNotFound { .. }
            | LedgerError::DisputeNotFound { .. } => (StatusCode::NOT_FOUND, self.0.to_string()),
            LedgerError::RelationshipExists { .. }
            | LedgerError::AlreadyRefunded { .. }
            | LedgerError::DisputeAlreadyExists { .. }
            | LedgerError::InvalidDisputeTransition { .. } => {
                (StatusCode::CONFLICT, self.0.to_string())
            }
            LedgerError::ConsistencyMismatch { .. } => {
                // Integrity bug, already escalated by the replay layer.
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ledger consistency check failed".to_string(),
                )
            }
            LedgerError::Storage(err) => {
                tracing::error!("storage error: {:#}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            // Remaining validation-class errors surface verbatim.
            _ => (StatusCode::UNPROCESSABLE_ENTITY, self.0.to_string()),
        };

        let body = Json(json!({
            "error": message,
        }));

        (status, body).into_response()
    }
}
