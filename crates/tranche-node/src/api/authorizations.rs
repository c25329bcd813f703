//! Payment authorization endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tranche_core::{AuthorizationStatus, PaymentAuthorizationRequest, PaymentExecution, TimeLock, TrancheError};
use tranche_release::{BulkApprovalReport, PayoutOutcome};
use tranche_state::EntityHistory;
use uuid::Uuid;

use super::default_actor;
use super::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateAuthorizationRequest {
    pub milestone_id: Uuid,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub status: Option<AuthorizationStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RejectRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct BulkApproveRequest {
    pub request_ids: Vec<Uuid>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct TimeLockRequest {
    pub cooldown_secs: i64,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Serialize)]
pub struct TimeLockResponse {
    pub request: PaymentAuthorizationRequest,
    pub time_lock: TimeLock,
}

const ALL_STATUSES: [AuthorizationStatus; 7] = [
    AuthorizationStatus::Pending,
    AuthorizationStatus::AutoApproved,
    AuthorizationStatus::ManualReviewRequired,
    AuthorizationStatus::Approved,
    AuthorizationStatus::Rejected,
    AuthorizationStatus::TimeLocked,
    AuthorizationStatus::Expired,
];

/// Request payout authorization for a completed milestone.
pub async fn create_authorization(
    State(state): State<AppState>,
    Json(req): Json<CreateAuthorizationRequest>,
) -> ApiResult<(StatusCode, Json<PayoutOutcome>)> {
    let outcome = state
        .pipeline
        .request_authorization(req.milestone_id, &req.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

/// List requests, optionally by status.
pub async fn list_authorizations(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<PaymentAuthorizationRequest>>> {
    let requests = match query.status {
        Some(status) => state.pipeline.engine().list(&[status]).await?,
        None => state.pipeline.engine().list(&ALL_STATUSES).await?,
    };
    Ok(Json(requests))
}

pub async fn get_authorization(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentAuthorizationRequest>> {
    Ok(Json(state.pipeline.engine().get(id).await?))
}

pub async fn authorization_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EntityHistory>> {
    state.pipeline.engine().get(id).await?;
    Ok(Json(state.pipeline.engine().history(id).await?))
}

/// Approve a request under review. Re-approving returns the recorded decision.
pub async fn approve(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ApproveRequest>,
) -> ApiResult<Json<PayoutOutcome>> {
    Ok(Json(state.pipeline.approve(id, &req.actor, req.reason).await?))
}

/// Reject a request with a reason.
pub async fn reject(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RejectRequest>,
) -> ApiResult<Json<PaymentAuthorizationRequest>> {
    Ok(Json(state.pipeline.engine().reject(id, &req.actor, &req.reason).await?))
}

/// Approve many requests; each succeeds or fails on its own.
pub async fn bulk_approve(
    State(state): State<AppState>,
    Json(req): Json<BulkApproveRequest>,
) -> Json<BulkApprovalReport> {
    Json(state.pipeline.bulk_approve(&req.request_ids, &req.actor).await)
}

/// Hold an approved request behind an explicit cooldown.
pub async fn create_time_lock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<TimeLockRequest>,
) -> ApiResult<(StatusCode, Json<TimeLockResponse>)> {
    let cooldown = Duration::try_seconds(req.cooldown_secs).ok_or_else(|| {
        TrancheError::validation(format!("cooldown of {}s is out of range", req.cooldown_secs))
    })?;
    let (request, time_lock) = state
        .pipeline
        .engine()
        .create_time_lock(id, cooldown, &req.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(TimeLockResponse { request, time_lock })))
}

/// The execution of a request.
pub async fn authorization_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentExecution>> {
    let execution = state
        .pipeline
        .coordinator()
        .for_request(id)
        .await?
        .ok_or_else(|| TrancheError::not_found("execution for request", id))?;
    Ok(Json(execution))
}
