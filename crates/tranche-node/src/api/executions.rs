//! Payment execution endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tranche_core::{ExecutionEvent, PaymentExecution};
use tranche_release::BulkExecutionReport;
use tranche_state::EntityHistory;
use uuid::Uuid;

use super::default_actor;
use super::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub request_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct BulkExecuteRequest {
    pub request_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct RedriveRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct CancelExecutionRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
    pub reason: String,
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    100
}

/// Audit export of an execution trace.
#[derive(Debug, Serialize)]
pub struct TraceResponse {
    pub execution_id: Uuid,
    pub events: Vec<ExecutionEvent>,
    pub root: String,
    pub verified: bool,
}

/// Execute an authorized payment. Repeated calls return the same execution.
pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> ApiResult<Json<PaymentExecution>> {
    Ok(Json(state.pipeline.coordinator().execute(req.request_id).await?))
}

pub async fn bulk_execute(
    State(state): State<AppState>,
    Json(req): Json<BulkExecuteRequest>,
) -> Json<BulkExecutionReport> {
    Json(state.pipeline.coordinator().bulk_execute(&req.request_ids).await)
}

pub async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentExecution>> {
    Ok(Json(state.pipeline.coordinator().get(id).await?))
}

pub async fn execution_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EntityHistory>> {
    state.pipeline.coordinator().get(id).await?;
    Ok(Json(state.pipeline.coordinator().history(id).await?))
}

pub async fn execution_trace(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TraceResponse>> {
    let execution = state.pipeline.coordinator().get(id).await?;
    let verified = execution.verify_trace_root();
    Ok(Json(TraceResponse {
        execution_id: execution.id,
        events: execution.trace,
        root: execution.trace_root,
        verified,
    }))
}

/// Retry a transiently failed execution now, ignoring backoff.
pub async fn retry_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<PaymentExecution>> {
    Ok(Json(state.pipeline.coordinator().retry_execution(id).await?))
}

/// Re-drive a dead-lettered execution.
pub async fn redrive(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<RedriveRequest>,
) -> ApiResult<Json<PaymentExecution>> {
    Ok(Json(state.pipeline.coordinator().redrive(id, &req.actor).await?))
}

/// Abandon an execution that is not in flight.
pub async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<CancelExecutionRequest>,
) -> ApiResult<Json<PaymentExecution>> {
    Ok(Json(
        state
            .pipeline
            .coordinator()
            .cancel_execution(id, &req.actor, &req.reason)
            .await?,
    ))
}

pub async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> ApiResult<Json<Vec<PaymentExecution>>> {
    Ok(Json(state.pipeline.coordinator().dead_letters(query.limit).await?))
}
