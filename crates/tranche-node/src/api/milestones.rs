//! Milestone endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tranche_core::Milestone;
use tranche_release::{CompletionOutcome, PayoutOutcome};
use tranche_state::EntityHistory;
use uuid::Uuid;

use super::error::ApiResult;
use super::{default_actor, ActorBody};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ProgressRequest {
    pub percent: u8,
    #[serde(default = "default_actor")]
    pub actor: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct OverdueRequest {
    pub as_of: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct OverdueResponse {
    pub flagged: Vec<Uuid>,
}

pub async fn get_milestone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Milestone>> {
    Ok(Json(state.pipeline.milestone(id).await?))
}

/// Record progress on a milestone.
pub async fn record_progress(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ProgressRequest>,
) -> ApiResult<Json<Milestone>> {
    Ok(Json(state.pipeline.record_progress(id, req.percent, &req.actor).await?))
}

/// Complete a milestone and start its payout.
pub async fn complete_milestone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ActorBody>>,
) -> ApiResult<Json<CompletionOutcome>> {
    let actor = body.map(|Json(b)| b.actor).unwrap_or_else(default_actor);
    Ok(Json(state.pipeline.complete_milestone(id, &actor).await?))
}

pub async fn cancel_milestone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ActorBody>>,
) -> ApiResult<Json<Milestone>> {
    let actor = body.map(|Json(b)| b.actor).unwrap_or_else(default_actor);
    Ok(Json(state.pipeline.cancel_milestone(id, &actor).await?))
}

/// Request payout authorization for a completed milestone.
pub async fn request_authorization(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ActorBody>>,
) -> ApiResult<(StatusCode, Json<PayoutOutcome>)> {
    let actor = body.map(|Json(b)| b.actor).unwrap_or_else(default_actor);
    let outcome = state.pipeline.request_authorization(id, &actor).await?;
    Ok((StatusCode::CREATED, Json(outcome)))
}

pub async fn milestone_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EntityHistory>> {
    state.pipeline.milestone(id).await?;
    Ok(Json(state.pipeline.store().history(id).await?))
}

/// Flag milestones past their due date.
pub async fn mark_overdue(
    State(state): State<AppState>,
    body: Option<Json<OverdueRequest>>,
) -> ApiResult<Json<OverdueResponse>> {
    let as_of = body.and_then(|Json(b)| b.as_of).unwrap_or_else(Utc::now);
    let flagged = state.pipeline.mark_overdue(as_of).await?;
    Ok(Json(OverdueResponse { flagged }))
}
