//! Time-lock endpoints.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use tranche_core::TimeLock;
use tranche_release::PayoutOutcome;
use uuid::Uuid;

use super::error::ApiResult;
use super::{default_actor, ActorBody};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EarlyReleaseRequest {
    #[serde(default = "default_actor")]
    pub actor: String,
    pub reason: String,
}

#[derive(Debug, Serialize)]
pub struct EarlyReleaseResponse {
    pub time_lock: TimeLock,
    pub payout: PayoutOutcome,
}

pub async fn get_time_lock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<TimeLock>> {
    Ok(Json(state.pipeline.engine().time_lock(id).await?))
}

/// Audited override releasing a lock before its release time.
pub async fn release_early(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<EarlyReleaseRequest>,
) -> ApiResult<Json<EarlyReleaseResponse>> {
    let (time_lock, payout) = state.pipeline.release_early(id, &req.actor, &req.reason).await?;
    Ok(Json(EarlyReleaseResponse { time_lock, payout }))
}

pub async fn cancel_time_lock(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    body: Option<Json<ActorBody>>,
) -> ApiResult<Json<TimeLock>> {
    let actor = body.map(|Json(b)| b.actor).unwrap_or_else(default_actor);
    Ok(Json(state.pipeline.engine().cancel_time_lock(id, &actor).await?))
}
