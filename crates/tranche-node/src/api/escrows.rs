//! Escrow endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use tranche_core::EscrowInstrument;
use uuid::Uuid;

use super::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateEscrowRequest {
    pub milestone_id: Uuid,
    /// Minor units.
    pub amount: u64,
    pub currency: String,
}

/// Fund a milestone. The response carries the condition, never the fulfillment.
pub async fn create_escrow(
    State(state): State<AppState>,
    Json(req): Json<CreateEscrowRequest>,
) -> ApiResult<(StatusCode, Json<EscrowInstrument>)> {
    let escrow = state
        .pipeline
        .create_escrow(req.milestone_id, req.amount, &req.currency)
        .await?;
    Ok((StatusCode::CREATED, Json(escrow)))
}

pub async fn get_escrow(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<EscrowInstrument>> {
    Ok(Json(state.pipeline.escrow(id).await?))
}
