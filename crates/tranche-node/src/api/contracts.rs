//! Contract registration and schedule endpoints.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tranche_core::{Milestone, TrancheError};
use tranche_graph::{Forecast, GraphAnalysis};
use tranche_release::ContractRegistration;
use uuid::Uuid;

use super::error::ApiResult;
use super::default_actor;
use crate::state::AppState;

/// One milestone in a registration request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneInput {
    /// Needed when other milestones depend on this one.
    pub id: Option<Uuid>,
    pub name: String,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    pub due_date: DateTime<Utc>,
    pub created_at: Option<DateTime<Utc>>,
    pub estimated_duration_secs: Option<i64>,
}

/// Request to register or validate a contract.
#[derive(Debug, Deserialize)]
pub struct ContractRequest {
    pub contract_id: Option<Uuid>,
    pub milestones: Vec<MilestoneInput>,
    #[serde(default = "default_actor")]
    pub actor: String,
}

/// Stored milestones of a contract.
#[derive(Debug, Serialize)]
pub struct ContractResponse {
    pub contract_id: Uuid,
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Deserialize)]
pub struct ReoptimizeQuery {
    pub as_of: Option<DateTime<Utc>>,
}

fn build_milestones(contract_id: Uuid, inputs: Vec<MilestoneInput>) -> Result<Vec<Milestone>, TrancheError> {
    inputs
        .into_iter()
        .map(|input| {
            let mut builder = Milestone::builder()
                .contract(contract_id)
                .name(input.name)
                .due(input.due_date);
            if let Some(id) = input.id {
                builder = builder.id(id);
            }
            if let Some(created_at) = input.created_at {
                builder = builder.created_at(created_at);
            }
            if let Some(secs) = input.estimated_duration_secs {
                builder = builder.estimate_secs(secs);
            }
            for pred in input.depends_on {
                builder = builder.depends_on(pred);
            }
            builder.build()
        })
        .collect()
}

/// Register a contract and its milestone graph.
pub async fn register_contract(
    State(state): State<AppState>,
    Json(req): Json<ContractRequest>,
) -> ApiResult<(StatusCode, Json<ContractRegistration>)> {
    let contract_id = req.contract_id.unwrap_or_else(Uuid::new_v4);
    let milestones = build_milestones(contract_id, req.milestones)?;
    let registration = state
        .pipeline
        .register_contract(contract_id, milestones, &req.actor)
        .await?;
    Ok((StatusCode::CREATED, Json(registration)))
}

/// Validate a milestone graph without storing it.
pub async fn validate_contract(
    State(state): State<AppState>,
    Json(req): Json<ContractRequest>,
) -> ApiResult<Json<GraphAnalysis>> {
    let contract_id = req.contract_id.unwrap_or_else(Uuid::new_v4);
    let milestones = build_milestones(contract_id, req.milestones)?;
    Ok(Json(state.pipeline.validate_contract(contract_id, &milestones)?))
}

/// Get a contract's milestones in creation order.
pub async fn get_contract(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
) -> ApiResult<Json<ContractResponse>> {
    let milestones = state.pipeline.store().contract_milestones(contract_id).await?;
    if milestones.is_empty() {
        return Err(TrancheError::not_found("contract", contract_id).into());
    }
    Ok(Json(ContractResponse {
        contract_id,
        milestones,
    }))
}

/// Topological order and CPM schedule.
pub async fn get_schedule(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
) -> ApiResult<Json<GraphAnalysis>> {
    Ok(Json(state.pipeline.contract_analysis(contract_id).await?))
}

/// Forward-looking forecast, as of now unless `as_of` is given.
pub async fn reoptimize(
    State(state): State<AppState>,
    Path(contract_id): Path<Uuid>,
    Query(query): Query<ReoptimizeQuery>,
) -> ApiResult<Json<Forecast>> {
    let as_of = query.as_of.unwrap_or_else(Utc::now);
    Ok(Json(state.pipeline.reoptimize(contract_id, as_of).await?))
}
