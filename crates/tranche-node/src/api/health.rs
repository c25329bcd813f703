//! Health check endpoint.

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tranche_release::CircuitState;

use crate::state::AppState;

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    /// State of the ledger circuit breaker.
    pub ledger_circuit: CircuitState,
}

/// Health check endpoint. Reports degraded while the ledger breaker is open.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let ledger_circuit = state.pipeline.coordinator().breaker_state();
    let status = match ledger_circuit {
        CircuitState::Closed => "healthy",
        CircuitState::Open | CircuitState::HalfOpen => "degraded",
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        ledger_circuit,
    })
}
