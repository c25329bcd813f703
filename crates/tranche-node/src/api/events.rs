//! Recent event feed.

use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;
use tranche_core::{EscrowEvent, EventType};
use tranche_state::EventFilter;
use uuid::Uuid;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(rename = "type")]
    pub event_type: Option<EventType>,
    /// Milestone or request the events are about.
    pub subject: Option<Uuid>,
    pub limit: Option<usize>,
}

/// Most recent events, newest last.
pub async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Json<Vec<EscrowEvent>> {
    let filter = EventFilter {
        types: query.event_type.map(|t| vec![t]),
        subject_id: query.subject,
    };
    let limit = query.limit.unwrap_or(100).min(256);
    Json(state.events.recent(&filter, limit).await)
}
