//! Application state.

use std::sync::Arc;

use tranche_core::Result;
use tranche_release::{LedgerClient, ReleaseConfig, ReleasePipeline, RiskScorer};
use tranche_state::{BroadcastPublisher, InMemoryEscrowStore};

use crate::config::NodeConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// The release pipeline behind every endpoint.
    pub pipeline: Arc<ReleasePipeline>,

    /// Event fan-out, also queried for recent events.
    pub events: Arc<BroadcastPublisher>,
}

impl AppState {
    /// Build the state for a node running against the simulated collaborators.
    pub fn new(config: &NodeConfig) -> Result<Self> {
        Self::with_collaborators(
            config.risk.build(),
            Arc::new(config.ledger.build()),
            config.release.clone(),
        )
    }

    /// Build the state around explicit collaborators.
    pub fn with_collaborators(
        scorer: Arc<dyn RiskScorer>,
        ledger: Arc<dyn LedgerClient>,
        release: ReleaseConfig,
    ) -> Result<Self> {
        let events = Arc::new(BroadcastPublisher::new());
        let pipeline = ReleasePipeline::new(
            Arc::new(InMemoryEscrowStore::new()),
            scorer,
            ledger,
            events.clone(),
            release,
        )?;

        Ok(Self {
            pipeline: Arc::new(pipeline),
            events,
        })
    }
}
