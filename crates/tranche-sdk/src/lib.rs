//! # Tranche SDK
//!
//! Client SDK for interacting with Tranche nodes.

pub mod client;

pub use client::{
    ContractSummary, EarlyRelease, HealthStatus, LockedRequest, NewMilestone, TraceExport,
    TrancheClient, DEFAULT_TIMEOUT,
};

/// Prelude module for common imports.
pub mod prelude {
    pub use crate::client::{NewMilestone, TrancheClient};
    pub use tranche_core::prelude::*;
}
