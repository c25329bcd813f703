//! # Tranche Core
//!
//! Core domain types for milestone-gated escrow release.
//!
//! This crate provides the fundamental building blocks:
//! - [`Milestone`] - A contractual deliverable and its predecessors
//! - [`PaymentAuthorizationRequest`] / [`TimeLock`] - Risk-gated payout approval
//! - [`PaymentExecution`] - The ledger-facing payout state machine
//! - [`condition`] - Crypto-conditions binding fulfillments to milestones
//! - [`TrancheError`] - Error taxonomy

pub mod authorization;
pub mod condition;
pub mod error;
pub mod escrow;
pub mod event;
pub mod execution;
pub mod milestone;
pub mod types;

// Re-exports for convenience
pub use authorization::{Decision, DecisionOutcome, PaymentAuthorizationRequest, TimeLock};
pub use condition::{Condition, Fulfillment};
pub use error::{ErrorCategory, LedgerError, LedgerErrorKind, Result, TrancheError};
pub use escrow::EscrowInstrument;
pub use event::{EscrowEvent, EventKind, EventType};
pub use execution::{ExecutionEvent, ExecutionEventType, FailureOutcome, PaymentExecution};
pub use milestone::{Milestone, MilestoneBuilder, MilestoneDependency, MAX_DURATION_SECS};
pub use types::*;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::authorization::{PaymentAuthorizationRequest, TimeLock};
    pub use crate::error::{Result, TrancheError};
    pub use crate::escrow::EscrowInstrument;
    pub use crate::execution::PaymentExecution;
    pub use crate::milestone::{Milestone, MilestoneBuilder};
    pub use crate::types::{AuthorizationStatus, ExecutionStatus, MilestoneStatus};
}
