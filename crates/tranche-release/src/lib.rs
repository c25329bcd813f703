//! # Tranche Release
//!
//! The release side of Tranche: risk-gated authorization of milestone
//! payouts, ledger execution with retries and a circuit breaker, and the
//! background sweeps that keep both moving.
//!
//! [`ReleasePipeline`] wires the pieces together; the components are also
//! usable on their own.

pub mod authorization;
pub mod breaker;
pub mod config;
pub mod executor;
pub mod ledger;
pub mod pipeline;
pub mod retry;
pub mod risk;
pub mod sweep;

#[cfg(test)]
pub(crate) mod fixtures;

pub use authorization::{AuthorizationEngine, BulkApprovalItem, BulkApprovalReport, RISK_ENGINE};
pub use breaker::{CircuitBreaker, CircuitState};
pub use config::{
    AuthorizationConfig, BreakerConfig, ExecutionConfig, ReleaseConfig, RiskThresholds,
    SweepConfig, TimeLockPolicy, MAX_WINDOW_SECS,
};
pub use executor::{BulkExecutionItem, BulkExecutionReport, PaymentCoordinator, RetryPass};
pub use ledger::{LedgerClient, ReleaseTransaction, SimulatedLedger};
pub use pipeline::{CompletionOutcome, ContractRegistration, PayoutOutcome, ReleasePipeline};
pub use retry::RetryPolicy;
pub use risk::{AmountRiskScorer, RiskClass, RiskContext, RiskScorer, StaticRiskScorer};
pub use sweep::{spawn_sweeps, ConfirmationSweep, StopSignal, Sweep, SweepHandle, SweepReport, TimeLockSweep};
