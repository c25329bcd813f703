//! Error types for Tranche.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Broad class of an error, used to decide retry and surfacing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Rejected synchronously, never retried.
    Validation,
    /// Authorization policy refused the operation. Terminal.
    Policy,
    /// Retried automatically.
    Transient,
    /// Failed immediately and needs manual remediation.
    Terminal,
    /// Automatic retries ran out; routed to dead-letter.
    Exhausted,
    /// Storage, serialization or other internal failure.
    Internal,
}

/// Kinds of failure reported by the external ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerErrorKind {
    /// The call did not complete within its deadline.
    Timeout,
    /// Temporary network failure.
    Network,
    /// The ledger is overloaded and asked us to back off.
    Busy,
    /// The local circuit breaker short-circuited the call.
    CircuitOpen,
    /// The transaction signature was refused.
    InvalidSignature,
    /// The fulfillment does not satisfy the escrow condition.
    ConditionMismatch,
    /// The escrow does not hold enough funds.
    InsufficientFunds,
    /// The ledger rejected the transaction for another permanent reason.
    Rejected,
}

impl LedgerErrorKind {
    /// Returns true if a call failing with this kind may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerErrorKind::Timeout
                | LedgerErrorKind::Network
                | LedgerErrorKind::Busy
                | LedgerErrorKind::CircuitOpen
        )
    }
}

/// A failure returned by a ledger client.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind:?}: {message}")]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    pub fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Timeout, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::Network, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(LedgerErrorKind::CircuitOpen, message)
    }

    /// Returns true if the failed call may be retried.
    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

/// Main error type for Tranche operations.
#[derive(Error, Debug, Clone)]
pub enum TrancheError {
    /// The milestone graph of a contract contains a cycle.
    #[error("Circular dependency in contract {contract_id} involving milestone {milestone_id}")]
    CircularDependency {
        contract_id: Uuid,
        milestone_id: Uuid,
        cycle: Vec<Uuid>,
    },

    /// A predecessor milestone is not yet completed.
    #[error("Milestone {milestone_id} depends on {predecessor_id}, which is not completed")]
    DependencyNotSatisfied {
        milestone_id: Uuid,
        predecessor_id: Uuid,
    },

    /// Input failed validation.
    #[error("Validation failed: {message}")]
    Validation { message: String },

    /// A state machine was asked to make a transition it does not allow.
    #[error("Invalid {entity} transition for {id}: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        id: Uuid,
        from: String,
        to: String,
    },

    /// The risk engine blocked the payment.
    #[error("Payment request {request_id} blocked: risk score {score:.3}")]
    RiskBlocked { request_id: Uuid, score: f64 },

    /// The authorization request expired before resolution.
    #[error("Payment request {request_id} has expired")]
    RequestExpired { request_id: Uuid },

    /// The request exists but may not be released yet.
    #[error("Payment request {request_id} is not releasable: {reason}")]
    NotReleasable { request_id: Uuid, reason: String },

    /// An external ledger call failed.
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    /// Automatic retries are exhausted.
    #[error("Execution {execution_id} dead-lettered after {retries} retries: {last_error}")]
    RetriesExhausted {
        execution_id: Uuid,
        retries: u32,
        last_error: String,
    },

    /// Operation timed out.
    #[error("Operation timed out after {duration_ms}ms: {message}")]
    Timeout { duration_ms: u64, message: String },

    /// A version-guarded update lost a race.
    #[error("Concurrent modification of {entity} {id}")]
    Conflict { entity: &'static str, id: Uuid },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Cryptographic operation failed.
    #[error("Cryptographic error: {0}")]
    CryptoError(String),

    /// Resource not found.
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    /// Internal error (should not happen).
    #[error("Internal error: {0}")]
    Internal(String),

    /// Connection error.
    #[error("Connection error: {0}")]
    ConnectionError(String),
}

impl TrancheError {
    /// Shorthand for a validation failure.
    pub fn validation(message: impl Into<String>) -> Self {
        TrancheError::Validation {
            message: message.into(),
        }
    }

    /// Shorthand for a missing resource.
    pub fn not_found(resource_type: &str, id: impl ToString) -> Self {
        TrancheError::NotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }

    /// Classify the error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TrancheError::CircularDependency { .. }
            | TrancheError::DependencyNotSatisfied { .. }
            | TrancheError::Validation { .. }
            | TrancheError::InvalidTransition { .. }
            | TrancheError::NotFound { .. } => ErrorCategory::Validation,
            TrancheError::RiskBlocked { .. }
            | TrancheError::RequestExpired { .. }
            | TrancheError::NotReleasable { .. } => ErrorCategory::Policy,
            TrancheError::Ledger(err) if err.is_transient() => ErrorCategory::Transient,
            TrancheError::Ledger(_) => ErrorCategory::Terminal,
            TrancheError::Timeout { .. } | TrancheError::ConnectionError(_) => {
                ErrorCategory::Transient
            }
            TrancheError::RetriesExhausted { .. } => ErrorCategory::Exhausted,
            TrancheError::Conflict { .. }
            | TrancheError::SerializationError(_)
            | TrancheError::CryptoError(_)
            | TrancheError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Returns true if this error is recoverable.
    pub fn is_recoverable(&self) -> bool {
        self.category() == ErrorCategory::Transient
    }
}

/// Convenience Result type for Tranche operations.
pub type Result<T> = std::result::Result<T, TrancheError>;

impl From<serde_json::Error> for TrancheError {
    fn from(err: serde_json::Error) -> Self {
        TrancheError::SerializationError(err.to_string())
    }
}
