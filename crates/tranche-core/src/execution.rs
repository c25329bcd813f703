//! Payment execution records.
//!
//! A PaymentExecution is the ledger-facing half of a payout. Exactly one
//! exists per authorization request; its trace is hashed into a Merkle root
//! so an exported record can be checked for tampering.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::authorization::PaymentAuthorizationRequest;
use crate::error::{LedgerError, LedgerErrorKind, Result, TrancheError};
use crate::types::ExecutionStatus;

/// Ledger execution of one authorized payment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentExecution {
    /// Unique identifier for this execution.
    pub id: Uuid,

    /// The authorization request. Unique across executions.
    pub request_id: Uuid,

    pub escrow_id: Uuid,
    pub milestone_id: Uuid,
    pub amount: u64,
    pub currency: String,

    /// Ledger transaction hash, once submitted.
    pub tx_hash: Option<String>,

    pub status: ExecutionStatus,

    /// Inclusion depth last observed on the ledger.
    pub confirmations: u32,
    pub required_confirmations: u32,

    /// Automatic retries performed so far.
    pub retry_count: u32,
    pub max_retries: u32,

    pub last_error: Option<String>,
    pub last_error_kind: Option<LedgerErrorKind>,

    /// When the next automatic retry may run. `None` unless a retry is scheduled.
    pub next_attempt_at: Option<DateTime<Utc>>,

    pub submitted_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Ordered audit trail.
    pub trace: Vec<ExecutionEvent>,

    /// Merkle root of the trace.
    pub trace_root: String,

    #[serde(default)]
    pub version: u64,
}

/// An event in an execution's trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionEvent {
    pub id: Uuid,
    pub event_type: ExecutionEventType,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Types of execution events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventType {
    Created,
    SubmissionStarted,
    Submitted,
    ConfirmationObserved,
    Confirmed,
    Failed,
    RetryScheduled,
    Retried,
    DeadLettered,
    Redriven,
    Cancelled,
}

/// What a failure did to the execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Transient; an automatic retry is scheduled.
    RetryScheduled { attempt: u32, at: DateTime<Utc> },
    /// Transient, but retries are exhausted.
    DeadLettered,
    /// Terminal error; no retry.
    Terminal,
}

impl ExecutionEvent {
    /// Create an event of the given type.
    pub fn new(event_type: ExecutionEventType) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    /// Add data to the event.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

impl PaymentExecution {
    /// Create a pending execution for an authorized request.
    pub fn for_request(
        request: &PaymentAuthorizationRequest,
        required_confirmations: u32,
        max_retries: u32,
    ) -> Self {
        let now = Utc::now();
        let mut execution = Self {
            id: Uuid::new_v4(),
            request_id: request.id,
            escrow_id: request.escrow_id,
            milestone_id: request.milestone_id,
            amount: request.amount,
            currency: request.currency.clone(),
            tx_hash: None,
            status: ExecutionStatus::Pending,
            confirmations: 0,
            required_confirmations: required_confirmations.max(1),
            retry_count: 0,
            max_retries,
            last_error: None,
            last_error_kind: None,
            next_attempt_at: None,
            submitted_at: None,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
            trace: Vec::new(),
            trace_root: String::new(),
            version: 0,
        };
        execution.record(ExecutionEvent::new(ExecutionEventType::Created));
        execution
    }

    /// Move to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: ExecutionStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(TrancheError::InvalidTransition {
                entity: "execution",
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Append an event to the trace.
    pub fn record(&mut self, event: ExecutionEvent) {
        self.trace.push(event);
        self.trace_root = self.compute_trace_root();
    }

    /// Returns true if a transient failure scheduled an automatic retry.
    pub fn awaiting_retry(&self) -> bool {
        self.status == ExecutionStatus::Failed && self.next_attempt_at.is_some()
    }

    /// Returns true if an automatic retry is due.
    pub fn retry_due(&self, now: DateTime<Utc>) -> bool {
        self.awaiting_retry() && self.next_attempt_at.map_or(false, |at| at <= now)
    }

    /// Mark the submission as accepted by the ledger.
    pub fn mark_submitted(&mut self, tx_hash: impl Into<String>) {
        let tx_hash = tx_hash.into();
        self.record(
            ExecutionEvent::new(ExecutionEventType::Submitted)
                .with_data(serde_json::json!({ "tx_hash": tx_hash })),
        );
        let now = Utc::now();
        self.tx_hash = Some(tx_hash);
        self.submitted_at = Some(now);
        self.updated_at = now;
    }

    /// Apply a confirmation count read from the ledger.
    pub fn observe_confirmations(&mut self, confirmations: u32) -> Result<()> {
        if confirmations == self.confirmations && confirmations < self.required_confirmations {
            return Ok(());
        }
        self.confirmations = confirmations;
        self.record(
            ExecutionEvent::new(ExecutionEventType::ConfirmationObserved)
                .with_data(serde_json::json!({ "confirmations": confirmations })),
        );

        if confirmations >= self.required_confirmations {
            self.transition(ExecutionStatus::Confirmed)?;
            self.confirmed_at = Some(Utc::now());
            self.record(ExecutionEvent::new(ExecutionEventType::Confirmed));
        } else if confirmations > 0 && self.status == ExecutionStatus::Submitted {
            self.transition(ExecutionStatus::Confirming)?;
        }
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Transient errors schedule a retry `backoff` from `now` until
    /// `max_retries` is reached; the next transient failure dead-letters.
    /// Terminal errors fail immediately without retry.
    pub fn record_failure(
        &mut self,
        error: &LedgerError,
        backoff: Duration,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome> {
        self.transition(ExecutionStatus::Failed)?;
        self.last_error = Some(error.message.clone());
        self.last_error_kind = Some(error.kind);
        self.record(ExecutionEvent::new(ExecutionEventType::Failed).with_data(
            serde_json::json!({ "kind": error.kind, "message": error.message }),
        ));

        if !error.is_transient() {
            self.next_attempt_at = None;
            return Ok(FailureOutcome::Terminal);
        }

        if self.retry_count >= self.max_retries {
            self.next_attempt_at = None;
            self.transition(ExecutionStatus::DeadLettered)?;
            self.record(ExecutionEvent::new(ExecutionEventType::DeadLettered).with_data(
                serde_json::json!({ "retries": self.retry_count }),
            ));
            return Ok(FailureOutcome::DeadLettered);
        }

        self.retry_count += 1;
        let at = now + backoff;
        self.next_attempt_at = Some(at);
        self.record(ExecutionEvent::new(ExecutionEventType::RetryScheduled).with_data(
            serde_json::json!({ "attempt": self.retry_count, "at": at }),
        ));
        Ok(FailureOutcome::RetryScheduled {
            attempt: self.retry_count,
            at,
        })
    }

    /// Move a failed execution back to Pending for another attempt.
    pub fn prepare_retry(&mut self) -> Result<()> {
        if self.status == ExecutionStatus::Failed
            && self.last_error_kind.map_or(false, |k| !k.is_transient())
        {
            return Err(TrancheError::InvalidTransition {
                entity: "execution",
                id: self.id,
                from: "failed (terminal)".to_string(),
                to: ExecutionStatus::Pending.to_string(),
            });
        }
        self.transition(ExecutionStatus::Pending)?;
        self.next_attempt_at = None;
        self.tx_hash = None;
        self.submitted_at = None;
        self.confirmations = 0;
        self.record(ExecutionEvent::new(ExecutionEventType::Retried).with_data(
            serde_json::json!({ "attempt": self.retry_count }),
        ));
        Ok(())
    }

    /// Operator re-drive of a dead-lettered execution.
    pub fn redrive(&mut self, actor: &str) -> Result<()> {
        if self.status != ExecutionStatus::DeadLettered {
            return Err(TrancheError::InvalidTransition {
                entity: "execution",
                id: self.id,
                from: self.status.to_string(),
                to: ExecutionStatus::Pending.to_string(),
            });
        }
        self.transition(ExecutionStatus::Pending)?;
        self.retry_count = 0;
        self.next_attempt_at = None;
        self.tx_hash = None;
        self.submitted_at = None;
        self.confirmations = 0;
        self.record(
            ExecutionEvent::new(ExecutionEventType::Redriven)
                .with_data(serde_json::json!({ "actor": actor })),
        );
        Ok(())
    }

    /// Operator abandonment.
    pub fn cancel(&mut self, actor: &str, reason: &str) -> Result<()> {
        self.transition(ExecutionStatus::Cancelled)?;
        self.next_attempt_at = None;
        self.record(
            ExecutionEvent::new(ExecutionEventType::Cancelled)
                .with_data(serde_json::json!({ "actor": actor, "reason": reason })),
        );
        Ok(())
    }

    /// Compute the Merkle root of the execution trace.
    pub fn compute_trace_root(&self) -> String {
        if self.trace.is_empty() {
            return "0".repeat(64);
        }

        let mut hashes: Vec<Vec<u8>> = self
            .trace
            .iter()
            .map(|event| {
                let json = serde_json::to_string(event).unwrap_or_default();
                Sha256::digest(json.as_bytes()).to_vec()
            })
            .collect();

        while hashes.len() > 1 {
            let mut next_level = Vec::with_capacity(hashes.len().div_ceil(2));

            for chunk in hashes.chunks(2) {
                let mut hasher = Sha256::new();
                hasher.update(&chunk[0]);
                // Odd level: pair the last hash with itself.
                hasher.update(chunk.get(1).unwrap_or(&chunk[0]));
                next_level.push(hasher.finalize().to_vec());
            }

            hashes = next_level;
        }

        hashes
            .first()
            .map(hex::encode)
            .unwrap_or_else(|| "0".repeat(64))
    }

    /// Verify the stored root matches the trace.
    pub fn verify_trace_root(&self) -> bool {
        self.trace_root == self.compute_trace_root()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LedgerErrorKind;

    fn execution(max_retries: u32) -> PaymentExecution {
        let request = PaymentAuthorizationRequest::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            5_000,
            "USD",
            Duration::hours(1),
        )
        .unwrap();
        PaymentExecution::for_request(&request, 3, max_retries)
    }

    #[test]
    fn test_confirmation_progression() {
        let mut exec = execution(3);
        exec.transition(ExecutionStatus::Submitted).unwrap();
        exec.mark_submitted("ABCD");

        exec.observe_confirmations(1).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Confirming);
        exec.observe_confirmations(2).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Confirming);
        exec.observe_confirmations(3).unwrap();
        assert_eq!(exec.status, ExecutionStatus::Confirmed);
        assert!(exec.confirmed_at.is_some());
    }

    #[test]
    fn test_transient_failures_dead_letter_after_max_retries() {
        let mut exec = execution(3);
        let now = Utc::now();

        for attempt in 1..=3 {
            exec.transition(ExecutionStatus::Submitted).unwrap();
            let outcome = exec
                .record_failure(&LedgerError::timeout(format!("t{}", attempt)), Duration::seconds(1), now)
                .unwrap();
            assert!(matches!(outcome, FailureOutcome::RetryScheduled { attempt: a, .. } if a == attempt));
            exec.prepare_retry().unwrap();
        }

        exec.transition(ExecutionStatus::Submitted).unwrap();
        let outcome = exec
            .record_failure(&LedgerError::timeout("t4"), Duration::seconds(1), now)
            .unwrap();
        assert_eq!(outcome, FailureOutcome::DeadLettered);
        assert_eq!(exec.status, ExecutionStatus::DeadLettered);
        assert_eq!(exec.retry_count, 3);
        assert_eq!(exec.last_error.as_deref(), Some("t4"));
    }

    #[test]
    fn test_terminal_failure_blocks_retry() {
        let mut exec = execution(3);
        exec.transition(ExecutionStatus::Submitted).unwrap();
        let err = LedgerError::new(LedgerErrorKind::InsufficientFunds, "empty");
        let outcome = exec.record_failure(&err, Duration::seconds(1), Utc::now()).unwrap();
        assert_eq!(outcome, FailureOutcome::Terminal);
        assert!(!exec.awaiting_retry());
        assert!(exec.prepare_retry().is_err());
        assert!(exec.cancel("ops", "funds missing").is_ok());
    }

    #[test]
    fn test_redrive_resets_retries() {
        let mut exec = execution(0);
        exec.transition(ExecutionStatus::Submitted).unwrap();
        exec.record_failure(&LedgerError::network("down"), Duration::zero(), Utc::now())
            .unwrap();
        assert_eq!(exec.status, ExecutionStatus::DeadLettered);
        exec.redrive("ops").unwrap();
        assert_eq!(exec.status, ExecutionStatus::Pending);
        assert_eq!(exec.retry_count, 0);
    }

    #[test]
    fn test_trace_root() {
        let mut exec = execution(3);
        assert!(exec.verify_trace_root());
        exec.record(ExecutionEvent::new(ExecutionEventType::SubmissionStarted));
        assert!(exec.verify_trace_root());
        exec.trace[0].event_type = ExecutionEventType::Cancelled;
        assert!(!exec.verify_trace_root());
    }
}
