//! Domain events published to external collaborators.
//!
//! Delivery is at-least-once; consumers deduplicate on `event_id` or on the
//! entity identifier carried by the kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope for a published event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EscrowEvent {
    pub event_id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub kind: EventKind,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A milestone was marked complete.
    MilestoneCompleted {
        contract_id: Uuid,
        milestone_id: Uuid,
    },
    /// A payment request was approved, automatically or by a reviewer.
    PaymentApproved {
        request_id: Uuid,
        automatic: bool,
    },
    /// A payment request was rejected.
    PaymentRejected {
        request_id: Uuid,
        reason: String,
    },
    /// An approved request is held by a time-lock.
    PaymentTimeLocked {
        request_id: Uuid,
        time_lock_id: Uuid,
        release_at: DateTime<Utc>,
    },
    /// A time-lock was released.
    TimeLockReleased {
        request_id: Uuid,
        time_lock_id: Uuid,
        early: bool,
    },
    /// A request expired unresolved.
    RequestExpired { request_id: Uuid },
    /// The payout reached its required confirmations.
    PaymentConfirmed {
        request_id: Uuid,
        execution_id: Uuid,
        tx_hash: String,
    },
    /// An execution attempt failed.
    ExecutionFailed {
        request_id: Uuid,
        execution_id: Uuid,
        error: String,
        retry_scheduled: bool,
    },
    /// An execution exhausted its retries.
    ExecutionDeadLettered {
        request_id: Uuid,
        execution_id: Uuid,
        retries: u32,
        last_error: String,
    },
}

/// Discriminant of [`EventKind`], used for subscription filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    MilestoneCompleted,
    PaymentApproved,
    PaymentRejected,
    PaymentTimeLocked,
    TimeLockReleased,
    RequestExpired,
    PaymentConfirmed,
    ExecutionFailed,
    ExecutionDeadLettered,
}

impl EventKind {
    /// The discriminant of this payload.
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::MilestoneCompleted { .. } => EventType::MilestoneCompleted,
            EventKind::PaymentApproved { .. } => EventType::PaymentApproved,
            EventKind::PaymentRejected { .. } => EventType::PaymentRejected,
            EventKind::PaymentTimeLocked { .. } => EventType::PaymentTimeLocked,
            EventKind::TimeLockReleased { .. } => EventType::TimeLockReleased,
            EventKind::RequestExpired { .. } => EventType::RequestExpired,
            EventKind::PaymentConfirmed { .. } => EventType::PaymentConfirmed,
            EventKind::ExecutionFailed { .. } => EventType::ExecutionFailed,
            EventKind::ExecutionDeadLettered { .. } => EventType::ExecutionDeadLettered,
        }
    }

    /// The entity consumers deduplicate on: the milestone for completion
    /// events, the authorization request for everything else.
    pub fn subject_id(&self) -> Uuid {
        match self {
            EventKind::MilestoneCompleted { milestone_id, .. } => *milestone_id,
            EventKind::PaymentApproved { request_id, .. }
            | EventKind::PaymentRejected { request_id, .. }
            | EventKind::PaymentTimeLocked { request_id, .. }
            | EventKind::TimeLockReleased { request_id, .. }
            | EventKind::RequestExpired { request_id }
            | EventKind::PaymentConfirmed { request_id, .. }
            | EventKind::ExecutionFailed { request_id, .. }
            | EventKind::ExecutionDeadLettered { request_id, .. } => *request_id,
        }
    }
}

impl EscrowEvent {
    /// Wrap a payload in a fresh envelope.
    pub fn new(kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}
