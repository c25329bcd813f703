//! Status enums and transition tables shared across Tranche.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a contract milestone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    /// Not started yet.
    Pending,
    /// Work has begun.
    InProgress,
    /// Verified complete. Terminal.
    Completed,
    /// Past its due date without completion.
    Overdue,
    /// Withdrawn from the contract. Terminal.
    Cancelled,
}

impl MilestoneStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MilestoneStatus::Completed | MilestoneStatus::Cancelled)
    }

    /// Returns true if the transition `self -> to` is allowed.
    pub fn can_transition_to(&self, to: MilestoneStatus) -> bool {
        use MilestoneStatus::*;
        matches!(
            (self, to),
            (Pending, InProgress)
                | (Pending, Completed)
                | (Pending, Overdue)
                | (Pending, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Overdue)
                | (InProgress, Cancelled)
                | (Overdue, InProgress)
                | (Overdue, Completed)
                | (Overdue, Cancelled)
        )
    }
}

/// Status of a payment authorization request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    /// Created, risk not yet evaluated.
    Pending,
    /// Risk below the auto-approve threshold.
    AutoApproved,
    /// Risk between thresholds; waiting for a reviewer.
    ManualReviewRequired,
    /// Approved by a reviewer.
    Approved,
    /// Rejected by policy or a reviewer. Terminal.
    Rejected,
    /// Approved but held until its time-lock releases.
    TimeLocked,
    /// Expired before resolution. Terminal.
    Expired,
}

impl AuthorizationStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Rejected | AuthorizationStatus::Expired
        )
    }

    /// Returns true if an approve/reject decision has been taken.
    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::AutoApproved
                | AuthorizationStatus::Approved
                | AuthorizationStatus::Rejected
                | AuthorizationStatus::TimeLocked
        )
    }

    /// Returns true if the request may still expire.
    pub fn can_expire(&self) -> bool {
        matches!(
            self,
            AuthorizationStatus::Pending
                | AuthorizationStatus::ManualReviewRequired
                | AuthorizationStatus::TimeLocked
        )
    }

    /// Returns true if the transition `self -> to` is allowed.
    pub fn can_transition_to(&self, to: AuthorizationStatus) -> bool {
        use AuthorizationStatus::*;
        if to == Expired {
            return self.can_expire();
        }
        matches!(
            (self, to),
            (Pending, AutoApproved)
                | (Pending, ManualReviewRequired)
                | (Pending, Rejected)
                | (ManualReviewRequired, Approved)
                | (ManualReviewRequired, Rejected)
                | (AutoApproved, TimeLocked)
                | (Approved, TimeLocked)
        )
    }
}

/// Status of a payment execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Waiting to be submitted.
    Pending,
    /// Handed to the ledger.
    Submitted,
    /// Included on the ledger, waiting for enough confirmations.
    Confirming,
    /// Fully confirmed. Terminal.
    Confirmed,
    /// The last attempt failed.
    Failed,
    /// Retries exhausted; needs an operator. Terminal until re-driven.
    DeadLettered,
    /// Abandoned by an operator. Terminal.
    Cancelled,
}

impl ExecutionStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Confirmed | ExecutionStatus::DeadLettered | ExecutionStatus::Cancelled
        )
    }

    /// Returns true if the execution is waiting on the ledger.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Submitted | ExecutionStatus::Confirming
        )
    }

    /// Returns true if the transition `self -> to` is allowed.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Pending, Submitted)
                | (Pending, Failed)
                | (Pending, Cancelled)
                | (Submitted, Confirming)
                | (Submitted, Confirmed)
                | (Submitted, Failed)
                | (Confirming, Confirmed)
                | (Confirming, Failed)
                | (Failed, Pending)
                | (Failed, DeadLettered)
                | (Failed, Cancelled)
                | (DeadLettered, Pending)
                | (DeadLettered, Cancelled)
        )
    }
}

macro_rules! display_as_serde {
    ($($ty:ty),*) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    let s = serde_json::to_value(self)
                        .ok()
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .unwrap_or_else(|| format!("{:?}", self));
                    f.write_str(&s)
                }
            }
        )*
    };
}

display_as_serde!(MilestoneStatus, AuthorizationStatus, ExecutionStatus);

/// Kind of dependency between two milestones. Only finish-to-start exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DependencyType {
    #[default]
    FinishToStart,
}
