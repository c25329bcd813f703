//! Payment authorization requests and time-locks.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TrancheError};
use crate::types::AuthorizationStatus;

/// A request to pay out the escrow attached to a completed milestone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentAuthorizationRequest {
    /// Unique identifier. Also the idempotency key of the resulting execution.
    pub id: Uuid,

    /// The milestone whose completion triggered the request.
    pub milestone_id: Uuid,

    /// The contract the milestone belongs to.
    pub contract_id: Uuid,

    /// The escrow instrument to release.
    pub escrow_id: Uuid,

    /// Amount in minor currency units.
    pub amount: u64,

    /// ISO 4217 currency code.
    pub currency: String,

    /// Current status.
    pub status: AuthorizationStatus,

    /// Risk score in [0, 1], once evaluated.
    pub risk_score: Option<f64>,

    /// Approve/reject decision, once taken.
    pub decision: Option<Decision>,

    /// Time-lock holding the release, if any.
    pub time_lock_id: Option<Uuid>,

    /// Execution created for this request, if any.
    pub execution_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// After this instant an unresolved request expires.
    pub expires_at: DateTime<Utc>,

    /// Storage version, bumped on every persisted change.
    #[serde(default)]
    pub version: u64,
}

/// Outcome of an authorization decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionOutcome {
    Approved,
    Rejected,
}

/// A recorded approve/reject decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Decision {
    pub outcome: DecisionOutcome,
    /// Principal that decided, or `"risk-engine"` for automatic decisions.
    pub decided_by: String,
    pub reason: Option<String>,
    pub decided_at: DateTime<Utc>,
    /// True when taken by thresholding rather than a reviewer.
    pub automatic: bool,
}

/// Validate an amount/currency pair.
pub fn validate_money(amount: u64, currency: &str) -> Result<()> {
    if amount == 0 {
        return Err(TrancheError::validation("amount must be greater than zero"));
    }
    if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(TrancheError::validation(format!(
            "currency '{}' is not a three-letter ISO code",
            currency
        )));
    }
    Ok(())
}

impl PaymentAuthorizationRequest {
    /// Create a new pending request.
    pub fn new(
        milestone_id: Uuid,
        contract_id: Uuid,
        escrow_id: Uuid,
        amount: u64,
        currency: impl Into<String>,
        ttl: Duration,
    ) -> Result<Self> {
        let currency = currency.into();
        validate_money(amount, &currency)?;
        if ttl <= Duration::zero() {
            return Err(TrancheError::validation("request ttl must be positive"));
        }

        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            milestone_id,
            contract_id,
            escrow_id,
            amount,
            currency,
            status: AuthorizationStatus::Pending,
            risk_score: None,
            decision: None,
            time_lock_id: None,
            execution_id: None,
            created_at: now,
            updated_at: now,
            expires_at: now + ttl,
            version: 0,
        })
    }

    /// Returns true if the request is unresolved and past its expiry.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.can_expire() && now >= self.expires_at
    }

    /// Move to `to`, enforcing the state machine.
    pub fn transition(&mut self, to: AuthorizationStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(TrancheError::InvalidTransition {
                entity: "authorization",
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Check whether this request may be handed to execution.
    pub fn check_releasable(&self, time_lock: Option<&TimeLock>) -> Result<()> {
        let not_releasable = |reason: &str| TrancheError::NotReleasable {
            request_id: self.id,
            reason: reason.to_string(),
        };

        match self.status {
            AuthorizationStatus::AutoApproved | AuthorizationStatus::Approved => Ok(()),
            AuthorizationStatus::TimeLocked => match time_lock {
                Some(lock) if lock.released => Ok(()),
                Some(_) => Err(not_releasable("time-lock has not been released")),
                None => Err(not_releasable("time-lock record is missing")),
            },
            AuthorizationStatus::Expired => Err(TrancheError::RequestExpired { request_id: self.id }),
            AuthorizationStatus::Rejected => match (&self.decision, self.risk_score) {
                (Some(decision), Some(score)) if decision.automatic => Err(TrancheError::RiskBlocked {
                    request_id: self.id,
                    score,
                }),
                _ => Err(not_releasable("request was rejected")),
            },
            AuthorizationStatus::Pending => Err(not_releasable("risk has not been evaluated")),
            AuthorizationStatus::ManualReviewRequired => {
                Err(not_releasable("request is awaiting manual review"))
            }
        }
    }
}

/// A mandatory delay before an approved payment may release.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeLock {
    pub id: Uuid,
    pub request_id: Uuid,

    /// Earliest automatic release time.
    pub release_at: DateTime<Utc>,

    /// Set once, when the lock is released by the sweep or an override.
    pub released: bool,
    pub released_at: Option<DateTime<Utc>>,

    /// Actor that forced an early release, if any.
    pub early_release_by: Option<String>,
    pub early_release_reason: Option<String>,

    /// Actor that cancelled the lock, if any.
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub version: u64,
}

impl TimeLock {
    /// Create a lock releasing `cooldown` from now.
    pub fn new(request_id: Uuid, cooldown: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            request_id,
            release_at: now + cooldown,
            released: false,
            released_at: None,
            early_release_by: None,
            early_release_reason: None,
            cancelled_by: None,
            cancelled_at: None,
            created_at: now,
            version: 0,
        }
    }

    /// Returns true if neither released nor cancelled.
    pub fn is_active(&self) -> bool {
        !self.released && self.cancelled_at.is_none()
    }

    /// Returns true if the sweep should release this lock.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.release_at <= now
    }
}
