//! Risk & authorization engine.
//!
//! Turns a completed milestone into a payment authorization request, scores
//! it, and records automatic or manual decisions and time-locks. Every write
//! goes through the store's version guard; a lost race re-reads and, where
//! the other writer already decided, returns that decision.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tranche_core::{
    AuthorizationStatus, Decision, DecisionOutcome, EscrowEvent, EventKind, Milestone,
    MilestoneStatus, PaymentAuthorizationRequest, Result, TimeLock, TrancheError,
};
use tranche_graph::ensure_predecessors_completed;
use tranche_state::{EntityHistory, EscrowStore, EventPublisher};
use uuid::Uuid;

use crate::config::{AuthorizationConfig, MAX_WINDOW_SECS};
use crate::risk::{check_score, classify, RiskClass, RiskContext, RiskScorer};

/// Actor recorded on automatic decisions.
pub const RISK_ENGINE: &str = "risk-engine";

const MAX_CAS_ATTEMPTS: usize = 3;

/// Per-item result of a bulk approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkApprovalItem {
    pub request_id: Uuid,
    pub success: bool,
    pub status: Option<AuthorizationStatus>,
    pub error: Option<String>,
}

/// Result of a bulk approval.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkApprovalReport {
    pub results: Vec<BulkApprovalItem>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Fail unless every predecessor of `milestone` is completed.
pub async fn predecessors_completed(store: &dyn EscrowStore, milestone: &Milestone) -> Result<()> {
    if milestone.depends_on.is_empty() {
        return Ok(());
    }
    let statuses: HashMap<Uuid, MilestoneStatus> = store
        .contract_milestones(milestone.contract_id)
        .await?
        .into_iter()
        .map(|m| (m.id, m.status))
        .collect();
    ensure_predecessors_completed(milestone, |id| statuses.get(&id).copied())
}

/// The authorization engine.
pub struct AuthorizationEngine {
    store: Arc<dyn EscrowStore>,
    scorer: Arc<dyn RiskScorer>,
    publisher: Arc<dyn EventPublisher>,
    config: AuthorizationConfig,
}

impl AuthorizationEngine {
    /// Create a new engine.
    pub fn new(
        store: Arc<dyn EscrowStore>,
        scorer: Arc<dyn RiskScorer>,
        publisher: Arc<dyn EventPublisher>,
        config: AuthorizationConfig,
    ) -> Self {
        Self {
            store,
            scorer,
            publisher,
            config,
        }
    }

    pub fn config(&self) -> &AuthorizationConfig {
        &self.config
    }

    /// Get a request by ID.
    pub async fn get(&self, request_id: Uuid) -> Result<PaymentAuthorizationRequest> {
        self.store
            .get_authorization(request_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("authorization", request_id))
    }

    /// Get a time-lock by ID.
    pub async fn time_lock(&self, lock_id: Uuid) -> Result<TimeLock> {
        self.store
            .get_time_lock(lock_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("time_lock", lock_id))
    }

    /// Requests currently in any of `statuses`.
    pub async fn list(&self, statuses: &[AuthorizationStatus]) -> Result<Vec<PaymentAuthorizationRequest>> {
        self.store.authorizations_by_status(statuses).await
    }

    /// Transition history of a request or time-lock.
    pub async fn history(&self, id: Uuid) -> Result<EntityHistory> {
        self.store.history(id).await
    }

    /// Create, score and classify a payout request for a completed milestone.
    ///
    /// A blocked request is persisted as Rejected and returned; callers see
    /// the policy error when they try to release it.
    pub async fn request_authorization(
        &self,
        milestone_id: Uuid,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        let milestone = self
            .store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("milestone", milestone_id))?;
        if milestone.status != MilestoneStatus::Completed {
            return Err(TrancheError::validation(format!(
                "milestone {} is {}, payment requires completion",
                milestone_id, milestone.status
            )));
        }
        predecessors_completed(self.store.as_ref(), &milestone).await?;

        let escrow = self
            .store
            .escrow_for_milestone(milestone_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("escrow for milestone", milestone_id))?;

        let prior_requests = self.store.authorizations_for_milestone(milestone_id).await?.len();
        let context = RiskContext {
            contract_id: milestone.contract_id,
            milestone_id,
            escrow_id: escrow.id,
            amount: escrow.amount,
            currency: escrow.currency.clone(),
            requested_at: Utc::now(),
            prior_requests,
        };
        let score = check_score(self.scorer.score(&context).await?)?;

        let request = PaymentAuthorizationRequest::new(
            milestone_id,
            milestone.contract_id,
            escrow.id,
            escrow.amount,
            escrow.currency,
            self.config.request_ttl(),
        )?;
        let mut request = self.store.insert_authorization(request, actor).await?;
        info!(request_id = %request.id, milestone_id = %milestone_id, score, "Payment request created");

        let class = classify(score, &self.config.thresholds);
        request.risk_score = Some(score);
        request.transition(class.status())?;
        request.decision = match class {
            RiskClass::AutoApprove => Some(automatic_decision(
                DecisionOutcome::Approved,
                format!("risk score {:.3} below auto-approve threshold", score),
            )),
            RiskClass::Block => Some(automatic_decision(
                DecisionOutcome::Rejected,
                format!("risk score {:.3} at or above block threshold", score),
            )),
            RiskClass::ManualReview => None,
        };

        // The approval and its hold land in one write.
        let lock = if class == RiskClass::AutoApprove && self.lock_required(&request) {
            Some(self.hold(&mut request, self.config.time_lock.cooldown())?)
        } else {
            None
        };
        let (request, lock) = self.write_decision(request, lock, RISK_ENGINE).await?;

        match class {
            RiskClass::AutoApprove => {
                info!(request_id = %request.id, "Payment auto-approved");
                self.publish(EventKind::PaymentApproved {
                    request_id: request.id,
                    automatic: true,
                })
                .await;
                if let Some(lock) = &lock {
                    self.announce_lock(&request, lock).await;
                }
                Ok(request)
            }
            RiskClass::ManualReview => {
                info!(request_id = %request.id, "Payment requires manual review");
                Ok(request)
            }
            RiskClass::Block => {
                warn!(request_id = %request.id, score, "Payment blocked by risk policy");
                self.publish(EventKind::PaymentRejected {
                    request_id: request.id,
                    reason: request
                        .decision
                        .as_ref()
                        .and_then(|d| d.reason.clone())
                        .unwrap_or_default(),
                })
                .await;
                Ok(request)
            }
        }
    }

    /// Approve a request awaiting review.
    ///
    /// A request that already carries a decision is returned unchanged. If
    /// the lock policy applies, the request goes straight to TimeLocked.
    pub async fn approve(
        &self,
        request_id: Uuid,
        actor: &str,
        reason: Option<String>,
    ) -> Result<PaymentAuthorizationRequest> {
        let (request, _) = self
            .decide(request_id, actor, DecisionOutcome::Approved, reason)
            .await?;
        Ok(request)
    }

    /// Reject a request. The reason must meet the configured minimum length.
    pub async fn reject(
        &self,
        request_id: Uuid,
        actor: &str,
        reason: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        let reason = reason.trim();
        if reason.chars().count() < self.config.min_rejection_reason_len {
            return Err(TrancheError::validation(format!(
                "rejection reason must be at least {} characters",
                self.config.min_rejection_reason_len
            )));
        }
        let (request, _) = self
            .decide(request_id, actor, DecisionOutcome::Rejected, Some(reason.to_string()))
            .await?;
        Ok(request)
    }

    /// Approve each request independently.
    pub async fn bulk_approve(&self, request_ids: &[Uuid], actor: &str) -> BulkApprovalReport {
        let mut report = BulkApprovalReport::default();

        for &request_id in request_ids {
            let item = match self.approve(request_id, actor, None).await {
                Ok(request) if approved(&request) => BulkApprovalItem {
                    request_id,
                    success: true,
                    status: Some(request.status),
                    error: None,
                },
                Ok(request) => BulkApprovalItem {
                    request_id,
                    success: false,
                    status: Some(request.status),
                    error: Some("request was already rejected".to_string()),
                },
                Err(e) => {
                    debug!(request_id = %request_id, error = %e, "Bulk approval item failed");
                    BulkApprovalItem {
                        request_id,
                        success: false,
                        status: None,
                        error: Some(e.to_string()),
                    }
                }
            };

            if item.success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
            report.results.push(item);
        }

        info!(succeeded = report.succeeded, failed = report.failed, "Bulk approval finished");
        report
    }

    /// Hold an approved request behind an explicit cooldown.
    pub async fn create_time_lock(
        &self,
        request_id: Uuid,
        cooldown: Duration,
        actor: &str,
    ) -> Result<(PaymentAuthorizationRequest, TimeLock)> {
        if cooldown <= Duration::zero() {
            return Err(TrancheError::validation("time-lock cooldown must be positive"));
        }
        if cooldown.num_seconds() > MAX_WINDOW_SECS as i64 {
            return Err(TrancheError::validation(format!(
                "time-lock cooldown of {}s exceeds the {}s maximum",
                cooldown.num_seconds(),
                MAX_WINDOW_SECS
            )));
        }
        let request = self.get(request_id).await?;
        if request.execution_id.is_some() || self.store.execution_for_request(request_id).await?.is_some() {
            return Err(TrancheError::NotReleasable {
                request_id,
                reason: "payment was already handed to execution".to_string(),
            });
        }
        self.lock_request(request, cooldown, actor).await
    }

    /// Audited override releasing a lock before its release time.
    pub async fn release_early(&self, lock_id: Uuid, actor: &str, reason: &str) -> Result<TimeLock> {
        if reason.trim().is_empty() {
            return Err(TrancheError::validation("early release requires a reason"));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut lock = self.time_lock(lock_id).await?;
            if lock.released {
                return Ok(lock);
            }
            if lock.cancelled_at.is_some() {
                return Err(TrancheError::InvalidTransition {
                    entity: "time_lock",
                    id: lock_id,
                    from: "cancelled".to_string(),
                    to: "released".to_string(),
                });
            }

            lock.released = true;
            lock.released_at = Some(Utc::now());
            lock.early_release_by = Some(actor.to_string());
            lock.early_release_reason = Some(reason.trim().to_string());

            match self.store.update_time_lock(lock, actor).await {
                Ok(lock) => {
                    warn!(
                        time_lock_id = %lock.id,
                        request_id = %lock.request_id,
                        actor,
                        reason = reason.trim(),
                        "Time-lock released early"
                    );
                    self.publish(EventKind::TimeLockReleased {
                        request_id: lock.request_id,
                        time_lock_id: lock.id,
                        early: true,
                    })
                    .await;
                    return Ok(lock);
                }
                Err(TrancheError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(TrancheError::Conflict {
            entity: "time_lock",
            id: lock_id,
        })
    }

    /// Release a due lock. Returns `None` if another writer got there first.
    pub async fn release_time_lock(&self, lock: TimeLock, actor: &str) -> Result<Option<TimeLock>> {
        if !lock.is_active() {
            return Ok(None);
        }

        let mut lock = lock;
        lock.released = true;
        lock.released_at = Some(Utc::now());

        match self.store.update_time_lock(lock, actor).await {
            Ok(lock) => {
                info!(time_lock_id = %lock.id, request_id = %lock.request_id, "Time-lock released");
                self.publish(EventKind::TimeLockReleased {
                    request_id: lock.request_id,
                    time_lock_id: lock.id,
                    early: false,
                })
                .await;
                Ok(Some(lock))
            }
            Err(TrancheError::Conflict { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Cancel an active lock. The held request can no longer release and
    /// expires at its deadline.
    pub async fn cancel_time_lock(&self, lock_id: Uuid, actor: &str) -> Result<TimeLock> {
        let mut lock = self.time_lock(lock_id).await?;
        if lock.cancelled_at.is_some() {
            return Ok(lock);
        }
        if lock.released {
            return Err(TrancheError::InvalidTransition {
                entity: "time_lock",
                id: lock_id,
                from: "released".to_string(),
                to: "cancelled".to_string(),
            });
        }

        lock.cancelled_at = Some(Utc::now());
        lock.cancelled_by = Some(actor.to_string());
        let lock = self.store.update_time_lock(lock, actor).await?;
        info!(time_lock_id = %lock.id, request_id = %lock.request_id, actor, "Time-lock cancelled");
        Ok(lock)
    }

    /// Active locks due for release.
    pub async fn due_time_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeLock>> {
        self.store.due_time_locks(now, limit).await
    }

    /// Time-locked requests whose lock was released before `released_before`
    /// but which never reached execution.
    pub async fn released_without_execution(
        &self,
        released_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Uuid>> {
        let held = self
            .store
            .authorizations_by_status(&[AuthorizationStatus::TimeLocked])
            .await?;

        let mut stranded = Vec::new();
        for request in held.into_iter().filter(|r| r.execution_id.is_none()) {
            if stranded.len() >= limit {
                break;
            }
            let lock = match request.time_lock_id {
                Some(id) => self.store.get_time_lock(id).await?,
                None => None,
            };
            let released = lock.map_or(false, |l| {
                l.released && l.released_at.map_or(true, |at| at < released_before)
            });
            if released && self.store.execution_for_request(request.id).await?.is_none() {
                stranded.push(request.id);
            }
        }
        Ok(stranded)
    }

    /// Expire unresolved requests past their deadline.
    ///
    /// Time-locked requests only expire when their lock can no longer release.
    pub async fn expire_overdue(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Uuid>> {
        let candidates = self
            .store
            .authorizations_by_status(&[
                AuthorizationStatus::Pending,
                AuthorizationStatus::ManualReviewRequired,
                AuthorizationStatus::TimeLocked,
            ])
            .await?;

        let mut expired = Vec::new();
        for request in candidates.into_iter().filter(|r| r.is_expired(now)) {
            if expired.len() >= limit {
                break;
            }
            if request.status == AuthorizationStatus::TimeLocked && !self.lock_is_dead(&request).await? {
                continue;
            }

            let request_id = request.id;
            match self.expire(request, "expiry-sweep").await {
                Ok(_) => expired.push(request_id),
                Err(TrancheError::Conflict { .. }) => {}
                Err(e) => error!(request_id = %request_id, error = %e, "Failed to expire request"),
            }
        }
        Ok(expired)
    }

    async fn lock_is_dead(&self, request: &PaymentAuthorizationRequest) -> Result<bool> {
        let lock = match request.time_lock_id {
            Some(id) => self.store.get_time_lock(id).await?,
            None => None,
        };
        Ok(lock.map_or(true, |l| l.cancelled_at.is_some()))
    }

    async fn expire(
        &self,
        mut request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        request.transition(AuthorizationStatus::Expired)?;
        let request = self.store.update_authorization(request, actor).await?;
        info!(request_id = %request.id, "Payment request expired");
        self.publish(EventKind::RequestExpired {
            request_id: request.id,
        })
        .await;
        Ok(request)
    }

    /// Record a manual decision. The flag is true if this call made it.
    async fn decide(
        &self,
        request_id: Uuid,
        actor: &str,
        outcome: DecisionOutcome,
        reason: Option<String>,
    ) -> Result<(PaymentAuthorizationRequest, bool)> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut request = self.get(request_id).await?;
            if request.decision.is_some() {
                debug!(request_id = %request_id, "Request already decided");
                return Ok((request, false));
            }
            if request.status == AuthorizationStatus::Expired {
                return Err(TrancheError::RequestExpired { request_id });
            }

            let now = Utc::now();
            if request.is_expired(now) {
                match self.expire(request, actor).await {
                    Ok(_) => return Err(TrancheError::RequestExpired { request_id }),
                    Err(TrancheError::Conflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }

            let to = match outcome {
                DecisionOutcome::Approved => AuthorizationStatus::Approved,
                DecisionOutcome::Rejected => AuthorizationStatus::Rejected,
            };
            request.transition(to)?;
            request.decision = Some(Decision {
                outcome,
                decided_by: actor.to_string(),
                reason: reason.clone(),
                decided_at: now,
                automatic: false,
            });
            let lock = if outcome == DecisionOutcome::Approved && self.lock_required(&request) {
                Some(self.hold(&mut request, self.config.time_lock.cooldown())?)
            } else {
                None
            };

            match self.write_decision(request, lock, actor).await {
                Ok((request, lock)) => {
                    info!(request_id = %request_id, actor, status = %request.status, "Payment request decided");
                    let kind = match outcome {
                        DecisionOutcome::Approved => EventKind::PaymentApproved {
                            request_id,
                            automatic: false,
                        },
                        DecisionOutcome::Rejected => EventKind::PaymentRejected {
                            request_id,
                            reason: reason.clone().unwrap_or_default(),
                        },
                    };
                    self.publish(kind).await;
                    if let Some(lock) = &lock {
                        self.announce_lock(&request, lock).await;
                    }
                    return Ok((request, true));
                }
                Err(TrancheError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(TrancheError::Conflict {
            entity: "authorization",
            id: request_id,
        })
    }

    fn lock_required(&self, request: &PaymentAuthorizationRequest) -> bool {
        let score = request.risk_score.unwrap_or(0.0);
        self.config.time_lock.requires_lock(request.amount, score)
    }

    async fn lock_request(
        &self,
        mut request: PaymentAuthorizationRequest,
        cooldown: Duration,
        actor: &str,
    ) -> Result<(PaymentAuthorizationRequest, TimeLock)> {
        let lock = self.hold(&mut request, cooldown)?;
        let (request, lock) = self.store.lock_authorization(request, lock, actor).await?;
        self.announce_lock(&request, &lock).await;
        Ok((request, lock))
    }

    /// Move the unsaved `request` to TimeLocked behind a new, unsaved lock.
    fn hold(&self, request: &mut PaymentAuthorizationRequest, cooldown: Duration) -> Result<TimeLock> {
        request.transition(AuthorizationStatus::TimeLocked)?;
        let lock = TimeLock::new(request.id, cooldown);
        request.time_lock_id = Some(lock.id);
        // A held request must not expire before its lock can release.
        let deadline = lock.release_at + self.config.request_ttl();
        if request.expires_at < deadline {
            request.expires_at = deadline;
        }
        Ok(lock)
    }

    /// Persist a decided request, together with its lock when it has one.
    async fn write_decision(
        &self,
        request: PaymentAuthorizationRequest,
        lock: Option<TimeLock>,
        actor: &str,
    ) -> Result<(PaymentAuthorizationRequest, Option<TimeLock>)> {
        match lock {
            Some(lock) => {
                let (request, lock) = self.store.lock_authorization(request, lock, actor).await?;
                Ok((request, Some(lock)))
            }
            None => Ok((self.store.update_authorization(request, actor).await?, None)),
        }
    }

    async fn announce_lock(&self, request: &PaymentAuthorizationRequest, lock: &TimeLock) {
        info!(request_id = %request.id, time_lock_id = %lock.id, release_at = %lock.release_at, "Payment time-locked");
        self.publish(EventKind::PaymentTimeLocked {
            request_id: request.id,
            time_lock_id: lock.id,
            release_at: lock.release_at,
        })
        .await;
    }

    async fn publish(&self, kind: EventKind) {
        self.publisher.publish(EscrowEvent::new(kind)).await;
    }
}

fn automatic_decision(outcome: DecisionOutcome, reason: String) -> Decision {
    Decision {
        outcome,
        decided_by: RISK_ENGINE.to_string(),
        reason: Some(reason),
        decided_at: Utc::now(),
        automatic: true,
    }
}

fn approved(request: &PaymentAuthorizationRequest) -> bool {
    request
        .decision
        .as_ref()
        .map_or(false, |d| d.outcome == DecisionOutcome::Approved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RiskThresholds, TimeLockPolicy};
    use crate::fixtures;
    use crate::risk::StaticRiskScorer;
    use tranche_core::EventType;
    use tranche_state::{BroadcastPublisher, EventFilter, InMemoryEscrowStore};

    struct Harness {
        store: Arc<InMemoryEscrowStore>,
        publisher: Arc<BroadcastPublisher>,
        engine: AuthorizationEngine,
    }

    fn harness(score: f64, time_lock: TimeLockPolicy) -> Harness {
        let store = Arc::new(InMemoryEscrowStore::new());
        let publisher = Arc::new(BroadcastPublisher::new());
        let config = AuthorizationConfig {
            thresholds: RiskThresholds::new(0.3, 0.8).unwrap(),
            time_lock,
            ..Default::default()
        };
        let engine = AuthorizationEngine::new(
            store.clone(),
            Arc::new(StaticRiskScorer(score)),
            publisher.clone(),
            config,
        );
        Harness {
            store,
            publisher,
            engine,
        }
    }

    fn no_lock() -> TimeLockPolicy {
        TimeLockPolicy {
            amount_threshold: None,
            risk_threshold: None,
            cooldown_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_auto_approve() {
        let h = harness(0.1, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;

        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        assert_eq!(request.status, AuthorizationStatus::AutoApproved);
        assert!(request.decision.as_ref().unwrap().automatic);
        assert!(request.check_releasable(None).is_ok());

        let events = h
            .publisher
            .recent(&EventFilter::types(vec![EventType::PaymentApproved]), 10)
            .await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn test_block_rejects() {
        let h = harness(0.9, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;

        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        assert_eq!(request.status, AuthorizationStatus::Rejected);
        assert!(matches!(
            request.check_releasable(None),
            Err(TrancheError::RiskBlocked { .. })
        ));
    }

    #[tokio::test]
    async fn test_incomplete_milestone_refused() {
        let h = harness(0.1, no_lock());
        let milestone = fixtures::pending_milestone(h.store.as_ref()).await;
        let err = h.engine.request_authorization(milestone.id, "test").await.unwrap_err();
        assert!(matches!(err, TrancheError::Validation { .. }));
        assert!(h
            .store
            .authorizations_for_milestone(milestone.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_manual_approval_is_idempotent() {
        let h = harness(0.5, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        assert_eq!(request.status, AuthorizationStatus::ManualReviewRequired);

        let first = h.engine.approve(request.id, "alice", None).await.unwrap();
        assert_eq!(first.status, AuthorizationStatus::Approved);
        let decided_at = first.decision.as_ref().unwrap().decided_at;

        let again = h.engine.approve(request.id, "bob", None).await.unwrap();
        let decision = again.decision.unwrap();
        assert_eq!(decision.decided_at, decided_at);
        assert_eq!(decision.decided_by, "alice");

        // Rejecting after approval returns the approval too.
        let rejected = h
            .engine
            .reject(request.id, "carol", "changed my mind entirely")
            .await
            .unwrap();
        assert_eq!(rejected.status, AuthorizationStatus::Approved);
    }

    #[tokio::test]
    async fn test_rejection_requires_reason() {
        let h = harness(0.5, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();

        assert!(h.engine.reject(request.id, "alice", "  no ").await.is_err());
        let rejected = h
            .engine
            .reject(request.id, "alice", "deliverable failed inspection")
            .await
            .unwrap();
        assert_eq!(rejected.status, AuthorizationStatus::Rejected);

        let again = h.engine.approve(request.id, "bob", None).await.unwrap();
        assert_eq!(again.status, AuthorizationStatus::Rejected);
        assert_eq!(again.decision.unwrap().decided_by, "alice");
    }

    #[tokio::test]
    async fn test_concurrent_approvals_decide_once() {
        let h = harness(0.5, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        let engine = Arc::new(h.engine);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.approve(request.id, &format!("reviewer-{}", i), None).await })
            })
            .collect();

        let mut deciders = std::collections::HashSet::new();
        for handle in handles {
            let request = handle.await.unwrap().unwrap();
            deciders.insert(request.decision.unwrap().decided_by);
        }
        assert_eq!(deciders.len(), 1);

        let history = h.store.history(request.id).await.unwrap();
        let approvals = history.records.iter().filter(|r| r.to == "approved").count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn test_expired_request_cannot_be_approved() {
        let h = harness(0.5, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();

        let mut stale = request.clone();
        stale.expires_at = Utc::now() - Duration::seconds(1);
        h.store.update_authorization(stale, "test").await.unwrap();

        let err = h.engine.approve(request.id, "alice", None).await.unwrap_err();
        assert!(matches!(err, TrancheError::RequestExpired { .. }));
        assert_eq!(
            h.engine.get(request.id).await.unwrap().status,
            AuthorizationStatus::Expired
        );
    }

    #[tokio::test]
    async fn test_bulk_approve_is_per_item() {
        let h = harness(0.5, no_lock());
        let (m1, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let (m2, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let r1 = h.engine.request_authorization(m1.id, "test").await.unwrap();
        let r2 = h.engine.request_authorization(m2.id, "test").await.unwrap();

        let mut stale = r1.clone();
        stale.expires_at = Utc::now() - Duration::seconds(1);
        h.store.update_authorization(stale, "test").await.unwrap();

        let missing = Uuid::new_v4();
        let report = h.engine.bulk_approve(&[r1.id, missing, r2.id], "alice").await;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 2);
        assert!(report.results[2].success);
        assert_eq!(report.results[2].status, Some(AuthorizationStatus::Approved));
    }

    #[tokio::test]
    async fn test_large_amount_is_time_locked() {
        let policy = TimeLockPolicy {
            amount_threshold: Some(500),
            risk_threshold: None,
            cooldown_secs: 3_600,
        };
        let h = harness(0.1, policy);
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;

        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        assert_eq!(request.status, AuthorizationStatus::TimeLocked);
        let lock = h.engine.time_lock(request.time_lock_id.unwrap()).await.unwrap();
        assert!(request.check_releasable(Some(&lock)).is_err());
        assert!(request.expires_at > lock.release_at);

        assert!(h.engine.release_early(lock.id, "cfo", " ").await.is_err());
        let released = h
            .engine
            .release_early(lock.id, "cfo", "vendor payroll deadline")
            .await
            .unwrap();
        assert_eq!(released.early_release_by.as_deref(), Some("cfo"));
        assert!(request.check_releasable(Some(&released)).is_ok());

        // Already released; cancel is refused.
        assert!(h.engine.cancel_time_lock(lock.id, "ops").await.is_err());
    }

    #[tokio::test]
    async fn test_locked_approval_is_never_stored_unheld() {
        let policy = TimeLockPolicy {
            amount_threshold: Some(500),
            risk_threshold: None,
            cooldown_secs: 3_600,
        };
        let h = harness(0.5, policy);
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        assert_eq!(request.status, AuthorizationStatus::ManualReviewRequired);

        let engine = Arc::new(h.engine);
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.approve(request.id, &format!("reviewer-{}", i), None).await })
            })
            .collect();
        for handle in handles {
            let decided = handle.await.unwrap().unwrap();
            assert_eq!(decided.status, AuthorizationStatus::TimeLocked);
        }

        let history = h.store.history(request.id).await.unwrap();
        let approved = AuthorizationStatus::Approved.to_string();
        assert!(history.records.iter().all(|r| r.to != approved));
        assert_eq!(history.current(), Some(AuthorizationStatus::TimeLocked.to_string().as_str()));

        let far_future = Utc::now() + Duration::days(30);
        let locks = h.store.due_time_locks(far_future, 100).await.unwrap();
        assert_eq!(locks.iter().filter(|l| l.request_id == request.id).count(), 1);

        let stored = engine.get(request.id).await.unwrap();
        assert_eq!(stored.time_lock_id, Some(locks[0].id));
        assert!(stored.check_releasable(Some(&locks[0])).is_err());
    }

    #[tokio::test]
    async fn test_auto_approval_lands_locked() {
        let policy = TimeLockPolicy {
            amount_threshold: Some(500),
            risk_threshold: None,
            cooldown_secs: 3_600,
        };
        let h = harness(0.1, policy);
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();

        let history = h.store.history(request.id).await.unwrap();
        let auto = AuthorizationStatus::AutoApproved.to_string();
        assert!(history.records.iter().all(|r| r.to != auto));

        let events = h
            .publisher
            .recent(
                &EventFilter::types(vec![EventType::PaymentApproved, EventType::PaymentTimeLocked]),
                10,
            )
            .await;
        assert_eq!(events.len(), 2);
    }

    #[tokio::test]
    async fn test_cooldown_is_bounded() {
        let h = harness(0.1, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();

        let too_long = Duration::seconds(MAX_WINDOW_SECS as i64 + 1);
        let err = h.engine.create_time_lock(request.id, too_long, "ops").await.unwrap_err();
        assert!(matches!(err, TrancheError::Validation { .. }));
        assert_eq!(
            h.engine.get(request.id).await.unwrap().status,
            AuthorizationStatus::AutoApproved
        );
    }

    #[tokio::test]
    async fn test_cancelled_lock_lets_request_expire() {
        let h = harness(0.1, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();

        let (locked, lock) = h
            .engine
            .create_time_lock(request.id, Duration::hours(1), "ops")
            .await
            .unwrap();
        assert_eq!(locked.status, AuthorizationStatus::TimeLocked);

        let far_future = Utc::now() + Duration::days(365);
        assert!(h.engine.expire_overdue(far_future, 10).await.unwrap().is_empty());

        h.engine.cancel_time_lock(lock.id, "ops").await.unwrap();
        let expired = h.engine.expire_overdue(far_future, 10).await.unwrap();
        assert_eq!(expired, vec![request.id]);
    }

    #[tokio::test]
    async fn test_sweep_release_happens_once() {
        let h = harness(0.1, no_lock());
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        let (_, lock) = h
            .engine
            .create_time_lock(request.id, Duration::seconds(1), "ops")
            .await
            .unwrap();

        let first = h.engine.release_time_lock(lock.clone(), "sweep-a").await.unwrap();
        let second = h.engine.release_time_lock(lock, "sweep-b").await.unwrap();
        assert!(first.is_some());
        assert!(second.is_none());
    }
}
