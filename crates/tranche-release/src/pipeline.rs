//! Release pipeline.
//!
//! Wires the graph resolver, the authorization engine and the payment
//! coordinator into the milestone -> authorization -> execution flow, and
//! owns the monitoring sweeps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use tranche_core::{
    EscrowEvent, EscrowInstrument, EventKind, Milestone, MilestoneStatus,
    PaymentAuthorizationRequest, PaymentExecution, Result, TimeLock, TrancheError,
};
use tranche_graph::{reoptimize, DependencyGraph, Forecast, GraphAnalysis};
use tranche_state::{EscrowStore, EventPublisher};
use uuid::Uuid;

use crate::authorization::{predecessors_completed, AuthorizationEngine, BulkApprovalReport};
use crate::breaker::CircuitBreaker;
use crate::config::ReleaseConfig;
use crate::executor::PaymentCoordinator;
use crate::ledger::LedgerClient;
use crate::risk::RiskScorer;
use crate::sweep::{spawn_sweeps, ConfirmationSweep, Sweep, SweepHandle, TimeLockSweep};

const MAX_CAS_ATTEMPTS: usize = 3;

/// A persisted contract and its validated schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractRegistration {
    pub contract_id: Uuid,
    pub milestones: Vec<Milestone>,
    pub analysis: GraphAnalysis,
}

/// Where a payout stands after an authorization step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutOutcome {
    pub request: PaymentAuthorizationRequest,
    /// Set once the request was handed to execution.
    pub execution: Option<PaymentExecution>,
}

/// Result of completing a milestone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub milestone: Milestone,
    /// Absent when the milestone has no escrow.
    pub payout: Option<PayoutOutcome>,
}

/// The release pipeline.
pub struct ReleasePipeline {
    store: Arc<dyn EscrowStore>,
    publisher: Arc<dyn EventPublisher>,
    engine: Arc<AuthorizationEngine>,
    coordinator: Arc<PaymentCoordinator>,
    config: ReleaseConfig,
}

impl ReleasePipeline {
    /// Build the pipeline. Fails on invalid configuration.
    pub fn new(
        store: Arc<dyn EscrowStore>,
        scorer: Arc<dyn RiskScorer>,
        ledger: Arc<dyn LedgerClient>,
        publisher: Arc<dyn EventPublisher>,
        config: ReleaseConfig,
    ) -> Result<Self> {
        config.validate()?;

        let engine = Arc::new(AuthorizationEngine::new(
            store.clone(),
            scorer,
            publisher.clone(),
            config.authorization.clone(),
        ));
        let breaker = Arc::new(CircuitBreaker::new("ledger", config.breaker.clone()));
        let coordinator = Arc::new(PaymentCoordinator::new(
            store.clone(),
            ledger,
            publisher.clone(),
            breaker,
            config.execution.clone(),
        ));

        Ok(Self {
            store,
            publisher,
            engine,
            coordinator,
            config,
        })
    }

    pub fn store(&self) -> &Arc<dyn EscrowStore> {
        &self.store
    }

    pub fn engine(&self) -> &Arc<AuthorizationEngine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<PaymentCoordinator> {
        &self.coordinator
    }

    pub fn config(&self) -> &ReleaseConfig {
        &self.config
    }

    /// Start the time-lock and confirmation sweeps.
    pub fn spawn_sweeps(&self) -> SweepHandle {
        let batch = self.config.sweep.batch_size;
        let sweeps: Vec<(Arc<dyn Sweep>, std::time::Duration)> = vec![
            (
                Arc::new(TimeLockSweep::new(self.engine.clone(), self.coordinator.clone(), batch)),
                self.config.sweep.time_lock_interval(),
            ),
            (
                Arc::new(ConfirmationSweep::new(self.store.clone(), self.coordinator.clone(), batch)),
                self.config.sweep.confirmation_interval(),
            ),
        ];
        spawn_sweeps(sweeps)
    }

    // ---- contracts ----

    /// Validate a milestone set without persisting it.
    pub fn validate_contract(&self, contract_id: Uuid, milestones: &[Milestone]) -> Result<GraphAnalysis> {
        DependencyGraph::build(contract_id, milestones, &self.config.graph)?.analyze()
    }

    /// Validate and persist the milestones of a new contract.
    ///
    /// Nothing is stored unless the whole graph is valid. The store refuses
    /// a second registration of the same contract atomically.
    pub async fn register_contract(
        &self,
        contract_id: Uuid,
        milestones: Vec<Milestone>,
        actor: &str,
    ) -> Result<ContractRegistration> {
        if milestones.is_empty() {
            return Err(TrancheError::validation("contract has no milestones"));
        }
        if !self.store.contract_milestones(contract_id).await?.is_empty() {
            return Err(TrancheError::validation(format!(
                "contract {} is already registered",
                contract_id
            )));
        }
        if let Some(m) = milestones.iter().find(|m| m.status != MilestoneStatus::Pending) {
            return Err(TrancheError::validation(format!(
                "milestone {} must be registered as pending, not {}",
                m.id, m.status
            )));
        }

        let analysis = self.validate_contract(contract_id, &milestones)?;
        let milestones = self.store.insert_milestones(milestones, actor).await?;
        info!(
            contract_id = %contract_id,
            milestones = milestones.len(),
            critical = analysis.schedule.critical_path.len(),
            "Contract registered"
        );

        Ok(ContractRegistration {
            contract_id,
            milestones,
            analysis,
        })
    }

    async fn contract_graph(&self, contract_id: Uuid) -> Result<DependencyGraph> {
        let milestones = self.store.contract_milestones(contract_id).await?;
        if milestones.is_empty() {
            return Err(TrancheError::not_found("contract", contract_id));
        }
        DependencyGraph::build(contract_id, &milestones, &self.config.graph)
    }

    /// Order and CPM schedule of a stored contract.
    pub async fn contract_analysis(&self, contract_id: Uuid) -> Result<GraphAnalysis> {
        self.contract_graph(contract_id).await?.analyze()
    }

    /// Forward-looking forecast of a stored contract as of `now`.
    pub async fn reoptimize(&self, contract_id: Uuid, now: DateTime<Utc>) -> Result<Forecast> {
        let graph = self.contract_graph(contract_id).await?;
        let order = graph.topological_order()?;
        let forecast = reoptimize(&graph, &order, now);
        debug!(contract_id = %contract_id, slipping = forecast.slipping().len(), "Schedule re-optimized");
        Ok(forecast)
    }

    // ---- milestones ----

    pub async fn milestone(&self, milestone_id: Uuid) -> Result<Milestone> {
        self.store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("milestone", milestone_id))
    }

    /// Record progress on a milestone.
    ///
    /// Progress never decreases. The first progress on a pending milestone
    /// starts it, which requires its predecessors to be completed.
    pub async fn record_progress(&self, milestone_id: Uuid, percent: u8, actor: &str) -> Result<Milestone> {
        if percent > 100 {
            return Err(TrancheError::validation(format!(
                "progress must be between 0 and 100, got {}",
                percent
            )));
        }

        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut milestone = self.milestone(milestone_id).await?;
            if milestone.status.is_terminal() {
                return Err(TrancheError::validation(format!(
                    "milestone {} is {} and takes no further progress",
                    milestone_id, milestone.status
                )));
            }
            if percent < milestone.progress {
                return Err(TrancheError::validation(format!(
                    "progress cannot go back from {} to {}",
                    milestone.progress, percent
                )));
            }
            if percent == milestone.progress {
                return Ok(milestone);
            }

            if milestone.status == MilestoneStatus::Pending {
                predecessors_completed(self.store.as_ref(), &milestone).await?;
                milestone.transition(MilestoneStatus::InProgress)?;
            }
            milestone.progress = percent;

            match self.store.update_milestone(milestone, actor).await {
                Ok(milestone) => {
                    debug!(milestone_id = %milestone_id, percent, "Progress recorded");
                    return Ok(milestone);
                }
                Err(TrancheError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(TrancheError::Conflict {
            entity: "milestone",
            id: milestone_id,
        })
    }

    /// Complete a milestone and start its payout.
    ///
    /// Completing an already completed milestone returns its current payout,
    /// requesting authorization if an earlier attempt did not get that far.
    pub async fn complete_milestone(&self, milestone_id: Uuid, actor: &str) -> Result<CompletionOutcome> {
        let milestone = self.mark_completed(milestone_id, actor).await?;

        let escrow = match self.store.escrow_for_milestone(milestone_id).await? {
            Some(escrow) => escrow,
            None => {
                debug!(milestone_id = %milestone_id, "Completed milestone has no escrow");
                return Ok(CompletionOutcome {
                    milestone,
                    payout: None,
                });
            }
        };

        let request = match self.latest_request(milestone_id, escrow.id).await? {
            Some(request) => request,
            None => match self.engine.request_authorization(milestone_id, actor).await {
                Ok(request) => request,
                // A concurrent completion opened the request first.
                Err(e) => match self.latest_request(milestone_id, escrow.id).await? {
                    Some(request) if !request.status.is_terminal() => {
                        debug!(milestone_id = %milestone_id, request_id = %request.id, "Joined concurrent payout request");
                        request
                    }
                    _ => return Err(e),
                },
            },
        };

        let payout = self.hand_off(request).await?;
        Ok(CompletionOutcome {
            milestone,
            payout: Some(payout),
        })
    }

    async fn latest_request(
        &self,
        milestone_id: Uuid,
        escrow_id: Uuid,
    ) -> Result<Option<PaymentAuthorizationRequest>> {
        Ok(self
            .store
            .authorizations_for_milestone(milestone_id)
            .await?
            .into_iter()
            .filter(|r| r.escrow_id == escrow_id)
            .max_by_key(|r| r.created_at))
    }

    async fn mark_completed(&self, milestone_id: Uuid, actor: &str) -> Result<Milestone> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut milestone = self.milestone(milestone_id).await?;
            if milestone.status == MilestoneStatus::Completed {
                return Ok(milestone);
            }

            predecessors_completed(self.store.as_ref(), &milestone).await?;
            milestone.transition(MilestoneStatus::Completed)?;

            match self.store.update_milestone(milestone, actor).await {
                Ok(milestone) => {
                    info!(milestone_id = %milestone_id, contract_id = %milestone.contract_id, actor, "Milestone completed");
                    self.publisher
                        .publish(EscrowEvent::new(EventKind::MilestoneCompleted {
                            contract_id: milestone.contract_id,
                            milestone_id,
                        }))
                        .await;
                    return Ok(milestone);
                }
                Err(TrancheError::Conflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(TrancheError::Conflict {
            entity: "milestone",
            id: milestone_id,
        })
    }

    /// Cancel an unfinished milestone.
    pub async fn cancel_milestone(&self, milestone_id: Uuid, actor: &str) -> Result<Milestone> {
        let mut milestone = self.milestone(milestone_id).await?;
        milestone.transition(MilestoneStatus::Cancelled)?;
        let milestone = self.store.update_milestone(milestone, actor).await?;
        warn!(milestone_id = %milestone_id, actor, "Milestone cancelled");
        Ok(milestone)
    }

    /// Flag open milestones that are past their due date.
    pub async fn mark_overdue(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let open = self.store.open_milestones().await?;

        let mut flagged = Vec::new();
        for mut milestone in open.into_iter().filter(|m| m.is_past_due(now)) {
            let milestone_id = milestone.id;
            if let Err(e) = milestone.transition(MilestoneStatus::Overdue) {
                debug!(milestone_id = %milestone_id, error = %e, "Skipping overdue flag");
                continue;
            }
            match self.store.update_milestone(milestone, "overdue-check").await {
                Ok(_) => {
                    warn!(milestone_id = %milestone_id, "Milestone overdue");
                    flagged.push(milestone_id);
                }
                Err(TrancheError::Conflict { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(flagged)
    }

    // ---- escrows & payouts ----

    /// Fund a milestone with an escrow. The fulfillment is sealed in the store.
    pub async fn create_escrow(&self, milestone_id: Uuid, amount: u64, currency: &str) -> Result<EscrowInstrument> {
        let milestone = self.milestone(milestone_id).await?;
        if milestone.status == MilestoneStatus::Cancelled {
            return Err(TrancheError::validation(format!(
                "milestone {} is cancelled",
                milestone_id
            )));
        }

        let (escrow, fulfillment) =
            EscrowInstrument::create(milestone.contract_id, milestone_id, amount, currency)?;
        let escrow = self.store.insert_escrow(escrow, fulfillment).await?;
        info!(escrow_id = %escrow.id, milestone_id = %milestone_id, amount, currency, "Escrow created");
        Ok(escrow)
    }

    pub async fn escrow(&self, escrow_id: Uuid) -> Result<EscrowInstrument> {
        self.store
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("escrow", escrow_id))
    }

    /// Request authorization for a completed milestone and hand it off if released.
    pub async fn request_authorization(&self, milestone_id: Uuid, actor: &str) -> Result<PayoutOutcome> {
        let request = self.engine.request_authorization(milestone_id, actor).await?;
        self.hand_off(request).await
    }

    /// Approve a request and hand it off if nothing holds it.
    pub async fn approve(&self, request_id: Uuid, actor: &str, reason: Option<String>) -> Result<PayoutOutcome> {
        let request = self.engine.approve(request_id, actor, reason).await?;
        self.hand_off(request).await
    }

    /// Approve each request and hand off the released ones.
    pub async fn bulk_approve(&self, request_ids: &[Uuid], actor: &str) -> BulkApprovalReport {
        let report = self.engine.bulk_approve(request_ids, actor).await;

        for item in report.results.iter().filter(|i| i.success) {
            let request = match self.engine.get(item.request_id).await {
                Ok(request) => request,
                Err(e) => {
                    error!(request_id = %item.request_id, error = %e, "Approved request vanished");
                    continue;
                }
            };
            if let Err(e) = self.hand_off(request).await {
                error!(request_id = %item.request_id, error = %e, "Hand-off after bulk approval failed");
            }
        }
        report
    }

    /// Audited early release of a time-lock, followed by hand-off.
    pub async fn release_early(&self, lock_id: Uuid, actor: &str, reason: &str) -> Result<(TimeLock, PayoutOutcome)> {
        let lock = self.engine.release_early(lock_id, actor, reason).await?;
        let request = self.engine.get(lock.request_id).await?;
        let payout = self.hand_off(request).await?;
        Ok((lock, payout))
    }

    /// Execute `request` if it may release now.
    async fn hand_off(&self, request: PaymentAuthorizationRequest) -> Result<PayoutOutcome> {
        let lock = match request.time_lock_id {
            Some(lock_id) => self.store.get_time_lock(lock_id).await?,
            None => None,
        };
        if request.check_releasable(lock.as_ref()).is_err() {
            let execution = self.coordinator.for_request(request.id).await?;
            return Ok(PayoutOutcome { request, execution });
        }

        let execution = self.coordinator.execute(request.id).await?;
        let request = self.engine.get(request.id).await?;
        Ok(PayoutOutcome {
            request,
            execution: Some(execution),
        })
    }
}
