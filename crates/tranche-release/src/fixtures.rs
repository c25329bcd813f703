//! Shared test setup.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tranche_core::{
    AuthorizationStatus, Decision, DecisionOutcome, EscrowInstrument, ExecutionStatus, Fulfillment,
    Milestone, MilestoneStatus, PaymentAuthorizationRequest, PaymentExecution, Result, TimeLock,
    TrancheError,
};
use tranche_state::{EntityHistory, EscrowStore, InMemoryEscrowStore};
use uuid::Uuid;

fn milestone() -> Milestone {
    Milestone::builder()
        .contract(Uuid::new_v4())
        .name("deliverable")
        .due_in(Duration::days(7))
        .build()
        .unwrap()
}

/// A stored pending milestone with no escrow.
pub async fn pending_milestone(store: &dyn EscrowStore) -> Milestone {
    store.insert_milestones(vec![milestone()], "test").await.unwrap().remove(0)
}

/// A stored completed milestone with a funded escrow.
pub async fn completed_with_escrow(store: &dyn EscrowStore, amount: u64) -> (Milestone, EscrowInstrument) {
    let mut m = milestone();
    m.transition(MilestoneStatus::Completed).unwrap();
    let m = store.insert_milestones(vec![m], "test").await.unwrap().remove(0);

    let (escrow, fulfillment) = EscrowInstrument::create(m.contract_id, m.id, amount, "USD").unwrap();
    let escrow = store.insert_escrow(escrow, fulfillment).await.unwrap();
    (m, escrow)
}

async fn request_in(store: &dyn EscrowStore, amount: u64, status: AuthorizationStatus) -> PaymentAuthorizationRequest {
    let (m, escrow) = completed_with_escrow(store, amount).await;
    let request = PaymentAuthorizationRequest::new(
        m.id,
        m.contract_id,
        escrow.id,
        escrow.amount,
        escrow.currency,
        Duration::days(7),
    )
    .unwrap();
    let mut request = store.insert_authorization(request, "test").await.unwrap();

    request.transition(status).unwrap();
    if status == AuthorizationStatus::AutoApproved {
        request.risk_score = Some(0.1);
        request.decision = Some(Decision {
            outcome: DecisionOutcome::Approved,
            decided_by: "test".to_string(),
            reason: None,
            decided_at: Utc::now(),
            automatic: true,
        });
    } else {
        request.risk_score = Some(0.5);
    }
    store.update_authorization(request, "test").await.unwrap()
}

/// An auto-approved request ready for execution.
pub async fn approved_request(store: &dyn EscrowStore, amount: u64) -> PaymentAuthorizationRequest {
    request_in(store, amount, AuthorizationStatus::AutoApproved).await
}

/// A request waiting for a reviewer.
pub async fn review_request(store: &dyn EscrowStore, amount: u64) -> PaymentAuthorizationRequest {
    request_in(store, amount, AuthorizationStatus::ManualReviewRequired).await
}

/// Store that fails the write recording a ledger submission for chosen
/// executions, and delegates everything else.
pub struct FailingSubmitStore {
    inner: InMemoryEscrowStore,
    fail_for: Mutex<HashSet<Uuid>>,
}

impl FailingSubmitStore {
    pub fn new(inner: InMemoryEscrowStore) -> Self {
        Self {
            inner,
            fail_for: Mutex::new(HashSet::new()),
        }
    }

    pub fn fail_submission_of(&self, execution_id: Uuid) {
        self.fail_for.lock().unwrap().insert(execution_id);
    }
}

#[async_trait]
impl EscrowStore for FailingSubmitStore {
    async fn insert_milestones(&self, milestones: Vec<Milestone>, actor: &str) -> Result<Vec<Milestone>> {
        self.inner.insert_milestones(milestones, actor).await
    }

    async fn get_milestone(&self, id: Uuid) -> Result<Option<Milestone>> {
        self.inner.get_milestone(id).await
    }

    async fn contract_milestones(&self, contract_id: Uuid) -> Result<Vec<Milestone>> {
        self.inner.contract_milestones(contract_id).await
    }

    async fn open_milestones(&self) -> Result<Vec<Milestone>> {
        self.inner.open_milestones().await
    }

    async fn update_milestone(&self, milestone: Milestone, actor: &str) -> Result<Milestone> {
        self.inner.update_milestone(milestone, actor).await
    }

    async fn insert_escrow(&self, escrow: EscrowInstrument, fulfillment: Fulfillment) -> Result<EscrowInstrument> {
        self.inner.insert_escrow(escrow, fulfillment).await
    }

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowInstrument>> {
        self.inner.get_escrow(id).await
    }

    async fn escrow_for_milestone(&self, milestone_id: Uuid) -> Result<Option<EscrowInstrument>> {
        self.inner.escrow_for_milestone(milestone_id).await
    }

    async fn fulfillment(&self, escrow_id: Uuid) -> Result<Option<Fulfillment>> {
        self.inner.fulfillment(escrow_id).await
    }

    async fn insert_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        self.inner.insert_authorization(request, actor).await
    }

    async fn get_authorization(&self, id: Uuid) -> Result<Option<PaymentAuthorizationRequest>> {
        self.inner.get_authorization(id).await
    }

    async fn authorizations_for_milestone(&self, milestone_id: Uuid) -> Result<Vec<PaymentAuthorizationRequest>> {
        self.inner.authorizations_for_milestone(milestone_id).await
    }

    async fn authorizations_by_status(
        &self,
        statuses: &[AuthorizationStatus],
    ) -> Result<Vec<PaymentAuthorizationRequest>> {
        self.inner.authorizations_by_status(statuses).await
    }

    async fn update_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        self.inner.update_authorization(request, actor).await
    }

    async fn insert_time_lock(&self, lock: TimeLock, actor: &str) -> Result<TimeLock> {
        self.inner.insert_time_lock(lock, actor).await
    }

    async fn lock_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        lock: TimeLock,
        actor: &str,
    ) -> Result<(PaymentAuthorizationRequest, TimeLock)> {
        self.inner.lock_authorization(request, lock, actor).await
    }

    async fn get_time_lock(&self, id: Uuid) -> Result<Option<TimeLock>> {
        self.inner.get_time_lock(id).await
    }

    async fn time_lock_for_request(&self, request_id: Uuid) -> Result<Option<TimeLock>> {
        self.inner.time_lock_for_request(request_id).await
    }

    async fn due_time_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeLock>> {
        self.inner.due_time_locks(now, limit).await
    }

    async fn update_time_lock(&self, lock: TimeLock, actor: &str) -> Result<TimeLock> {
        self.inner.update_time_lock(lock, actor).await
    }

    async fn insert_execution(
        &self,
        execution: PaymentExecution,
        actor: &str,
    ) -> Result<(PaymentExecution, bool)> {
        self.inner.insert_execution(execution, actor).await
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PaymentExecution>> {
        self.inner.get_execution(id).await
    }

    async fn execution_for_request(&self, request_id: Uuid) -> Result<Option<PaymentExecution>> {
        self.inner.execution_for_request(request_id).await
    }

    async fn executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
        limit: usize,
    ) -> Result<Vec<PaymentExecution>> {
        self.inner.executions_by_status(statuses, limit).await
    }

    async fn update_execution(&self, execution: PaymentExecution, actor: &str) -> Result<PaymentExecution> {
        let submitted = execution.status == ExecutionStatus::Submitted && execution.tx_hash.is_some();
        if submitted && self.fail_for.lock().unwrap().contains(&execution.id) {
            return Err(TrancheError::Internal("disk full".to_string()));
        }
        self.inner.update_execution(execution, actor).await
    }

    async fn history(&self, entity_id: Uuid) -> Result<EntityHistory> {
        self.inner.history(entity_id).await
    }

    async fn version(&self) -> u64 {
        self.inner.version().await
    }
}
