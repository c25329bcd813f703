//! Escrow state store.
//!
//! Every mutation of an existing record is a compare-and-set on its
//! `version`: the caller passes the record it read, and the write succeeds
//! only if nobody wrote in between. Losers get [`TrancheError::Conflict`].

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tranche_core::{
    AuthorizationStatus, EscrowInstrument, ExecutionStatus, Fulfillment, Milestone,
    PaymentAuthorizationRequest, PaymentExecution, Result, TimeLock, TrancheError,
};
use uuid::Uuid;

use crate::history::{EntityHistory, EntityKind, TransitionRecord};

/// Trait for escrow state stores.
#[async_trait]
pub trait EscrowStore: Send + Sync {
    /// Insert the milestones of a new contract. Fails without writing if any
    /// id exists or the contract already has milestones.
    async fn insert_milestones(&self, milestones: Vec<Milestone>, actor: &str) -> Result<Vec<Milestone>>;

    async fn get_milestone(&self, id: Uuid) -> Result<Option<Milestone>>;

    /// All milestones of a contract.
    async fn contract_milestones(&self, contract_id: Uuid) -> Result<Vec<Milestone>>;

    /// Milestones not yet completed or cancelled, across contracts.
    async fn open_milestones(&self) -> Result<Vec<Milestone>>;

    /// Version-guarded update.
    async fn update_milestone(&self, milestone: Milestone, actor: &str) -> Result<Milestone>;

    /// Record an escrow and seal its fulfillment. One escrow per milestone.
    async fn insert_escrow(&self, escrow: EscrowInstrument, fulfillment: Fulfillment) -> Result<EscrowInstrument>;

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowInstrument>>;

    /// The escrow attached to a milestone, if any.
    async fn escrow_for_milestone(&self, milestone_id: Uuid) -> Result<Option<EscrowInstrument>>;

    /// Reveal the sealed fulfillment of an escrow.
    async fn fulfillment(&self, escrow_id: Uuid) -> Result<Option<Fulfillment>>;

    /// Insert a request. Fails if the milestone already has an open request.
    async fn insert_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest>;

    async fn get_authorization(&self, id: Uuid) -> Result<Option<PaymentAuthorizationRequest>>;

    async fn authorizations_for_milestone(&self, milestone_id: Uuid) -> Result<Vec<PaymentAuthorizationRequest>>;

    async fn authorizations_by_status(
        &self,
        statuses: &[AuthorizationStatus],
    ) -> Result<Vec<PaymentAuthorizationRequest>>;

    /// Version-guarded update.
    async fn update_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest>;

    async fn insert_time_lock(&self, lock: TimeLock, actor: &str) -> Result<TimeLock>;

    /// Version-guarded update of `request` and insert of its new `lock` as
    /// one write. Fails without change if the request already has an active
    /// lock.
    async fn lock_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        lock: TimeLock,
        actor: &str,
    ) -> Result<(PaymentAuthorizationRequest, TimeLock)>;

    async fn get_time_lock(&self, id: Uuid) -> Result<Option<TimeLock>>;

    async fn time_lock_for_request(&self, request_id: Uuid) -> Result<Option<TimeLock>>;

    /// Active locks whose release time has passed, oldest first.
    async fn due_time_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeLock>>;

    /// Version-guarded update.
    async fn update_time_lock(&self, lock: TimeLock, actor: &str) -> Result<TimeLock>;

    /// Insert unless the request already has an execution.
    ///
    /// Returns the stored execution and whether it was created by this call.
    async fn insert_execution(
        &self,
        execution: PaymentExecution,
        actor: &str,
    ) -> Result<(PaymentExecution, bool)>;

    async fn get_execution(&self, id: Uuid) -> Result<Option<PaymentExecution>>;

    async fn execution_for_request(&self, request_id: Uuid) -> Result<Option<PaymentExecution>>;

    /// Executions in any of `statuses`, oldest update first.
    async fn executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
        limit: usize,
    ) -> Result<Vec<PaymentExecution>>;

    /// Version-guarded update.
    async fn update_execution(&self, execution: PaymentExecution, actor: &str) -> Result<PaymentExecution>;

    /// Transition history of any entity.
    async fn history(&self, entity_id: Uuid) -> Result<EntityHistory>;

    /// Current store version.
    async fn version(&self) -> u64;
}

/// Records the store can version and log.
trait Versioned: Clone {
    const ENTITY: EntityKind;
    const NAME: &'static str;

    fn id(&self) -> Uuid;
    fn version(&self) -> u64;
    fn set_version(&mut self, version: u64);
    fn status_label(&self) -> String;
}

impl Versioned for Milestone {
    const ENTITY: EntityKind = EntityKind::Milestone;
    const NAME: &'static str = "milestone";

    fn id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

impl Versioned for PaymentAuthorizationRequest {
    const ENTITY: EntityKind = EntityKind::Authorization;
    const NAME: &'static str = "authorization";

    fn id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

impl Versioned for TimeLock {
    const ENTITY: EntityKind = EntityKind::TimeLock;
    const NAME: &'static str = "time_lock";

    fn id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn status_label(&self) -> String {
        if self.released {
            "released".to_string()
        } else if self.cancelled_at.is_some() {
            "cancelled".to_string()
        } else {
            "active".to_string()
        }
    }
}

impl Versioned for PaymentExecution {
    const ENTITY: EntityKind = EntityKind::Execution;
    const NAME: &'static str = "execution";

    fn id(&self) -> Uuid {
        self.id
    }
    fn version(&self) -> u64 {
        self.version
    }
    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
    fn status_label(&self) -> String {
        self.status.to_string()
    }
}

#[derive(Default)]
struct Tables {
    version: u64,
    milestones: HashMap<Uuid, Milestone>,
    escrows: HashMap<Uuid, EscrowInstrument>,
    fulfillments: HashMap<Uuid, Fulfillment>,
    authorizations: HashMap<Uuid, PaymentAuthorizationRequest>,
    time_locks: HashMap<Uuid, TimeLock>,
    executions: HashMap<Uuid, PaymentExecution>,
    executions_by_request: HashMap<Uuid, Uuid>,
    history: HashMap<Uuid, Vec<TransitionRecord>>,
}

/// Append a transition record.
fn log_transition<T: Versioned>(
    history: &mut HashMap<Uuid, Vec<TransitionRecord>>,
    record: &T,
    from: Option<String>,
    actor: &str,
) {
    history
        .entry(record.id())
        .or_default()
        .push(TransitionRecord {
            entity: T::ENTITY,
            entity_id: record.id(),
            from,
            to: record.status_label(),
            actor: actor.to_string(),
            at: Utc::now(),
            version: record.version(),
        });
}

/// Insert a new record, stamping a fresh version.
fn insert_new<T: Versioned>(
    map: &mut HashMap<Uuid, T>,
    clock: &mut u64,
    history: &mut HashMap<Uuid, Vec<TransitionRecord>>,
    mut record: T,
    actor: &str,
) -> Result<T> {
    if map.contains_key(&record.id()) {
        return Err(TrancheError::validation(format!(
            "{} {} already exists",
            T::NAME,
            record.id()
        )));
    }
    *clock += 1;
    record.set_version(*clock);
    log_transition(history, &record, None, actor);
    map.insert(record.id(), record.clone());
    Ok(record)
}

/// Replace a record if its version still matches the stored one.
fn compare_and_swap<T: Versioned>(
    map: &mut HashMap<Uuid, T>,
    clock: &mut u64,
    history: &mut HashMap<Uuid, Vec<TransitionRecord>>,
    mut record: T,
    actor: &str,
) -> Result<T> {
    let stored = map
        .get(&record.id())
        .ok_or_else(|| TrancheError::not_found(T::NAME, record.id()))?;
    if stored.version() != record.version() {
        return Err(TrancheError::Conflict {
            entity: T::NAME,
            id: record.id(),
        });
    }
    let from = stored.status_label();

    *clock += 1;
    record.set_version(*clock);
    if from != record.status_label() {
        log_transition(history, &record, Some(from), actor);
    }
    map.insert(record.id(), record.clone());
    Ok(record)
}

/// In-memory implementation of EscrowStore.
///
/// A single lock covers all tables, so multi-record checks (open request per
/// milestone, one execution per request) are atomic.
#[derive(Clone, Default)]
pub struct InMemoryEscrowStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryEscrowStore {
    /// Create a new in-memory store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EscrowStore for InMemoryEscrowStore {
    async fn insert_milestones(&self, milestones: Vec<Milestone>, actor: &str) -> Result<Vec<Milestone>> {
        let mut guard = self.tables.write().await;
        if let Some(dup) = milestones.iter().find(|m| guard.milestones.contains_key(&m.id)) {
            return Err(TrancheError::validation(format!("milestone {} already exists", dup.id)));
        }
        let contracts: HashSet<Uuid> = milestones.iter().map(|m| m.contract_id).collect();
        if let Some(existing) = guard.milestones.values().find(|m| contracts.contains(&m.contract_id)) {
            return Err(TrancheError::validation(format!(
                "contract {} is already registered",
                existing.contract_id
            )));
        }

        let Tables {
            version,
            milestones: table,
            history,
            ..
        } = &mut *guard;
        milestones
            .into_iter()
            .map(|m| insert_new(table, version, history, m, actor))
            .collect()
    }

    async fn get_milestone(&self, id: Uuid) -> Result<Option<Milestone>> {
        Ok(self.tables.read().await.milestones.get(&id).cloned())
    }

    async fn contract_milestones(&self, contract_id: Uuid) -> Result<Vec<Milestone>> {
        let tables = self.tables.read().await;
        let mut found: Vec<Milestone> = tables
            .milestones
            .values()
            .filter(|m| m.contract_id == contract_id)
            .cloned()
            .collect();
        found.sort_by_key(|m| (m.created_at, m.id));
        Ok(found)
    }

    async fn open_milestones(&self) -> Result<Vec<Milestone>> {
        let tables = self.tables.read().await;
        Ok(tables
            .milestones
            .values()
            .filter(|m| !m.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn update_milestone(&self, milestone: Milestone, actor: &str) -> Result<Milestone> {
        let mut guard = self.tables.write().await;
        let Tables {
            version,
            milestones,
            history,
            ..
        } = &mut *guard;
        compare_and_swap(milestones, version, history, milestone, actor)
    }

    async fn insert_escrow(&self, escrow: EscrowInstrument, fulfillment: Fulfillment) -> Result<EscrowInstrument> {
        let mut tables = self.tables.write().await;
        if tables.escrows.contains_key(&escrow.id) {
            return Err(TrancheError::validation(format!("escrow {} already exists", escrow.id)));
        }
        if tables.escrows.values().any(|e| e.milestone_id == escrow.milestone_id) {
            return Err(TrancheError::validation(format!(
                "milestone {} already has an escrow",
                escrow.milestone_id
            )));
        }
        tables.version += 1;
        tables.fulfillments.insert(escrow.id, fulfillment);
        tables.escrows.insert(escrow.id, escrow.clone());
        Ok(escrow)
    }

    async fn get_escrow(&self, id: Uuid) -> Result<Option<EscrowInstrument>> {
        Ok(self.tables.read().await.escrows.get(&id).cloned())
    }

    async fn escrow_for_milestone(&self, milestone_id: Uuid) -> Result<Option<EscrowInstrument>> {
        let tables = self.tables.read().await;
        Ok(tables
            .escrows
            .values()
            .find(|e| e.milestone_id == milestone_id)
            .cloned())
    }

    async fn fulfillment(&self, escrow_id: Uuid) -> Result<Option<Fulfillment>> {
        Ok(self.tables.read().await.fulfillments.get(&escrow_id).cloned())
    }

    async fn insert_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        let mut guard = self.tables.write().await;
        let open = guard
            .authorizations
            .values()
            .find(|r| r.milestone_id == request.milestone_id && !r.status.is_terminal());
        if let Some(existing) = open {
            return Err(TrancheError::validation(format!(
                "milestone {} already has open payment request {}",
                request.milestone_id, existing.id
            )));
        }

        let Tables {
            version,
            authorizations,
            history,
            ..
        } = &mut *guard;
        insert_new(authorizations, version, history, request, actor)
    }

    async fn get_authorization(&self, id: Uuid) -> Result<Option<PaymentAuthorizationRequest>> {
        Ok(self.tables.read().await.authorizations.get(&id).cloned())
    }

    async fn authorizations_for_milestone(&self, milestone_id: Uuid) -> Result<Vec<PaymentAuthorizationRequest>> {
        let tables = self.tables.read().await;
        let mut found: Vec<_> = tables
            .authorizations
            .values()
            .filter(|r| r.milestone_id == milestone_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn authorizations_by_status(
        &self,
        statuses: &[AuthorizationStatus],
    ) -> Result<Vec<PaymentAuthorizationRequest>> {
        let tables = self.tables.read().await;
        let mut found: Vec<_> = tables
            .authorizations
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.created_at);
        Ok(found)
    }

    async fn update_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        actor: &str,
    ) -> Result<PaymentAuthorizationRequest> {
        let mut guard = self.tables.write().await;
        let Tables {
            version,
            authorizations,
            history,
            ..
        } = &mut *guard;
        compare_and_swap(authorizations, version, history, request, actor)
    }

    async fn insert_time_lock(&self, lock: TimeLock, actor: &str) -> Result<TimeLock> {
        let mut guard = self.tables.write().await;
        let active = guard
            .time_locks
            .values()
            .any(|l| l.request_id == lock.request_id && l.is_active());
        if active {
            return Err(TrancheError::validation(format!(
                "request {} already has an active time-lock",
                lock.request_id
            )));
        }

        let Tables {
            version,
            time_locks,
            history,
            ..
        } = &mut *guard;
        insert_new(time_locks, version, history, lock, actor)
    }

    async fn lock_authorization(
        &self,
        request: PaymentAuthorizationRequest,
        lock: TimeLock,
        actor: &str,
    ) -> Result<(PaymentAuthorizationRequest, TimeLock)> {
        let mut guard = self.tables.write().await;
        let stored = guard
            .authorizations
            .get(&request.id)
            .ok_or_else(|| TrancheError::not_found("authorization", request.id))?;
        if stored.version != request.version {
            return Err(TrancheError::Conflict {
                entity: "authorization",
                id: request.id,
            });
        }
        if lock.request_id != request.id {
            return Err(TrancheError::validation(format!(
                "time-lock {} belongs to request {}, not {}",
                lock.id, lock.request_id, request.id
            )));
        }
        if guard.time_locks.contains_key(&lock.id)
            || guard
                .time_locks
                .values()
                .any(|l| l.request_id == request.id && l.is_active())
        {
            return Err(TrancheError::validation(format!(
                "request {} already has an active time-lock",
                request.id
            )));
        }

        let Tables {
            version,
            authorizations,
            time_locks,
            history,
            ..
        } = &mut *guard;
        let lock = insert_new(time_locks, version, history, lock, actor)?;
        let request = compare_and_swap(authorizations, version, history, request, actor)?;
        Ok((request, lock))
    }

    async fn get_time_lock(&self, id: Uuid) -> Result<Option<TimeLock>> {
        Ok(self.tables.read().await.time_locks.get(&id).cloned())
    }

    async fn time_lock_for_request(&self, request_id: Uuid) -> Result<Option<TimeLock>> {
        let tables = self.tables.read().await;
        Ok(tables
            .time_locks
            .values()
            .filter(|l| l.request_id == request_id)
            .max_by_key(|l| l.created_at)
            .cloned())
    }

    async fn due_time_locks(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<TimeLock>> {
        let tables = self.tables.read().await;
        let mut due: Vec<TimeLock> = tables
            .time_locks
            .values()
            .filter(|l| l.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|l| (l.release_at, l.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn update_time_lock(&self, lock: TimeLock, actor: &str) -> Result<TimeLock> {
        let mut guard = self.tables.write().await;
        let Tables {
            version,
            time_locks,
            history,
            ..
        } = &mut *guard;
        compare_and_swap(time_locks, version, history, lock, actor)
    }

    async fn insert_execution(
        &self,
        execution: PaymentExecution,
        actor: &str,
    ) -> Result<(PaymentExecution, bool)> {
        let mut guard = self.tables.write().await;
        if let Some(existing_id) = guard.executions_by_request.get(&execution.request_id) {
            if let Some(existing) = guard.executions.get(existing_id) {
                return Ok((existing.clone(), false));
            }
        }

        let request_id = execution.request_id;
        let Tables {
            version,
            executions,
            executions_by_request,
            history,
            ..
        } = &mut *guard;
        let stored = insert_new(executions, version, history, execution, actor)?;
        executions_by_request.insert(request_id, stored.id);
        Ok((stored, true))
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<PaymentExecution>> {
        Ok(self.tables.read().await.executions.get(&id).cloned())
    }

    async fn execution_for_request(&self, request_id: Uuid) -> Result<Option<PaymentExecution>> {
        let tables = self.tables.read().await;
        Ok(tables
            .executions_by_request
            .get(&request_id)
            .and_then(|id| tables.executions.get(id))
            .cloned())
    }

    async fn executions_by_status(
        &self,
        statuses: &[ExecutionStatus],
        limit: usize,
    ) -> Result<Vec<PaymentExecution>> {
        let tables = self.tables.read().await;
        let mut found: Vec<PaymentExecution> = tables
            .executions
            .values()
            .filter(|e| statuses.contains(&e.status))
            .cloned()
            .collect();
        found.sort_by_key(|e| (e.updated_at, e.id));
        found.truncate(limit);
        Ok(found)
    }

    async fn update_execution(&self, execution: PaymentExecution, actor: &str) -> Result<PaymentExecution> {
        let mut guard = self.tables.write().await;
        let Tables {
            version,
            executions,
            history,
            ..
        } = &mut *guard;
        compare_and_swap(executions, version, history, execution, actor)
    }

    async fn history(&self, entity_id: Uuid) -> Result<EntityHistory> {
        let tables = self.tables.read().await;
        Ok(EntityHistory {
            records: tables.history.get(&entity_id).cloned().unwrap_or_default(),
        })
    }

    async fn version(&self) -> u64 {
        self.tables.read().await.version
    }
}
