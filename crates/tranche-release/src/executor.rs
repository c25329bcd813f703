//! Payment execution coordinator.
//!
//! Owns the Pending -> Submitted -> Confirming -> Confirmed state machine of
//! each [`PaymentExecution`]. An execution is claimed with a version-guarded
//! Pending -> Submitted write before any ledger I/O, so two callers racing on
//! the same request never both submit.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, warn};
use tranche_core::{
    condition, EscrowEvent, EventKind, ExecutionEvent, ExecutionEventType, ExecutionStatus,
    FailureOutcome, LedgerError, LedgerErrorKind, PaymentExecution, Result, TrancheError,
};
use tranche_state::{EntityHistory, EscrowStore, EventPublisher};
use uuid::Uuid;

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::config::ExecutionConfig;
use crate::ledger::{LedgerClient, ReleaseTransaction};
use crate::retry::RetryPolicy;

const COORDINATOR: &str = "coordinator";
const MAX_CAS_ATTEMPTS: usize = 3;

/// Per-item result of a bulk execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkExecutionItem {
    pub request_id: Uuid,
    pub success: bool,
    pub execution_id: Option<Uuid>,
    pub status: Option<ExecutionStatus>,
    pub error: Option<String>,
}

/// Result of a bulk execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkExecutionReport {
    pub results: Vec<BulkExecutionItem>,
    pub succeeded: usize,
    pub failed: usize,
}

/// Result of one automatic retry pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryPass {
    pub retried: Vec<PaymentExecution>,
    /// Retries that hit an error. Each execution stays where it stopped and
    /// the confirmation timeout eventually fails it again.
    pub failed: usize,
}

/// The payment coordinator.
pub struct PaymentCoordinator {
    store: Arc<dyn EscrowStore>,
    ledger: Arc<dyn LedgerClient>,
    publisher: Arc<dyn EventPublisher>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    config: ExecutionConfig,
}

impl PaymentCoordinator {
    /// Create a new coordinator.
    pub fn new(
        store: Arc<dyn EscrowStore>,
        ledger: Arc<dyn LedgerClient>,
        publisher: Arc<dyn EventPublisher>,
        breaker: Arc<CircuitBreaker>,
        config: ExecutionConfig,
    ) -> Self {
        Self {
            store,
            ledger,
            publisher,
            breaker,
            retry: RetryPolicy::from_config(&config),
            config,
        }
    }

    pub fn config(&self) -> &ExecutionConfig {
        &self.config
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// Get an execution by ID.
    pub async fn get(&self, execution_id: Uuid) -> Result<PaymentExecution> {
        self.store
            .get_execution(execution_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("execution", execution_id))
    }

    /// The execution of a request, if one was created.
    pub async fn for_request(&self, request_id: Uuid) -> Result<Option<PaymentExecution>> {
        self.store.execution_for_request(request_id).await
    }

    pub async fn history(&self, execution_id: Uuid) -> Result<EntityHistory> {
        self.store.history(execution_id).await
    }

    /// Executions waiting for an operator.
    pub async fn dead_letters(&self, limit: usize) -> Result<Vec<PaymentExecution>> {
        self.store
            .executions_by_status(&[ExecutionStatus::DeadLettered], limit)
            .await
    }

    /// Execute the payout of an authorized request.
    ///
    /// Idempotent per request: a repeated call returns the existing execution.
    /// Ledger failures are recorded on the execution, not returned.
    pub async fn execute(&self, request_id: Uuid) -> Result<PaymentExecution> {
        if let Some(existing) = self.store.execution_for_request(request_id).await? {
            debug!(request_id = %request_id, execution_id = %existing.id, "Execution already exists");
            return Ok(existing);
        }

        let request = self
            .store
            .get_authorization(request_id)
            .await?
            .ok_or_else(|| TrancheError::not_found("authorization", request_id))?;
        let lock = match request.time_lock_id {
            Some(lock_id) => self.store.get_time_lock(lock_id).await?,
            None => None,
        };
        request.check_releasable(lock.as_ref())?;

        let execution = PaymentExecution::for_request(
            &request,
            self.config.required_confirmations,
            self.config.max_retries,
        );
        let (execution, created) = self.store.insert_execution(execution, COORDINATOR).await?;
        if !created {
            return Ok(execution);
        }
        info!(request_id = %request_id, execution_id = %execution.id, "Execution created");
        self.link_request(request_id, execution.id).await;

        self.attempt(execution).await
    }

    /// Execute each request independently.
    pub async fn bulk_execute(&self, request_ids: &[Uuid]) -> BulkExecutionReport {
        let outcomes = futures::future::join_all(request_ids.iter().map(|&id| self.execute(id))).await;

        let mut report = BulkExecutionReport::default();
        for (&request_id, outcome) in request_ids.iter().zip(outcomes) {
            let item = match outcome {
                Ok(execution) => {
                    let success = !matches!(
                        execution.status,
                        ExecutionStatus::Failed | ExecutionStatus::DeadLettered | ExecutionStatus::Cancelled
                    );
                    BulkExecutionItem {
                        request_id,
                        success,
                        execution_id: Some(execution.id),
                        status: Some(execution.status),
                        error: if success { None } else { execution.last_error },
                    }
                }
                Err(e) => BulkExecutionItem {
                    request_id,
                    success: false,
                    execution_id: None,
                    status: None,
                    error: Some(e.to_string()),
                },
            };
            if item.success {
                report.succeeded += 1;
            } else {
                report.failed += 1;
            }
            report.results.push(item);
        }
        report
    }

    /// Advance one in-flight execution by a single confirmation poll.
    pub async fn poll_confirmation(&self, execution_id: Uuid) -> Result<PaymentExecution> {
        let execution = self.get(execution_id).await?;
        if !execution.status.is_in_flight() {
            return Ok(execution);
        }

        let now = Utc::now();
        let since = execution.submitted_at.unwrap_or(execution.updated_at);
        if now - since >= self.config.confirmation_timeout() {
            warn!(execution_id = %execution_id, "Confirmation timed out");
            let error = LedgerError::timeout(format!(
                "not confirmed within {}s",
                self.config.confirmation_timeout_secs
            ));
            return self.fail(execution, error).await;
        }

        let tx_hash = match execution.tx_hash.clone() {
            Some(tx_hash) => tx_hash,
            // Claimed but the submission has not returned yet.
            None => return Ok(execution),
        };

        let result = self
            .ledger_call(async { self.ledger.confirmations(&tx_hash).await })
            .await;

        match result {
            Ok(depth) => self.apply_confirmations(execution, depth).await,
            Err(e) if e.is_transient() => {
                debug!(execution_id = %execution_id, error = %e, "Confirmation poll failed");
                Ok(execution)
            }
            Err(e) => self.fail(execution, e).await,
        }
    }

    /// Poll until the execution leaves the in-flight states.
    pub async fn monitor_until_confirmed(&self, execution_id: Uuid) -> Result<PaymentExecution> {
        loop {
            let execution = self.poll_confirmation(execution_id).await?;
            if !execution.status.is_in_flight() {
                return Ok(execution);
            }
            sleep(self.config.poll_interval()).await;
        }
    }

    /// Run automatic retries whose backoff has elapsed.
    ///
    /// Only the initial scan can fail the pass; a failing item is logged and
    /// counted, and the rest of the batch still runs.
    pub async fn retry_due(&self, now: DateTime<Utc>, limit: usize) -> Result<RetryPass> {
        let failed = self
            .store
            .executions_by_status(&[ExecutionStatus::Failed], usize::MAX)
            .await?;

        let mut pass = RetryPass::default();
        for mut execution in failed.into_iter().filter(|e| e.retry_due(now)).take(limit) {
            let execution_id = execution.id;
            if let Err(e) = execution.prepare_retry() {
                error!(execution_id = %execution_id, error = %e, "Cannot retry execution");
                pass.failed += 1;
                continue;
            }
            let claimed = match self.store.update_execution(execution, COORDINATOR).await {
                Ok(claimed) => claimed,
                Err(TrancheError::Conflict { .. }) => continue,
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "Failed to claim retry");
                    pass.failed += 1;
                    continue;
                }
            };
            info!(execution_id = %execution_id, attempt = claimed.retry_count, "Retrying execution");
            match self.attempt(claimed).await {
                Ok(execution) => pass.retried.push(execution),
                Err(e) => {
                    error!(execution_id = %execution_id, error = %e, "Retry attempt failed");
                    pass.failed += 1;
                }
            }
        }
        Ok(pass)
    }

    /// Operator retry of a transiently failed execution, ignoring backoff.
    ///
    /// A dead-lettered execution needs [`redrive`](Self::redrive) instead.
    pub async fn retry_execution(&self, execution_id: Uuid) -> Result<PaymentExecution> {
        let mut execution = self.get(execution_id).await?;
        if execution.status == ExecutionStatus::DeadLettered {
            return Err(TrancheError::RetriesExhausted {
                execution_id,
                retries: execution.retry_count,
                last_error: execution.last_error.clone().unwrap_or_default(),
            });
        }
        execution.prepare_retry()?;
        let execution = self.store.update_execution(execution, COORDINATOR).await?;
        info!(execution_id = %execution_id, "Manual retry");
        self.attempt(execution).await
    }

    /// Operator re-drive of a dead-lettered execution.
    pub async fn redrive(&self, execution_id: Uuid, actor: &str) -> Result<PaymentExecution> {
        let mut execution = self.get(execution_id).await?;
        execution.redrive(actor)?;
        let execution = self.store.update_execution(execution, actor).await?;
        info!(execution_id = %execution_id, actor, "Execution re-driven");
        self.attempt(execution).await
    }

    /// Operator abandonment of an execution that is not in flight.
    pub async fn cancel_execution(&self, execution_id: Uuid, actor: &str, reason: &str) -> Result<PaymentExecution> {
        let mut execution = self.get(execution_id).await?;
        execution.cancel(actor, reason)?;
        let execution = self.store.update_execution(execution, actor).await?;
        warn!(execution_id = %execution_id, actor, reason, "Execution cancelled");
        Ok(execution)
    }

    /// Claim a Pending execution and submit it.
    async fn attempt(&self, mut execution: PaymentExecution) -> Result<PaymentExecution> {
        execution.transition(ExecutionStatus::Submitted)?;
        execution.record(ExecutionEvent::new(ExecutionEventType::SubmissionStarted));
        let execution = match self.store.update_execution(execution, COORDINATOR).await {
            Ok(claimed) => claimed,
            Err(TrancheError::Conflict { id, .. }) => {
                debug!(execution_id = %id, "Execution claimed by another worker");
                return self.get(id).await;
            }
            Err(e) => return Err(e),
        };

        let transaction = match self.release_transaction(&execution).await {
            Ok(transaction) => transaction,
            Err(e) => return self.fail(execution, e).await,
        };
        let blob = match transaction.to_blob() {
            Ok(blob) => blob,
            Err(e) => {
                let error = LedgerError::new(LedgerErrorKind::Rejected, e.to_string());
                return self.fail(execution, error).await;
            }
        };

        let result = self
            .ledger_call(async { self.ledger.submit(&blob).await })
            .await;

        match result {
            Ok(tx_hash) => {
                let mut execution = execution;
                execution.mark_submitted(tx_hash.clone());
                let execution = self.store.update_execution(execution, COORDINATOR).await?;
                info!(execution_id = %execution.id, tx_hash = %tx_hash, "Payment submitted");
                Ok(execution)
            }
            Err(e) => self.fail(execution, e).await,
        }
    }

    /// Build the escrow-finish transaction, checking the fulfillment locally.
    async fn release_transaction(&self, execution: &PaymentExecution) -> std::result::Result<ReleaseTransaction, LedgerError> {
        let rejected = |message: String| LedgerError::new(LedgerErrorKind::Rejected, message);

        let escrow = self
            .store
            .get_escrow(execution.escrow_id)
            .await
            .map_err(|e| LedgerError::network(e.to_string()))?
            .ok_or_else(|| rejected(format!("escrow {} not found", execution.escrow_id)))?;
        let fulfillment = self
            .store
            .fulfillment(escrow.id)
            .await
            .map_err(|e| LedgerError::network(e.to_string()))?
            .ok_or_else(|| rejected(format!("no fulfillment sealed for escrow {}", escrow.id)))?;

        if !condition::validate(&escrow.condition, &fulfillment, escrow.id, execution.milestone_id) {
            return Err(LedgerError::new(
                LedgerErrorKind::ConditionMismatch,
                format!("fulfillment does not satisfy condition of escrow {}", escrow.id),
            ));
        }

        Ok(ReleaseTransaction::for_execution(execution, escrow.condition, fulfillment))
    }

    async fn apply_confirmations(&self, mut execution: PaymentExecution, depth: u32) -> Result<PaymentExecution> {
        let before = (execution.status, execution.confirmations);
        execution.observe_confirmations(depth)?;
        if (execution.status, execution.confirmations) == before {
            return Ok(execution);
        }

        let execution = match self.store.update_execution(execution, COORDINATOR).await {
            Ok(stored) => stored,
            Err(TrancheError::Conflict { id, .. }) => return self.get(id).await,
            Err(e) => return Err(e),
        };

        if execution.status == ExecutionStatus::Confirmed {
            info!(execution_id = %execution.id, request_id = %execution.request_id, "Payment confirmed");
            self.publish(EventKind::PaymentConfirmed {
                request_id: execution.request_id,
                execution_id: execution.id,
                tx_hash: execution.tx_hash.clone().unwrap_or_default(),
            })
            .await;
        }
        Ok(execution)
    }

    /// Record a failed attempt, schedule its retry or dead-letter it.
    async fn fail(&self, mut execution: PaymentExecution, error: LedgerError) -> Result<PaymentExecution> {
        let backoff = self.retry.delay_for(execution.retry_count + 1);
        let backoff = chrono::Duration::from_std(backoff).unwrap_or_else(|_| chrono::Duration::zero());
        let outcome = execution.record_failure(&error, backoff, Utc::now())?;

        let execution = match self.store.update_execution(execution, COORDINATOR).await {
            Ok(stored) => stored,
            Err(TrancheError::Conflict { id, .. }) => return self.get(id).await,
            Err(e) => return Err(e),
        };

        match outcome {
            FailureOutcome::RetryScheduled { attempt, at } => {
                warn!(
                    execution_id = %execution.id,
                    attempt,
                    retry_at = %at,
                    error = %error,
                    "Execution failed, retry scheduled"
                );
                self.publish(EventKind::ExecutionFailed {
                    request_id: execution.request_id,
                    execution_id: execution.id,
                    error: error.message.clone(),
                    retry_scheduled: true,
                })
                .await;
            }
            FailureOutcome::Terminal => {
                error!(execution_id = %execution.id, error = %error, "Execution failed terminally");
                self.publish(EventKind::ExecutionFailed {
                    request_id: execution.request_id,
                    execution_id: execution.id,
                    error: error.message.clone(),
                    retry_scheduled: false,
                })
                .await;
            }
            FailureOutcome::DeadLettered => {
                error!(
                    execution_id = %execution.id,
                    retries = execution.retry_count,
                    error = %error,
                    "Execution dead-lettered"
                );
                self.publish(EventKind::ExecutionDeadLettered {
                    request_id: execution.request_id,
                    execution_id: execution.id,
                    retries: execution.retry_count,
                    last_error: error.message.clone(),
                })
                .await;
            }
        }
        Ok(execution)
    }

    /// Wrap a ledger call in the breaker and the per-call deadline.
    async fn ledger_call<T, F>(&self, call: F) -> std::result::Result<T, LedgerError>
    where
        F: std::future::Future<Output = std::result::Result<T, LedgerError>>,
    {
        let deadline = self.config.ledger_call_timeout();
        self.breaker
            .call(async move {
                match timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(LedgerError::timeout(format!(
                        "ledger call exceeded {}ms",
                        deadline.as_millis()
                    ))),
                }
            })
            .await
    }

    async fn link_request(&self, request_id: Uuid, execution_id: Uuid) {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut request = match self.store.get_authorization(request_id).await {
                Ok(Some(request)) => request,
                _ => return,
            };
            if request.execution_id.is_some() {
                return;
            }
            request.execution_id = Some(execution_id);
            request.updated_at = Utc::now();
            match self.store.update_authorization(request, COORDINATOR).await {
                Ok(_) => return,
                Err(TrancheError::Conflict { .. }) => continue,
                Err(e) => {
                    warn!(request_id = %request_id, error = %e, "Failed to link execution to request");
                    return;
                }
            }
        }
    }

    async fn publish(&self, kind: EventKind) {
        self.publisher.publish(EscrowEvent::new(kind)).await;
    }
}
