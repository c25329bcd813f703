//! Monitoring sweeps.
//!
//! Each sweep is a single-step `run_once` so tests can drive it directly.
//! [`spawn_sweeps`] runs them on intervals until the returned handle is shut
//! down; a pass in progress finishes its current item and stops taking new ones.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};
use tranche_core::ExecutionStatus;
use tranche_state::EscrowStore;

use crate::authorization::AuthorizationEngine;
use crate::executor::PaymentCoordinator;

/// What one sweep pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub scanned: usize,
    /// Items this pass moved forward.
    pub advanced: usize,
    /// Items another worker handled first.
    pub skipped: usize,
    pub failed: usize,
    pub expired: usize,
    /// The pass stopped early on shutdown.
    pub interrupted: bool,
}

impl SweepReport {
    pub fn is_idle(&self) -> bool {
        self.scanned == 0 && self.expired == 0
    }
}

/// Cooperative stop flag observed between items.
#[derive(Clone)]
pub struct StopSignal(watch::Receiver<bool>);

impl StopSignal {
    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_stopped(&self) -> bool {
        *self.0.borrow()
    }
}

/// A periodic background task.
#[async_trait]
pub trait Sweep: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run one pass.
    async fn run_once(&self, now: DateTime<Utc>, stop: &StopSignal) -> SweepReport;
}

/// Releases due time-locks into execution and expires stale requests.
pub struct TimeLockSweep {
    engine: Arc<AuthorizationEngine>,
    coordinator: Arc<PaymentCoordinator>,
    batch_size: usize,
}

impl TimeLockSweep {
    pub fn new(engine: Arc<AuthorizationEngine>, coordinator: Arc<PaymentCoordinator>, batch_size: usize) -> Self {
        Self {
            engine,
            coordinator,
            batch_size,
        }
    }
}

#[async_trait]
impl Sweep for TimeLockSweep {
    fn name(&self) -> &'static str {
        "time-lock"
    }

    async fn run_once(&self, now: DateTime<Utc>, stop: &StopSignal) -> SweepReport {
        let mut report = SweepReport::default();

        // Releases from earlier passes whose hand-off never happened.
        match self.engine.released_without_execution(now, self.batch_size).await {
            Ok(stranded) => {
                report.scanned += stranded.len();
                for request_id in stranded {
                    if stop.is_stopped() {
                        report.interrupted = true;
                        return report;
                    }
                    match self.coordinator.execute(request_id).await {
                        Ok(execution) => {
                            info!(request_id = %request_id, execution_id = %execution.id, "Released payment recovered");
                            report.advanced += 1;
                        }
                        Err(e) => {
                            error!(request_id = %request_id, error = %e, "Hand-off of released payment failed");
                            report.failed += 1;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "Time-lock sweep failed to scan released locks");
                report.failed += 1;
            }
        }

        let due = match self.engine.due_time_locks(now, self.batch_size).await {
            Ok(due) => due,
            Err(e) => {
                error!(error = %e, "Time-lock sweep failed to scan");
                report.failed += 1;
                return report;
            }
        };
        report.scanned += due.len();

        for lock in due {
            if stop.is_stopped() {
                report.interrupted = true;
                return report;
            }

            let request_id = lock.request_id;
            match self.engine.release_time_lock(lock, "time-lock-sweep").await {
                Ok(Some(_)) => match self.coordinator.execute(request_id).await {
                    Ok(execution) => {
                        debug!(request_id = %request_id, execution_id = %execution.id, "Released payment handed off");
                        report.advanced += 1;
                    }
                    Err(e) => {
                        error!(request_id = %request_id, error = %e, "Hand-off after release failed");
                        report.failed += 1;
                    }
                },
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    error!(request_id = %request_id, error = %e, "Time-lock release failed");
                    report.failed += 1;
                }
            }
        }

        if stop.is_stopped() {
            report.interrupted = true;
            return report;
        }
        match self.engine.expire_overdue(now, self.batch_size).await {
            Ok(expired) => report.expired = expired.len(),
            Err(e) => {
                error!(error = %e, "Request expiry failed");
                report.failed += 1;
            }
        }

        report
    }
}

/// Advances in-flight executions and runs due retries.
pub struct ConfirmationSweep {
    store: Arc<dyn EscrowStore>,
    coordinator: Arc<PaymentCoordinator>,
    batch_size: usize,
}

impl ConfirmationSweep {
    pub fn new(store: Arc<dyn EscrowStore>, coordinator: Arc<PaymentCoordinator>, batch_size: usize) -> Self {
        Self {
            store,
            coordinator,
            batch_size,
        }
    }
}

#[async_trait]
impl Sweep for ConfirmationSweep {
    fn name(&self) -> &'static str {
        "confirmation"
    }

    async fn run_once(&self, now: DateTime<Utc>, stop: &StopSignal) -> SweepReport {
        let mut report = SweepReport::default();

        let in_flight = match self
            .store
            .executions_by_status(
                &[ExecutionStatus::Submitted, ExecutionStatus::Confirming],
                self.batch_size,
            )
            .await
        {
            Ok(found) => found,
            Err(e) => {
                error!(error = %e, "Confirmation sweep failed to scan");
                report.failed += 1;
                return report;
            }
        };
        report.scanned = in_flight.len();

        for execution in in_flight {
            if stop.is_stopped() {
                report.interrupted = true;
                return report;
            }

            let before = (execution.status, execution.confirmations);
            match self.coordinator.poll_confirmation(execution.id).await {
                Ok(after) if (after.status, after.confirmations) != before => report.advanced += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(execution_id = %execution.id, error = %e, "Confirmation poll failed");
                    report.failed += 1;
                }
            }
        }

        if stop.is_stopped() {
            report.interrupted = true;
            return report;
        }
        match self.coordinator.retry_due(now, self.batch_size).await {
            Ok(pass) => {
                report.scanned += pass.retried.len() + pass.failed;
                report.advanced += pass.retried.len();
                report.failed += pass.failed;
            }
            Err(e) => {
                error!(error = %e, "Retry pass failed");
                report.failed += 1;
            }
        }

        report
    }
}

/// Handle to running sweeps.
pub struct SweepHandle {
    stop: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SweepHandle {
    /// Signal every sweep to stop and wait for in-flight passes to wind down.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Sweep task panicked");
            }
        }
        info!("Sweeps stopped");
    }
}

/// Spawn each sweep on its own interval.
pub fn spawn_sweeps(sweeps: Vec<(Arc<dyn Sweep>, Duration)>) -> SweepHandle {
    let (stop, rx) = watch::channel(false);

    let tasks = sweeps
        .into_iter()
        .map(|(sweep, interval)| {
            let mut rx = rx.clone();
            tokio::spawn(async move {
                info!(sweep = sweep.name(), interval_ms = interval.as_millis() as u64, "Sweep started");
                let signal = StopSignal(rx.clone());
                loop {
                    let report = sweep.run_once(Utc::now(), &signal).await;
                    if !report.is_idle() {
                        debug!(sweep = sweep.name(), ?report, "Sweep pass finished");
                    }
                    if signal.is_stopped() {
                        break;
                    }

                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() || *rx.borrow() {
                                break;
                            }
                        }
                        _ = sleep(interval) => {}
                    }
                }
                info!(sweep = sweep.name(), "Sweep stopped");
            })
        })
        .collect();

    SweepHandle { stop, tasks }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthorizationConfig, BreakerConfig, ExecutionConfig, TimeLockPolicy};
    use crate::breaker::CircuitBreaker;
    use crate::fixtures;
    use crate::ledger::SimulatedLedger;
    use crate::risk::StaticRiskScorer;
    use tranche_core::{AuthorizationStatus, TimeLock};
    use tranche_state::{BroadcastPublisher, InMemoryEscrowStore};

    struct Harness {
        store: Arc<InMemoryEscrowStore>,
        ledger: Arc<SimulatedLedger>,
        engine: Arc<AuthorizationEngine>,
        coordinator: Arc<PaymentCoordinator>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryEscrowStore::new());
        let ledger = Arc::new(SimulatedLedger::new());
        let publisher = Arc::new(BroadcastPublisher::new());
        let engine = Arc::new(AuthorizationEngine::new(
            store.clone(),
            Arc::new(StaticRiskScorer(0.1)),
            publisher.clone(),
            AuthorizationConfig {
                time_lock: TimeLockPolicy {
                    amount_threshold: Some(1),
                    risk_threshold: None,
                    cooldown_secs: 3_600,
                },
                ..Default::default()
            },
        ));
        let coordinator = Arc::new(PaymentCoordinator::new(
            store.clone(),
            ledger.clone(),
            publisher,
            Arc::new(CircuitBreaker::new("ledger", BreakerConfig::default())),
            ExecutionConfig {
                required_confirmations: 1,
                base_backoff_ms: 0,
                max_backoff_ms: 0,
                ..Default::default()
            },
        ));
        Harness {
            store,
            ledger,
            engine,
            coordinator,
        }
    }

    /// A time-locked request whose lock is already due.
    async fn due_locked_request(h: &Harness) -> (uuid::Uuid, TimeLock) {
        let (milestone, _) = fixtures::completed_with_escrow(h.store.as_ref(), 1_000).await;
        let request = h.engine.request_authorization(milestone.id, "test").await.unwrap();
        assert_eq!(request.status, AuthorizationStatus::TimeLocked);

        let mut lock = h.engine.time_lock(request.time_lock_id.unwrap()).await.unwrap();
        lock.release_at = Utc::now() - chrono::Duration::seconds(1);
        let lock = h.store.update_time_lock(lock, "test").await.unwrap();
        (request.id, lock)
    }

    #[tokio::test]
    async fn test_time_lock_sweep_hands_off() {
        let h = harness();
        let (request_id, _) = due_locked_request(&h).await;
        let sweep = TimeLockSweep::new(h.engine.clone(), h.coordinator.clone(), 10);

        let report = sweep.run_once(Utc::now(), &StopSignal::never()).await;
        assert_eq!(report.advanced, 1);
        let execution = h.coordinator.for_request(request_id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Submitted);

        let report = sweep.run_once(Utc::now(), &StopSignal::never()).await;
        assert_eq!(report.scanned, 0);
    }

    #[tokio::test]
    async fn test_released_lock_without_hand_off_recovers() {
        let h = harness();
        let (request_id, lock) = due_locked_request(&h).await;
        // The releasing worker stops before it hands the payment off.
        h.engine.release_time_lock(lock, "time-lock-sweep").await.unwrap().unwrap();
        assert!(h.coordinator.for_request(request_id).await.unwrap().is_none());

        let sweep = TimeLockSweep::new(h.engine.clone(), h.coordinator.clone(), 10);
        let later = Utc::now() + chrono::Duration::seconds(1);
        let report = sweep.run_once(later, &StopSignal::never()).await;
        assert_eq!(report.advanced, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(h.ledger.submit_calls(), 1);

        let execution = h.coordinator.for_request(request_id).await.unwrap().unwrap();
        assert_eq!(h.engine.get(request_id).await.unwrap().execution_id, Some(execution.id));

        let report = sweep.run_once(later, &StopSignal::never()).await;
        assert_eq!(report.scanned, 0);
        assert_eq!(h.ledger.submit_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_sweeps_release_once() {
        let h = harness();
        let (request_id, _) = due_locked_request(&h).await;
        let a = Arc::new(TimeLockSweep::new(h.engine.clone(), h.coordinator.clone(), 10));
        let b = Arc::new(TimeLockSweep::new(h.engine.clone(), h.coordinator.clone(), 10));

        let now = Utc::now();
        let (stop_a, stop_b) = (StopSignal::never(), StopSignal::never());
        let (ra, rb) = tokio::join!(
            a.run_once(now, &stop_a),
            b.run_once(now, &stop_b)
        );
        assert_eq!(ra.advanced + rb.advanced, 1);
        assert_eq!(h.ledger.submit_calls(), 1);

        let history = h.store.history(h.engine.get(request_id).await.unwrap().time_lock_id.unwrap()).await.unwrap();
        let releases = history.records.iter().filter(|r| r.to == "released").count();
        assert_eq!(releases, 1);
    }

    #[tokio::test]
    async fn test_stopped_sweep_takes_nothing() {
        let h = harness();
        due_locked_request(&h).await;
        let sweep = TimeLockSweep::new(h.engine.clone(), h.coordinator.clone(), 10);

        let (tx, rx) = watch::channel(true);
        let report = sweep.run_once(Utc::now(), &StopSignal(rx)).await;
        drop(tx);
        assert!(report.interrupted);
        assert_eq!(report.advanced, 0);
        assert_eq!(h.ledger.submit_calls(), 0);
    }

    #[tokio::test]
    async fn test_confirmation_sweep_confirms() {
        let h = harness();
        let request = fixtures::approved_request(h.store.as_ref(), 1_000).await;
        h.coordinator.execute(request.id).await.unwrap();

        let sweep = ConfirmationSweep::new(h.store.clone(), h.coordinator.clone(), 10);
        let report = sweep.run_once(Utc::now(), &StopSignal::never()).await;
        assert_eq!(report.advanced, 1);

        let execution = h.coordinator.for_request(request.id).await.unwrap().unwrap();
        assert_eq!(execution.status, ExecutionStatus::Confirmed);
    }

    #[tokio::test]
    async fn test_spawned_sweeps_shut_down() {
        let h = harness();
        let (request_id, _) = due_locked_request(&h).await;
        let sweeps: Vec<(Arc<dyn Sweep>, Duration)> = vec![
            (
                Arc::new(TimeLockSweep::new(h.engine.clone(), h.coordinator.clone(), 10)),
                Duration::from_millis(5),
            ),
            (
                Arc::new(ConfirmationSweep::new(h.store.clone(), h.coordinator.clone(), 10)),
                Duration::from_millis(5),
            ),
        ];
        let handle = spawn_sweeps(sweeps);

        let mut confirmed = false;
        for _ in 0..200 {
            if let Some(execution) = h.coordinator.for_request(request_id).await.unwrap() {
                if execution.status == ExecutionStatus::Confirmed {
                    confirmed = true;
                    break;
                }
            }
            sleep(Duration::from_millis(5)).await;
        }
        handle.shutdown().await;
        assert!(confirmed);
    }
}
