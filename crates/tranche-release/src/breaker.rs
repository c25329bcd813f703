//! Circuit breaker for the ledger dependency.
//!
//! One breaker is shared by the sweeps and foreground calls, so state lives
//! behind a mutex that is never held across an await.

use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tranche_core::LedgerError;

use crate::config::BreakerConfig;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls fail fast.
    Open,
    /// One trial call is allowed through.
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    first_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

/// A closed/open/half-open circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                first_failure_at: None,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The guarded data stays consistent even if a holder panicked.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker past its cooldown reports HalfOpen.
    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(at)) if at.elapsed() >= self.config.cooldown() => {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Returns true if a call may proceed. In half-open only one caller wins.
    pub fn allow_request(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.config.cooldown());
                if cooled {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    info!(breaker = %self.name, "Circuit half-open, allowing a trial call");
                }
                cooled
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Closed {
            info!(breaker = %self.name, "Circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.first_failure_at = None;
        inner.opened_at = None;
        inner.trial_in_flight = false;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        let now = Instant::now();

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.opened_at = Some(now);
                inner.trial_in_flight = false;
                warn!(breaker = %self.name, "Trial call failed, circuit reopened");
            }
            CircuitState::Open => {}
            CircuitState::Closed => {
                let in_window = inner
                    .first_failure_at
                    .map_or(false, |at| now.duration_since(at) <= self.config.failure_window());
                if in_window {
                    inner.consecutive_failures += 1;
                } else {
                    inner.consecutive_failures = 1;
                    inner.first_failure_at = Some(now);
                }

                if inner.consecutive_failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(now);
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        self.record_success();
    }

    /// Run `call` through the breaker.
    ///
    /// Only transient failures count against the dependency; a terminal
    /// rejection means the ledger answered.
    pub async fn call<T, F>(&self, call: F) -> Result<T, LedgerError>
    where
        F: Future<Output = Result<T, LedgerError>>,
    {
        if !self.allow_request() {
            return Err(LedgerError::circuit_open(format!("circuit '{}' is open", self.name)));
        }

        let result = call.await;
        match &result {
            Err(e) if e.is_transient() => self.record_failure(),
            _ => self.record_success(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tranche_core::LedgerErrorKind;

    fn breaker(threshold: u32, cooldown_secs: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "ledger",
            BreakerConfig {
                failure_threshold: threshold,
                failure_window_secs: 60,
                cooldown_secs,
            },
        )
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = breaker(3, 60);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.allow_request());
    }

    #[test]
    fn test_success_resets_count() {
        let cb = breaker(2, 60);
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_single_trial() {
        let cb = breaker(1, 0);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        assert!(cb.allow_request());
        assert!(!cb.allow_request());

        cb.record_failure();
        assert!(cb.allow_request());
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.allow_request());
        assert!(cb.allow_request());
    }

    #[tokio::test]
    async fn test_call_short_circuits() {
        let cb = breaker(1, 60);
        let err = cb
            .call(async { Err::<(), _>(LedgerError::network("down")) })
            .await
            .unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::Network);

        let err = cb.call(async { Ok::<_, LedgerError>(1) }).await.unwrap_err();
        assert_eq!(err.kind, LedgerErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn test_terminal_errors_do_not_trip() {
        let cb = breaker(1, 60);
        let _ = cb
            .call(async {
                Err::<(), _>(LedgerError::new(LedgerErrorKind::InsufficientFunds, "empty"))
            })
            .await;
        assert_eq!(cb.state(), CircuitState::Closed);
    }
}
