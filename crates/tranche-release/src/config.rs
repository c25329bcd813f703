//! Release configuration.
//!
//! Every section deserializes with defaults, so a partial TOML file is valid.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tranche_core::{Result, TrancheError};
use tranche_graph::GraphConfig;

/// Longest configurable wait (TTL, cooldown or confirmation timeout): ten years.
pub const MAX_WINDOW_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn window(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_WINDOW_SECS) as i64)
}

fn check_window(name: &str, secs: u64) -> Result<()> {
    if secs > MAX_WINDOW_SECS {
        return Err(TrancheError::validation(format!(
            "{} of {}s exceeds the {}s maximum",
            name, secs, MAX_WINDOW_SECS
        )));
    }
    Ok(())
}

/// Risk cut points.
///
/// `score < auto_approve` approves automatically, `score >= block` rejects,
/// anything between goes to manual review.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskThresholds {
    pub auto_approve: f64,
    pub block: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            auto_approve: 0.3,
            block: 0.8,
        }
    }
}

impl RiskThresholds {
    /// Create validated thresholds.
    pub fn new(auto_approve: f64, block: f64) -> Result<Self> {
        let thresholds = Self { auto_approve, block };
        thresholds.validate()?;
        Ok(thresholds)
    }

    pub fn validate(&self) -> Result<()> {
        let in_range = |v: f64| (0.0..=1.0).contains(&v);
        if !in_range(self.auto_approve) || !in_range(self.block) || self.auto_approve > self.block {
            return Err(TrancheError::validation(format!(
                "risk thresholds must satisfy 0 <= auto_approve ({}) <= block ({}) <= 1",
                self.auto_approve, self.block
            )));
        }
        Ok(())
    }
}

/// When an approved payment must wait before release.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeLockPolicy {
    /// Amounts at or above this (minor units) are locked. `None` disables.
    pub amount_threshold: Option<u64>,

    /// Cooldown applied to locked payments.
    pub cooldown_secs: u64,

    /// Scores at or above this are locked even below the amount threshold.
    pub risk_threshold: Option<f64>,
}

impl Default for TimeLockPolicy {
    fn default() -> Self {
        Self {
            amount_threshold: Some(1_000_000),
            cooldown_secs: 24 * 60 * 60,
            risk_threshold: None,
        }
    }
}

impl TimeLockPolicy {
    /// Returns true if a payment of `amount` scored `score` must be locked.
    pub fn requires_lock(&self, amount: u64, score: f64) -> bool {
        self.amount_threshold.map_or(false, |t| amount >= t)
            || self.risk_threshold.map_or(false, |t| score >= t)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        window(self.cooldown_secs)
    }
}

/// Authorization engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    pub thresholds: RiskThresholds,

    /// Lifetime of an unresolved request.
    pub request_ttl_secs: u64,

    /// Minimum trimmed length of a rejection reason.
    pub min_rejection_reason_len: usize,

    pub time_lock: TimeLockPolicy,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            thresholds: RiskThresholds::default(),
            request_ttl_secs: 7 * 24 * 60 * 60,
            min_rejection_reason_len: 10,
            time_lock: TimeLockPolicy::default(),
        }
    }
}

impl AuthorizationConfig {
    pub fn request_ttl(&self) -> chrono::Duration {
        window(self.request_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        self.thresholds.validate()?;
        if self.request_ttl_secs == 0 {
            return Err(TrancheError::validation("request_ttl_secs must be positive"));
        }
        check_window("request_ttl_secs", self.request_ttl_secs)?;
        check_window("time_lock.cooldown_secs", self.time_lock.cooldown_secs)?;
        if let Some(t) = self.time_lock.risk_threshold {
            if !(0.0..=1.0).contains(&t) {
                return Err(TrancheError::validation("time_lock.risk_threshold must be in [0, 1]"));
            }
        }
        Ok(())
    }
}

/// Payment execution configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Ledger inclusion depth at which a payment counts as confirmed.
    pub required_confirmations: u32,

    /// Automatic retries before dead-lettering.
    pub max_retries: u32,

    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,

    /// Interval between confirmation polls when monitoring one execution.
    pub poll_interval_ms: u64,

    /// How long a submitted payment may stay unconfirmed.
    pub confirmation_timeout_secs: u64,

    /// Deadline for every individual ledger call.
    pub ledger_call_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            required_confirmations: 3,
            max_retries: 3,
            base_backoff_ms: 200,
            max_backoff_ms: 30_000,
            poll_interval_ms: 1_000,
            confirmation_timeout_secs: 600,
            ledger_call_timeout_ms: 5_000,
        }
    }
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ledger_call_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_call_timeout_ms)
    }

    pub fn confirmation_timeout(&self) -> chrono::Duration {
        window(self.confirmation_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.required_confirmations == 0 {
            return Err(TrancheError::validation("required_confirmations must be at least 1"));
        }
        if self.base_backoff_ms > self.max_backoff_ms {
            return Err(TrancheError::validation("base_backoff_ms must not exceed max_backoff_ms"));
        }
        if self.ledger_call_timeout_ms == 0 {
            return Err(TrancheError::validation("ledger_call_timeout_ms must be positive"));
        }
        check_window("confirmation_timeout_secs", self.confirmation_timeout_secs)?;
        Ok(())
    }
}

/// Circuit breaker configuration for the ledger dependency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,

    /// Failures further apart than this do not count as consecutive.
    pub failure_window_secs: u64,

    /// Time the breaker stays open before allowing a trial call.
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

/// Background sweep configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub time_lock_interval_ms: u64,
    pub confirmation_interval_ms: u64,

    /// Maximum items a sweep pass takes.
    pub batch_size: usize,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            time_lock_interval_ms: 1_000,
            confirmation_interval_ms: 2_000,
            batch_size: 100,
        }
    }
}

impl SweepConfig {
    pub fn time_lock_interval(&self) -> Duration {
        Duration::from_millis(self.time_lock_interval_ms)
    }

    pub fn confirmation_interval(&self) -> Duration {
        Duration::from_millis(self.confirmation_interval_ms)
    }
}

/// All release-side configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReleaseConfig {
    pub graph: GraphConfig,
    pub authorization: AuthorizationConfig,
    pub execution: ExecutionConfig,
    pub breaker: BreakerConfig,
    pub sweep: SweepConfig,
}

impl ReleaseConfig {
    pub fn validate(&self) -> Result<()> {
        self.authorization.validate()?;
        self.execution.validate()?;
        if self.breaker.failure_threshold == 0 {
            return Err(TrancheError::validation("breaker.failure_threshold must be at least 1"));
        }
        if self.sweep.batch_size == 0 {
            return Err(TrancheError::validation("sweep.batch_size must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        ReleaseConfig::default().validate().unwrap();
    }

    #[test]
    fn test_threshold_validation() {
        assert!(RiskThresholds::new(0.2, 0.9).is_ok());
        assert!(RiskThresholds::new(0.9, 0.2).is_err());
        assert!(RiskThresholds::new(-0.1, 0.5).is_err());
        assert!(RiskThresholds::new(0.5, 1.5).is_err());
    }

    #[test]
    fn test_time_lock_policy() {
        let policy = TimeLockPolicy {
            amount_threshold: Some(1_000),
            cooldown_secs: 60,
            risk_threshold: Some(0.5),
        };
        assert!(policy.requires_lock(1_000, 0.0));
        assert!(policy.requires_lock(10, 0.6));
        assert!(!policy.requires_lock(999, 0.1));

        let disabled = TimeLockPolicy {
            amount_threshold: None,
            risk_threshold: None,
            ..policy
        };
        assert!(!disabled.requires_lock(u64::MAX, 1.0));
    }

    #[test]
    fn test_windows_are_bounded() {
        let mut config = ReleaseConfig::default();
        config.authorization.time_lock.cooldown_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(TrancheError::Validation { .. })));
        assert_eq!(
            config.authorization.time_lock.cooldown().num_seconds(),
            MAX_WINDOW_SECS as i64
        );

        let mut config = ReleaseConfig::default();
        config.authorization.request_ttl_secs = MAX_WINDOW_SECS + 1;
        assert!(config.validate().is_err());

        let mut config = ReleaseConfig::default();
        config.execution.confirmation_timeout_secs = u64::MAX;
        assert!(config.validate().is_err());
        assert_eq!(
            config.execution.confirmation_timeout().num_seconds(),
            MAX_WINDOW_SECS as i64
        );
    }
}
