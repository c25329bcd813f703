//! Node configuration.
//!
//! Loaded from an optional TOML file, then overridden from the command line.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tranche_core::TrancheError;
use tranche_release::{AmountRiskScorer, ReleaseConfig, RiskScorer, SimulatedLedger, StaticRiskScorer};

/// Configuration loading failures.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(#[from] TrancheError),
}

/// Simulated ledger settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerSettings {
    /// Depth gained per confirmation query.
    pub confirmations_per_poll: u32,
    /// Artificial latency per call.
    pub latency_ms: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            confirmations_per_poll: 1,
            latency_ms: 0,
        }
    }
}

impl LedgerSettings {
    pub fn build(&self) -> SimulatedLedger {
        let ledger = SimulatedLedger::new().with_confirmations_per_poll(self.confirmations_per_poll);
        if self.latency_ms > 0 {
            ledger.with_latency(Duration::from_millis(self.latency_ms))
        } else {
            ledger
        }
    }
}

/// Which risk model scores requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum RiskSettings {
    /// Every request gets the same score.
    Static { score: f64 },
    /// Score grows with amount and repeat requests.
    Amount {
        ceiling: u64,
        repeat_penalty: f64,
        off_hours_penalty: f64,
    },
}

impl Default for RiskSettings {
    fn default() -> Self {
        let scorer = AmountRiskScorer::default();
        RiskSettings::Amount {
            ceiling: scorer.ceiling,
            repeat_penalty: scorer.repeat_penalty,
            off_hours_penalty: scorer.off_hours_penalty,
        }
    }
}

impl RiskSettings {
    pub fn build(&self) -> Arc<dyn RiskScorer> {
        match self {
            RiskSettings::Static { score } => Arc::new(StaticRiskScorer(*score)),
            RiskSettings::Amount {
                ceiling,
                repeat_penalty,
                off_hours_penalty,
            } => Arc::new(AmountRiskScorer {
                ceiling: *ceiling,
                repeat_penalty: *repeat_penalty,
                off_hours_penalty: *off_hours_penalty,
            }),
        }
    }
}

/// Top-level node configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub listen: SocketAddr,
    pub log_level: String,
    pub json_logs: bool,
    pub release: ReleaseConfig,
    pub ledger: LedgerSettings,
    pub risk: RiskSettings,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 3000)),
            log_level: "info".to_string(),
            json_logs: false,
            release: ReleaseConfig::default(),
            ledger: LedgerSettings::default(),
            risk: RiskSettings::default(),
        }
    }
}

impl NodeConfig {
    /// Load from `path`, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                Self::from_toml(&raw).map_err(|e| match e {
                    ConfigError::Parse { source, .. } => ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    },
                    other => other,
                })?
            }
            None => Self::default(),
        };
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let config: NodeConfig = toml::from_str(raw).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.release.validate()?;
        if let RiskSettings::Static { score } = self.risk {
            if !(0.0..=1.0).contains(&score) {
                return Err(TrancheError::validation(format!("static risk score {} is outside [0, 1]", score)).into());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = NodeConfig::load(None).unwrap();
        assert_eq!(config.listen.port(), 3000);
        config.validate().unwrap();
    }

    #[test]
    fn test_partial_toml() {
        let config = NodeConfig::from_toml(
            r#"
            listen = "127.0.0.1:8080"
            json_logs = true

            [release.authorization.thresholds]
            auto_approve = 0.2
            block = 0.9

            [release.execution]
            max_retries = 5

            [risk]
            model = "static"
            score = 0.1
            "#,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 8080);
        assert!(config.json_logs);
        assert_eq!(config.release.authorization.thresholds.auto_approve, 0.2);
        assert_eq!(config.release.execution.max_retries, 5);
        assert_eq!(config.release.execution.required_confirmations, 3);
        assert_eq!(config.risk, RiskSettings::Static { score: 0.1 });
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let err = NodeConfig::from_toml(
            r#"
            [release.authorization.thresholds]
            auto_approve = 0.9
            block = 0.2
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = NodeConfig::load(Some(Path::new("/nonexistent/tranche.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
