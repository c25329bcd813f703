//! Risk scoring collaborator and thresholding.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tranche_core::{AuthorizationStatus, Result, TrancheError};
use uuid::Uuid;

use crate::config::RiskThresholds;

/// Inputs handed to the risk model. The model treats them as opaque.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskContext {
    pub contract_id: Uuid,
    pub milestone_id: Uuid,
    pub escrow_id: Uuid,
    pub amount: u64,
    pub currency: String,
    pub requested_at: DateTime<Utc>,
    /// Earlier payout requests for the same milestone.
    pub prior_requests: usize,
}

/// External risk model.
#[async_trait]
pub trait RiskScorer: Send + Sync {
    /// Score a payout in [0, 1]; higher is riskier.
    async fn score(&self, context: &RiskContext) -> Result<f64>;
}

/// Outcome of comparing a score with the thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    AutoApprove,
    ManualReview,
    Block,
}

impl RiskClass {
    /// Status a freshly evaluated request moves to.
    pub fn status(&self) -> AuthorizationStatus {
        match self {
            RiskClass::AutoApprove => AuthorizationStatus::AutoApproved,
            RiskClass::ManualReview => AuthorizationStatus::ManualReviewRequired,
            RiskClass::Block => AuthorizationStatus::Rejected,
        }
    }
}

/// Classify a score.
pub fn classify(score: f64, thresholds: &RiskThresholds) -> RiskClass {
    if score < thresholds.auto_approve {
        RiskClass::AutoApprove
    } else if score < thresholds.block {
        RiskClass::ManualReview
    } else {
        RiskClass::Block
    }
}

/// Reject scores a model should never produce.
pub fn check_score(score: f64) -> Result<f64> {
    if score.is_nan() || !(0.0..=1.0).contains(&score) {
        return Err(TrancheError::validation(format!(
            "risk score {} is outside [0, 1]",
            score
        )));
    }
    Ok(score)
}

/// Scorer returning a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct StaticRiskScorer(pub f64);

#[async_trait]
impl RiskScorer for StaticRiskScorer {
    async fn score(&self, _context: &RiskContext) -> Result<f64> {
        Ok(self.0)
    }
}

/// Heuristic scorer for development deployments.
///
/// Scales with amount relative to `ceiling`, adds a penalty for repeat
/// requests on the same milestone and for requests made outside business
/// hours (UTC).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmountRiskScorer {
    /// Amount (minor units) that alone scores 0.7.
    pub ceiling: u64,
    pub repeat_penalty: f64,
    pub off_hours_penalty: f64,
}

impl Default for AmountRiskScorer {
    fn default() -> Self {
        Self {
            ceiling: 10_000_000,
            repeat_penalty: 0.15,
            off_hours_penalty: 0.1,
        }
    }
}

#[async_trait]
impl RiskScorer for AmountRiskScorer {
    async fn score(&self, context: &RiskContext) -> Result<f64> {
        let ceiling = self.ceiling.max(1) as f64;
        let amount = (context.amount as f64 / ceiling).min(1.0) * 0.7;
        let repeats = context.prior_requests.min(2) as f64 * self.repeat_penalty;
        let hour = context.requested_at.hour();
        let off_hours = if (8..20).contains(&hour) {
            0.0
        } else {
            self.off_hours_penalty
        };
        Ok((amount + repeats + off_hours).clamp(0.0, 1.0))
    }
}
