//! Milestone types and builder.
//!
//! A Milestone is one contractual deliverable. Milestones of the same contract
//! form a dependency DAG through `depends_on`.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, TrancheError};
use crate::types::{DependencyType, MilestoneStatus};

/// Longest duration a milestone may declare: one hundred years, in seconds.
/// Keeps every schedule offset inside the `DateTime<Utc>` range.
pub const MAX_DURATION_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// A contract milestone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Milestone {
    /// Unique identifier for this milestone.
    pub id: Uuid,

    /// The contract this milestone belongs to.
    pub contract_id: Uuid,

    /// Human-readable name.
    pub name: String,

    /// Predecessors that must be completed first, in declaration order.
    pub depends_on: Vec<Uuid>,

    /// Current status.
    pub status: MilestoneStatus,

    /// Percent progress (0 to 100).
    pub progress: u8,

    /// When the milestone is due.
    pub due_date: DateTime<Utc>,

    /// Optional explicit duration estimate used for scheduling, in seconds.
    pub estimated_duration_secs: Option<i64>,

    /// When the milestone was created.
    pub created_at: DateTime<Utc>,

    /// When the milestone was completed.
    pub completed_at: Option<DateTime<Utc>>,

    /// Storage version, bumped on every persisted change.
    #[serde(default)]
    pub version: u64,
}

/// A directed edge `from -> to`: `to` cannot start until `from` finishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MilestoneDependency {
    pub from: Uuid,
    pub to: Uuid,
    #[serde(default)]
    pub dependency_type: DependencyType,
}

impl Milestone {
    /// Create a new milestone builder.
    pub fn builder() -> MilestoneBuilder {
        MilestoneBuilder::new()
    }

    /// Scheduling duration in seconds: the explicit estimate if present,
    /// otherwise the span from creation to due date. Clamped to
    /// `0..=MAX_DURATION_SECS`.
    pub fn duration_secs(&self) -> i64 {
        self.estimated_duration_secs
            .unwrap_or_else(|| (self.due_date - self.created_at).num_seconds())
            .clamp(0, MAX_DURATION_SECS)
    }

    /// Returns true if the milestone is completed.
    pub fn is_completed(&self) -> bool {
        self.status == MilestoneStatus::Completed
    }

    /// Incoming dependency edges of this milestone.
    pub fn dependencies(&self) -> Vec<MilestoneDependency> {
        self.depends_on
            .iter()
            .map(|from| MilestoneDependency {
                from: *from,
                to: self.id,
                dependency_type: DependencyType::FinishToStart,
            })
            .collect()
    }

    /// Returns true if the milestone is past due and not finished.
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && self.status != MilestoneStatus::Overdue && now > self.due_date
    }

    /// Move to `to`, enforcing the state machine.
    ///
    /// Predecessor checks are the caller's job; they need the rest of the graph.
    pub fn transition(&mut self, to: MilestoneStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(TrancheError::InvalidTransition {
                entity: "milestone",
                id: self.id,
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        self.status = to;
        if to == MilestoneStatus::Completed {
            self.progress = 100;
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// Builder for creating Milestones with a fluent API.
#[derive(Debug, Default)]
pub struct MilestoneBuilder {
    id: Option<Uuid>,
    contract_id: Option<Uuid>,
    name: Option<String>,
    depends_on: Vec<Uuid>,
    due_date: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    estimated_duration_secs: Option<i64>,
}

impl MilestoneBuilder {
    /// Create a new MilestoneBuilder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fixed identifier instead of a random one.
    pub fn id(mut self, id: Uuid) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the owning contract.
    pub fn contract(mut self, contract_id: Uuid) -> Self {
        self.contract_id = Some(contract_id);
        self
    }

    /// Set the milestone name.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a predecessor.
    pub fn depends_on(mut self, predecessor: Uuid) -> Self {
        self.depends_on.push(predecessor);
        self
    }

    /// Set the due date.
    pub fn due(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    /// Set the due date relative to the creation time.
    pub fn due_in(mut self, duration: Duration) -> Self {
        let created = *self.created_at.get_or_insert_with(Utc::now);
        self.due_date = Some(created + duration);
        self
    }

    /// Override the creation timestamp.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Set an explicit duration estimate.
    pub fn estimate(mut self, duration: Duration) -> Self {
        self.estimated_duration_secs = Some(duration.num_seconds());
        self
    }

    /// Set an explicit duration estimate in seconds, as received on the wire.
    pub fn estimate_secs(mut self, secs: i64) -> Self {
        self.estimated_duration_secs = Some(secs);
        self
    }

    /// Build the milestone.
    pub fn build(self) -> Result<Milestone> {
        let contract_id = self
            .contract_id
            .ok_or_else(|| TrancheError::validation("milestone contract is required"))?;

        let name = self.name.unwrap_or_default();
        if name.trim().is_empty() {
            return Err(TrancheError::validation("milestone name is required"));
        }

        let created_at = self.created_at.unwrap_or_else(Utc::now);
        let due_date = self
            .due_date
            .ok_or_else(|| TrancheError::validation("milestone due date is required"))?;
        if due_date < created_at {
            return Err(TrancheError::validation(format!(
                "milestone '{}' is due before it was created",
                name
            )));
        }

        if let Some(secs) = self.estimated_duration_secs {
            if secs < 0 {
                return Err(TrancheError::validation("duration estimate must not be negative"));
            }
            if secs > MAX_DURATION_SECS {
                return Err(TrancheError::validation(format!(
                    "duration estimate of {}s exceeds the {}s maximum",
                    secs, MAX_DURATION_SECS
                )));
            }
        }

        let id = self.id.unwrap_or_else(Uuid::new_v4);
        let mut depends_on: Vec<Uuid> = Vec::with_capacity(self.depends_on.len());
        for dep in self.depends_on {
            if dep == id {
                return Err(TrancheError::validation(format!(
                    "milestone {} cannot depend on itself",
                    id
                )));
            }
            if !depends_on.contains(&dep) {
                depends_on.push(dep);
            }
        }

        Ok(Milestone {
            id,
            contract_id,
            name,
            depends_on,
            status: MilestoneStatus::Pending,
            progress: 0,
            due_date,
            estimated_duration_secs: self.estimated_duration_secs,
            created_at,
            completed_at: None,
            version: 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let contract = Uuid::new_v4();
        let m = Milestone::builder()
            .contract(contract)
            .name("foundation")
            .due_in(Duration::days(10))
            .build()
            .unwrap();

        assert_eq!(m.status, MilestoneStatus::Pending);
        assert_eq!(m.progress, 0);
        assert_eq!(m.duration_secs(), Duration::days(10).num_seconds());
        assert!(m.depends_on.is_empty());
    }

    #[test]
    fn test_estimate_overrides_due_span() {
        let m = Milestone::builder()
            .contract(Uuid::new_v4())
            .name("framing")
            .due_in(Duration::days(10))
            .estimate(Duration::days(3))
            .build()
            .unwrap();
        assert_eq!(m.duration_secs(), Duration::days(3).num_seconds());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let id = Uuid::new_v4();
        let result = Milestone::builder()
            .id(id)
            .contract(Uuid::new_v4())
            .name("loop")
            .depends_on(id)
            .due_in(Duration::days(1))
            .build();
        assert!(matches!(result, Err(TrancheError::Validation { .. })));
    }

    #[test]
    fn test_duplicate_dependencies_collapsed() {
        let a = Uuid::new_v4();
        let m = Milestone::builder()
            .contract(Uuid::new_v4())
            .name("roof")
            .depends_on(a)
            .depends_on(a)
            .due_in(Duration::days(1))
            .build()
            .unwrap();
        assert_eq!(m.depends_on, vec![a]);
        assert_eq!(m.dependencies().len(), 1);
        assert_eq!(m.dependencies()[0].to, m.id);
    }

    #[test]
    fn test_oversized_estimate_rejected() {
        let result = Milestone::builder()
            .contract(Uuid::new_v4())
            .name("forever")
            .due_in(Duration::days(1))
            .estimate_secs(10_000_000_000_000)
            .build();
        assert!(matches!(result, Err(TrancheError::Validation { .. })));

        let m = Milestone::builder()
            .contract(Uuid::new_v4())
            .name("century")
            .due_in(Duration::days(1))
            .estimate_secs(MAX_DURATION_SECS)
            .build()
            .unwrap();
        assert_eq!(m.duration_secs(), MAX_DURATION_SECS);
    }

    #[test]
    fn test_stored_duration_clamped() {
        let mut m = Milestone::builder()
            .contract(Uuid::new_v4())
            .name("imported")
            .due_in(Duration::days(1))
            .build()
            .unwrap();
        m.estimated_duration_secs = Some(i64::MAX);
        assert_eq!(m.duration_secs(), MAX_DURATION_SECS);
    }

    #[test]
    fn test_due_before_created_rejected() {
        let now = Utc::now();
        let result = Milestone::builder()
            .contract(Uuid::new_v4())
            .name("late")
            .created_at(now)
            .due(now - Duration::days(1))
            .build();
        assert!(result.is_err());
    }
}
