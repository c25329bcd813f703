//! Dependency graph construction, validation and topological ordering.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use tranche_core::{
    Milestone, MilestoneDependency, MilestoneStatus, Result, TrancheError, MAX_DURATION_SECS,
};
use uuid::Uuid;

use crate::schedule::Schedule;

/// Limits applied when building a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Maximum number of milestones in one contract.
    pub max_milestones: usize,

    /// Maximum number of predecessors of one milestone.
    pub max_dependencies: usize,

    /// Longest scheduling duration of one milestone, in seconds.
    pub max_duration_secs: i64,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_milestones: 1_000,
            max_dependencies: 64,
            max_duration_secs: MAX_DURATION_SECS,
        }
    }
}

/// The milestone DAG of one contract.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    contract_id: Uuid,
    milestones: HashMap<Uuid, Milestone>,
    successors: HashMap<Uuid, Vec<Uuid>>,
}

/// Result of validating a graph: its order and schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphAnalysis {
    pub contract_id: Uuid,
    pub order: Vec<Uuid>,
    pub schedule: Schedule,
}

/// Entry in Kahn's ready set, ordered so the earliest-created milestone
/// (then smallest id) pops first.
#[derive(PartialEq, Eq)]
struct Ready {
    created_at: DateTime<Utc>,
    id: Uuid,
}

impl Ord for Ready {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed for min-heap behavior on BinaryHeap.
        other
            .created_at
            .cmp(&self.created_at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ready {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl DependencyGraph {
    /// Build the graph of `contract_id` from its milestones.
    ///
    /// Fails on foreign-contract milestones, duplicate ids, unknown
    /// predecessors or size limits. Cycles are reported by
    /// [`topological_order`](Self::topological_order).
    pub fn build(contract_id: Uuid, milestones: &[Milestone], config: &GraphConfig) -> Result<Self> {
        if milestones.len() > config.max_milestones {
            return Err(TrancheError::validation(format!(
                "contract {} has {} milestones, limit is {}",
                contract_id,
                milestones.len(),
                config.max_milestones
            )));
        }

        let mut by_id: HashMap<Uuid, Milestone> = HashMap::with_capacity(milestones.len());
        for m in milestones {
            if m.contract_id != contract_id {
                return Err(TrancheError::validation(format!(
                    "milestone {} belongs to contract {}, not {}",
                    m.id, m.contract_id, contract_id
                )));
            }
            let span = m
                .estimated_duration_secs
                .unwrap_or_else(|| (m.due_date - m.created_at).num_seconds());
            if span > config.max_duration_secs {
                return Err(TrancheError::validation(format!(
                    "milestone {} lasts {}s, limit is {}s",
                    m.id, span, config.max_duration_secs
                )));
            }
            if by_id.insert(m.id, m.clone()).is_some() {
                return Err(TrancheError::validation(format!("duplicate milestone {}", m.id)));
            }
        }

        let mut successors: HashMap<Uuid, Vec<Uuid>> =
            by_id.keys().map(|id| (*id, Vec::new())).collect();

        for m in milestones {
            if m.depends_on.len() > config.max_dependencies {
                return Err(TrancheError::validation(format!(
                    "milestone {} has {} predecessors, limit is {}",
                    m.id,
                    m.depends_on.len(),
                    config.max_dependencies
                )));
            }
            for pred in &m.depends_on {
                if *pred == m.id {
                    return Err(TrancheError::validation(format!(
                        "milestone {} depends on itself",
                        m.id
                    )));
                }
                match successors.get_mut(pred) {
                    Some(succ) => succ.push(m.id),
                    None => {
                        return Err(TrancheError::validation(format!(
                            "milestone {} depends on unknown milestone {}",
                            m.id, pred
                        )))
                    }
                }
            }
        }

        Ok(Self {
            contract_id,
            milestones: by_id,
            successors,
        })
    }

    pub fn contract_id(&self) -> Uuid {
        self.contract_id
    }

    pub fn len(&self) -> usize {
        self.milestones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.milestones.is_empty()
    }

    pub fn milestone(&self, id: Uuid) -> Option<&Milestone> {
        self.milestones.get(&id)
    }

    /// Direct successors of a milestone.
    pub fn successors(&self, id: Uuid) -> &[Uuid] {
        self.successors.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Direct predecessors of a milestone.
    pub fn predecessors(&self, id: Uuid) -> &[Uuid] {
        self.milestones
            .get(&id)
            .map(|m| m.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// All edges of the graph.
    pub fn edges(&self) -> Vec<MilestoneDependency> {
        let mut edges: Vec<MilestoneDependency> = self
            .milestones
            .values()
            .flat_map(|m| m.dependencies())
            .collect();
        edges.sort_by_key(|e| (e.from, e.to));
        edges
    }

    /// Deterministic topological order using Kahn's algorithm.
    ///
    /// Ties among ready milestones break by creation time, then id.
    pub fn topological_order(&self) -> Result<Vec<Uuid>> {
        let mut in_degree: HashMap<Uuid, usize> = self
            .milestones
            .values()
            .map(|m| (m.id, m.depends_on.len()))
            .collect();

        let mut ready: BinaryHeap<Ready> = self
            .milestones
            .values()
            .filter(|m| m.depends_on.is_empty())
            .map(|m| Ready {
                created_at: m.created_at,
                id: m.id,
            })
            .collect();

        let mut order = Vec::with_capacity(self.milestones.len());
        while let Some(Ready { id, .. }) = ready.pop() {
            order.push(id);
            for succ in self.successors(id) {
                if let Some(degree) = in_degree.get_mut(succ) {
                    *degree -= 1;
                    if *degree == 0 {
                        if let Some(m) = self.milestones.get(succ) {
                            ready.push(Ready {
                                created_at: m.created_at,
                                id: m.id,
                            });
                        }
                    }
                }
            }
        }

        if order.len() < self.milestones.len() {
            let emitted: HashSet<Uuid> = order.iter().copied().collect();
            let cycle = self.find_cycle(&emitted);
            let milestone_id = cycle.first().copied().unwrap_or_default();
            warn!(
                contract_id = %self.contract_id,
                milestone_id = %milestone_id,
                "Circular dependency detected"
            );
            return Err(TrancheError::CircularDependency {
                contract_id: self.contract_id,
                milestone_id,
                cycle,
            });
        }

        debug!(contract_id = %self.contract_id, milestones = order.len(), "Topological order computed");
        Ok(order)
    }

    /// Extract one cycle among milestones Kahn could not emit.
    ///
    /// Every unemitted milestone has an unemitted predecessor, so walking
    /// predecessors must revisit a node; the revisited suffix is a cycle.
    fn find_cycle(&self, emitted: &HashSet<Uuid>) -> Vec<Uuid> {
        let start = self
            .milestones
            .values()
            .filter(|m| !emitted.contains(&m.id))
            .min_by_key(|m| (m.created_at, m.id))
            .map(|m| m.id);

        let Some(mut current) = start else {
            return Vec::new();
        };

        let mut path: Vec<Uuid> = Vec::new();
        let mut seen: HashMap<Uuid, usize> = HashMap::new();
        loop {
            if let Some(&pos) = seen.get(&current) {
                let mut cycle = path.split_off(pos);
                // Walked against edge direction; flip to dependency order.
                cycle.reverse();
                return cycle;
            }
            seen.insert(current, path.len());
            path.push(current);

            let next = self
                .predecessors(current)
                .iter()
                .find(|p| !emitted.contains(p))
                .copied();
            match next {
                Some(p) => current = p,
                None => return path,
            }
        }
    }

    /// Validate the graph and compute its schedule.
    pub fn analyze(&self) -> Result<GraphAnalysis> {
        let order = self.topological_order()?;
        let schedule = Schedule::compute(self, &order);
        Ok(GraphAnalysis {
            contract_id: self.contract_id,
            order,
            schedule,
        })
    }

    /// Milestones that are not finished and whose predecessors are all completed.
    pub fn ready_milestones(&self) -> Vec<Uuid> {
        let mut ready: Vec<&Milestone> = self
            .milestones
            .values()
            .filter(|m| !m.status.is_terminal())
            .filter(|m| {
                m.depends_on.iter().all(|p| {
                    self.milestones
                        .get(p)
                        .map_or(false, |pm| pm.status == MilestoneStatus::Completed)
                })
            })
            .collect();
        ready.sort_by_key(|m| (m.created_at, m.id));
        ready.into_iter().map(|m| m.id).collect()
    }

    /// Fail with the first unmet predecessor of `milestone_id`.
    pub fn check_dependencies_satisfied(&self, milestone_id: Uuid) -> Result<()> {
        let milestone = self
            .milestones
            .get(&milestone_id)
            .ok_or_else(|| TrancheError::not_found("milestone", milestone_id))?;
        ensure_predecessors_completed(milestone, |id| self.milestones.get(&id).map(|m| m.status))
    }
}

/// Fail with [`TrancheError::DependencyNotSatisfied`] naming the first
/// predecessor, in `depends_on` order, that is not completed. A predecessor
/// the lookup cannot find counts as unmet.
pub fn ensure_predecessors_completed<F>(milestone: &Milestone, status_of: F) -> Result<()>
where
    F: Fn(Uuid) -> Option<MilestoneStatus>,
{
    for pred in &milestone.depends_on {
        if status_of(*pred) != Some(MilestoneStatus::Completed) {
            return Err(TrancheError::DependencyNotSatisfied {
                milestone_id: milestone.id,
                predecessor_id: *pred,
            });
        }
    }
    Ok(())
}
