//! Critical Path Method scheduling.
//!
//! Each milestone is an activity whose duration is its explicit estimate or
//! the span from creation to due date. Offsets are seconds from the project
//! start (the earliest milestone creation). These computations annotate;
//! they never change milestone state.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tranche_core::MilestoneStatus;
use uuid::Uuid;

use crate::resolver::DependencyGraph;

/// CPM figures for one milestone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleEntry {
    pub milestone_id: Uuid,
    pub duration_secs: i64,
    pub earliest_start_secs: i64,
    pub earliest_finish_secs: i64,
    pub latest_start_secs: i64,
    pub latest_finish_secs: i64,
    /// `latest_finish - earliest_finish`. Never negative.
    pub slack_secs: i64,
    /// Zero slack.
    pub critical: bool,
    pub earliest_start: DateTime<Utc>,
    pub earliest_finish: DateTime<Utc>,
}

/// CPM schedule of a contract.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub project_start: DateTime<Utc>,
    pub project_duration_secs: i64,
    /// Entries in topological order.
    pub entries: Vec<ScheduleEntry>,
    /// One start-to-finish chain of zero-slack milestones.
    pub critical_path: Vec<Uuid>,
}

impl Schedule {
    /// Run the forward and backward passes over `order`, which must be a
    /// topological order of `graph`.
    pub fn compute(graph: &DependencyGraph, order: &[Uuid]) -> Self {
        let project_start = order
            .iter()
            .filter_map(|id| graph.milestone(*id))
            .map(|m| m.created_at)
            .min()
            .unwrap_or_else(Utc::now);

        let duration: HashMap<Uuid, i64> = order
            .iter()
            .filter_map(|id| graph.milestone(*id).map(|m| (*id, m.duration_secs())))
            .collect();
        let dur = |id: &Uuid| duration.get(id).copied().unwrap_or(0);

        // Forward pass.
        let mut es: HashMap<Uuid, i64> = HashMap::with_capacity(order.len());
        let mut ef: HashMap<Uuid, i64> = HashMap::with_capacity(order.len());
        for id in order {
            let start = graph
                .predecessors(*id)
                .iter()
                .filter_map(|p| ef.get(p))
                .copied()
                .max()
                .unwrap_or(0);
            es.insert(*id, start);
            ef.insert(*id, start.saturating_add(dur(id)));
        }
        let project_duration_secs = ef.values().copied().max().unwrap_or(0);

        // Backward pass.
        let mut ls: HashMap<Uuid, i64> = HashMap::with_capacity(order.len());
        let mut lf: HashMap<Uuid, i64> = HashMap::with_capacity(order.len());
        for id in order.iter().rev() {
            let finish = graph
                .successors(*id)
                .iter()
                .filter_map(|s| ls.get(s))
                .copied()
                .min()
                .unwrap_or(project_duration_secs);
            lf.insert(*id, finish);
            ls.insert(*id, finish.saturating_sub(dur(id)));
        }

        let entries: Vec<ScheduleEntry> = order
            .iter()
            .map(|id| {
                let slack = lf[id].saturating_sub(ef[id]).max(0);
                ScheduleEntry {
                    milestone_id: *id,
                    duration_secs: dur(id),
                    earliest_start_secs: es[id],
                    earliest_finish_secs: ef[id],
                    latest_start_secs: ls[id],
                    latest_finish_secs: lf[id],
                    slack_secs: slack,
                    critical: slack == 0,
                    earliest_start: offset(project_start, es[id]),
                    earliest_finish: offset(project_start, ef[id]),
                }
            })
            .collect();

        let critical_path = trace_critical_path(graph, &entries);

        Self {
            project_start,
            project_duration_secs,
            entries,
            critical_path,
        }
    }

    /// Look up the entry of a milestone.
    pub fn entry(&self, milestone_id: Uuid) -> Option<&ScheduleEntry> {
        self.entries.iter().find(|e| e.milestone_id == milestone_id)
    }

    /// All zero-slack milestones, in topological order.
    pub fn critical_milestones(&self) -> Vec<Uuid> {
        self.entries
            .iter()
            .filter(|e| e.critical)
            .map(|e| e.milestone_id)
            .collect()
    }

    pub fn project_finish(&self) -> DateTime<Utc> {
        offset(self.project_start, self.project_duration_secs)
    }
}

/// `start + secs`, pinned to the representable range instead of overflowing.
fn offset(start: DateTime<Utc>, secs: i64) -> DateTime<Utc> {
    Duration::try_seconds(secs)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(if secs < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

/// Follow zero-slack milestones from a critical root, always stepping to a
/// critical successor that starts exactly when the current one finishes.
fn trace_critical_path(graph: &DependencyGraph, entries: &[ScheduleEntry]) -> Vec<Uuid> {
    let Some(mut current) = entries
        .iter()
        .find(|e| e.critical && e.earliest_start_secs == 0)
    else {
        return Vec::new();
    };

    let mut path = vec![current.milestone_id];
    while let Some(next) = entries.iter().find(|e| {
        e.critical
            && e.earliest_start_secs == current.earliest_finish_secs
            && graph.successors(current.milestone_id).contains(&e.milestone_id)
    }) {
        path.push(next.milestone_id);
        current = next;
    }
    path
}

/// Forward-looking forecast for one milestone.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForecastEntry {
    pub milestone_id: Uuid,
    pub status: MilestoneStatus,
    pub current_due: DateTime<Utc>,
    pub forecast_start: DateTime<Utc>,
    pub forecast_finish: DateTime<Utc>,
    /// Seconds the forecast finish lies past the current due date; negative if early.
    pub slip_secs: i64,
    pub slack_secs: i64,
    pub critical: bool,
    /// Completed and cancelled milestones keep their recorded dates.
    pub locked: bool,
}

/// Result of re-optimizing a contract schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Forecast {
    pub contract_id: Uuid,
    pub as_of: DateTime<Utc>,
    pub project_finish: DateTime<Utc>,
    pub entries: Vec<ForecastEntry>,
}

impl Forecast {
    /// Milestones whose forecast finish lies past their due date.
    pub fn slipping(&self) -> Vec<&ForecastEntry> {
        self.entries
            .iter()
            .filter(|e| !e.locked && e.slip_secs > 0)
            .collect()
    }

    pub fn entry(&self, milestone_id: Uuid) -> Option<&ForecastEntry> {
        self.entries.iter().find(|e| e.milestone_id == milestone_id)
    }
}

/// Recompute forward-looking dates and slack as of `now`.
///
/// Finished milestones are anchored at their recorded completion. Open
/// milestones start no earlier than `now` and than every predecessor's
/// forecast finish, and need the unfinished share of their duration.
pub fn reoptimize(graph: &DependencyGraph, order: &[Uuid], now: DateTime<Utc>) -> Forecast {
    let mut start: HashMap<Uuid, DateTime<Utc>> = HashMap::with_capacity(order.len());
    let mut finish: HashMap<Uuid, DateTime<Utc>> = HashMap::with_capacity(order.len());
    let mut remaining: HashMap<Uuid, i64> = HashMap::with_capacity(order.len());

    for id in order {
        let Some(m) = graph.milestone(*id) else {
            continue;
        };
        match m.status {
            MilestoneStatus::Completed => {
                let done = m.completed_at.unwrap_or(m.due_date);
                start.insert(*id, done);
                finish.insert(*id, done);
                remaining.insert(*id, 0);
            }
            MilestoneStatus::Cancelled => {
                start.insert(*id, m.created_at);
                finish.insert(*id, m.created_at);
                remaining.insert(*id, 0);
            }
            _ => {
                let earliest = graph
                    .predecessors(*id)
                    .iter()
                    .filter_map(|p| finish.get(p))
                    .copied()
                    .fold(now, |acc, t| acc.max(t));
                let left = m.duration_secs().saturating_mul(i64::from(100 - m.progress.min(100))) / 100;
                start.insert(*id, earliest);
                finish.insert(*id, offset(earliest, left));
                remaining.insert(*id, left);
            }
        }
    }

    let project_finish = finish.values().copied().max().unwrap_or(now);

    let mut latest_finish: HashMap<Uuid, DateTime<Utc>> = HashMap::with_capacity(order.len());
    for id in order.iter().rev() {
        let lf = graph
            .successors(*id)
            .iter()
            .filter_map(|s| {
                latest_finish
                    .get(s)
                    .map(|lf| offset(*lf, -remaining.get(s).copied().unwrap_or(0)))
            })
            .min()
            .unwrap_or(project_finish);
        latest_finish.insert(*id, lf);
    }

    let entries = order
        .iter()
        .filter_map(|id| graph.milestone(*id))
        .map(|m| {
            let locked = m.status.is_terminal();
            let forecast_finish = finish[&m.id];
            let slack = if locked {
                0
            } else {
                (latest_finish[&m.id] - forecast_finish).num_seconds().max(0)
            };
            ForecastEntry {
                milestone_id: m.id,
                status: m.status,
                current_due: m.due_date,
                forecast_start: start[&m.id],
                forecast_finish,
                slip_secs: if locked {
                    0
                } else {
                    (forecast_finish - m.due_date).num_seconds()
                },
                slack_secs: slack,
                critical: !locked && slack == 0,
                locked,
            }
        })
        .collect();

    Forecast {
        contract_id: graph.contract_id(),
        as_of: now,
        project_finish,
        entries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::GraphConfig;
    use proptest::prelude::*;
    use tranche_core::Milestone;

    fn base() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn activity(contract: Uuid, n: u128, days: i64, deps: &[u128]) -> Milestone {
        let mut b = Milestone::builder()
            .id(Uuid::from_u128(n))
            .contract(contract)
            .name(format!("a{}", n))
            .created_at(base())
            .due(base() + Duration::days(90))
            .estimate(Duration::days(days));
        for d in deps {
            b = b.depends_on(Uuid::from_u128(*d));
        }
        b.build().unwrap()
    }

    fn day(n: i64) -> i64 {
        Duration::days(n).num_seconds()
    }

    /// 1(3d) -> 2(5d) -> 4(2d); 1 -> 3(1d) -> 4
    fn diamond() -> (DependencyGraph, Vec<Uuid>) {
        let c = Uuid::new_v4();
        let ms = vec![
            activity(c, 1, 3, &[]),
            activity(c, 2, 5, &[1]),
            activity(c, 3, 1, &[1]),
            activity(c, 4, 2, &[2, 3]),
        ];
        let graph = DependencyGraph::build(c, &ms, &GraphConfig::default()).unwrap();
        let order = graph.topological_order().unwrap();
        (graph, order)
    }

    #[test]
    fn test_diamond_critical_path() {
        let (graph, order) = diamond();
        let schedule = Schedule::compute(&graph, &order);

        assert_eq!(schedule.project_duration_secs, day(10));
        let ids: Vec<Uuid> = [1u128, 2, 4].iter().map(|n| Uuid::from_u128(*n)).collect();
        assert_eq!(schedule.critical_path, ids);

        let side = schedule.entry(Uuid::from_u128(3)).unwrap();
        assert_eq!(side.earliest_start_secs, day(3));
        assert_eq!(side.latest_finish_secs, day(8));
        assert_eq!(side.slack_secs, day(4));
        assert!(!side.critical);
        assert_eq!(schedule.critical_milestones().len(), 3);
        assert_eq!(schedule.project_finish(), base() + Duration::days(10));
    }

    #[test]
    fn test_duration_defaults_to_due_span() {
        let c = Uuid::new_v4();
        let m = Milestone::builder()
            .id(Uuid::from_u128(1))
            .contract(c)
            .name("span")
            .created_at(base())
            .due(base() + Duration::days(4))
            .build()
            .unwrap();
        let graph = DependencyGraph::build(c, &[m], &GraphConfig::default()).unwrap();
        let order = graph.topological_order().unwrap();
        let schedule = Schedule::compute(&graph, &order);
        assert_eq!(schedule.project_duration_secs, day(4));
        assert_eq!(schedule.critical_path.len(), 1);
    }

    #[test]
    fn test_empty_schedule() {
        let graph = DependencyGraph::build(Uuid::new_v4(), &[], &GraphConfig::default()).unwrap();
        let schedule = Schedule::compute(&graph, &[]);
        assert!(schedule.entries.is_empty());
        assert!(schedule.critical_path.is_empty());
        assert_eq!(schedule.project_duration_secs, 0);
    }

    #[test]
    fn test_reoptimize_keeps_history_and_pushes_successors() {
        let c = Uuid::new_v4();
        let mut first = activity(c, 1, 3, &[]);
        first.status = MilestoneStatus::Completed;
        first.completed_at = Some(base() + Duration::days(2));
        let mut second = activity(c, 2, 10, &[1]);
        second.due_date = base() + Duration::days(12);
        second.progress = 50;
        let third = activity(c, 3, 1, &[2]);

        let graph = DependencyGraph::build(c, &[first, second, third], &GraphConfig::default()).unwrap();
        let order = graph.topological_order().unwrap();
        let now = base() + Duration::days(10);
        let forecast = reoptimize(&graph, &order, now);

        let done = forecast.entry(Uuid::from_u128(1)).unwrap();
        assert!(done.locked);
        assert_eq!(done.forecast_finish, base() + Duration::days(2));

        let slipping = forecast.entry(Uuid::from_u128(2)).unwrap();
        assert_eq!(slipping.forecast_start, now);
        assert_eq!(slipping.forecast_finish, now + Duration::days(5));
        assert_eq!(slipping.slip_secs, day(3));
        assert!(slipping.critical);
        assert_eq!(forecast.slipping().len(), 1);

        let tail = forecast.entry(Uuid::from_u128(3)).unwrap();
        assert_eq!(tail.forecast_start, now + Duration::days(5));
        assert_eq!(forecast.project_finish, now + Duration::days(6));
    }

    #[test]
    fn test_extreme_durations_saturate() {
        let c = Uuid::new_v4();
        let mut first = activity(c, 1, 1, &[]);
        let mut second = activity(c, 2, 1, &[1]);
        first.estimated_duration_secs = Some(i64::MAX);
        second.estimated_duration_secs = Some(i64::MAX);
        let config = GraphConfig {
            max_duration_secs: i64::MAX,
            ..Default::default()
        };
        let graph = DependencyGraph::build(c, &[first, second], &config).unwrap();
        let order = graph.topological_order().unwrap();

        let schedule = Schedule::compute(&graph, &order);
        assert_eq!(schedule.critical_path.len(), 2);
        assert!(schedule.project_finish() > base());
        for e in &schedule.entries {
            assert!(e.slack_secs >= 0);
            assert!(e.earliest_finish >= e.earliest_start);
        }

        let far = DateTime::<Utc>::MAX_UTC - Duration::days(1);
        let forecast = reoptimize(&graph, &order, far);
        assert_eq!(forecast.project_finish, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn test_offset_pins_to_range() {
        assert_eq!(offset(base(), i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(offset(base(), i64::MIN), DateTime::<Utc>::MIN_UTC);
        assert_eq!(offset(base(), 60), base() + Duration::minutes(1));
    }

    proptest! {
        #[test]
        fn slack_is_non_negative_with_a_zero_slack_chain(
            durations in proptest::collection::vec(0i64..20, 1..10),
            edge_bits in proptest::collection::vec(any::<bool>(), 45),
        ) {
            let c = Uuid::new_v4();
            let n = durations.len();
            let mut bit = 0;
            let mut ms = Vec::new();
            for (i, d) in durations.iter().enumerate() {
                let mut deps = Vec::new();
                for j in 0..i {
                    if edge_bits[bit % edge_bits.len()] {
                        deps.push(j as u128);
                    }
                    bit += 1;
                }
                ms.push(activity(c, i as u128, *d, &deps));
            }
            let graph = DependencyGraph::build(c, &ms, &GraphConfig::default()).unwrap();
            let order = graph.topological_order().unwrap();
            let schedule = Schedule::compute(&graph, &order);

            prop_assert_eq!(schedule.entries.len(), n);
            for e in &schedule.entries {
                prop_assert!(e.slack_secs >= 0);
                prop_assert!(e.latest_start_secs >= e.earliest_start_secs);
            }

            let path = &schedule.critical_path;
            prop_assert!(!path.is_empty());
            let first = schedule.entry(path[0]).unwrap();
            let last = schedule.entry(*path.last().unwrap()).unwrap();
            prop_assert_eq!(first.earliest_start_secs, 0);
            prop_assert_eq!(last.earliest_finish_secs, schedule.project_duration_secs);
            for pair in path.windows(2) {
                prop_assert!(graph.successors(pair[0]).contains(&pair[1]));
                prop_assert_eq!(schedule.entry(pair[1]).unwrap().slack_secs, 0);
            }
        }
    }
}
