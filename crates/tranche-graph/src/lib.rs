//! # Tranche Graph
//!
//! Milestone dependency resolution for Tranche contracts: DAG validation,
//! deterministic topological ordering, critical-path scheduling and
//! forward-looking re-optimization.
//!
//! Everything here is pure and synchronous; callers on an async runtime
//! should not need to offload it for typical contract sizes.

pub mod resolver;
pub mod schedule;

pub use resolver::{ensure_predecessors_completed, DependencyGraph, GraphAnalysis, GraphConfig};
pub use schedule::{reoptimize, Forecast, ForecastEntry, Schedule, ScheduleEntry};
