//! Dependency graph executor.
//!
//! Build nodes form a static DAG declared once in configuration. A run walks it
//! with per-node unresolved-dependency counters:
//!
//! - a node becomes ready once every upstream node is `Succeeded` or `Skipped`
//! - ready nodes start at once and run concurrently (optionally capped)
//! - the first `Failed` or `TimedOut` node fails the run; unstarted nodes never start

mod executor;
mod graph;

#[cfg(test)]
mod tests;

pub use executor::{ExecutionSummary, GraphExecutor};
pub use graph::{BuildGraph, GraphError};
