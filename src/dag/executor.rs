//! Readiness-driven execution of a [`BuildGraph`].
//!
//! Each ready node runs in its own task on a `JoinSet`; the executor only
//! decrements unresolved-dependency counters and decides what starts next.
//! After the first failing node nothing new is started, but nodes already in
//! flight are joined so their runs are reported.

use std::collections::{HashMap, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, instrument, warn};

use crate::platform::RemotePlatform;
use crate::trigger::JobWaiter;
use crate::types::{ChangeSetId, FailureReason, JobRun, RunOutcome};

use super::graph::BuildGraph;

/// Result of one pass over the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Job runs in declaration order. Nodes never started are `Pending`.
    pub jobs: Vec<JobRun>,
    pub outcome: RunOutcome,
}

/// Runs build graphs through a [`JobWaiter`].
pub struct GraphExecutor<P> {
    waiter: JobWaiter<P>,
    max_concurrency: Option<NonZeroUsize>,
}

impl<P: RemotePlatform> GraphExecutor<P> {
    pub fn new(waiter: JobWaiter<P>) -> Self {
        Self {
            waiter,
            max_concurrency: None,
        }
    }

    /// Caps the number of nodes in flight at once.
    pub fn with_max_concurrency(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.max_concurrency = limit;
        self
    }

    /// Executes every node of `graph` at most once against `change_set`'s branch.
    ///
    /// The outcome is `Succeeded` only if every node ends `Succeeded` or `Skipped`.
    /// Cancelling `cancel` stops new starts and interrupts in-flight waits.
    #[instrument(skip_all, fields(change_set = %change_set))]
    pub async fn execute(
        &self,
        graph: &BuildGraph,
        change_set: &ChangeSetId,
        cancel: &CancellationToken,
    ) -> ExecutionSummary {
        let mut jobs: Vec<JobRun> = graph.nodes().iter().map(JobRun::pending).collect();
        let mut unresolved = graph.unresolved_counts();
        let mut ready: VecDeque<usize> = graph.roots().collect();
        let mut in_flight = JoinSet::new();
        let mut task_nodes = HashMap::new();
        let mut failed = false;

        let limit = self.max_concurrency.map_or(usize::MAX, NonZeroUsize::get);
        let branch: Arc<str> = Arc::from(change_set.branch());

        loop {
            if !failed && !cancel.is_cancelled() {
                while in_flight.len() < limit {
                    let Some(index) = ready.pop_front() else {
                        break;
                    };
                    let node = graph.node(index).clone();
                    debug!(node = %node.name, "Starting node");

                    let waiter = self.waiter.clone();
                    let branch = Arc::clone(&branch);
                    let cancel = cancel.clone();
                    let handle = in_flight.spawn(
                        async move { waiter.run(&node, &branch, &cancel).await }.in_current_span(),
                    );
                    task_nodes.insert(handle.id(), index);
                }
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };

            match joined {
                Ok((id, run)) => {
                    let Some(index) = task_nodes.remove(&id) else {
                        continue;
                    };
                    if run.status.satisfies_dependents() {
                        for &dependent in graph.dependents(index) {
                            unresolved[dependent] -= 1;
                            if unresolved[dependent] == 0 {
                                ready.push_back(dependent);
                            }
                        }
                    } else if !failed {
                        warn!(node = %run.node, status = ?run.status, "Node failed, no further nodes will start");
                        failed = true;
                    }
                    jobs[index] = run;
                }
                Err(join_error) => {
                    error!(error = %join_error, "Node task ended abnormally");
                    failed = true;
                    if let Some(index) = task_nodes.remove(&join_error.id()) {
                        jobs[index].start();
                        jobs[index].fail(FailureReason::Cancelled, join_error.to_string());
                    }
                }
            }
        }

        let outcome = if jobs.iter().all(|job| job.status.satisfies_dependents()) {
            RunOutcome::Succeeded
        } else {
            RunOutcome::Failed
        };
        info!(?outcome, nodes = jobs.len(), "Graph execution finished");

        ExecutionSummary { jobs, outcome }
    }
}
