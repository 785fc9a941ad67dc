//! Top-level entry point tying the graph executor to the merge gate.
//!
//! One orchestration run is: admission by the gate (generation and revision
//! snapshot captured together), one pass of the executor over the build graph,
//! then publish on success or failure recording otherwise. Modifications go
//! straight to the gate and may land at any point of that sequence.

use std::num::NonZeroUsize;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::PipelineConfig;
use crate::dag::{BuildGraph, GraphError, GraphExecutor};
use crate::gate::{
    GateError, GateView, InvalidationCoordinator, InvalidationReport, MidRunPolicy,
    StatusSettings,
};
use crate::persistence::GateStore;
use crate::platform::RemotePlatform;
use crate::trigger::{JobWaiter, WaitConfig};
use crate::types::{
    ChangeSetId, OrchestrationRun, PublishOutcome, RepoId, RevisionId, RunOutcome,
};

/// Errors from orchestration entry points.
#[derive(Debug, Error)]
pub enum OrchestrateError {
    /// The run was never admitted, or a gate operation failed outright.
    #[error(transparent)]
    Gate(#[from] GateError),

    /// The run finished but its result could not be applied to the gate.
    #[error("{} finished but could not be resolved: {source}", .run.run_id)]
    Resolve {
        run: Box<OrchestrationRun>,
        source: GateError,
    },
}

impl OrchestrateError {
    /// The underlying gate error.
    pub fn gate_error(&self) -> &GateError {
        match self {
            OrchestrateError::Gate(e) => e,
            OrchestrateError::Resolve { source, .. } => source,
        }
    }
}

/// A finished orchestration run and what the gate made of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub run: OrchestrationRun,
    /// Set for succeeded runs.
    pub publish: Option<PublishOutcome>,
    /// Set for failed runs: false if a modification made the failure stale.
    pub failure_recorded: Option<bool>,
}

impl RunReport {
    pub fn outcome(&self) -> RunOutcome {
        self.run.outcome
    }
}

/// Runs the configured build graph for change sets and gates their merges.
pub struct Orchestrator<P, S> {
    graph: BuildGraph,
    executor: GraphExecutor<P>,
    gate: InvalidationCoordinator<P, S>,
}

impl<P: RemotePlatform, S: GateStore> Orchestrator<P, S> {
    /// Creates an orchestrator with default status and mid-run settings.
    ///
    /// The gate tracks every repository that hosts a build node.
    pub fn new(graph: BuildGraph, platform: Arc<P>, store: Arc<S>, wait: WaitConfig) -> Self {
        let executor = GraphExecutor::new(JobWaiter::new(Arc::clone(&platform), wait));
        let gate = InvalidationCoordinator::new(platform, store, graph.repositories());
        Orchestrator {
            graph,
            executor,
            gate,
        }
    }

    /// Creates an orchestrator from a loaded pipeline file.
    pub fn from_config(
        config: &PipelineConfig,
        platform: Arc<P>,
        store: Arc<S>,
    ) -> Result<Self, GraphError> {
        let orchestrator = Self::new(config.graph()?, platform, store, config.wait_config())
            .with_max_concurrency(config.execution.max_concurrency)
            .with_status(config.status.clone())
            .with_policy(config.execution.mid_run_modification);
        Ok(orchestrator)
    }

    pub fn with_max_concurrency(mut self, limit: Option<NonZeroUsize>) -> Self {
        self.executor = self.executor.with_max_concurrency(limit);
        self
    }

    pub fn with_status(mut self, status: StatusSettings) -> Self {
        self.gate = self.gate.with_status(status);
        self
    }

    pub fn with_policy(mut self, policy: MidRunPolicy) -> Self {
        self.gate = self.gate.with_policy(policy);
        self
    }

    pub fn graph(&self) -> &BuildGraph {
        &self.graph
    }

    /// Repositories a change set may span.
    pub fn repositories(&self) -> &[RepoId] {
        self.gate.repos()
    }

    /// Runs every build node for `id` and resolves the result with the gate.
    ///
    /// Fails with [`GateError::ConcurrentRunRejected`] if `id` already has a
    /// run in flight. Node failures are not errors: they are reported in the
    /// run and recorded on the gate.
    #[instrument(skip(self), fields(change_set = %id))]
    pub async fn run_orchestration(
        &self,
        id: &ChangeSetId,
    ) -> Result<RunReport, OrchestrateError> {
        // Dropping this future before the gate resolves the run drops the
        // ticket, which releases the change set's slot.
        let ticket = self.gate.begin_run(id).await?;
        let started_at = Utc::now();

        let summary = self.executor.execute(&self.graph, id, &ticket.cancel).await;

        let run = OrchestrationRun {
            run_id: ticket.run_id,
            change_set: ticket.change_set.clone(),
            generation: ticket.generation,
            snapshot: ticket.snapshot.clone(),
            jobs: summary.jobs,
            outcome: summary.outcome,
            started_at,
            finished_at: Utc::now(),
        };
        info!(run_id = %run.run_id, outcome = ?run.outcome, "Run finished");

        let resolved = match run.outcome {
            RunOutcome::Succeeded => self
                .gate
                .publish(&run)
                .await
                .map(|outcome| (Some(outcome), None)),
            RunOutcome::Failed => self
                .gate
                .record_failure(&run)
                .await
                .map(|recorded| (None, Some(recorded))),
        };

        match resolved {
            Ok((publish, failure_recorded)) => Ok(RunReport {
                run,
                publish,
                failure_recorded,
            }),
            Err(source) => {
                warn!(run_id = %run.run_id, error = %source, "Could not resolve run");
                Err(OrchestrateError::Resolve {
                    run: Box::new(run),
                    source,
                })
            }
        }
    }

    /// Records a modification of `id`. See [`InvalidationCoordinator::invalidate`].
    pub async fn invalidate(&self, id: &ChangeSetId) -> Result<InvalidationReport, GateError> {
        self.gate.invalidate(id).await
    }

    pub async fn publish_test_signal(
        &self,
        id: &ChangeSetId,
        repo: &RepoId,
    ) -> Result<RevisionId, GateError> {
        self.gate.publish_test_signal(id, repo).await
    }

    pub async fn gate_state(&self, id: &ChangeSetId) -> Result<GateView, GateError> {
        self.gate.state(id).await
    }

    /// Cancels every run in flight. Their results are still resolved.
    pub async fn shutdown(&self) {
        self.gate.cancel_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::sync::Notify;

    use crate::persistence::MemoryGateStore;
    use crate::platform::{PlatformError, RemoteJobState};
    use crate::test_utils::{MockPlatform, PollStep};
    use crate::types::{
        BuildNode, CheckState, FailureReason, GatePhase, JobStatus, SuppressReason,
    };

    const BRANCH: &str = "feature/x";

    fn core() -> RepoId {
        RepoId::new("acme", "core")
    }

    fn app() -> RepoId {
        RepoId::new("acme", "app")
    }

    fn id() -> ChangeSetId {
        ChangeSetId::new(BRANCH)
    }

    fn graph() -> BuildGraph {
        BuildGraph::new(vec![
            BuildNode::new("core", core(), "ci.yml"),
            BuildNode::new("app", app(), "ci.yml").after(["core"]),
        ])
        .unwrap()
    }

    fn wait() -> WaitConfig {
        WaitConfig {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(60),
            ..WaitConfig::new()
        }
    }

    fn setup() -> (Arc<MockPlatform>, Arc<Orchestrator<MockPlatform, MemoryGateStore>>) {
        let platform = Arc::new(MockPlatform::new());
        platform
            .open_revision(&core(), BRANCH, "c0")
            .open_revision(&app(), BRANCH, "a0");
        let orchestrator = Orchestrator::new(
            graph(),
            Arc::clone(&platform),
            Arc::new(MemoryGateStore::new()),
            wait(),
        );
        (platform, Arc::new(orchestrator))
    }

    fn success_writes(platform: &MockPlatform) -> Vec<RepoId> {
        platform
            .status_writes()
            .into_iter()
            .filter(|w| w.check.state == CheckState::Success)
            .map(|w| w.repo)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn clean_run_publishes_on_every_revision() {
        let (platform, orchestrator) = setup();

        let report = orchestrator.run_orchestration(&id()).await.unwrap();

        assert_eq!(report.outcome(), RunOutcome::Succeeded);
        assert!(report.publish.as_ref().unwrap().is_published());
        assert_eq!(report.failure_recorded, None);
        assert_eq!(platform.triggered_repos(), vec![core(), app()]);
        assert_eq!(success_writes(&platform), vec![app(), core()]);

        let view = orchestrator.gate_state(&id()).await.unwrap();
        assert_eq!(view.record.phase, GatePhase::Succeeded);
        assert_eq!(view.active_run, None);
    }

    #[tokio::test(start_paused = true)]
    async fn skipped_node_still_publishes() {
        let (platform, orchestrator) = setup();
        platform
            .missing_branch(&app(), BRANCH)
            .close_revision(&app(), BRANCH);

        let report = orchestrator.run_orchestration(&id()).await.unwrap();

        assert_eq!(report.outcome(), RunOutcome::Succeeded);
        assert_eq!(report.run.jobs[1].status, JobStatus::Skipped);
        assert_eq!(platform.triggered_repos(), vec![core()]);
        assert_eq!(success_writes(&platform), vec![core()]);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_node_records_failure() {
        let (platform, orchestrator) = setup();
        platform.script(
            &core(),
            "ci.yml",
            vec![PollStep::State(RemoteJobState::Failed)],
        );

        let report = orchestrator.run_orchestration(&id()).await.unwrap();

        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert_eq!(report.publish, None);
        assert_eq!(report.failure_recorded, Some(true));
        assert_eq!(report.run.jobs[0].status, JobStatus::Failed);
        assert_eq!(report.run.jobs[1].status, JobStatus::Pending);
        assert_eq!(platform.triggered_repos(), vec![core()]);
        assert!(success_writes(&platform).is_empty());

        let failures = platform
            .status_writes()
            .into_iter()
            .filter(|w| w.check.state == CheckState::Failure)
            .count();
        assert_eq!(failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn modification_during_run_suppresses_publish() {
        let (platform, orchestrator) = setup();
        let release = Arc::new(Notify::new());
        platform.script(
            &core(),
            "ci.yml",
            vec![
                PollStep::WaitFor(Arc::clone(&release)),
                PollStep::State(RemoteJobState::Succeeded),
            ],
        );

        let run = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_orchestration(&id()).await }
        });
        platform.wait_for_triggers(1).await;

        let report = orchestrator.invalidate(&id()).await.unwrap();
        assert_eq!(report.generation, 1);
        assert!(!report.aborted_run);
        release.notify_one();

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.outcome(), RunOutcome::Succeeded);
        assert_eq!(
            report.publish,
            Some(PublishOutcome::Suppressed {
                reason: SuppressReason::GenerationChanged {
                    captured: 0,
                    current: 1,
                },
            })
        );
        assert!(success_writes(&platform).is_empty());

        let view = orchestrator.gate_state(&id()).await.unwrap();
        assert_eq!(view.record.phase, GatePhase::Invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_policy_cancels_run_and_discards_failure() {
        let platform = Arc::new(MockPlatform::new());
        platform.open_revision(&core(), BRANCH, "c0");
        platform.script(
            &core(),
            "ci.yml",
            vec![PollStep::State(RemoteJobState::Running)],
        );
        let orchestrator = Arc::new(
            Orchestrator::new(
                graph(),
                Arc::clone(&platform),
                Arc::new(MemoryGateStore::new()),
                wait(),
            )
            .with_policy(MidRunPolicy::Abort),
        );

        let run = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_orchestration(&id()).await }
        });
        platform.wait_for_triggers(1).await;

        let report = orchestrator.invalidate(&id()).await.unwrap();
        assert!(report.aborted_run);

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert_eq!(report.failure_recorded, Some(false));
        let failure = report.run.jobs[0].failure.as_ref().unwrap();
        assert_eq!(failure.reason, FailureReason::Cancelled);
        assert_eq!(platform.triggered_repos(), vec![core()]);
    }

    #[tokio::test(start_paused = true)]
    async fn second_run_is_rejected_while_first_in_flight() {
        let (platform, orchestrator) = setup();
        let release = Arc::new(Notify::new());
        platform.script(
            &core(),
            "ci.yml",
            vec![
                PollStep::WaitFor(Arc::clone(&release)),
                PollStep::State(RemoteJobState::Succeeded),
            ],
        );

        let first = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_orchestration(&id()).await }
        });
        platform.wait_for_triggers(1).await;

        let err = orchestrator.run_orchestration(&id()).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrateError::Gate(GateError::ConcurrentRunRejected(_))
        ));

        release.notify_one();
        let report = first.await.unwrap().unwrap();
        assert!(report.publish.unwrap().is_published());

        // slot is free again
        let again = orchestrator.run_orchestration(&id()).await.unwrap();
        assert_eq!(again.run.run_id.0, report.run.run_id.0 + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_run_frees_change_set() {
        let (platform, orchestrator) = setup();
        platform.script(
            &core(),
            "ci.yml",
            vec![PollStep::State(RemoteJobState::Running)],
        );

        let run = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_orchestration(&id()).await }
        });
        platform.wait_for_triggers(1).await;
        run.abort();
        assert!(run.await.unwrap_err().is_cancelled());

        let view = orchestrator.gate_state(&id()).await.unwrap();
        assert_eq!(view.active_run, None);
        assert_eq!(view.record.phase, GatePhase::Invalidated);

        platform.script(
            &core(),
            "ci.yml",
            vec![PollStep::State(RemoteJobState::Succeeded)],
        );
        let report = orchestrator.run_orchestration(&id()).await.unwrap();
        assert!(report.publish.unwrap().is_published());
        assert_eq!(platform.triggered_repos(), vec![core(), core(), app()]);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_run() {
        let (platform, orchestrator) = setup();
        platform.script(
            &core(),
            "ci.yml",
            vec![PollStep::State(RemoteJobState::Running)],
        );

        let run = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_orchestration(&id()).await }
        });
        platform.wait_for_triggers(1).await;
        orchestrator.shutdown().await;

        let report = run.await.unwrap().unwrap();
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert_eq!(report.run.jobs[1].status, JobStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn unresolvable_result_keeps_the_run() {
        let (platform, orchestrator) = setup();
        let release = Arc::new(Notify::new());
        platform.script(
            &core(),
            "ci.yml",
            vec![
                PollStep::WaitFor(Arc::clone(&release)),
                PollStep::State(RemoteJobState::Succeeded),
            ],
        );

        let run = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.run_orchestration(&id()).await }
        });
        platform.wait_for_triggers(1).await;
        platform.fail_listing(&app(), PlatformError::permanent("listing refused"));
        release.notify_one();

        match run.await.unwrap() {
            Err(OrchestrateError::Resolve { run, source }) => {
                assert_eq!(run.outcome, RunOutcome::Succeeded);
                assert!(matches!(source, GateError::Platform(_)));
            }
            other => panic!("expected resolve error, got {:?}", other),
        }
        assert!(success_writes(&platform).is_empty());
    }
}
