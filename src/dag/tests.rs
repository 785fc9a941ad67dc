//! Executor tests over the scripted platform, on a paused clock.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::platform::{PlatformError, RemoteJobState, RetryConfig};
use crate::test_utils::{MockPlatform, PollStep, arb_dag};
use crate::trigger::{JobWaiter, WaitConfig};
use crate::types::{BuildNode, ChangeSetId, FailureReason, JobStatus, RepoId, RunOutcome};

fn config() -> WaitConfig {
    WaitConfig {
        poll_interval: Duration::from_secs(10),
        timeout: Duration::from_secs(3600),
        poll_retry: RetryConfig::new(2, Duration::from_secs(1), Duration::from_secs(4), 2.0),
        branch_check_retry: RetryConfig::new(2, Duration::from_secs(1), Duration::from_secs(4), 2.0),
    }
}

fn repo(name: &str) -> RepoId {
    RepoId::new("acme", name)
}

fn node(name: &str, deps: &[&str]) -> BuildNode {
    BuildNode::new(name, repo(name), "ci.yml").after(deps.iter().copied())
}

/// A → {B, C, D} → E
fn diamond() -> BuildGraph {
    BuildGraph::new(vec![
        node("a", &[]),
        node("b", &["a"]),
        node("c", &["a"]),
        node("d", &["a"]),
        node("e", &["b", "c", "d"]),
    ])
    .unwrap()
}

fn change_set() -> ChangeSetId {
    ChangeSetId::new("feature/x")
}

fn executor(platform: &Arc<MockPlatform>) -> GraphExecutor<MockPlatform> {
    GraphExecutor::new(JobWaiter::new(Arc::clone(platform), config()))
}

async fn execute(platform: &Arc<MockPlatform>, graph: &BuildGraph) -> ExecutionSummary {
    executor(platform)
        .execute(graph, &change_set(), &CancellationToken::new())
        .await
}

fn statuses(summary: &ExecutionSummary) -> Vec<JobStatus> {
    summary.jobs.iter().map(|j| j.status).collect()
}

fn running_then(state: RemoteJobState, polls: usize) -> Vec<PollStep> {
    let mut steps = vec![PollStep::State(RemoteJobState::Running); polls];
    steps.push(PollStep::State(state));
    steps
}

// ─── Ordering ─────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn all_succeed_in_dependency_order() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert!(summary.jobs.iter().all(|j| j.status == JobStatus::Succeeded));

    let order = platform.triggered_repos();
    assert_eq!(order.len(), 5);
    assert_eq!(order[0], repo("a"));
    assert_eq!(order[4], repo("e"));
}

#[tokio::test(start_paused = true)]
async fn fan_out_runs_concurrently() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();
    let started = tokio::time::Instant::now();

    execute(&platform, &graph).await;

    // Three levels, each one poll interval long.
    assert_eq!(started.elapsed(), Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn jobs_reported_in_declaration_order() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();

    let summary = execute(&platform, &graph).await;

    let names: Vec<_> = summary.jobs.iter().map(|j| j.node.to_string()).collect();
    assert_eq!(names, vec!["a", "b", "c", "d", "e"]);
}

// ─── Fail-Fast ────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn failing_branch_lets_siblings_finish_and_blocks_join() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();
    platform.script(&repo("b"), "ci.yml", vec![PollStep::State(RemoteJobState::Failed)]);
    platform.script(&repo("c"), "ci.yml", running_then(RemoteJobState::Succeeded, 3));
    platform.script(&repo("d"), "ci.yml", running_then(RemoteJobState::Failed, 1));

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(
        statuses(&summary),
        vec![
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Succeeded,
            JobStatus::Failed,
            JobStatus::Pending,
        ]
    );
    assert!(!summary.jobs[4].was_started());
    assert!(!platform.triggered_repos().contains(&repo("e")));
}

#[tokio::test(start_paused = true)]
async fn failed_root_starts_nothing_else() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();
    platform.fail_trigger(&repo("a"), "ci.yml", PlatformError::permanent("no such workflow"));

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(
        summary.jobs[0].failure.as_ref().map(|f| f.reason),
        Some(FailureReason::TriggerError)
    );
    assert!(summary.jobs[1..].iter().all(|j| j.status == JobStatus::Pending));
    assert!(platform.triggers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn timed_out_node_fails_run_but_is_reported_distinctly() {
    let platform = Arc::new(MockPlatform::new());
    let graph = BuildGraph::new(vec![node("a", &[]), node("b", &["a"])]).unwrap();
    platform.script(&repo("a"), "ci.yml", vec![PollStep::State(RemoteJobState::Running)]);

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(statuses(&summary), vec![JobStatus::TimedOut, JobStatus::Pending]);
    assert!(summary.jobs[0].failure.is_none());
}

// ─── Skips ────────────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn skipped_node_satisfies_dependents() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();
    platform.missing_branch(&repo("c"), change_set().branch());

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert_eq!(summary.jobs[2].status, JobStatus::Skipped);
    assert_eq!(summary.jobs[4].status, JobStatus::Succeeded);
    assert!(!platform.triggered_repos().contains(&repo("c")));
}

#[tokio::test(start_paused = true)]
async fn all_skipped_is_success() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();
    for name in ["a", "b", "c", "d", "e"] {
        platform.missing_branch(&repo(name), change_set().branch());
    }

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert!(summary.jobs.iter().all(|j| j.status == JobStatus::Skipped));
    assert!(platform.triggers().is_empty());
}

#[tokio::test(start_paused = true)]
async fn empty_graph_succeeds() {
    let platform = Arc::new(MockPlatform::new());
    let graph = BuildGraph::new(Vec::new()).unwrap();

    let summary = execute(&platform, &graph).await;

    assert_eq!(summary.outcome, RunOutcome::Succeeded);
    assert!(summary.jobs.is_empty());
}

// ─── Concurrency Cap ──────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn concurrency_cap_limits_in_flight_nodes() {
    let platform = Arc::new(MockPlatform::new());
    let graph = BuildGraph::new(vec![node("a", &[]), node("b", &[]), node("c", &[])]).unwrap();
    let gates: Vec<_> = (0..3).map(|_| Arc::new(Notify::new())).collect();
    for (name, gate) in ["a", "b", "c"].iter().zip(&gates) {
        platform.script(
            &repo(name),
            "ci.yml",
            vec![
                PollStep::WaitFor(Arc::clone(gate)),
                PollStep::State(RemoteJobState::Succeeded),
            ],
        );
    }

    let task = {
        let executor = executor(&platform).with_max_concurrency(NonZeroUsize::new(1));
        tokio::spawn(async move {
            executor
                .execute(&graph, &change_set(), &CancellationToken::new())
                .await
        })
    };

    platform.wait_for_triggers(1).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(platform.triggered_repos(), vec![repo("a")]);

    gates[0].notify_one();
    platform.wait_for_triggers(2).await;
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(platform.triggered_repos(), vec![repo("a"), repo("b")]);

    gates[1].notify_one();
    gates[2].notify_one();
    let summary = task.await.unwrap();
    assert_eq!(summary.outcome, RunOutcome::Succeeded);
}

// ─── Cancellation ─────────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn cancellation_stops_starts_and_interrupts_waits() {
    let platform = Arc::new(MockPlatform::new());
    let graph = diamond();
    platform.script(&repo("a"), "ci.yml", vec![PollStep::State(RemoteJobState::Running)]);
    let cancel = CancellationToken::new();

    let task = {
        let executor = executor(&platform);
        let cancel = cancel.clone();
        tokio::spawn(async move { executor.execute(&graph, &change_set(), &cancel).await })
    };

    platform.wait_for_triggers(1).await;
    cancel.cancel();
    let summary = task.await.unwrap();

    assert_eq!(summary.outcome, RunOutcome::Failed);
    assert_eq!(
        summary.jobs[0].failure.as_ref().map(|f| f.reason),
        Some(FailureReason::Cancelled)
    );
    assert!(summary.jobs[1..].iter().all(|j| j.status == JobStatus::Pending));
}

// ─── Properties ───────────────────────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// With every job succeeding, each node is triggered exactly once and only
    /// after all of its upstream nodes were triggered.
    #[test]
    fn every_node_runs_once_after_its_upstream(nodes in arb_dag(7)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .start_paused(true)
            .build()
            .unwrap();
        let graph = BuildGraph::new(nodes).unwrap();
        let platform = Arc::new(MockPlatform::new());

        let summary = runtime.block_on(execute(&platform, &graph));
        prop_assert_eq!(summary.outcome, RunOutcome::Succeeded);

        let order = platform.triggered_repos();
        prop_assert_eq!(order.len(), graph.len());
        for (i, node) in graph.nodes().iter().enumerate() {
            let pos = order.iter().position(|r| *r == node.repo).unwrap();
            for upstream in &node.depends_on {
                let upstream_repo = &graph
                    .nodes()
                    .iter()
                    .find(|n| n.name == *upstream)
                    .unwrap()
                    .repo;
                let upstream_pos = order.iter().position(|r| r == upstream_repo).unwrap();
                prop_assert!(upstream_pos < pos, "node {} triggered before upstream", i);
            }
        }
    }
}
