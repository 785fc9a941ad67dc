//! Shared test utilities: a scripted in-memory platform and proptest generators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use proptest::prelude::*;
use tokio::sync::Notify;

use crate::platform::{OpenRevision, PlatformError, RemoteJobState, RemotePlatform, branch_matches};
use crate::types::{BuildNode, RepoId, RevisionId, RunHandle, StatusCheck};

// ─── Mock Platform ────────────────────────────────────────────────────────────

/// One scripted response to a status poll.
#[derive(Debug, Clone)]
pub enum PollStep {
    State(RemoteJobState),
    Transient,
    Permanent,
    /// Blocks the poll until the gate is notified, then answers with the next step.
    WaitFor(Arc<Notify>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerCall {
    pub repo: RepoId,
    pub job: String,
    pub branch: String,
    pub handle: RunHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusWrite {
    pub repo: RepoId,
    pub revision: RevisionId,
    pub check: StatusCheck,
}

#[derive(Default)]
struct MockState {
    missing_branches: HashSet<(RepoId, String)>,
    branch_errors: HashMap<RepoId, VecDeque<PlatformError>>,
    trigger_errors: HashMap<(RepoId, String), PlatformError>,
    scripts: HashMap<(RepoId, String), Vec<PollStep>>,
    running: HashMap<RunHandle, VecDeque<PollStep>>,
    open: HashMap<RepoId, Vec<OpenRevision>>,
    list_errors: HashMap<RepoId, PlatformError>,
    next_handle: u64,
    branch_checks: Vec<RepoId>,
    triggers: Vec<TriggerCall>,
    polls: Vec<RunHandle>,
    status_writes: Vec<StatusWrite>,
}

/// A scripted `RemotePlatform`.
///
/// Branches exist unless marked missing. A triggered job answers polls from
/// the script registered for its `(repo, job)`; the last step repeats. Jobs
/// without a script succeed on the first poll.
#[derive(Default)]
pub struct MockPlatform {
    state: Mutex<MockState>,
    activity: Notify,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn missing_branch(&self, repo: &RepoId, branch: &str) -> &Self {
        self.lock()
            .missing_branches
            .insert((repo.clone(), branch.to_string()));
        self
    }

    /// Queues errors returned by `branch_exists` before it answers normally.
    pub fn branch_errors(&self, repo: &RepoId, errors: Vec<PlatformError>) -> &Self {
        self.lock()
            .branch_errors
            .insert(repo.clone(), errors.into());
        self
    }

    pub fn fail_trigger(&self, repo: &RepoId, job: &str, error: PlatformError) -> &Self {
        self.lock()
            .trigger_errors
            .insert((repo.clone(), job.to_string()), error);
        self
    }

    pub fn script(&self, repo: &RepoId, job: &str, steps: Vec<PollStep>) -> &Self {
        self.lock()
            .scripts
            .insert((repo.clone(), job.to_string()), steps);
        self
    }

    /// Scripts the job behind `node`.
    pub fn script_node(&self, node: &BuildNode, steps: Vec<PollStep>) -> &Self {
        self.script(&node.repo, &node.job, steps)
    }

    /// Sets (or replaces) the open revision on `branch` in `repo`.
    pub fn open_revision(&self, repo: &RepoId, branch: &str, head: &str) -> &Self {
        let mut state = self.lock();
        let revisions = state.open.entry(repo.clone()).or_default();
        let revision = OpenRevision {
            branch: branch.to_string(),
            head: RevisionId::new(head),
        };
        match revisions.iter_mut().find(|r| r.branch == branch) {
            Some(existing) => *existing = revision,
            None => revisions.push(revision),
        }
        self
    }

    pub fn close_revision(&self, repo: &RepoId, branch: &str) -> &Self {
        if let Some(revisions) = self.lock().open.get_mut(repo) {
            revisions.retain(|r| r.branch != branch);
        }
        self
    }

    pub fn fail_listing(&self, repo: &RepoId, error: PlatformError) -> &Self {
        self.lock().list_errors.insert(repo.clone(), error);
        self
    }

    pub fn branch_checks(&self) -> Vec<RepoId> {
        self.lock().branch_checks.clone()
    }

    pub fn triggers(&self) -> Vec<TriggerCall> {
        self.lock().triggers.clone()
    }

    pub fn triggered_repos(&self) -> Vec<RepoId> {
        self.triggers().into_iter().map(|t| t.repo).collect()
    }

    pub fn polls(&self) -> Vec<RunHandle> {
        self.lock().polls.clone()
    }

    pub fn status_writes(&self) -> Vec<StatusWrite> {
        self.lock().status_writes.clone()
    }

    /// Waits until at least `n` jobs have been triggered.
    pub async fn wait_for_triggers(&self, n: usize) {
        loop {
            let notified = self.activity.notified();
            if self.lock().triggers.len() >= n {
                return;
            }
            notified.await;
        }
    }

    fn next_step(&self, handle: &RunHandle) -> Option<PollStep> {
        let mut state = self.lock();
        let steps = state.running.get_mut(handle)?;
        if steps.len() > 1 {
            steps.pop_front()
        } else {
            steps.front().cloned()
        }
    }
}

impl RemotePlatform for MockPlatform {
    async fn branch_exists(&self, repo: &RepoId, branch: &str) -> Result<bool, PlatformError> {
        let mut state = self.lock();
        state.branch_checks.push(repo.clone());
        if let Some(err) = state.branch_errors.get_mut(repo).and_then(|q| q.pop_front()) {
            return Err(err);
        }
        Ok(!state
            .missing_branches
            .contains(&(repo.clone(), branch.to_string())))
    }

    async fn trigger_job(
        &self,
        repo: &RepoId,
        job: &str,
        branch: &str,
    ) -> Result<RunHandle, PlatformError> {
        let result = {
            let mut state = self.lock();
            let key = (repo.clone(), job.to_string());
            if let Some(err) = state.trigger_errors.get(&key) {
                Err(err.clone())
            } else {
                state.next_handle += 1;
                let handle = RunHandle::new(format!("{}", state.next_handle));
                let script = state
                    .scripts
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| vec![PollStep::State(RemoteJobState::Succeeded)]);
                state.running.insert(handle.clone(), script.into());
                state.triggers.push(TriggerCall {
                    repo: repo.clone(),
                    job: job.to_string(),
                    branch: branch.to_string(),
                    handle: handle.clone(),
                });
                Ok(handle)
            }
        };
        self.activity.notify_waiters();
        result
    }

    async fn poll_job_status(
        &self,
        _repo: &RepoId,
        handle: &RunHandle,
    ) -> Result<RemoteJobState, PlatformError> {
        self.lock().polls.push(handle.clone());
        loop {
            let step = self
                .next_step(handle)
                .ok_or_else(|| PlatformError::permanent(format!("unknown handle {}", handle)))?;
            match step {
                PollStep::State(state) => return Ok(state),
                PollStep::Transient => {
                    return Err(PlatformError::transient("scripted transient poll failure"));
                }
                PollStep::Permanent => {
                    return Err(PlatformError::permanent("scripted permanent poll failure"));
                }
                PollStep::WaitFor(gate) => gate.notified().await,
            }
        }
    }

    async fn list_open_revisions(
        &self,
        repo: &RepoId,
        branch_pattern: &str,
    ) -> Result<Vec<OpenRevision>, PlatformError> {
        let state = self.lock();
        if let Some(err) = state.list_errors.get(repo) {
            return Err(err.clone());
        }
        Ok(state
            .open
            .get(repo)
            .map(|revisions| {
                revisions
                    .iter()
                    .filter(|r| branch_matches(branch_pattern, &r.branch))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn set_status_check(
        &self,
        repo: &RepoId,
        revision: &RevisionId,
        check: &StatusCheck,
    ) -> Result<(), PlatformError> {
        self.lock().status_writes.push(StatusWrite {
            repo: repo.clone(),
            revision: revision.clone(),
            check: check.clone(),
        });
        Ok(())
    }
}

// ─── Generators ───────────────────────────────────────────────────────────────

pub fn arb_repo_id() -> impl Strategy<Value = RepoId> {
    ("[a-z][a-z0-9-]{0,10}", "[a-z][a-z0-9_.-]{0,15}").prop_map(|(o, r)| RepoId::new(o, r))
}

/// Generates an acyclic set of build nodes: node `i` may only depend on nodes `< i`.
pub fn arb_dag(max_nodes: usize) -> impl Strategy<Value = Vec<BuildNode>> {
    (1..=max_nodes)
        .prop_flat_map(|n| {
            let deps: Vec<_> = (0..n)
                .map(|i| prop::collection::vec(any::<bool>(), i))
                .collect();
            deps
        })
        .prop_map(|deps| {
            deps.into_iter()
                .enumerate()
                .map(|(i, edges)| {
                    let upstream: Vec<String> = edges
                        .iter()
                        .enumerate()
                        .filter(|(_, e)| **e)
                        .map(|(j, _)| format!("n{}", j))
                        .collect();
                    BuildNode::new(
                        format!("n{}", i),
                        RepoId::new("acme", format!("repo{}", i)),
                        "ci.yml",
                    )
                    .after(upstream)
                })
                .collect()
        })
}
