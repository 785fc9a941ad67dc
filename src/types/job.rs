//! Build nodes and the record of one attempt to run them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{NodeName, RepoId, RunHandle};

/// A statically declared unit of work bound to one repository and one remote job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildNode {
    pub name: NodeName,
    #[serde(alias = "repository")]
    pub repo: RepoId,
    /// Remote job name (a workflow file name on GitHub Actions).
    pub job: String,
    /// Names of the nodes that must resolve before this one may start.
    #[serde(default)]
    pub depends_on: Vec<NodeName>,
}

impl BuildNode {
    pub fn new(name: impl Into<String>, repo: RepoId, job: impl Into<String>) -> Self {
        BuildNode {
            name: NodeName::new(name),
            repo,
            job: job.into(),
            depends_on: Vec::new(),
        }
    }

    /// Adds upstream dependencies.
    pub fn after<I, S>(mut self, upstream: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on
            .extend(upstream.into_iter().map(|s| NodeName::new(s)));
        self
    }
}

/// Status of a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not started. Nodes cancelled before start stay here.
    Pending,
    /// Triggered and not yet terminal.
    Running,
    Succeeded,
    Failed,
    /// The node's branch does not exist in its repository; nothing was triggered.
    Skipped,
    /// No terminal remote state was observed before the deadline.
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    /// True for statuses that let downstream nodes start.
    ///
    /// `Skipped` and `Succeeded` are equivalent here; they differ only in reporting.
    pub fn satisfies_dependents(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Skipped)
    }

    /// True for statuses that fail the enclosing run.
    pub fn is_failure(&self) -> bool {
        matches!(self, JobStatus::Failed | JobStatus::TimedOut)
    }
}

/// Why a job run ended in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The branch-existence query failed permanently or exhausted its retries.
    BranchCheckError,
    /// The platform refused or failed to start the job.
    TriggerError,
    /// Status polling failed permanently or exhausted its retries.
    PollError,
    /// The remote job finished unsuccessfully.
    RemoteFailure,
    /// The wait was interrupted by cancellation.
    Cancelled,
}

/// Failure details attached to a `Failed` job run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub reason: FailureReason,
    pub message: String,
}

/// One execution attempt of a build node against a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub node: NodeName,
    pub repo: RepoId,
    pub job: String,
    pub status: JobStatus,
    /// Handle returned by the trigger call; every poll uses it.
    pub handle: Option<RunHandle>,
    pub failure: Option<JobFailure>,
    /// Number of status polls issued (including ones that errored).
    pub polls: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRun {
    /// A run that has not started.
    pub fn pending(node: &BuildNode) -> Self {
        JobRun {
            node: node.name.clone(),
            repo: node.repo.clone(),
            job: node.job.clone(),
            status: JobStatus::Pending,
            handle: None,
            failure: None,
            polls: 0,
            started_at: None,
            finished_at: None,
        }
    }

    pub(crate) fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    pub(crate) fn finish(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.finished_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, reason: FailureReason, message: impl Into<String>) {
        self.failure = Some(JobFailure {
            reason,
            message: message.into(),
        });
        self.finish(JobStatus::Failed);
    }

    pub fn was_started(&self) -> bool {
        self.started_at.is_some()
    }
}
