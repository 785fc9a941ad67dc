//! Remote execution platform contract.
//!
//! The orchestration core never talks to a build service or source host
//! directly. Everything it needs is expressed by [`RemotePlatform`]:
//!
//! - branch existence (decides whether a build node is skipped)
//! - job trigger and status polling (the trigger-and-wait unit)
//! - open revision listing (change-set membership and snapshots)
//! - status check writes (the merge gate signal)
//!
//! [`crate::github::GitHubPlatform`] implements it against GitHub Actions; tests
//! use a scripted in-memory implementation.

use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::types::{RepoId, RevisionId, RunHandle, StatusCheck};

mod error;
pub mod retry;

pub use error::{PlatformError, PlatformErrorKind};
pub use retry::{RetryConfig, retry_with_backoff};

/// Remote job state as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteJobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RemoteJobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RemoteJobState::Succeeded | RemoteJobState::Failed)
    }
}

/// An open revision (pull request head) in one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenRevision {
    pub branch: String,
    pub head: RevisionId,
}

/// Operations the orchestrator consumes from the remote platform.
///
/// Implementations must be shareable across tasks: every node of a run polls
/// concurrently through the same instance.
pub trait RemotePlatform: Send + Sync + 'static {
    /// Returns whether `branch` exists in `repo`.
    fn branch_exists(
        &self,
        repo: &RepoId,
        branch: &str,
    ) -> impl Future<Output = Result<bool, PlatformError>> + Send;

    /// Starts `job` in `repo` on `branch` and returns the handle of the started instance.
    fn trigger_job(
        &self,
        repo: &RepoId,
        job: &str,
        branch: &str,
    ) -> impl Future<Output = Result<RunHandle, PlatformError>> + Send;

    /// Reports the state of the job instance identified by `handle`.
    fn poll_job_status(
        &self,
        repo: &RepoId,
        handle: &RunHandle,
    ) -> impl Future<Output = Result<RemoteJobState, PlatformError>> + Send;

    /// Lists open revisions whose branch matches `branch_pattern`, oldest first.
    fn list_open_revisions(
        &self,
        repo: &RepoId,
        branch_pattern: &str,
    ) -> impl Future<Output = Result<Vec<OpenRevision>, PlatformError>> + Send;

    /// Writes a status check on `revision`.
    fn set_status_check(
        &self,
        repo: &RepoId,
        revision: &RevisionId,
        check: &StatusCheck,
    ) -> impl Future<Output = Result<(), PlatformError>> + Send;
}

/// Returns true if `branch` matches `pattern`.
///
/// A pattern ending in `*` matches by prefix; anything else must match exactly.
pub fn branch_matches(pattern: &str, branch: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => branch.starts_with(prefix),
        None => branch == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_pattern_matches_only_itself() {
        assert!(branch_matches("feature/x", "feature/x"));
        assert!(!branch_matches("feature/x", "feature/xy"));
        assert!(!branch_matches("feature/x", "feature"));
    }

    #[test]
    fn star_pattern_matches_prefix() {
        assert!(branch_matches("release/*", "release/1.2"));
        assert!(branch_matches("release/*", "release/"));
        assert!(!branch_matches("release/*", "hotfix/1.2"));
    }

    #[test]
    fn terminal_states() {
        assert!(RemoteJobState::Succeeded.is_terminal());
        assert!(RemoteJobState::Failed.is_terminal());
        assert!(!RemoteJobState::Pending.is_terminal());
        assert!(!RemoteJobState::Running.is_terminal());
    }
}
