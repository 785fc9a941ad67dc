//! `RemotePlatform` over GitHub Actions and the commit status API.
//!
//! Key implementation details:
//! - Jobs are `workflow_dispatch` workflows; the dispatch endpoint returns no
//!   run id, so the started run is correlated by listing dispatch runs of the
//!   workflow on the branch: the earliest run created around the dispatch
//!   instant that was not already listed just before dispatching
//! - Open-revision listing and status writes retry transient errors with backoff
//! - Branch checks, triggers and polls are attempted once; the trigger-and-wait
//!   unit owns those retry policies

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

use crate::platform::{
    OpenRevision, PlatformError, RemoteJobState, RemotePlatform, RetryConfig, branch_matches,
    retry_with_backoff,
};
use crate::types::{RepoId, RevisionId, RunHandle, StatusCheck};

use super::client::RepoClient;
use super::error::GitHubApiError;

/// Number of run listings attempted while correlating a dispatch with its run.
const CORRELATION_ATTEMPTS: u32 = 6;

/// Delay between correlation listings. Runs usually appear within a few seconds.
const CORRELATION_DELAY: Duration = Duration::from_secs(3);

/// Tolerated clock skew between this host and GitHub when comparing `created_at`.
const CLOCK_SKEW_SECS: i64 = 10;

/// GitHub truncates status descriptions longer than this.
const MAX_STATUS_DESCRIPTION: usize = 140;

// ─── API Types ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct WorkflowRunsResponse {
    workflow_runs: Vec<WorkflowRunResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct WorkflowRunResponse {
    id: u64,
    status: Option<String>,
    conclusion: Option<String>,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
struct WorkflowRunsQuery<'a> {
    branch: &'a str,
    event: &'static str,
    per_page: u8,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    state: &'static str,
    context: &'a str,
    description: &'a str,
}

// ─── Platform ─────────────────────────────────────────────────────────────────

/// GitHub implementation of [`RemotePlatform`].
#[derive(Clone)]
pub struct GitHubPlatform {
    client: Octocrab,
    retry: RetryConfig,
}

impl GitHubPlatform {
    pub fn new(client: Octocrab) -> Self {
        Self {
            client,
            retry: RetryConfig::DEFAULT,
        }
    }

    /// Creates a platform authenticated with a personal access token.
    pub fn from_token(token: impl Into<String>) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client))
    }

    /// Overrides the retry configuration for listing and status writes.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn scoped<'a>(&'a self, repo: &'a RepoId) -> RepoClient<'a> {
        RepoClient::new(&self.client, repo)
    }
}

impl std::fmt::Debug for GitHubPlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubPlatform")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}

impl RemotePlatform for GitHubPlatform {
    async fn branch_exists(&self, repo: &RepoId, branch: &str) -> Result<bool, PlatformError> {
        Ok(get_branch_exists(self.scoped(repo), branch).await?)
    }

    async fn trigger_job(
        &self,
        repo: &RepoId,
        job: &str,
        branch: &str,
    ) -> Result<RunHandle, PlatformError> {
        Ok(dispatch_workflow(self.scoped(repo), job, branch).await?)
    }

    async fn poll_job_status(
        &self,
        repo: &RepoId,
        handle: &RunHandle,
    ) -> Result<RemoteJobState, PlatformError> {
        Ok(get_run_state(self.scoped(repo), handle).await?)
    }

    async fn list_open_revisions(
        &self,
        repo: &RepoId,
        branch_pattern: &str,
    ) -> Result<Vec<OpenRevision>, PlatformError> {
        let client = self.scoped(repo);
        retry_with_backoff(self.retry, move || async move {
            list_open_prs(client, branch_pattern)
                .await
                .map_err(PlatformError::from)
        })
        .await
    }

    async fn set_status_check(
        &self,
        repo: &RepoId,
        revision: &RevisionId,
        check: &StatusCheck,
    ) -> Result<(), PlatformError> {
        let client = self.scoped(repo);
        retry_with_backoff(self.retry, move || async move {
            post_status(client, revision, check)
                .await
                .map_err(PlatformError::from)
        })
        .await
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

async fn get_branch_exists(client: RepoClient<'_>, branch: &str) -> Result<bool, GitHubApiError> {
    // '/' in branch names must be encoded: "feature/foo" -> "feature%2Ffoo"
    let url = client.path(&format!("branches/{}", urlencoding::encode(branch)));
    let result: Result<serde_json::Value, _> = client.inner().get(&url, None::<&()>).await;

    match result {
        Ok(_) => Ok(true),
        Err(e) => {
            let err = GitHubApiError::from_octocrab(e);
            if err.is_not_found() {
                Ok(false)
            } else {
                Err(err)
            }
        }
    }
}

async fn dispatch_workflow(
    client: RepoClient<'_>,
    workflow: &str,
    branch: &str,
) -> Result<RunHandle, GitHubApiError> {
    let known: HashSet<u64> = list_dispatch_runs(client, workflow, branch)
        .await?
        .into_iter()
        .map(|run| run.id)
        .collect();
    let since = Utc::now() - chrono::Duration::seconds(CLOCK_SKEW_SECS);

    client
        .inner()
        .actions()
        .create_workflow_dispatch(client.owner(), client.repo_name(), workflow, branch)
        .send()
        .await
        .map_err(GitHubApiError::from_octocrab)?;

    tracing::debug!(repo = %client.repo(), workflow, branch, "Workflow dispatched, correlating run");

    for attempt in 0..CORRELATION_ATTEMPTS {
        tokio::time::sleep(CORRELATION_DELAY).await;

        let runs = list_dispatch_runs(client, workflow, branch).await?;
        if let Some(id) = pick_dispatched_run(&runs, &known, since) {
            tracing::debug!(repo = %client.repo(), workflow, run_id = id, attempt, "Correlated dispatched run");
            return Ok(RunHandle::new(id.to_string()));
        }
    }

    Err(GitHubApiError::permanent(format!(
        "workflow {} was dispatched on {} but no run appeared",
        workflow, branch
    )))
}

async fn list_dispatch_runs(
    client: RepoClient<'_>,
    workflow: &str,
    branch: &str,
) -> Result<Vec<WorkflowRunResponse>, GitHubApiError> {
    let url = client.path(&format!(
        "actions/workflows/{}/runs",
        urlencoding::encode(workflow)
    ));
    let query = WorkflowRunsQuery {
        branch,
        event: "workflow_dispatch",
        per_page: 20,
    };

    let response: WorkflowRunsResponse = client
        .inner()
        .get(&url, Some(&query))
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(response.workflow_runs)
}

/// Picks the earliest run created at or after `since` that is not in `known`,
/// the runs listed before dispatching.
fn pick_dispatched_run(
    runs: &[WorkflowRunResponse],
    known: &HashSet<u64>,
    since: DateTime<Utc>,
) -> Option<u64> {
    runs.iter()
        .filter(|run| run.created_at >= since && !known.contains(&run.id))
        .min_by_key(|run| (run.created_at, run.id))
        .map(|run| run.id)
}

async fn get_run_state(
    client: RepoClient<'_>,
    handle: &RunHandle,
) -> Result<RemoteJobState, GitHubApiError> {
    let run_id: u64 = handle.as_str().parse().map_err(|_| {
        GitHubApiError::permanent(format!("invalid run handle {:?}", handle.as_str()))
    })?;

    let url = client.path(&format!("actions/runs/{}", run_id));
    let run: WorkflowRunResponse = client
        .inner()
        .get(&url, None::<&()>)
        .await
        .map_err(GitHubApiError::from_octocrab)?;

    Ok(remote_state(run.status.as_deref(), run.conclusion.as_deref()))
}

/// Maps a workflow run's `status`/`conclusion` pair to a [`RemoteJobState`].
fn remote_state(status: Option<&str>, conclusion: Option<&str>) -> RemoteJobState {
    match status {
        Some("completed") => match conclusion {
            Some("success" | "neutral" | "skipped") => RemoteJobState::Succeeded,
            _ => RemoteJobState::Failed,
        },
        Some("in_progress") => RemoteJobState::Running,
        _ => RemoteJobState::Pending,
    }
}

async fn list_open_prs(
    client: RepoClient<'_>,
    branch_pattern: &str,
) -> Result<Vec<OpenRevision>, GitHubApiError> {
    let mut page = 1u32;
    let mut matching = Vec::new();

    loop {
        let page_result = client
            .inner()
            .pulls(client.owner(), client.repo_name())
            .list()
            .state(octocrab::params::State::Open)
            .per_page(100)
            .page(page)
            .send()
            .await
            .map_err(GitHubApiError::from_octocrab)?;

        let items = page_result.items;
        let is_last_page = items.len() < 100;

        for pull in items {
            if branch_matches(branch_pattern, &pull.head.ref_field) {
                matching.push((
                    pull.number,
                    OpenRevision {
                        branch: pull.head.ref_field,
                        head: RevisionId::new(pull.head.sha),
                    },
                ));
            }
        }

        if is_last_page {
            break;
        }
        page += 1;
    }

    matching.sort_by_key(|(number, _)| *number);
    Ok(matching.into_iter().map(|(_, rev)| rev).collect())
}

async fn post_status(
    client: RepoClient<'_>,
    revision: &RevisionId,
    check: &StatusCheck,
) -> Result<(), GitHubApiError> {
    let url = client.path(&format!("statuses/{}", revision.as_str()));
    let body = StatusRequest {
        state: check.state.as_api_str(),
        context: &check.context,
        description: truncate_description(&check.description),
    };

    let _: serde_json::Value = client
        .inner()
        .post(&url, Some(&body))
        .await
        .map_err(GitHubApiError::from_octocrab)?;
    Ok(())
}

fn truncate_description(description: &str) -> &str {
    match description.char_indices().nth(MAX_STATUS_DESCRIPTION) {
        Some((idx, _)) => &description[..idx],
        None => description,
    }
}
