//! Octocrab client wrapper scoped to a specific repository.
//!
//! `GitHubPlatform` serves every repository of the pipeline through one
//! authenticated `Octocrab`; each call borrows a `RepoClient` so the request
//! helpers never have to thread owner and name separately.

use octocrab::Octocrab;

use crate::types::RepoId;

/// A GitHub API client scoped to one repository.
#[derive(Clone, Copy)]
pub struct RepoClient<'a> {
    client: &'a Octocrab,
    repo: &'a RepoId,
}

impl<'a> RepoClient<'a> {
    pub fn new(client: &'a Octocrab, repo: &'a RepoId) -> Self {
        Self { client, repo }
    }

    /// Returns the underlying octocrab client.
    pub fn inner(&self) -> &'a Octocrab {
        self.client
    }

    pub fn repo(&self) -> &'a RepoId {
        self.repo
    }

    pub fn owner(&self) -> &'a str {
        &self.repo.owner
    }

    pub fn repo_name(&self) -> &'a str {
        &self.repo.repo
    }

    /// Builds a path below `/repos/{owner}/{repo}`.
    pub fn path(&self, suffix: &str) -> String {
        format!("/repos/{}/{}/{}", self.owner(), self.repo_name(), suffix)
    }
}

impl std::fmt::Debug for RepoClient<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepoClient")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}
