//! Orchestration runs and their results.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ChangeSetId, RepoId, RevisionId, RunId};
use super::job::JobRun;

/// Aggregate outcome of an orchestration run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Succeeded,
    Failed,
}

/// Head revision per repository, as observed at one instant.
///
/// Repositories without an open revision on the change set's branch are absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevisionSnapshot(pub BTreeMap<RepoId, RevisionId>);

impl RevisionSnapshot {
    pub fn new() -> Self {
        RevisionSnapshot(BTreeMap::new())
    }

    pub fn insert(&mut self, repo: RepoId, revision: RevisionId) {
        self.0.insert(repo, revision);
    }

    pub fn get(&self, repo: &RepoId) -> Option<&RevisionId> {
        self.0.get(repo)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&RepoId, &RevisionId)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the first repository whose head differs between the two snapshots,
    /// including repositories present in only one of them.
    pub fn first_difference(&self, other: &RevisionSnapshot) -> Option<RepoId> {
        self.0
            .iter()
            .find(|(repo, rev)| other.get(repo) != Some(*rev))
            .map(|(repo, _)| repo.clone())
            .or_else(|| {
                other
                    .0
                    .keys()
                    .find(|repo| !self.0.contains_key(*repo))
                    .cloned()
            })
    }
}

impl FromIterator<(RepoId, RevisionId)> for RevisionSnapshot {
    fn from_iter<T: IntoIterator<Item = (RepoId, RevisionId)>>(iter: T) -> Self {
        RevisionSnapshot(iter.into_iter().collect())
    }
}

/// One full pass of the graph executor over all build nodes for a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationRun {
    pub run_id: RunId,
    pub change_set: ChangeSetId,
    /// Gate generation captured when the run was admitted.
    pub generation: u64,
    /// Head revisions observed when the run was admitted.
    pub snapshot: RevisionSnapshot,
    /// Job runs in graph declaration order.
    pub jobs: Vec<JobRun>,
    pub outcome: RunOutcome,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Why a successful run did not produce a success status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SuppressReason {
    /// The change set was modified after the run started.
    GenerationChanged { captured: u64, current: u64 },
    /// A repository's open revision no longer matches the run's snapshot.
    RevisionsChanged { repo: RepoId },
}

/// Result of publishing a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Success was written on every revision of the snapshot.
    Published { revisions: RevisionSnapshot },
    /// The run was stale; nothing was written.
    Suppressed { reason: SuppressReason },
}

impl PublishOutcome {
    pub fn is_published(&self) -> bool {
        matches!(self, PublishOutcome::Published { .. })
    }
}
