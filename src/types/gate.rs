//! Per-change-set merge gate state.
//!
//! `GateRecord` is the persisted form of the gate state machine:
//!
//! ```text
//! Pending ──invalidate──► Invalidated ──start_run──► Running ──resolve──► Succeeded | Failed
//!    │                         ▲                        │                      │
//!    └──────start_run──────────┼────────────────────────┼──────────────────────┘ (re-run)
//!                              └──────invalidate────────┴──── from any phase
//! ```
//!
//! The generation counter only ever grows. A run captures it at start and its
//! result is honoured only if it is unchanged when the run resolves.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ChangeSetId, RepoId, RevisionId};
use super::run::RunOutcome;

/// Current schema version of persisted gate records.
pub const SCHEMA_VERSION: u32 = 1;

/// Merge-eligibility phase of a change set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatePhase {
    /// Never modified or run.
    Pending,
    /// Modified since the last resolved run; any earlier approval is void.
    Invalidated,
    /// An orchestration run is in flight and no modification has been seen since it started.
    Running,
    Succeeded,
    Failed,
}

/// State of an externally visible status check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    Pending,
    Success,
    Failure,
    Error,
}

impl CheckState {
    /// Returns the GitHub commit status API string for this state.
    pub fn as_api_str(&self) -> &'static str {
        match self {
            CheckState::Pending => "pending",
            CheckState::Success => "success",
            CheckState::Failure => "failure",
            CheckState::Error => "error",
        }
    }
}

/// A status check to be written on one revision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCheck {
    pub context: String,
    pub state: CheckState,
    pub description: String,
}

/// The last status check this gate wrote for a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedCheck {
    pub revision: RevisionId,
    pub state: CheckState,
}

/// Persisted gate state for one change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRecord {
    pub schema_version: u32,
    pub change_set: ChangeSetId,
    pub phase: GatePhase,
    pub generation: u64,
    /// Last check written per repository.
    #[serde(default)]
    pub checks: BTreeMap<RepoId, PublishedCheck>,
    pub updated_at: DateTime<Utc>,
}

impl GateRecord {
    /// Creates the initial record for a change set that has never been seen.
    pub fn new(change_set: ChangeSetId) -> Self {
        GateRecord {
            schema_version: SCHEMA_VERSION,
            change_set,
            phase: GatePhase::Pending,
            generation: 0,
            checks: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Records a modification: bumps the generation and voids any approval.
    ///
    /// Returns the new generation.
    pub fn invalidate(&mut self) -> u64 {
        self.generation += 1;
        self.phase = GatePhase::Invalidated;
        self.touch();
        self.generation
    }

    /// Marks a run as started and returns the generation it captures.
    pub fn start_run(&mut self) -> u64 {
        self.phase = GatePhase::Running;
        self.touch();
        self.generation
    }

    /// Returns true if no modification happened since `captured` was taken.
    pub fn is_current(&self, captured: u64) -> bool {
        self.generation == captured
    }

    /// Resolves a run that captured generation `captured`.
    ///
    /// If the generation is unchanged the phase follows the outcome and `true`
    /// is returned. Otherwise the run is stale: the phase is `Invalidated` and
    /// `false` is returned.
    pub fn resolve_run(&mut self, captured: u64, outcome: RunOutcome) -> bool {
        let current = self.is_current(captured);
        self.phase = match (current, outcome) {
            (true, RunOutcome::Succeeded) => GatePhase::Succeeded,
            (true, RunOutcome::Failed) => GatePhase::Failed,
            (false, _) => GatePhase::Invalidated,
        };
        self.touch();
        current
    }

    /// Voids a stale run without resolving it (publish suppressed on revisions).
    pub fn suppress(&mut self) {
        self.phase = GatePhase::Invalidated;
        self.touch();
    }

    /// Fixes up a record loaded after a restart.
    ///
    /// A persisted `Running` phase belongs to a run that died with the previous
    /// process, so its result can never be published.
    pub fn recover(&mut self) -> bool {
        if self.phase == GatePhase::Running {
            self.phase = GatePhase::Invalidated;
            self.touch();
            true
        } else {
            false
        }
    }

    /// Returns true unless `state` is already the last check written on `revision`.
    pub fn needs_write(&self, repo: &RepoId, revision: &RevisionId, state: CheckState) -> bool {
        match self.checks.get(repo) {
            Some(check) => check.revision != *revision || check.state != state,
            None => true,
        }
    }

    /// Remembers a successful status write.
    pub fn record_check(&mut self, repo: RepoId, revision: RevisionId, state: CheckState) {
        self.checks.insert(repo, PublishedCheck { revision, state });
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
