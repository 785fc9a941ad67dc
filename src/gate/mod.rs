//! Invalidation coordinator: the per-change-set merge gate.
//!
//! The coordinator is the only writer of status checks. It reconciles two
//! event streams per change set:
//!
//! - **Modifications** (`invalidate`): bump the generation, void any approval,
//!   mark every open revision pending
//! - **Run results** (`publish`, `record_failure`): honoured only if the
//!   generation captured at run start is still current, and for success only
//!   if every repository's head still matches the run's snapshot
//!
//! # Serialization
//!
//! Each change set has its own `tokio::sync::Mutex`; every operation holds it
//! for its whole read-decide-write sequence, adapter calls included. The outer
//! `RwLock` only guards lookup and insertion, so different change sets never
//! contend.

mod coordinator;


use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::persistence::StoreError;
use crate::platform::PlatformError;
use crate::types::{ChangeSetId, GateRecord, RepoId, RevisionSnapshot, RunId};

pub use coordinator::InvalidationCoordinator;
use coordinator::RunSlot;

/// Status check context written when none is configured.
pub const DEFAULT_STATUS_CONTEXT: &str = "changeset-gate";

/// What a modification does to a run already in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MidRunPolicy {
    /// Let the run finish; its publish is suppressed by the generation check.
    #[default]
    SuppressPublish,
    /// Cancel the run: no new nodes start and in-flight waits end as cancelled.
    Abort,
}

/// The `[status]` table of the pipeline file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusSettings {
    /// Status check context shown on every revision of a change set.
    pub context: String,
}

impl Default for StatusSettings {
    fn default() -> Self {
        Self {
            context: DEFAULT_STATUS_CONTEXT.to_string(),
        }
    }
}

/// Errors from gate operations.
#[derive(Debug, Error)]
pub enum GateError {
    #[error("change set {0} already has an active run")]
    ConcurrentRunRejected(ChangeSetId),

    #[error("{run_id} is not the active run of {change_set}")]
    NotActiveRun { change_set: ChangeSetId, run_id: RunId },

    #[error("{run_id} did not succeed and cannot be published")]
    NotSucceeded { run_id: RunId },

    #[error("no open revision for {change_set} in {repo}")]
    NoOpenRevision { change_set: ChangeSetId, repo: RepoId },

    #[error("platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Result type for gate operations.
pub type Result<T> = std::result::Result<T, GateError>;

/// Admission of a run: what it captured and how to stop it.
///
/// The ticket holds the change set's slot. Keep it alive until the run is
/// published or recorded; dropping it earlier abandons the run.
#[derive(Debug)]
pub struct RunTicket {
    pub run_id: RunId,
    pub change_set: ChangeSetId,
    /// Generation at admission.
    pub generation: u64,
    /// Head revisions at admission, taken under the same lock as `generation`.
    pub snapshot: RevisionSnapshot,
    /// Fired on shutdown, or by `invalidate` under [`MidRunPolicy::Abort`].
    pub cancel: CancellationToken,
    _slot: RunSlot,
}

/// Result of an `invalidate` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub generation: u64,
    /// Repositories whose open revision got a fresh pending check.
    pub marked_pending: Vec<RepoId>,
    /// True if an active run was cancelled by the abort policy.
    pub aborted_run: bool,
}

/// Gate record plus the run currently holding the slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateView {
    #[serde(flatten)]
    pub record: GateRecord,
    pub active_run: Option<RunId>,
}
