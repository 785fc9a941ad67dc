//! Core domain types for the change-set gate.
//!
//! This module contains the fundamental types shared by the executor, the
//! trigger-and-wait unit and the invalidation coordinator.

pub mod gate;
pub mod ids;
pub mod job;
pub mod run;

// Re-export commonly used types at the module level
pub use gate::{CheckState, GatePhase, GateRecord, PublishedCheck, StatusCheck};
pub use ids::{ChangeSetId, InvalidRepoId, NodeName, RepoId, RevisionId, RunHandle, RunId};
pub use job::{BuildNode, FailureReason, JobFailure, JobRun, JobStatus};
pub use run::{OrchestrationRun, PublishOutcome, RevisionSnapshot, RunOutcome, SuppressReason};
