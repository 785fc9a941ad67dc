//! Trigger-and-wait unit.
//!
//! Starts one remote build job and waits for its terminal state:
//!
//! - **Branch check**: a node whose branch is absent from its repository is
//!   `Skipped` and nothing is triggered
//! - **Trigger**: exactly one call; a refused trigger fails the node
//! - **Poll loop**: fixed interval, bounded by a deadline, transient errors
//!   retried with backoff; the trigger's handle is reused for every poll
//!
//! Node-level errors never escape: [`JobWaiter::run`] always returns a terminal
//! [`crate::types::JobRun`].

mod config;
mod waiter;


pub use config::{
    MAX_JOB_TIMEOUT_MINS, MAX_POLL_INTERVAL_SECS, OutOfRange, WaitConfig, WaitSettings,
};
pub use waiter::JobWaiter;
