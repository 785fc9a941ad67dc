//! GitHub Actions implementation of the remote platform.
//!
//! Key features:
//! - Distinguishes transient vs permanent errors
//! - Exponential backoff retry on listing and status writes
//! - Correlates `workflow_dispatch` triggers with the run they start

mod client;
mod error;
mod platform;

pub use client::RepoClient;
pub use error::GitHubApiError;
pub use platform::GitHubPlatform;
