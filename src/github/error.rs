//! Classification of GitHub API failures.
//!
//! Every octocrab error is mapped to a [`PlatformErrorKind`]. 5xx, 429,
//! rate-limit 403s and network failures are transient; everything else,
//! including a workflow without a `workflow_dispatch` trigger (422), is
//! permanent.

use std::fmt;

use thiserror::Error;

use crate::platform::{PlatformError, PlatformErrorKind};

/// A failed GitHub call.
#[derive(Debug, Error)]
pub struct GitHubApiError {
    pub kind: PlatformErrorKind,
    pub status: Option<u16>,
    pub message: String,
    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for GitHubApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(status) = self.status {
            write!(f, "GitHub returned {}: {}", status, self.message)
        } else {
            write!(f, "GitHub request failed: {}", self.message)
        }
    }
}

impl GitHubApiError {
    /// A failure detected locally, such as an unusable response.
    pub fn permanent(message: impl Into<String>) -> Self {
        GitHubApiError {
            kind: PlatformErrorKind::Permanent,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status = match &err {
            octocrab::Error::GitHub { source, .. } => Some(source.status_code.as_u16()),
            other => scan_status(&other.to_string()),
        };
        let message = err.to_string();
        GitHubApiError {
            kind: classify(status, &message.to_lowercase()),
            status,
            message,
            source: Some(err),
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status == Some(404)
    }
}

impl From<GitHubApiError> for PlatformError {
    fn from(err: GitHubApiError) -> Self {
        PlatformError {
            kind: err.kind,
            message: err.to_string(),
        }
    }
}

const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "abuse detection"];
const NETWORK_MARKERS: &[&str] = &["timeout", "timed out", "connection", "network", "dns"];

/// `message` must already be lowercased.
fn classify(status: Option<u16>, message: &str) -> PlatformErrorKind {
    let mentions = |markers: &[&str]| markers.iter().any(|m| message.contains(m));
    let transient = match status {
        Some(429) | Some(500..=599) => true,
        Some(403) => mentions(RATE_LIMIT_MARKERS),
        Some(_) => false,
        None => mentions(NETWORK_MARKERS),
    };
    if transient {
        PlatformErrorKind::Transient
    } else {
        PlatformErrorKind::Permanent
    }
}

/// Finds an HTTP status in errors octocrab only renders as text,
/// e.g. `"... status: 503 ..."`.
fn scan_status(rendered: &str) -> Option<u16> {
    let (_, rest) = rendered.split_once("status: ")?;
    let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok().filter(|code| (100..600).contains(code))
}
