//! Webhook endpoint.
//!
//! A pull request being opened, reopened or pushed to in one of the configured
//! repositories is a modification of the change set named by its head branch.
//! Such deliveries invalidate that change set synchronously; every other
//! delivery is acknowledged and dropped.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::AppState;
use super::changeset::gate_status;
use crate::gate::GateError;
use crate::persistence::GateStore;
use crate::platform::RemotePlatform;
use crate::types::{ChangeSetId, RepoId};

const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";
const HEADER_SIGNATURE: &str = "x-hub-signature-256";

/// `pull_request` actions that change what a change set contains.
const INVALIDATING_ACTIONS: &[&str] = &["opened", "reopened", "synchronize"];

/// Errors that can occur when processing a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook endpoint is not configured")]
    Disabled,

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("invalid signature")]
    InvalidSignature,

    #[error("invalid pull_request payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Gate(#[from] GateError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::Disabled => StatusCode::SERVICE_UNAVAILABLE,
            WebhookError::MissingHeader(_) => StatusCode::BAD_REQUEST,
            WebhookError::InvalidSignature => StatusCode::UNAUTHORIZED,
            WebhookError::InvalidPayload(_) => StatusCode::BAD_REQUEST,
            WebhookError::Gate(e) => gate_status(e),
        };
        (status, self.to_string()).into_response()
    }
}

/// The subset of a `pull_request` payload the gate reads.
#[derive(Debug, Deserialize)]
struct PullRequestEvent {
    action: String,
    pull_request: PullRequest,
    repository: Repository,
}

#[derive(Debug, Deserialize)]
struct PullRequest {
    head: Head,
}

#[derive(Debug, Deserialize)]
struct Head {
    #[serde(rename = "ref")]
    branch: String,
}

#[derive(Debug, Deserialize)]
struct Repository {
    full_name: String,
}

/// Webhook handler.
///
/// - 200 with an `InvalidationReport` when a change set was invalidated
/// - 202 when the delivery was valid but irrelevant
/// - 400 for missing headers or a malformed `pull_request` payload
/// - 401 for a bad signature
/// - 503 when no webhook secret is configured
pub async fn webhook_handler<P: RemotePlatform, S: GateStore>(
    State(app_state): State<AppState<P, S>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookError> {
    let secret = app_state.webhook_secret().ok_or(WebhookError::Disabled)?;
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let signature = get_header(&headers, HEADER_SIGNATURE)?;
    let delivery = headers
        .get(HEADER_DELIVERY)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-");

    if !secret.verify(&body, signature) {
        warn!(delivery, "Invalid webhook signature");
        return Err(WebhookError::InvalidSignature);
    }

    if event_type != "pull_request" {
        debug!(delivery, event_type, "Ignoring event");
        return Ok(ignored());
    }

    let event: PullRequestEvent = serde_json::from_slice(&body)?;
    if !INVALIDATING_ACTIONS.contains(&event.action.as_str()) {
        debug!(delivery, action = %event.action, "Ignoring pull_request action");
        return Ok(ignored());
    }

    let Ok(repo) = event.repository.full_name.parse::<RepoId>() else {
        debug!(delivery, repository = %event.repository.full_name, "Ignoring unparseable repository");
        return Ok(ignored());
    };
    if !app_state.orchestrator().repositories().contains(&repo) {
        debug!(delivery, %repo, "Ignoring repository outside the build graph");
        return Ok(ignored());
    }

    let id = ChangeSetId::new(event.pull_request.head.branch);
    info!(delivery, %repo, change_set = %id, action = %event.action, "Pull request modified change set");
    let report = app_state.orchestrator().invalidate(&id).await?;
    Ok((StatusCode::OK, Json(report)).into_response())
}

fn ignored() -> Response {
    (StatusCode::ACCEPTED, "Ignored").into_response()
}

fn get_header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(WebhookError::MissingHeader(name))
}
