//! HTTP surface of the orchestrator.
//!
//! # Endpoints
//!
//! - `POST /api/v1/changesets/{id}/run` - Runs the build graph and resolves the gate
//! - `POST /api/v1/changesets/{id}/invalidate` - Records a modification
//! - `POST /api/v1/changesets/{id}/repos/{owner}/{repo}/test-signal` - Manual success check
//! - `GET /api/v1/changesets/{id}/state` - Gate record and active run as JSON
//! - `POST /webhook` - GitHub `pull_request` deliveries, mapped to `invalidate`
//! - `GET /health` - Liveness probe
//!
//! Change-set ids are branch names and usually contain `/`; clients send them
//! percent-encoded (`feature%2Fx`).

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::orchestrator::Orchestrator;
use crate::persistence::GateStore;
use crate::platform::RemotePlatform;

mod changeset;
mod health;
mod signature;
mod webhook;


pub use changeset::ApiError;
pub use signature::WebhookSecret;

/// Shared application state, passed to handlers via axum's `State` extractor.
pub struct AppState<P, S> {
    orchestrator: Arc<Orchestrator<P, S>>,
    /// `None` disables the webhook endpoint.
    webhook_secret: Option<WebhookSecret>,
}

// Derived Clone would require P: Clone and S: Clone.
impl<P, S> Clone for AppState<P, S> {
    fn clone(&self) -> Self {
        AppState {
            orchestrator: Arc::clone(&self.orchestrator),
            webhook_secret: self.webhook_secret.clone(),
        }
    }
}

impl<P, S> AppState<P, S> {
    pub fn new(orchestrator: Arc<Orchestrator<P, S>>, webhook_secret: Option<WebhookSecret>) -> Self {
        AppState {
            orchestrator,
            webhook_secret,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator<P, S> {
        &self.orchestrator
    }

    pub fn webhook_secret(&self) -> Option<&WebhookSecret> {
        self.webhook_secret.as_ref()
    }
}

/// Builds the axum Router with all endpoints.
pub fn build_router<P: RemotePlatform, S: GateStore>(app_state: AppState<P, S>) -> Router {
    Router::new()
        .route(
            "/api/v1/changesets/{id}/run",
            post(changeset::run_handler::<P, S>),
        )
        .route(
            "/api/v1/changesets/{id}/invalidate",
            post(changeset::invalidate_handler::<P, S>),
        )
        .route(
            "/api/v1/changesets/{id}/repos/{owner}/{repo}/test-signal",
            post(changeset::test_signal_handler::<P, S>),
        )
        .route(
            "/api/v1/changesets/{id}/state",
            get(changeset::state_handler::<P, S>),
        )
        .route("/webhook", post(webhook::webhook_handler::<P, S>))
        .route("/health", get(health::health_handler::<P, S>))
        .with_state(app_state)
}
