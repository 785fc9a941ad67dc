//! Change-set endpoints.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{info, warn};

use super::AppState;
use crate::gate::{GateError, GateView, InvalidationReport};
use crate::orchestrator::{OrchestrateError, RunReport};
use crate::persistence::GateStore;
use crate::platform::RemotePlatform;
use crate::types::{ChangeSetId, RepoId, RevisionId};

/// Errors returned by the change-set endpoints.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Run(#[from] OrchestrateError),
}

impl ApiError {
    fn gate_error(&self) -> &GateError {
        match self {
            ApiError::Gate(e) => e,
            ApiError::Run(e) => e.gate_error(),
        }
    }
}

/// HTTP status for a failed gate operation.
pub(super) fn gate_status(error: &GateError) -> StatusCode {
    match error {
        GateError::ConcurrentRunRejected(_) => StatusCode::CONFLICT,
        GateError::NoOpenRevision { .. } => StatusCode::NOT_FOUND,
        GateError::Platform(_) => StatusCode::BAD_GATEWAY,
        GateError::NotActiveRun { .. } | GateError::NotSucceeded { .. } | GateError::Store(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = gate_status(self.gate_error());
        if status.is_server_error() {
            warn!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}

/// Runs every build node for the change set and resolves the gate.
///
/// Responds once the run is resolved, which may take as long as the slowest
/// dependency chain of remote jobs.
pub async fn run_handler<P: RemotePlatform, S: GateStore>(
    State(app_state): State<AppState<P, S>>,
    Path(id): Path<String>,
) -> Result<Json<RunReport>, ApiError> {
    let id = ChangeSetId::new(id);
    info!(change_set = %id, "Run requested");
    let report = app_state.orchestrator().run_orchestration(&id).await?;
    Ok(Json(report))
}

pub async fn invalidate_handler<P: RemotePlatform, S: GateStore>(
    State(app_state): State<AppState<P, S>>,
    Path(id): Path<String>,
) -> Result<Json<InvalidationReport>, ApiError> {
    let id = ChangeSetId::new(id);
    Ok(Json(app_state.orchestrator().invalidate(&id).await?))
}

/// Writes a manual success check on one repository's open revision.
pub async fn test_signal_handler<P: RemotePlatform, S: GateStore>(
    State(app_state): State<AppState<P, S>>,
    Path((id, owner, repo)): Path<(String, String, String)>,
) -> Result<Json<RevisionId>, ApiError> {
    let id = ChangeSetId::new(id);
    let repo = RepoId::new(owner, repo);
    Ok(Json(
        app_state
            .orchestrator()
            .publish_test_signal(&id, &repo)
            .await?,
    ))
}

pub async fn state_handler<P: RemotePlatform, S: GateStore>(
    State(app_state): State<AppState<P, S>>,
    Path(id): Path<String>,
) -> Result<Json<GateView>, ApiError> {
    let id = ChangeSetId::new(id);
    Ok(Json(app_state.orchestrator().gate_state(&id).await?))
}
