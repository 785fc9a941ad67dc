//! Liveness probe.

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use super::AppState;
use crate::persistence::GateStore;
use crate::platform::RemotePlatform;
use crate::types::RepoId;

#[derive(Debug, Serialize)]
pub struct Health {
    status: &'static str,
    nodes: usize,
    repositories: Vec<RepoId>,
}

/// Returns 200 with the shape of the loaded build graph.
///
/// ```ignore
/// GET /health HTTP/1.1
///
/// HTTP/1.1 200 OK
/// {"status":"ok","nodes":2,"repositories":["acme/app","acme/core"]}
/// ```
pub async fn health_handler<P: RemotePlatform, S: GateStore>(
    State(app_state): State<AppState<P, S>>,
) -> Json<Health> {
    let orchestrator = app_state.orchestrator();
    Json(Health {
        status: "ok",
        nodes: orchestrator.graph().len(),
        repositories: orchestrator.repositories().to_vec(),
    })
}
