//! HTTP handlers for health, session listing, and dependency installs.

use axum::{Json, extract::State};
use log::info;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::session::SessionInfo;
use crate::venv;
use crate::ws::types::WsEvent;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_sessions: usize,
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_sessions: state.registry.len(),
    })
}

/// GET /sessions
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.list())
}

#[derive(Deserialize)]
pub struct InstallRequest {
    #[serde(rename = "terminalId")]
    pub terminal_id: String,
}

#[derive(Serialize)]
pub struct InstallResponse {
    pub success: bool,
    pub command: String,
}

/// POST /install-requirements
///
/// Types the install command into the session's shell and returns without
/// waiting for it to finish. Progress events go out over the session's
/// WebSocket.
pub async fn install_requirements(
    State(state): State<AppState>,
    Json(req): Json<InstallRequest>,
) -> ApiResult<Json<InstallResponse>> {
    let session = state
        .registry
        .get(&req.terminal_id)
        .ok_or_else(|| ApiError::not_found(format!("unknown terminal {}", req.terminal_id)))?;

    let command = venv::install_command(&session.working_directory)
        .ok_or_else(|| ApiError::conflict("no dependency manifest in working directory"))?;

    info!("install requested for {}: {command}", session.id);

    let delay = state.venv.install_notify_delay;
    let response_command = command.clone();
    tokio::spawn(async move {
        let (status_tx, mut status_rx) = mpsc::channel(16);

        let events = session.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                if events.send(WsEvent::VenvStatus { status }).await.is_err() {
                    break;
                }
            }
        });

        if let Err(e) = venv::trigger_install(&session.pty, &command, &status_tx, delay).await {
            log::warn!("install trigger for {} failed: {e}", session.id);
        }
        drop(status_tx);
        let _ = forwarder.await;
    });

    Ok(Json(InstallResponse {
        success: true,
        command: response_command,
    }))
}
