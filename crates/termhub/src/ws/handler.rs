//! WebSocket connection handling for terminal sessions.
//!
//! Each connection owns one PTY session. Three tasks cooperate per
//! connection: a bridge pumping PTY events into the session's event channel,
//! a send loop draining that channel to the socket (with keepalive pings),
//! and the receive loop below dispatching client commands. When the
//! connection ends for any reason the session is removed from the registry
//! and its shell killed.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::api::AppState;
use crate::session::{PartialConfig, Session, SessionConfig};
use crate::term::{PtyEvent, PtyProcess, ShellInput};
use crate::venv;
use crate::ws::types::{ConnectParams, WsCommand, WsEvent};

const PING_INTERVAL_SECS: u64 = 30;
const EVENT_CHANNEL_CAPACITY: usize = 256;
const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;

/// GET /ws/terminal
pub async fn terminal_ws(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, params, state))
}

fn resolve_cwd(requested: Option<String>) -> PathBuf {
    if let Some(cwd) = requested {
        let path = PathBuf::from(shellexpand::tilde(&cwd).into_owned());
        if path.is_dir() {
            return path.canonicalize().unwrap_or(path);
        }
        warn!("requested cwd {cwd:?} is not a directory, falling back");
    }
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn initial_config(raw: Option<&str>) -> SessionConfig {
    let mut config = SessionConfig::default();
    if let Some(raw) = raw {
        match serde_json::from_str::<PartialConfig>(raw) {
            Ok(partial) => partial.apply_to(&mut config),
            Err(e) => warn!("ignoring malformed config parameter: {e}"),
        }
    }
    config
}

async fn handle_connection(socket: WebSocket, params: ConnectParams, state: AppState) {
    let terminal_id = params
        .terminal_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let cwd = resolve_cwd(params.cwd);
    let config = initial_config(params.config.as_deref());

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (pty, mut pty_rx) = match PtyProcess::spawn(
        &state.shell,
        &[],
        &cwd,
        INITIAL_COLS,
        INITIAL_ROWS,
    ) {
        Ok(spawned) => spawned,
        Err(e) => {
            error!("failed to spawn shell for {terminal_id}: {e}");
            let event = WsEvent::Error {
                message: format!("Failed to start shell: {e}"),
                kind: Some("spawn".to_string()),
                remediation: Some(format!(
                    "Check that `{}` is installed and executable",
                    state.shell
                )),
                link: None,
            };
            if let Ok(json) = serde_json::to_string(&event) {
                let _ = ws_sender.send(Message::Text(json.into())).await;
            }
            let _ = ws_sender.close().await;
            return;
        }
    };

    let (events_tx, mut events_rx) = mpsc::channel::<WsEvent>(EVENT_CHANNEL_CAPACITY);
    let session = Arc::new(Session::new(
        terminal_id.clone(),
        cwd,
        pty,
        events_tx.clone(),
        config,
    ));
    state.registry.insert(session.clone());
    info!(
        "terminal {terminal_id} connected ({} active)",
        state.registry.len()
    );

    let _ = events_tx
        .send(WsEvent::Connected {
            terminal_id: terminal_id.clone(),
        })
        .await;

    // PTY -> event channel bridge.
    let bridge_tx = events_tx.clone();
    let bridge_task = tokio::spawn(async move {
        while let Some(event) = pty_rx.recv().await {
            let (ws_event, is_exit) = match event {
                PtyEvent::Output(data) => (WsEvent::Output { data }, false),
                PtyEvent::Exit { code, signal } => (WsEvent::Exit { code, signal }, true),
            };
            if bridge_tx.send(ws_event).await.is_err() || is_exit {
                break;
            }
        }
    });

    // Event channel -> socket, with keepalive pings.
    let send_task = tokio::spawn(async move {
        let mut ping_interval =
            tokio::time::interval(Duration::from_secs(PING_INTERVAL_SECS));
        ping_interval.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    let Some(event) = event else { break };
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("failed to serialize event: {e}");
                            continue;
                        }
                    };
                    if ws_sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Receive loop: dispatch client commands until the socket closes.
    while let Some(message) = ws_receiver.next().await {
        match message {
            Ok(Message::Text(text)) => match serde_json::from_str::<WsCommand>(&text) {
                Ok(command) => handle_command(command, &session, &state).await,
                Err(e) => warn!("ignoring malformed command on {terminal_id}: {e}"),
            },
            Ok(Message::Binary(_)) => debug!("ignoring binary frame on {terminal_id}"),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!("terminal {terminal_id} sent close");
                break;
            }
            Err(e) => {
                debug!("terminal {terminal_id} socket error: {e}");
                break;
            }
        }
    }

    send_task.abort();
    bridge_task.abort();
    // Kill only the shell this connection spawned. The registry entry may
    // already belong to a reconnect that reused the terminal id, in which
    // case it stays put.
    if let Err(e) = session.pty.kill() {
        warn!("failed to kill shell for {terminal_id}: {e}");
    }
    state.registry.remove_if_current(&terminal_id, &session);
    info!(
        "terminal {terminal_id} disconnected ({} active)",
        state.registry.len()
    );
}

async fn handle_command(command: WsCommand, session: &Arc<Session>, state: &AppState) {
    match command {
        WsCommand::Input { data } => {
            if let Err(e) = session.pty.write_input(&data) {
                warn!("input to {} failed: {e}", session.id);
            }
        }
        WsCommand::Resize { cols, rows } => {
            if let Err(e) = session.pty.resize(cols, rows) {
                warn!("resize of {} failed: {e}", session.id);
            }
        }
        WsCommand::SetupVenv { config } => {
            if let Some(ref partial) = config {
                session.update_config(partial);
            }
            spawn_venv_orchestration(session.clone(), state.venv.clone());
        }
        WsCommand::GetState => {
            let _ = session
                .events
                .send(WsEvent::State {
                    state: session.snapshot(),
                })
                .await;
        }
        WsCommand::UpdateConfig { config } => {
            let merged = session.update_config(&config);
            let _ = session
                .events
                .send(WsEvent::ConfigUpdated { config: merged })
                .await;
        }
        WsCommand::SaveHistory { command } => {
            session.push_history(command);
        }
    }
}

/// Run venv orchestration in the background, forwarding its progress to the
/// session's event channel.
fn spawn_venv_orchestration(session: Arc<Session>, settings: venv::VenvSettings) {
    tokio::spawn(async move {
        let (status_tx, mut status_rx) = mpsc::channel(64);

        let forward_session = session.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(status) = status_rx.recv().await {
                if forward_session
                    .events
                    .send(WsEvent::VenvStatus { status })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let result = venv::run(
            &session.working_directory,
            &session.config(),
            &settings,
            &session.pty as &dyn ShellInput,
            &status_tx,
        )
        .await;
        drop(status_tx);
        let _ = forwarder.await;

        match result {
            Ok(Some(env)) => session.set_env(env),
            Ok(None) => {}
            Err(e) => {
                warn!("venv orchestration for {} failed: {e}", session.id);
                let _ = session
                    .events
                    .send(WsEvent::Error {
                        message: format!("Environment setup failed: {e}"),
                        kind: Some("venv".to_string()),
                        remediation: None,
                        link: None,
                    })
                    .await;
            }
        }
    });
}
