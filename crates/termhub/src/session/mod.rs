//! Session registry and per-session state.
//!
//! A session owns one PTY process plus the mutable state that travels with
//! it: behavior config, virtual environment status, and a bounded command
//! history. Sessions live in a [`SessionRegistry`] keyed by terminal id.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::term::PtyProcess;
use crate::ws::types::WsEvent;

/// Maximum number of history entries retained per session.
pub const HISTORY_LIMIT: usize = 500;

/// Dependency installation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoInstallDeps {
    /// Pause and let the client decide.
    Ask,
    /// Install without asking.
    Always,
    /// Never install automatically.
    Never,
}

/// Per-session behavior configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub auto_create_env: bool,
    pub auto_activate_env: bool,
    pub auto_install_deps: AutoInstallDeps,
    pub preferred_runtime_command: String,
    pub show_env_in_tree: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_create_env: true,
            auto_activate_env: true,
            auto_install_deps: AutoInstallDeps::Ask,
            preferred_runtime_command: "python3".to_string(),
            show_env_in_tree: false,
        }
    }
}

/// Partial config for merge-style updates. Absent fields keep their
/// current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialConfig {
    pub auto_create_env: Option<bool>,
    pub auto_activate_env: Option<bool>,
    pub auto_install_deps: Option<AutoInstallDeps>,
    pub preferred_runtime_command: Option<String>,
    pub show_env_in_tree: Option<bool>,
}

impl PartialConfig {
    /// Merge the set fields into `config`.
    pub fn apply_to(&self, config: &mut SessionConfig) {
        if let Some(v) = self.auto_create_env {
            config.auto_create_env = v;
        }
        if let Some(v) = self.auto_activate_env {
            config.auto_activate_env = v;
        }
        if let Some(v) = self.auto_install_deps {
            config.auto_install_deps = v;
        }
        if let Some(ref v) = self.preferred_runtime_command {
            config.preferred_runtime_command = v.clone();
        }
        if let Some(v) = self.show_env_in_tree {
            config.show_env_in_tree = v;
        }
    }
}

/// Virtual environment state attached to a session.
#[derive(Debug, Clone, Default)]
pub struct EnvironmentState {
    pub active: bool,
    pub path: Option<PathBuf>,
    pub runtime_executable: Option<PathBuf>,
}

/// Serializable snapshot of a session, sent over the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub terminal_id: String,
    pub cwd: String,
    pub is_venv_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venv_path: Option<String>,
    pub config: SessionConfig,
    pub history_count: usize,
    pub created_at: DateTime<Utc>,
}

/// One interactive terminal session.
pub struct Session {
    pub id: String,
    pub working_directory: PathBuf,
    pub pty: PtyProcess,
    /// Channel into this session's WebSocket send loop.
    pub events: mpsc::Sender<WsEvent>,
    pub created_at: DateTime<Utc>,
    config: RwLock<SessionConfig>,
    env: RwLock<EnvironmentState>,
    history: Mutex<VecDeque<String>>,
}

impl Session {
    pub fn new(
        id: String,
        working_directory: PathBuf,
        pty: PtyProcess,
        events: mpsc::Sender<WsEvent>,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            working_directory,
            pty,
            events,
            created_at: Utc::now(),
            config: RwLock::new(config),
            env: RwLock::new(EnvironmentState::default()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> SessionConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    /// Merge a partial update into the config and return the result.
    pub fn update_config(&self, update: &PartialConfig) -> SessionConfig {
        let mut config = self.config.write().expect("config lock poisoned");
        update.apply_to(&mut config);
        config.clone()
    }

    pub fn env(&self) -> EnvironmentState {
        self.env.read().expect("env lock poisoned").clone()
    }

    pub fn set_env(&self, env: EnvironmentState) {
        *self.env.write().expect("env lock poisoned") = env;
    }

    /// Append a command to the history, evicting the oldest entry past the
    /// retention limit.
    pub fn push_history(&self, command: String) {
        let mut history = self.history.lock().expect("history lock poisoned");
        history.push_back(command);
        while history.len() > HISTORY_LIMIT {
            history.pop_front();
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.lock().expect("history lock poisoned").len()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let env = self.env();
        SessionSnapshot {
            terminal_id: self.id.clone(),
            cwd: self.working_directory.display().to_string(),
            is_venv_active: env.active,
            venv_path: env.path.map(|p| p.display().to_string()),
            config: self.config(),
            history_count: self.history_len(),
            created_at: self.created_at,
        }
    }
}

/// Summary of a session for the HTTP listing endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub terminal_id: String,
    pub cwd: String,
    pub is_venv_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub venv_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Concurrent map of live sessions.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session. A session already holding this id is killed and
    /// replaced, so a reconnecting client never leaks a shell process.
    pub fn insert(&self, session: Arc<Session>) {
        if let Some(previous) = self.sessions.insert(session.id.clone(), session.clone()) {
            warn!("replacing existing session {}", previous.id);
            if let Err(e) = previous.pty.kill() {
                warn!("failed to kill replaced session {}: {e}", previous.id);
            }
        }
        debug!("registered session {}", session.id);
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    /// Remove and return a session. The caller decides whether to kill it.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.remove(id).map(|(_, session)| session)
    }

    /// Remove `id` only if the registered session is exactly `session`.
    /// Returns whether the entry was removed. A reconnect can replace the
    /// entry before the old connection finishes tearing down; that stale
    /// teardown must not evict the replacement.
    pub fn remove_if_current(&self, id: &str, session: &Arc<Session>) -> bool {
        self.sessions
            .remove_if(id, |_, current| Arc::ptr_eq(current, session))
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn list(&self) -> Vec<SessionInfo> {
        self.sessions
            .iter()
            .map(|entry| {
                let session = entry.value();
                let env = session.env();
                SessionInfo {
                    terminal_id: session.id.clone(),
                    cwd: session.working_directory.display().to_string(),
                    is_venv_active: env.active,
                    venv_path: env.path.map(|p| p.display().to_string()),
                    created_at: session.created_at,
                }
            })
            .collect()
    }

    /// Kill every session's shell and clear the registry. Used on server
    /// shutdown.
    pub fn shutdown_all(&self) {
        let count = self.sessions.len();
        for entry in self.sessions.iter() {
            if let Err(e) = entry.value().pty.kill() {
                warn!("failed to kill session {} on shutdown: {e}", entry.key());
            }
        }
        self.sessions.clear();
        if count > 0 {
            info!("shut down {count} session(s)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_session_in(id: &str, cwd: &std::path::Path) -> Arc<Session> {
        let (pty, _rx) = PtyProcess::spawn(
            "/bin/sh",
            &["-c".to_string(), "sleep 30".to_string()],
            cwd,
            80,
            24,
        )
        .unwrap();
        let (tx, _rx) = mpsc::channel(16);
        Arc::new(Session::new(
            id.to_string(),
            cwd.to_path_buf(),
            pty,
            tx,
            SessionConfig::default(),
        ))
    }

    fn spawn_session(id: &str) -> (Arc<Session>, tempfile::TempDir) {
        let tmp = tempfile::TempDir::new().unwrap();
        let session = spawn_session_in(id, tmp.path());
        (session, tmp)
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_create_env);
        assert!(config.auto_activate_env);
        assert_eq!(config.auto_install_deps, AutoInstallDeps::Ask);
        assert_eq!(config.preferred_runtime_command, "python3");
        assert!(!config.show_env_in_tree);
    }

    #[test]
    fn test_partial_config_merge_keeps_unset_fields() {
        let mut config = SessionConfig::default();
        let update: PartialConfig =
            serde_json::from_str(r#"{"autoCreateEnv":false,"autoInstallDeps":"never"}"#).unwrap();
        update.apply_to(&mut config);

        assert!(!config.auto_create_env);
        assert_eq!(config.auto_install_deps, AutoInstallDeps::Never);
        // Untouched fields keep their defaults.
        assert!(config.auto_activate_env);
        assert_eq!(config.preferred_runtime_command, "python3");
    }

    #[test]
    fn test_config_deserializes_with_missing_fields() {
        let config: SessionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, SessionConfig::default());
    }

    #[tokio::test]
    async fn test_history_is_capped() {
        let (session, _tmp) = spawn_session("hist");
        for i in 0..(HISTORY_LIMIT + 25) {
            session.push_history(format!("cmd-{i}"));
        }
        assert_eq!(session.history_len(), HISTORY_LIMIT);
    }

    #[tokio::test]
    async fn test_registry_insert_get_remove() {
        let registry = SessionRegistry::new();
        let (session, _tmp) = spawn_session("t1");
        registry.insert(session);

        assert_eq!(registry.len(), 1);
        assert!(registry.get("t1").is_some());
        assert!(registry.get("t2").is_none());

        let removed = registry.remove("t1").unwrap();
        assert_eq!(removed.id, "t1");
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_registry_replaces_duplicate_id() {
        let registry = SessionRegistry::new();
        let (first, _tmp1) = spawn_session("dup");
        let (second, _tmp2) = spawn_session("dup");
        let second_cwd = second.working_directory.clone();

        registry.insert(first);
        registry.insert(second);

        assert_eq!(registry.len(), 1);
        let current = registry.get("dup").unwrap();
        assert_eq!(current.working_directory, second_cwd);
    }

    #[tokio::test]
    async fn test_stale_teardown_leaves_replacement_registered() {
        let registry = SessionRegistry::new();
        let (first, _tmp1) = spawn_session("re");
        let (second, _tmp2) = spawn_session("re");

        registry.insert(first.clone());
        registry.insert(second.clone());

        // The first connection's socket closes after its entry was already
        // replaced by a reconnect. Its cleanup must not evict the
        // replacement.
        first.pty.kill().unwrap();
        assert!(!registry.remove_if_current("re", &first));
        let current = registry.get("re").unwrap();
        assert!(Arc::ptr_eq(&current, &second));

        // The replacement's own teardown still removes it.
        assert!(registry.remove_if_current("re", &second));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_sessions_sharing_cwd_are_independent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let registry = SessionRegistry::new();
        registry.insert(spawn_session_in("a", tmp.path()));
        registry.insert(spawn_session_in("b", tmp.path()));
        assert_eq!(registry.len(), 2);

        // Killing one shell leaves the other session untouched.
        registry.get("a").unwrap().pty.kill().unwrap();
        let b = registry.get("b").unwrap();
        b.push_history("ls".to_string());
        assert_eq!(b.history_len(), 1);
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_env_state() {
        let (session, tmp) = spawn_session("snap");
        let snapshot = session.snapshot();
        assert!(!snapshot.is_venv_active);
        assert!(snapshot.venv_path.is_none());

        session.set_env(EnvironmentState {
            active: true,
            path: Some(tmp.path().join(".venv")),
            runtime_executable: Some(PathBuf::from("/usr/bin/python3")),
        });
        let snapshot = session.snapshot();
        assert!(snapshot.is_venv_active);
        assert!(snapshot.venv_path.is_some());
    }
}
