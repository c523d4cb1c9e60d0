//! WebSocket message types.
//!
//! Commands flow client-to-server, events server-to-client. Both are tagged
//! JSON objects; the tag is the `type` field in kebab-case.

use serde::{Deserialize, Serialize};

use crate::session::{PartialConfig, SessionConfig, SessionSnapshot};
use crate::venv::VenvStatus;

/// Client-to-server command.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsCommand {
    /// Raw keystrokes for the PTY.
    Input { data: String },
    /// Terminal viewport change.
    Resize { cols: u16, rows: u16 },
    /// Start virtual environment orchestration, optionally overriding
    /// session config for this run.
    SetupVenv {
        #[serde(default)]
        config: Option<PartialConfig>,
    },
    /// Request a full session state snapshot.
    GetState,
    /// Merge the given fields into the session config.
    UpdateConfig { config: PartialConfig },
    /// Append a command line to the session history.
    SaveHistory { command: String },
}

/// Server-to-client event.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WsEvent {
    /// Sent once immediately after the connection is accepted.
    Connected {
        #[serde(rename = "terminalId")]
        terminal_id: String,
    },
    /// Terminal output chunk.
    Output { data: String },
    /// Progress of virtual environment orchestration.
    VenvStatus {
        #[serde(flatten)]
        status: VenvStatus,
    },
    /// Recoverable error surfaced to the client.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        kind: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        remediation: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        link: Option<String>,
    },
    /// The shell process exited.
    Exit {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<String>,
    },
    /// Full session state snapshot, in response to `get-state`.
    State {
        #[serde(flatten)]
        state: SessionSnapshot,
    },
    /// Acknowledges `update-config` with the merged result.
    ConfigUpdated { config: SessionConfig },
}

/// Query parameters accepted on the WebSocket upgrade request.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "terminalId")]
    pub terminal_id: Option<String>,
    pub cwd: Option<String>,
    /// JSON-encoded [`PartialConfig`] applied on top of the defaults.
    pub config: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::venv::VenvPhase;

    #[test]
    fn test_command_parses_kebab_case_tags() {
        let cmd: WsCommand = serde_json::from_str(r#"{"type":"input","data":"ls\n"}"#).unwrap();
        assert!(matches!(cmd, WsCommand::Input { data } if data == "ls\n"));

        let cmd: WsCommand =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert!(matches!(cmd, WsCommand::Resize { cols: 120, rows: 40 }));

        let cmd: WsCommand = serde_json::from_str(r#"{"type":"setup-venv"}"#).unwrap();
        assert!(matches!(cmd, WsCommand::SetupVenv { config: None }));

        let cmd: WsCommand = serde_json::from_str(
            r#"{"type":"update-config","config":{"autoCreateEnv":false}}"#,
        )
        .unwrap();
        match cmd {
            WsCommand::UpdateConfig { config } => {
                assert_eq!(config.auto_create_env, Some(false));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_command_type_is_an_error() {
        let result = serde_json::from_str::<WsCommand>(r#"{"type":"self-destruct"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = WsEvent::Output {
            data: "hello".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "output");
        assert_eq!(json["data"], "hello");

        let event = WsEvent::Exit {
            code: Some(0),
            signal: None,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "exit");
        assert_eq!(json["code"], 0);
        assert!(json.get("signal").is_none());
    }

    #[test]
    fn test_venv_status_fields_are_flattened() {
        let event = WsEvent::VenvStatus {
            status: VenvStatus {
                phase: VenvPhase::Creating,
                message: "Creating virtual environment (3s)".to_string(),
                remediation: None,
                link: None,
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "venv-status");
        assert_eq!(json["phase"], "creating");
        assert_eq!(json["message"], "Creating virtual environment (3s)");
    }
}
