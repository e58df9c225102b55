//! Events crossing the boundary between the engine and the presentation layer.
//!
//! Events are the only data that crosses: every payload is owned and
//! immutable once produced.

use crate::telemetry::TelemetrySnapshot;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Opaque session identifier. Allocated monotonically and never reused
/// within one engine process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a session's process ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExitStatus {
    /// The process exited on its own with a code.
    Exited { code: i32 },
    /// The process was terminated by a signal (named, e.g. `SIGHUP`).
    Killed { signal: String },
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited { code: 0 })
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Running,
    Exited { code: i32 },
    Killed { signal: String },
}

impl SessionState {
    /// Whether the session has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Exited { .. } | SessionState::Killed { .. })
    }
}

impl From<ExitStatus> for SessionState {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Exited { code } => SessionState::Exited { code },
            ExitStatus::Killed { signal } => SessionState::Killed { signal },
        }
    }
}

/// Summary of one live session, returned by `ListSessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub shell: String,
    pub cwd: String,
    pub rows: u16,
    pub cols: u16,
    #[serde(flatten)]
    pub state: SessionState,
    pub age_secs: u64,
}

/// Commands flowing from the presentation layer into the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    /// Open a new shell session. Unset fields fall back to configuration.
    OpenSession {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        shell: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<u16>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cols: Option<u16>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    CloseSession {
        id: SessionId,
    },
    SessionInput {
        id: SessionId,
        bytes: Vec<u8>,
    },
    Resize {
        id: SessionId,
        rows: u16,
        cols: u16,
    },
    SetSamplingInterval {
        ms: u64,
    },
    ListSessions,
    Shutdown,
}

impl Inbound {
    /// An open request with every field left to configuration defaults.
    pub fn open_default() -> Self {
        Inbound::OpenSession {
            shell: None,
            cwd: None,
            rows: None,
            cols: None,
            env: BTreeMap::new(),
        }
    }
}

/// Events flowing from the engine to the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    SessionOpened {
        id: SessionId,
        shell: String,
        cwd: String,
        rows: u16,
        cols: u16,
    },
    SessionOpenFailed {
        reason: String,
    },
    SessionOutput {
        id: SessionId,
        bytes: Vec<u8>,
    },
    SessionExited {
        id: SessionId,
        status: ExitStatus,
    },
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    /// A command could not be applied (stale identifier, closed session,
    /// undecodable frame).
    CommandRejected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<SessionId>,
        reason: String,
    },
    /// One sampler tick. `dropped_before` counts snapshots the bridge
    /// discarded since the previously delivered one.
    TelemetryUpdate {
        snapshot: TelemetrySnapshot,
        #[serde(default)]
        dropped_before: u64,
    },
    SamplingStalled {
        sequence: u64,
        elapsed_ms: u64,
        interval_ms: u64,
    },
}

impl Outbound {
    /// The session this event belongs to, if any.
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Outbound::SessionOpened { id, .. }
            | Outbound::SessionOutput { id, .. }
            | Outbound::SessionExited { id, .. } => Some(*id),
            Outbound::CommandRejected { id, .. } => *id,
            _ => None,
        }
    }

    /// Telemetry events may be discarded under backpressure; everything
    /// else is delivered.
    pub fn is_telemetry(&self) -> bool {
        matches!(self, Outbound::TelemetryUpdate { .. })
    }

    /// Build a rejection event from an engine error.
    pub fn rejected(id: Option<SessionId>, err: &crate::DeckError) -> Self {
        Outbound::CommandRejected {
            id,
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DeckError;

    #[test]
    fn inbound_json_shape() {
        let json = r#"{"type":"session_input","id":3,"bytes":[104,105]}"#;
        let msg: Inbound = serde_json::from_str(json).unwrap();
        assert_eq!(
            msg,
            Inbound::SessionInput {
                id: SessionId(3),
                bytes: b"hi".to_vec()
            }
        );
    }

    #[test]
    fn open_session_fields_optional() {
        let msg: Inbound = serde_json::from_str(r#"{"type":"open_session"}"#).unwrap();
        assert_eq!(msg, Inbound::open_default());

        let msg: Inbound =
            serde_json::from_str(r#"{"type":"open_session","shell":"bash -l","rows":40}"#)
                .unwrap();
        match msg {
            Inbound::OpenSession { shell, rows, cols, .. } => {
                assert_eq!(shell.as_deref(), Some("bash -l"));
                assert_eq!(rows, Some(40));
                assert_eq!(cols, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn exit_status_tagging() {
        let json = serde_json::to_value(ExitStatus::Killed {
            signal: "SIGHUP".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "killed");
        assert_eq!(json["signal"], "SIGHUP");
        assert!(ExitStatus::Exited { code: 0 }.success());
        assert!(!ExitStatus::Exited { code: 2 }.success());
    }

    #[test]
    fn session_id_routing() {
        let out = Outbound::SessionOutput {
            id: SessionId(7),
            bytes: vec![],
        };
        assert_eq!(out.session_id(), Some(SessionId(7)));
        assert!(!out.is_telemetry());

        let rejected = Outbound::rejected(
            Some(SessionId(9)),
            &DeckError::UnknownSession(SessionId(9)),
        );
        assert_eq!(rejected.session_id(), Some(SessionId(9)));
        match rejected {
            Outbound::CommandRejected { reason, .. } => {
                assert_eq!(reason, "unknown session: 9")
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::from(ExitStatus::Exited { code: 1 }).is_terminal());
    }
}
