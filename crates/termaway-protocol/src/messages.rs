use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ClientEntry, SessionEntry};

/// Client -> Server frames.
///
/// `resize` dimensions and `clipboard-set` content are carried as raw JSON
/// values: the dispatch contract drops or rejects ill-typed payloads itself
/// instead of failing the whole frame parse.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    Auth {
        password: String,
    },

    List,

    Create {
        name: String,
    },

    Attach {
        name: String,
    },

    Detach,

    Input {
        data: String,
    },

    Resize {
        #[serde(default)]
        cols: Value,
        #[serde(default)]
        rows: Value,
    },

    Kill {
        name: String,
    },

    Rename {
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },

    ClipboardSet {
        #[serde(default)]
        content: Value,
    },

    ClipboardGet,

    ListClients,

    KickClient {
        #[serde(rename = "clientId")]
        client_id: i64,
    },

    /// Liveness response to a server `ping`.
    Pong,
}

/// Server -> Client frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    AuthRequired {
        required: bool,
    },

    AuthSuccess,

    AuthFailed {
        message: String,
    },

    Sessions {
        list: Vec<SessionEntry>,
    },

    Created {
        name: String,
    },

    Attached {
        name: String,
    },

    Detached,

    Killed {
        name: String,
    },

    Renamed {
        #[serde(rename = "oldName")]
        old_name: String,
        #[serde(rename = "newName")]
        new_name: String,
    },

    Exited {
        name: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
        signal: Option<i32>,
    },

    /// Raw PTY bytes, lossy-converted to UTF-8. Chunk boundaries are
    /// arbitrary; escape sequences may be split across frames.
    Output {
        data: String,
    },

    Error {
        message: String,
    },

    ClipboardUpdate {
        content: String,
    },

    ClipboardContent {
        content: String,
    },

    ClipboardSetOk,

    ClientConnected {
        #[serde(rename = "clientIP")]
        client_ip: String,
        #[serde(rename = "clientCount")]
        client_count: usize,
        timestamp: String,
    },

    ClientDisconnected {
        #[serde(rename = "clientIP")]
        client_ip: String,
        #[serde(rename = "clientCount")]
        client_count: usize,
        timestamp: String,
    },

    Clients {
        list: Vec<ClientEntry>,
    },

    ClientKicked {
        #[serde(rename = "clientId")]
        client_id: usize,
    },

    /// Liveness probe; the client answers with `pong`.
    Ping,
}

/// Why an inbound line failed to parse as a `ClientFrame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParseError {
    /// Not a JSON object (or a JSON object with fields that don't fit the
    /// declared type).
    InvalidJson,
    /// A JSON object whose `type` is not in the accepted set.
    UnknownType(String),
}

impl std::fmt::Display for FrameParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameParseError::InvalidJson => write!(f, "Invalid JSON"),
            FrameParseError::UnknownType(t) => write!(f, "Unknown message type: {}", t),
        }
    }
}

impl std::error::Error for FrameParseError {}

impl ClientFrame {
    /// Parse one wire line into a frame, distinguishing malformed JSON from
    /// a well-formed object with an unrecognized `type`.
    pub fn from_line(line: &str) -> Result<ClientFrame, FrameParseError> {
        let value: Value =
            serde_json::from_str(line).map_err(|_| FrameParseError::InvalidJson)?;
        if !value.is_object() {
            return Err(FrameParseError::InvalidJson);
        }
        match serde_json::from_value::<ClientFrame>(value.clone()) {
            Ok(frame) => Ok(frame),
            Err(_) => {
                let ty = value
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if Self::is_known_type(ty) {
                    Err(FrameParseError::InvalidJson)
                } else {
                    Err(FrameParseError::UnknownType(ty.to_string()))
                }
            }
        }
    }

    fn is_known_type(ty: &str) -> bool {
        matches!(
            ty,
            "auth"
                | "list"
                | "create"
                | "attach"
                | "detach"
                | "input"
                | "resize"
                | "kill"
                | "rename"
                | "clipboard-set"
                | "clipboard-get"
                | "list-clients"
                | "kick-client"
                | "pong"
        )
    }
}
