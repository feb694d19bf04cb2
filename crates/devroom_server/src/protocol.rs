//! Real-time channel wire format
//!
//! Every frame is a JSON text message `{"event": <name>, "data": <payload>}`.
//! Inbound frames are decoded in two steps: the envelope first, then the
//! payload against the schema of the named event. A payload that is not an
//! object, or does not match its schema, is rejected before any registry is
//! touched.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::history::Snapshot;
use crate::room::{ConnectionId, Language};

/// Default colour for remote cursors when the client sends none.
pub const DEFAULT_CURSOR_COLOR: &str = "#38bdf8";

#[derive(Debug, Deserialize)]
struct InboundFrame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub room_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Outcome reported by a client after running the document elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionStatus {
    Success,
    Error,
    Running,
    Idle,
    Other(String),
}

impl ExecutionStatus {
    fn from_wire(raw: Option<&Value>) -> Self {
        match raw.and_then(Value::as_str) {
            Some("success") => Self::Success,
            Some("error") => Self::Error,
            Some("running") => Self::Running,
            Some("idle") | None => Self::Idle,
            Some(other) => Self::Other(other.chars().take(20).collect()),
        }
    }

    /// Whether the execution has finished.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Other(s) => s,
        }
    }
}

/// A validated inbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Join(JoinRequest),
    Edit { document: String },
    LanguageChange { language: Language },
    RunRequest,
    ExecutionResult { output: String, status: ExecutionStatus },
    Chat { text: String, timestamp: Option<i64> },
    Cursor { line: f64, column: f64, color: Option<String> },
    RequestHistory,
    RestoreSnapshot { index: u64 },
    Disconnect,
}

#[derive(Deserialize)]
struct EditPayload {
    #[serde(alias = "code")]
    document: String,
}

#[derive(Deserialize)]
struct LanguagePayload {
    language: Language,
}

#[derive(Deserialize)]
struct ExecutionPayload {
    #[serde(default)]
    output: Option<Value>,
    #[serde(default)]
    status: Option<Value>,
}

#[derive(Deserialize)]
struct ChatPayload {
    text: String,
    #[serde(default)]
    timestamp: Option<Value>,
}

#[derive(Deserialize)]
struct CursorPayload {
    line: f64,
    column: f64,
    #[serde(default)]
    color: Option<Value>,
}

#[derive(Deserialize)]
struct RestorePayload {
    index: u64,
}

impl ClientEvent {
    /// Decode a raw text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let frame: InboundFrame = serde_json::from_str(text)?;

        match frame.event.as_str() {
            "join" => Ok(Self::Join(object("join", frame.data)?)),
            "edit" => {
                let p: EditPayload = object("edit", frame.data)?;
                Ok(Self::Edit { document: p.document })
            }
            "language-change" => {
                let p: LanguagePayload = object("language-change", frame.data)?;
                Ok(Self::LanguageChange { language: p.language })
            }
            "run-request" => {
                require_object("run-request", &frame.data)?;
                Ok(Self::RunRequest)
            }
            "execution-result" => {
                let p: ExecutionPayload = object("execution-result", frame.data)?;
                Ok(Self::ExecutionResult {
                    output: p
                        .output
                        .as_ref()
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    status: ExecutionStatus::from_wire(p.status.as_ref()),
                })
            }
            "chat" => {
                let p: ChatPayload = object("chat", frame.data)?;
                Ok(Self::Chat {
                    text: p.text,
                    timestamp: p
                        .timestamp
                        .as_ref()
                        .and_then(Value::as_f64)
                        .filter(|t| t.is_finite())
                        .map(|t| t as i64),
                })
            }
            "cursor" => {
                let p: CursorPayload = object("cursor", frame.data)?;
                Ok(Self::Cursor {
                    line: p.line,
                    column: p.column,
                    color: p
                        .color
                        .as_ref()
                        .and_then(Value::as_str)
                        .map(|c| c.chars().take(20).collect()),
                })
            }
            "request-history" => Ok(Self::RequestHistory),
            "restore-snapshot" => {
                let p: RestorePayload = object("restore-snapshot", frame.data)?;
                Ok(Self::RestoreSnapshot { index: p.index })
            }
            "disconnect" => Ok(Self::Disconnect),
            other => Err(ProtocolError::UnknownEvent(other.chars().take(64).collect())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Join(_) => "join",
            Self::Edit { .. } => "edit",
            Self::LanguageChange { .. } => "language-change",
            Self::RunRequest => "run-request",
            Self::ExecutionResult { .. } => "execution-result",
            Self::Chat { .. } => "chat",
            Self::Cursor { .. } => "cursor",
            Self::RequestHistory => "request-history",
            Self::RestoreSnapshot { .. } => "restore-snapshot",
            Self::Disconnect => "disconnect",
        }
    }
}

fn require_object(event: &'static str, data: &Value) -> Result<(), ProtocolError> {
    if data.is_object() {
        Ok(())
    } else {
        Err(ProtocolError::NotAnObject(event))
    }
}

fn object<T: DeserializeOwned>(event: &'static str, data: Value) -> Result<T, ProtocolError> {
    require_object(event, &data)?;
    serde_json::from_value(data).map_err(|source| ProtocolError::Schema { event, source })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Member {
    pub id: ConnectionId,
    pub username: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MembershipChange {
    Joined,
    Left,
}

/// Outbound event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    RoomState {
        room_id: String,
        self_id: ConnectionId,
        document: String,
        language: Language,
        users: Vec<Member>,
        history: Vec<Snapshot>,
    },
    MembershipChanged {
        change: MembershipChange,
        id: ConnectionId,
        username: String,
    },
    DocumentUpdate {
        document: String,
    },
    LanguageUpdate {
        language: Language,
        document: String,
    },
    HistoryUpdate {
        history: Vec<Snapshot>,
    },
    SnapshotRestored {
        username: String,
        index: u64,
    },
    ExecutionOutput {
        output: String,
        status: String,
        username: String,
    },
    #[serde(rename_all = "camelCase")]
    ChatMessage {
        connection_id: ConnectionId,
        username: String,
        text: String,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    CursorUpdate {
        connection_id: ConnectionId,
        username: String,
        color: String,
        line: u32,
        column: u32,
    },
    RunAck {
        allowed: bool,
    },
    JoinError {
        reason: String,
        message: String,
    },
    RunError {
        reason: String,
        message: String,
    },
}

impl ServerEvent {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
