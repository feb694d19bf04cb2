//! Rejection taxonomy
//!
//! Validation, capacity and rate-limit rejections are recovered inside the
//! handler that detects them and reported to the caller. Nothing here is an
//! internal fault.

use serde::Serialize;
use thiserror::Error;

/// How a transport should surface a [`CreateRoomError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusHint {
    RateLimited,
    Malformed,
    Conflict,
    AtCapacity,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CreateRoomError {
    #[error("Too many rooms created. Try again in an hour.")]
    RateLimited,

    #[error("Invalid room ID format.")]
    InvalidRoomId,

    #[error("Room already exists.")]
    AlreadyExists,

    #[error("Server at capacity. Try again later.")]
    AtCapacity,
}

impl CreateRoomError {
    pub fn status_hint(&self) -> StatusHint {
        match self {
            Self::RateLimited => StatusHint::RateLimited,
            Self::InvalidRoomId => StatusHint::Malformed,
            Self::AlreadyExists => StatusHint::Conflict,
            Self::AtCapacity => StatusHint::AtCapacity,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("Invalid payload.")]
    InvalidPayload,

    #[error("Missing roomId or username.")]
    MissingFields,

    #[error("Too many join attempts. Please refresh.")]
    TooManyAttempts,

    #[error("Invalid room ID.")]
    InvalidRoomId,

    #[error("Invalid username. 1-{max} alphanumeric characters only.")]
    InvalidUsername { max: usize },

    #[error("Room does not exist. Please create it first.")]
    RoomNotFound,

    #[error("Room is full (max {capacity} users).")]
    RoomFull { capacity: usize },

    #[error("Too many connections. Please wait a minute.")]
    ConnectionRateLimited,
}

impl JoinError {
    /// Stable machine-readable reason carried next to the message.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::MissingFields => "missing_fields",
            Self::TooManyAttempts => "too_many_attempts",
            Self::InvalidRoomId => "invalid_room_id",
            Self::InvalidUsername { .. } => "invalid_username",
            Self::RoomNotFound => "room_not_found",
            Self::RoomFull { .. } => "room_full",
            Self::ConnectionRateLimited => "rate_limited",
        }
    }

    /// Whether the connection must be closed after reporting this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::TooManyAttempts | Self::ConnectionRateLimited)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunError {
    #[error("Rate limit: max {max} runs per minute.")]
    RateLimited { max: u32 },

    #[error("Invalid payload.")]
    InvalidPayload,
}

impl RunError {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidPayload => "invalid_payload",
        }
    }
}

/// Frame-level decoding failures. These never reach the client.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Payload for `{0}` is not an object")]
    NotAnObject(&'static str),

    #[error("Payload for `{event}` does not match its schema: {source}")]
    Schema {
        event: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

impl ProtocolError {
    /// Name of the event the rejected frame claimed to be, when known.
    pub fn event(&self) -> Option<&'static str> {
        match self {
            Self::NotAnObject(event) | Self::Schema { event, .. } => Some(*event),
            Self::UnknownEvent(_) | Self::MalformedFrame(_) => None,
        }
    }
}
