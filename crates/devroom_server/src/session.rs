//! Session registry
//!
//! The only record of which room a connection has joined and under which
//! display name. Event handlers resolve the room through this binding and
//! never through a room id supplied by the client.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::room::ConnectionId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub connection_id: ConnectionId,
    pub room_id: String,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<ConnectionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a connection to a room, replacing any earlier binding.
    pub fn bind(
        &self,
        connection_id: ConnectionId,
        room_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Option<Session> {
        let session = Session {
            connection_id,
            room_id: room_id.into(),
            display_name: display_name.into(),
            joined_at: Utc::now(),
        };

        debug!(
            connection = %connection_id,
            room = %session.room_id,
            "Session bound"
        );

        self.sessions.insert(connection_id, session)
    }

    pub fn resolve(&self, connection_id: &ConnectionId) -> Option<Session> {
        self.sessions.get(connection_id).map(|s| s.clone())
    }

    pub fn unbind(&self, connection_id: &ConnectionId) -> Option<Session> {
        self.sessions.remove(connection_id).map(|(_, session)| session)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
