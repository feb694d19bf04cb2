//! Event hub: admission control and the per-connection protocol state machine
//!
//! A connection starts `Connected` (socket open, no session), becomes
//! `Joined` once a join is accepted, and ends `Closed` on disconnect. Every
//! handler except join resolves the room through the session registry and
//! silently drops the event when there is no session.
//!
//! Handlers run to completion without awaiting. Room mutations and the
//! fan-out that follows them happen under the room's registry lock, so every
//! member observes a room's updates in the order they were applied.

use dashmap::DashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{CreateRoomError, JoinError, ProtocolError, RunError};
use crate::history::SnapshotTrigger;
use crate::metrics::METRICS;
use crate::protocol::{
    ClientEvent, ExecutionStatus, JoinRequest, Member, MembershipChange, ServerEvent,
    DEFAULT_CURSOR_COLOR,
};
use crate::rate_limit::RateLimiters;
use crate::room::{
    is_valid_room_id, normalize_room_id, ConnectionId, DeletionReason, Language, Room,
    RoomRegistry,
};
use crate::session::{Session, SessionRegistry};
use crate::sweeper;

pub type Outbound = Arc<ServerEvent>;

const MAX_CURSOR_LINE: f64 = 100_000.0;
const MAX_CURSOR_COLUMN: f64 = 10_000.0;

/// What the transport should do with the socket after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// A newly admitted connection.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub outbound: mpsc::Receiver<Outbound>,
}

struct ConnectionHandle {
    tx: mpsc::Sender<Outbound>,
    join_attempts: u32,
    caller_key: String,
}

/// Owns the registries and rate limiters; the only writer of room state.
pub struct RoomHub {
    config: Arc<Config>,
    rooms: Arc<RoomRegistry>,
    sessions: SessionRegistry,
    limits: RateLimiters,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    #[cfg(test)]
    fail_on: parking_lot::Mutex<Option<&'static str>>,
}

impl RoomHub {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            rooms: Arc::new(RoomRegistry::new(config.max_total_rooms, config.max_history)),
            sessions: SessionRegistry::new(),
            limits: RateLimiters::new(&config),
            connections: DashMap::new(),
            #[cfg(test)]
            fail_on: parking_lot::Mutex::new(None),
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn limits(&self) -> &RateLimiters {
        &self.limits
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    // ── Admission endpoints ─────────────────────────────────────────────

    /// Case-insensitive existence check; malformed ids simply do not exist.
    pub fn room_exists(&self, raw_room_id: &str) -> bool {
        let room_id = normalize_room_id(raw_room_id);
        is_valid_room_id(&room_id) && self.rooms.exists(&room_id)
    }

    /// Create a room on behalf of `caller_key`. Returns the normalized id.
    pub fn create_room(&self, raw_room_id: &str, caller_key: &str) -> Result<String, CreateRoomError> {
        if !self.limits.room_creation.check(caller_key) {
            warn!(caller = %caller_key, "Room creation rate limit hit");
            return Err(CreateRoomError::RateLimited);
        }

        let room_id = normalize_room_id(raw_room_id);
        self.rooms.create(&room_id)?;

        info!(
            room = %room_id,
            caller = %caller_key,
            total = self.rooms.len(),
            "✨ Room created"
        );
        Ok(room_id)
    }

    /// Admit a new socket for `caller_key`.
    pub fn connect(&self, caller_key: &str) -> Result<Connection, JoinError> {
        if !self.limits.connections.check(caller_key) {
            warn!(caller = %caller_key, "Connection rate limit hit");
            METRICS
                .join_rejections
                .with_label_values(&[JoinError::ConnectionRateLimited.reason()])
                .inc();
            return Err(JoinError::ConnectionRateLimited);
        }

        let id = Uuid::new_v4();
        let (tx, outbound) = mpsc::channel(self.config.outbound_queue);
        self.connections.insert(
            id,
            ConnectionHandle {
                tx,
                join_attempts: 0,
                caller_key: caller_key.to_string(),
            },
        );

        METRICS.connections_total.inc();
        METRICS.connections_active.set(self.connections.len() as f64);
        debug!(connection = %id, caller = %caller_key, "Connection admitted");

        Ok(Connection { id, outbound })
    }

    // ── Event dispatch ──────────────────────────────────────────────────

    /// Dispatch one event inside the fault boundary: a panicking handler is
    /// logged and the connection carries on.
    pub fn dispatch(&self, conn: ConnectionId, event: ClientEvent) -> Flow {
        let name = event.name();
        METRICS.events_received.with_label_values(&[name]).inc();

        match catch_unwind(AssertUnwindSafe(|| self.handle(conn, event))) {
            Ok(flow) => flow,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                METRICS.handler_faults.inc();
                error!(connection = %conn, event = name, panic = %message, "❌ Event handler fault contained");
                Flow::Continue
            }
        }
    }

    /// Make the handler for `event` panic, to exercise the fault boundary.
    #[cfg(test)]
    fn fail_on(&self, event: Option<&'static str>) {
        *self.fail_on.lock() = event;
    }

    fn handle(&self, conn: ConnectionId, event: ClientEvent) -> Flow {
        #[cfg(test)]
        if *self.fail_on.lock() == Some(event.name()) {
            panic!("injected fault in {}", event.name());
        }

        match event {
            ClientEvent::Join(request) => return self.join(conn, request),
            ClientEvent::Edit { document } => self.edit(conn, document),
            ClientEvent::LanguageChange { language } => self.change_language(conn, language),
            ClientEvent::RunRequest => self.run_request(conn),
            ClientEvent::ExecutionResult { output, status } => {
                self.execution_result(conn, output, status)
            }
            ClientEvent::Chat { text, timestamp } => self.chat(conn, &text, timestamp),
            ClientEvent::Cursor { line, column, color } => self.cursor(conn, line, column, color),
            ClientEvent::RequestHistory => self.request_history(conn),
            ClientEvent::RestoreSnapshot { index } => self.restore_snapshot(conn, index),
            ClientEvent::Disconnect => {
                self.disconnect(conn);
                return Flow::Close;
            }
        }
        Flow::Continue
    }

    /// React to a frame that failed to decode. Join and run requests get an
    /// explicit error; everything else is dropped.
    pub fn reject_frame(&self, conn: ConnectionId, err: &ProtocolError) -> Flow {
        let event = err.event().unwrap_or("unknown");
        METRICS.events_dropped.with_label_values(&[event]).inc();
        debug!(connection = %conn, error = %err, "Inbound frame rejected");

        match err.event() {
            Some("join") => self.reject_join(conn, JoinError::InvalidPayload),
            Some("run-request") if self.sessions.resolve(&conn).is_some() => {
                let err = RunError::InvalidPayload;
                self.send(
                    conn,
                    Arc::new(ServerEvent::RunError {
                        reason: err.reason().to_string(),
                        message: err.to_string(),
                    }),
                );
                Flow::Continue
            }
            _ => Flow::Continue,
        }
    }

    fn reject_join(&self, conn: ConnectionId, err: JoinError) -> Flow {
        METRICS.join_rejections.with_label_values(&[err.reason()]).inc();
        debug!(connection = %conn, reason = err.reason(), "Join rejected");
        self.send(
            conn,
            Arc::new(ServerEvent::JoinError {
                reason: err.reason().to_string(),
                message: err.to_string(),
            }),
        );
        if err.is_fatal() {
            Flow::Close
        } else {
            Flow::Continue
        }
    }

    // ── Connected --join--> Joined ──────────────────────────────────────

    fn join(&self, conn: ConnectionId, request: JoinRequest) -> Flow {
        let (raw_room_id, raw_username) = match (request.room_id, request.username) {
            (Some(room), Some(name)) if !room.is_empty() && !name.is_empty() => (room, name),
            _ => return self.reject_join(conn, JoinError::MissingFields),
        };

        let attempts = match self.connections.get_mut(&conn) {
            Some(mut handle) => {
                handle.join_attempts += 1;
                handle.join_attempts
            }
            None => return Flow::Close,
        };
        if attempts > self.config.max_join_attempts {
            return self.reject_join(conn, JoinError::TooManyAttempts);
        }

        let room_id = normalize_room_id(&raw_room_id);
        if !is_valid_room_id(&room_id) {
            return self.reject_join(conn, JoinError::InvalidRoomId);
        }

        let username = match sanitize_display_name(&raw_username, self.config.max_username_len) {
            Some(name) => name,
            None => {
                return self.reject_join(
                    conn,
                    JoinError::InvalidUsername {
                        max: self.config.max_username_len,
                    },
                )
            }
        };

        if !self.rooms.exists(&room_id) {
            return self.reject_join(conn, JoinError::RoomNotFound);
        }

        // A connection belongs to at most one room. Leaving unbinds first, so
        // a rejected join below leaves the connection without a session.
        if let Some(previous) = self.sessions.resolve(&conn) {
            if previous.room_id != room_id {
                self.sessions.unbind(&conn);
                self.leave_room(conn, &previous);
            }
        }

        let capacity = self.config.max_users_per_room;
        let outcome = self.rooms.with_room_mut(&room_id, |room| {
            // A repeated join keeps the name the others already know.
            let existing = room.roster.get(&conn).cloned();
            let already_member = existing.is_some();
            if !already_member && room.roster.len() >= capacity {
                return Err(JoinError::RoomFull { capacity });
            }

            let username = existing.unwrap_or_else(|| username.clone());
            room.roster.insert(conn, username.clone());
            room.ever_joined = true;
            if room.cancel_pending_deletion() {
                info!(room = %room.id, "Pending room deletion cancelled by rejoin");
            }

            self.send(
                conn,
                Arc::new(ServerEvent::RoomState {
                    room_id: room.id.clone(),
                    self_id: conn,
                    document: room.document.clone(),
                    language: room.language,
                    users: members(room),
                    history: room.history.to_vec(),
                }),
            );

            if !already_member {
                self.broadcast(
                    room,
                    Some(conn),
                    ServerEvent::MembershipChanged {
                        change: MembershipChange::Joined,
                        id: conn,
                        username: username.clone(),
                    },
                );
            }

            Ok((room.roster.len(), username))
        });

        match outcome {
            Some(Ok((roster_size, username))) => {
                self.sessions.bind(conn, room_id.clone(), username.clone());
                info!(
                    room = %room_id,
                    user = %username,
                    connection = %conn,
                    users = roster_size,
                    "👤 User joined room"
                );
                Flow::Continue
            }
            Some(Err(err)) => self.reject_join(conn, err),
            // Deleted between the existence check and the lock.
            None => self.reject_join(conn, JoinError::RoomNotFound),
        }
    }

    // ── Joined --edit--> Joined ─────────────────────────────────────────

    fn edit(&self, conn: ConnectionId, document: String) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };
        if !self.limits.edits.check(&conn.to_string()) {
            return;
        }
        if document.chars().count() > self.config.max_document_len {
            debug!(connection = %conn, "Oversized document dropped");
            return;
        }

        self.rooms.with_room_mut(&session.room_id, |room| {
            room.document = document;
            self.broadcast(
                room,
                Some(conn),
                ServerEvent::DocumentUpdate {
                    document: room.document.clone(),
                },
            );
        });
    }

    // ── Joined --language-change--> Joined ──────────────────────────────

    fn change_language(&self, conn: ConnectionId, language: Language) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };

        self.rooms.with_room_mut(&session.room_id, |room| {
            let recorded = room.snapshot(&session.display_name, SnapshotTrigger::LangChange);
            room.language = language;
            room.document = language.starter_document().to_string();

            self.broadcast(
                room,
                Some(conn),
                ServerEvent::LanguageUpdate {
                    language,
                    document: room.document.clone(),
                },
            );
            if recorded {
                self.broadcast(room, None, history_update(room));
            }

            debug!(room = %room.id, language = %language, "Language changed");
        });
    }

    // ── Joined --run-request--> Joined ──────────────────────────────────

    fn run_request(&self, conn: ConnectionId) {
        if self.sessions.resolve(&conn).is_none() {
            return;
        }

        let event = if self.limits.runs.check(&conn.to_string()) {
            ServerEvent::RunAck { allowed: true }
        } else {
            let err = RunError::RateLimited {
                max: self.limits.runs.limit().max,
            };
            ServerEvent::RunError {
                reason: err.reason().to_string(),
                message: err.to_string(),
            }
        };
        self.send(conn, Arc::new(event));
    }

    // ── Joined --execution-result--> Joined ─────────────────────────────

    fn execution_result(&self, conn: ConnectionId, output: String, status: ExecutionStatus) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };
        let output = truncate_chars(output, self.config.max_output_len);

        self.rooms.with_room_mut(&session.room_id, |room| {
            if status.is_terminal() {
                room.snapshot(&session.display_name, SnapshotTrigger::Run);
                self.broadcast(room, None, history_update(room));
            }
            self.broadcast(
                room,
                None,
                ServerEvent::ExecutionOutput {
                    output,
                    status: status.as_str().to_string(),
                    username: session.display_name.clone(),
                },
            );
        });
    }

    // ── Joined --chat--> Joined ─────────────────────────────────────────

    fn chat(&self, conn: ConnectionId, text: &str, timestamp: Option<i64>) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };
        let max = self.config.max_chat_len;
        if text.is_empty() || text.chars().count() > max {
            return;
        }
        let text = sanitize_text(text, max);
        if text.is_empty() {
            return;
        }

        let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        self.rooms.with_room(&session.room_id, |room| {
            self.broadcast(
                room,
                Some(conn),
                ServerEvent::ChatMessage {
                    connection_id: conn,
                    username: session.display_name.clone(),
                    text,
                    timestamp,
                },
            );
        });
    }

    // ── Joined --cursor--> Joined ───────────────────────────────────────

    fn cursor(&self, conn: ConnectionId, line: f64, column: f64, color: Option<String>) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };
        if !(1.0..=MAX_CURSOR_LINE).contains(&line) || !(1.0..=MAX_CURSOR_COLUMN).contains(&column) {
            return;
        }

        self.rooms.with_room(&session.room_id, |room| {
            self.broadcast(
                room,
                Some(conn),
                ServerEvent::CursorUpdate {
                    connection_id: conn,
                    username: session.display_name.clone(),
                    color: color.unwrap_or_else(|| DEFAULT_CURSOR_COLOR.to_string()),
                    line: line as u32,
                    column: column as u32,
                },
            );
        });
    }

    // ── Joined --request-history--> Joined ──────────────────────────────

    fn request_history(&self, conn: ConnectionId) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };
        if let Some(event) = self.rooms.with_room(&session.room_id, history_update) {
            self.send(conn, Arc::new(event));
        }
    }

    // ── Joined --restore-snapshot--> Joined ─────────────────────────────

    fn restore_snapshot(&self, conn: ConnectionId, index: u64) {
        let Some(session) = self.sessions.resolve(&conn) else {
            return;
        };

        self.rooms.with_room_mut(&session.room_id, |room| {
            let Some(target) = usize::try_from(index)
                .ok()
                .and_then(|i| room.history.get(i))
                .cloned()
            else {
                return;
            };

            room.snapshot(&session.display_name, SnapshotTrigger::BeforeRestore);
            room.document = target.document;
            room.language = target.language;

            self.broadcast(
                room,
                None,
                ServerEvent::DocumentUpdate {
                    document: room.document.clone(),
                },
            );
            self.broadcast(
                room,
                None,
                ServerEvent::LanguageUpdate {
                    language: room.language,
                    document: room.document.clone(),
                },
            );
            self.broadcast(room, None, history_update(room));
            self.broadcast(
                room,
                None,
                ServerEvent::SnapshotRestored {
                    username: session.display_name.clone(),
                    index,
                },
            );

            info!(room = %room.id, user = %session.display_name, index = index, "Snapshot restored");
        });
    }

    // ── Joined --disconnect--> Closed ───────────────────────────────────

    /// Unwind all per-connection state. Safe to call more than once.
    pub fn disconnect(&self, conn: ConnectionId) {
        let handle = self.connections.remove(&conn).map(|(_, handle)| handle);
        self.limits.forget_connection(&conn.to_string());

        if let Some(session) = self.sessions.unbind(&conn) {
            self.leave_room(conn, &session);
        }

        if let Some(handle) = handle {
            METRICS.connections_active.set(self.connections.len() as f64);
            debug!(connection = %conn, caller = %handle.caller_key, "Connection closed");
        }
    }

    fn leave_room(&self, conn: ConnectionId, session: &Session) {
        let grace = self.config.room_grace_period;

        let remaining = self.rooms.with_room_mut(&session.room_id, |room| {
            room.snapshot(&session.display_name, SnapshotTrigger::Leave);
            room.roster.remove(&conn);

            self.broadcast(
                room,
                None,
                ServerEvent::MembershipChanged {
                    change: MembershipChange::Left,
                    id: conn,
                    username: session.display_name.clone(),
                },
            );
            self.broadcast(room, None, history_update(room));

            if room.roster.is_empty() {
                self.schedule_deletion(room, grace);
            }
            room.roster.len()
        });

        if let Some(remaining) = remaining {
            info!(
                room = %session.room_id,
                user = %session.display_name,
                remaining = remaining,
                session_secs = (chrono::Utc::now() - session.joined_at).num_seconds(),
                "👋 User left room"
            );
        }
    }

    fn schedule_deletion(&self, room: &mut Room, grace: Duration) {
        let handle = sweeper::schedule_room_deletion(self.rooms.clone(), room.id.clone(), grace);
        room.set_pending_deletion(handle);
    }

    // ── Sweeps ──────────────────────────────────────────────────────────

    /// Delete never-joined rooms older than `max_age`. Returns the count.
    pub fn sweep_ghost_rooms(&self, now: Instant, max_age: Duration) -> usize {
        self.rooms
            .ghost_rooms(now, max_age)
            .into_iter()
            .filter(|room_id| {
                self.rooms.delete_if(room_id, DeletionReason::Ghost, |room| {
                    !room.ever_joined && room.roster.is_empty()
                })
            })
            .count()
    }

    /// Evict expired rate-limit windows. Returns the count.
    pub fn sweep_rate_limits(&self, now: Instant) -> usize {
        self.limits.evict_expired(now)
    }

    // ── Fan-out ─────────────────────────────────────────────────────────

    fn send(&self, conn: ConnectionId, event: Outbound) {
        let Some(handle) = self.connections.get(&conn) else {
            return;
        };
        match handle.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(connection = %conn, "Outbound queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(connection = %conn, "Outbound queue closed");
            }
        }
    }

    /// Send `event` to every member of `room` except `skip`.
    fn broadcast(&self, room: &Room, skip: Option<ConnectionId>, event: ServerEvent) {
        let event = Arc::new(event);
        for member in room.roster.keys() {
            if Some(*member) != skip {
                self.send(*member, event.clone());
            }
        }
    }
}

fn members(room: &Room) -> Vec<Member> {
    room.members()
        .into_iter()
        .map(|(id, username)| Member { id, username })
        .collect()
}

fn history_update(room: &Room) -> ServerEvent {
    ServerEvent::HistoryUpdate {
        history: room.history.to_vec(),
    }
}

/// Trimmed display name of 1..=`max` characters from `[A-Za-z0-9_ .-]`.
pub fn sanitize_display_name(raw: &str, max: usize) -> Option<String> {
    let name = raw.trim();
    let len = name.chars().count();
    let allowed = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | ' ' | '-' | '.'));

    ((1..=max).contains(&len) && allowed).then(|| name.to_string())
}

/// Strip markup tags and control characters, trim, and cap at `max` characters.
pub fn sanitize_text(raw: &str, max: usize) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        if c == '<' {
            // Drop a complete `<...>` tag; an unterminated `<` is kept.
            let rest: String = chars.clone().collect();
            if let Some(end) = rest.find('>') {
                let skip = rest[..end].chars().count() + 1;
                for _ in 0..skip {
                    chars.next();
                }
                continue;
            }
        }
        if c.is_control() && !matches!(c, '\t' | '\n' | '\r') {
            continue;
        }
        out.push(c);
    }

    truncate_chars(out.trim().to_string(), max)
}

fn truncate_chars(mut s: String, max: usize) -> String {
    if let Some((idx, _)) = s.char_indices().nth(max) {
        s.truncate(idx);
    }
    s
}
