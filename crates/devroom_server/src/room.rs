//! Room registry
//!
//! Owns every live [`Room`]: creation (format, uniqueness and global
//! ceiling checks), lookup, guarded mutation and deletion. Nothing outside
//! this module and the event hub writes to a room.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Instant;
use tokio::task::AbortHandle;
use tracing::info;
use uuid::Uuid;

use crate::error::CreateRoomError;
use crate::history::{HistoryLog, Snapshot, SnapshotTrigger};
use crate::metrics::METRICS;

pub type ConnectionId = Uuid;

/// Languages a room can be switched to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    Typescript,
    Java,
    Cpp,
    C,
    Csharp,
    Go,
    Rust,
    Php,
    Ruby,
    Kotlin,
}

impl Language {
    pub const ALL: [Language; 12] = [
        Language::Python,
        Language::Javascript,
        Language::Typescript,
        Language::Java,
        Language::Cpp,
        Language::C,
        Language::Csharp,
        Language::Go,
        Language::Rust,
        Language::Php,
        Language::Ruby,
        Language::Kotlin,
    ];

    /// Language of a freshly created room.
    pub const DEFAULT: Language = Language::Javascript;

    pub fn as_str(self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::Typescript => "typescript",
            Language::Java => "java",
            Language::Cpp => "cpp",
            Language::C => "c",
            Language::Csharp => "csharp",
            Language::Go => "go",
            Language::Rust => "rust",
            Language::Php => "php",
            Language::Ruby => "ruby",
            Language::Kotlin => "kotlin",
        }
    }

    /// Document a room is reset to when switched to this language.
    pub fn starter_document(self) -> &'static str {
        match self {
            Language::Python => "# Welcome to DevRoom!\nprint(\"Hello, DevRoom!\")\n",
            Language::Javascript => "// Welcome to DevRoom!\nconsole.log(\"Hello, DevRoom!\");\n",
            Language::Typescript => {
                "const message: string = \"Hello, DevRoom!\";\nconsole.log(message);\n"
            }
            Language::Java => {
                "public class Main {\n    public static void main(String[] args) {\n        System.out.println(\"Hello, DevRoom!\");\n    }\n}\n"
            }
            Language::Cpp => {
                "#include <iostream>\nusing namespace std;\nint main() {\n    cout << \"Hello, DevRoom!\" << endl;\n    return 0;\n}\n"
            }
            Language::C => {
                "#include <stdio.h>\nint main() {\n    printf(\"Hello, DevRoom!\\n\");\n    return 0;\n}\n"
            }
            Language::Csharp => {
                "using System;\nclass Program {\n    static void Main() {\n        Console.WriteLine(\"Hello, DevRoom!\");\n    }\n}\n"
            }
            Language::Go => {
                "package main\nimport \"fmt\"\nfunc main() {\n    fmt.Println(\"Hello, DevRoom!\")\n}\n"
            }
            Language::Rust => "fn main() {\n    println!(\"Hello, DevRoom!\");\n}\n",
            Language::Php => "<?php\necho \"Hello, DevRoom!\";\n",
            Language::Ruby => "puts \"Hello, DevRoom!\"\n",
            Language::Kotlin => "fun main() {\n    println(\"Hello, DevRoom!\")\n}\n",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.as_str() == s)
            .ok_or(())
    }
}

/// Lowercase token of 3-20 `[a-z0-9-]` characters.
pub fn is_valid_room_id(id: &str) -> bool {
    (3..=20).contains(&id.len())
        && id
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// Trim and lowercase a client-supplied room id.
pub fn normalize_room_id(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// One collaborative room.
#[derive(Debug)]
pub struct Room {
    pub id: String,
    pub document: String,
    pub language: Language,
    pub roster: HashMap<ConnectionId, String>,
    pub history: HistoryLog,
    pub created_at: Instant,
    /// Set on the first successful join; ghost sweeping only considers rooms
    /// that were never joined.
    pub ever_joined: bool,
    pending_deletion: Option<AbortHandle>,
}

impl Room {
    fn new(id: String, history_cap: usize, created_at: Instant) -> Self {
        Self {
            id,
            document: Language::DEFAULT.starter_document().to_string(),
            language: Language::DEFAULT,
            roster: HashMap::new(),
            history: HistoryLog::new(history_cap),
            created_at,
            ever_joined: false,
            pending_deletion: None,
        }
    }

    /// Capture the current document under `trigger`. No-op if unchanged.
    pub fn snapshot(&mut self, author: &str, trigger: SnapshotTrigger) -> bool {
        let author = if author.is_empty() { "Unknown" } else { author };
        self.history.append(Snapshot::new(
            self.document.clone(),
            self.language,
            author,
            trigger,
        ))
    }

    /// Record a pending grace-period deletion, aborting any earlier one.
    pub fn set_pending_deletion(&mut self, handle: AbortHandle) {
        if let Some(previous) = self.pending_deletion.replace(handle) {
            previous.abort();
        }
    }

    /// Abort a pending grace-period deletion. Returns whether one was pending.
    pub fn cancel_pending_deletion(&mut self) -> bool {
        match self.pending_deletion.take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn has_pending_deletion(&self) -> bool {
        self.pending_deletion.is_some()
    }

    /// Roster as `(id, name)` pairs.
    pub fn members(&self) -> Vec<(ConnectionId, String)> {
        self.roster
            .iter()
            .map(|(id, name)| (*id, name.clone()))
            .collect()
    }
}

/// Why a room left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletionReason {
    Empty,
    Ghost,
}

impl DeletionReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeletionReason::Empty => "empty",
            DeletionReason::Ghost => "ghost",
        }
    }
}

/// All live rooms, keyed by id.
pub struct RoomRegistry {
    rooms: DashMap<String, Room>,
    /// Serializes creation so the global ceiling holds across distinct ids.
    create_lock: Mutex<()>,
    max_rooms: usize,
    history_cap: usize,
}

impl RoomRegistry {
    pub fn new(max_rooms: usize, history_cap: usize) -> Self {
        Self {
            rooms: DashMap::new(),
            create_lock: Mutex::new(()),
            max_rooms,
            history_cap,
        }
    }

    /// Create `room_id` with the default language and its starter document.
    pub fn create(&self, room_id: &str) -> Result<(), CreateRoomError> {
        self.create_at(room_id, Instant::now())
    }

    pub fn create_at(&self, room_id: &str, now: Instant) -> Result<(), CreateRoomError> {
        if !is_valid_room_id(room_id) {
            return Err(CreateRoomError::InvalidRoomId);
        }

        let _guard = self.create_lock.lock();

        if self.rooms.contains_key(room_id) {
            return Err(CreateRoomError::AlreadyExists);
        }
        if self.rooms.len() >= self.max_rooms {
            return Err(CreateRoomError::AtCapacity);
        }

        match self.rooms.entry(room_id.to_string()) {
            Entry::Occupied(_) => Err(CreateRoomError::AlreadyExists),
            Entry::Vacant(slot) => {
                slot.insert(Room::new(room_id.to_string(), self.history_cap, now));
                METRICS.rooms_created.inc();
                METRICS.rooms_active.set(self.rooms.len() as f64);
                Ok(())
            }
        }
    }

    pub fn exists(&self, room_id: &str) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Run `f` with shared access to a room.
    pub fn with_room<R>(&self, room_id: &str, f: impl FnOnce(&Room) -> R) -> Option<R> {
        self.rooms.get(room_id).map(|room| f(&room))
    }

    /// Run `f` with exclusive access to a room. Mutations of one room are
    /// serialized by the registry's shard lock; `f` must not block.
    pub fn with_room_mut<R>(&self, room_id: &str, f: impl FnOnce(&mut Room) -> R) -> Option<R> {
        self.rooms.get_mut(room_id).map(|mut room| f(&mut room))
    }

    /// Remove a room and its history unconditionally.
    pub fn delete(&self, room_id: &str, reason: DeletionReason) -> bool {
        self.delete_if(room_id, reason, |_| true)
    }

    /// Remove a room only if `predicate` holds at removal time.
    pub fn delete_if(
        &self,
        room_id: &str,
        reason: DeletionReason,
        predicate: impl FnOnce(&Room) -> bool,
    ) -> bool {
        match self.rooms.remove_if(room_id, |_, room| predicate(room)) {
            Some((id, mut room)) => {
                room.cancel_pending_deletion();
                METRICS
                    .rooms_deleted
                    .with_label_values(&[reason.as_str()])
                    .inc();
                METRICS.rooms_active.set(self.rooms.len() as f64);
                info!(
                    room = %id,
                    reason = reason.as_str(),
                    total = self.rooms.len(),
                    "🧹 Room deleted"
                );
                true
            }
            None => false,
        }
    }

    /// Ids of rooms that were never joined and are older than `max_age`.
    pub fn ghost_rooms(&self, now: Instant, max_age: std::time::Duration) -> Vec<String> {
        self.rooms
            .iter()
            .filter(|entry| {
                let room = entry.value();
                !room.ever_joined
                    && room.roster.is_empty()
                    && now.saturating_duration_since(room.created_at) > max_age
            })
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn history_cap(&self) -> usize {
        self.history_cap
    }
}
