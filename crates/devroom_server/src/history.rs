//! Bounded per-room snapshot history

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;

use crate::room::Language;

/// What caused a snapshot to be taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SnapshotTrigger {
    Run,
    Leave,
    LangChange,
    BeforeRestore,
}

/// Immutable capture of a room's document and language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub document: String,
    pub language: Language,
    pub author_name: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub trigger: SnapshotTrigger,
}

impl Snapshot {
    pub fn new(
        document: impl Into<String>,
        language: Language,
        author_name: impl Into<String>,
        trigger: SnapshotTrigger,
    ) -> Self {
        Self {
            document: document.into(),
            language,
            author_name: author_name.into(),
            timestamp: Utc::now().timestamp_millis(),
            trigger,
        }
    }

    fn same_content(&self, other: &Snapshot) -> bool {
        self.language == other.language && self.document == other.document
    }
}

/// FIFO of at most `cap` snapshots, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    entries: VecDeque<Snapshot>,
    cap: usize,
}

impl HistoryLog {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap: cap.max(1),
        }
    }

    /// Append unless the most recent entry has the same document and language.
    /// Returns whether the log changed.
    pub fn append(&mut self, snapshot: Snapshot) -> bool {
        if self
            .entries
            .back()
            .is_some_and(|last| last.same_content(&snapshot))
        {
            return false;
        }

        self.entries.push_back(snapshot);
        while self.entries.len() > self.cap {
            self.entries.pop_front();
        }
        true
    }

    pub fn get(&self, index: usize) -> Option<&Snapshot> {
        self.entries.get(index)
    }

    pub fn last(&self) -> Option<&Snapshot> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.entries.iter()
    }

    /// Owned copy, oldest first, for sending over the wire.
    pub fn to_vec(&self) -> Vec<Snapshot> {
        self.entries.iter().cloned().collect()
    }
}
