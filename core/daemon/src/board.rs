//! Latest signal readings pushed by browser integrations.
//!
//! Integrations report over IPC (`report_signal`, `open_session`,
//! `close_session`); detectors poll the board through [`BoardSource`] on
//! their own schedule, so a burst of reports never changes detector timing.
//! The board doubles as the [`SessionCatalog`] enumerated by discovery.
//! An entry that has neither reported nor been reopened within the liveness
//! TTL is dropped when discovery enumerates, so a tab that vanished without
//! `close_session` is still removed.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use tabwatch_core::{MonitorError, SessionCatalog, SessionDescriptor, SignalSource};

#[derive(Debug, Clone)]
struct BoardEntry {
    descriptor: SessionDescriptor,
    reported: bool,
    active: bool,
    intermediate: bool,
    content: String,
    signal_timestamp: Option<DateTime<Utc>>,
    last_seen: Instant,
}

impl BoardEntry {
    fn new(descriptor: SessionDescriptor) -> Self {
        Self {
            descriptor,
            reported: false,
            active: false,
            intermediate: false,
            content: String::new(),
            signal_timestamp: None,
            last_seen: Instant::now(),
        }
    }
}

/// Readings reported for one session in a single `report_signal` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reading {
    pub active: bool,
    pub intermediate: bool,
    pub content: String,
    pub signal_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SignalBoard {
    entries: Arc<Mutex<HashMap<String, BoardEntry>>>,
    liveness_ttl: Duration,
}

impl SignalBoard {
    pub fn new(liveness_ttl: Duration) -> Self {
        Self {
            entries: Arc::default(),
            liveness_ttl,
        }
    }

    /// Adds a session or refreshes its display metadata. Returns true when
    /// the session was not on the board yet.
    pub fn open(&self, descriptor: SessionDescriptor) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(&descriptor.id) {
            Some(entry) => {
                entry.descriptor = descriptor;
                entry.last_seen = Instant::now();
                false
            }
            None => {
                entries.insert(descriptor.id.clone(), BoardEntry::new(descriptor));
                true
            }
        }
    }

    pub fn close(&self, session_id: &str) -> bool {
        self.lock().remove(session_id).is_some()
    }

    /// Stores the latest reading. Unknown sessions are added with bare
    /// metadata; returns true in that case.
    pub fn report(&self, session_id: &str, reading: Reading) -> bool {
        let mut entries = self.lock();
        let created = !entries.contains_key(session_id);
        let entry = entries
            .entry(session_id.to_string())
            .or_insert_with(|| BoardEntry::new(SessionDescriptor::new(session_id)));
        entry.reported = true;
        entry.last_seen = Instant::now();
        entry.active = reading.active;
        entry.intermediate = reading.intermediate;
        entry.content = reading.content;
        if reading.signal_timestamp.is_some() {
            entry.signal_timestamp = reading.signal_timestamp;
        }
        created
    }

    pub fn descriptor(&self, session_id: &str) -> Option<SessionDescriptor> {
        self.lock()
            .get(session_id)
            .map(|entry| entry.descriptor.clone())
    }

    pub fn source(&self, session_id: &str) -> BoardSource {
        BoardSource {
            board: self.clone(),
            session_id: session_id.to_string(),
        }
    }

    fn with_entry<T>(
        &self,
        session_id: &str,
        read: impl FnOnce(&BoardEntry) -> T,
    ) -> Result<T, MonitorError> {
        let entries = self.lock();
        match entries.get(session_id) {
            Some(entry) if entry.reported => Ok(read(entry)),
            Some(_) => Err(MonitorError::signal_unavailable(
                session_id,
                "no signal reported yet",
            )),
            None => Err(MonitorError::signal_unavailable(
                session_id,
                "session is not on the board",
            )),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BoardEntry>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionCatalog for SignalBoard {
    /// Drops entries past the liveness TTL, then lists the rest by id.
    fn live_sessions(&self) -> Vec<SessionDescriptor> {
        let ttl = self.liveness_ttl;
        let mut entries = self.lock();
        entries.retain(|session_id, entry| {
            let live = entry.last_seen.elapsed() < ttl;
            if !live {
                tracing::info!(session_id = %session_id, "Session went silent; dropping from the board");
            }
            live
        });
        let mut sessions: Vec<SessionDescriptor> = entries
            .values()
            .map(|entry| entry.descriptor.clone())
            .collect();
        sessions.sort_by(|left, right| left.id.cmp(&right.id));
        sessions
    }
}

/// One session's view of the board.
#[derive(Debug, Clone)]
pub struct BoardSource {
    board: SignalBoard,
    session_id: String,
}

impl SignalSource for BoardSource {
    fn is_active(&self) -> Result<bool, MonitorError> {
        self.board.with_entry(&self.session_id, |entry| entry.active)
    }

    fn is_intermediate_phase(&self) -> Result<bool, MonitorError> {
        self.board
            .with_entry(&self.session_id, |entry| entry.intermediate)
    }

    fn content_snapshot(&self) -> Result<String, MonitorError> {
        self.board
            .with_entry(&self.session_id, |entry| entry.content.clone())
    }

    fn authoritative_timestamp(&self) -> Option<DateTime<Utc>> {
        self.board
            .with_entry(&self.session_id, |entry| entry.signal_timestamp)
            .ok()
            .flatten()
    }
}
