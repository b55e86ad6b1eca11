//! Splits sessions into their durable and ephemeral subsets and back.
//!
//! - durable: `monitored`, `completion_history` (survives full restarts)
//! - ephemeral: `state`, `state_changed_at`, `last_signal_timestamp`,
//!   `generation_started_at` (survives daemon restarts within one boot)
//!
//! Writes are best-effort. A failed write is logged and forgotten; the
//! registry's in-memory state stays authoritative.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::store::{MemoryStore, RecordStore};
use crate::types::{to_millis, Session};
use crate::validation::{validate_durable, validate_ephemeral, RestoredDurable, RestoredEphemeral};

/// Everything recovered for one session id at startup.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestoredSession {
    pub ephemeral: RestoredEphemeral,
    pub durable: RestoredDurable,
}

pub struct PersistenceBridge {
    durable: Box<dyn RecordStore>,
    ephemeral: Box<dyn RecordStore>,
}

impl PersistenceBridge {
    pub fn new(durable: Box<dyn RecordStore>, ephemeral: Box<dyn RecordStore>) -> Self {
        Self { durable, ephemeral }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStore::new()), Box::new(MemoryStore::new()))
    }

    /// Reads both tiers and validates every field. Ids present in only one
    /// tier still restore; the other half is defaulted.
    pub fn restore(&self, now: DateTime<Utc>) -> BTreeMap<String, RestoredSession> {
        let mut restored: BTreeMap<String, RestoredSession> = BTreeMap::new();

        match self.durable.load_all() {
            Ok(records) => {
                for (session_id, record) in records {
                    let (durable, rejected) = validate_durable(&session_id, &record, now);
                    for err in rejected {
                        warn!(error = %err, "Discarding durable field");
                    }
                    restored.entry(session_id).or_default().durable = durable;
                }
            }
            Err(err) => warn!(error = %err, "Failed to load durable session records"),
        }

        match self.ephemeral.load_all() {
            Ok(records) => {
                for (session_id, record) in records {
                    let (ephemeral, rejected) = validate_ephemeral(&session_id, &record, now);
                    for err in rejected {
                        warn!(error = %err, "Discarding ephemeral field");
                    }
                    restored.entry(session_id).or_default().ephemeral = ephemeral;
                }
            }
            Err(err) => warn!(error = %err, "Failed to load ephemeral session records"),
        }

        debug!(sessions = restored.len(), "Restored persisted session state");
        restored
    }

    pub fn save_durable(&mut self, session: &Session) {
        if let Err(err) = self.durable.put(&session.id, durable_record(session)) {
            warn!(session_id = %session.id, error = %err, "Failed to persist durable state");
        }
    }

    pub fn save_ephemeral(&mut self, session: &Session) {
        if let Err(err) = self.ephemeral.put(&session.id, ephemeral_record(session)) {
            warn!(session_id = %session.id, error = %err, "Failed to persist ephemeral state");
        }
    }

    /// Waits for queued writes in both tiers. Called once on shutdown.
    pub fn flush(&mut self) {
        if let Err(err) = self.durable.flush() {
            warn!(error = %err, "Failed to flush durable state");
        }
        if let Err(err) = self.ephemeral.flush() {
            warn!(error = %err, "Failed to flush ephemeral state");
        }
    }

    /// Drops every record for `session_id` from both tiers.
    pub fn purge(&mut self, session_id: &str) {
        if let Err(err) = self.durable.delete(session_id) {
            warn!(session_id = %session_id, error = %err, "Failed to purge durable state");
        }
        if let Err(err) = self.ephemeral.delete(session_id) {
            warn!(session_id = %session_id, error = %err, "Failed to purge ephemeral state");
        }
    }
}

pub fn durable_record(session: &Session) -> Value {
    let history: Vec<Value> = session
        .completion_history
        .iter()
        .map(|entry| {
            json!({
                "timestamp": to_millis(entry.timestamp),
                "duration_ms": entry.duration_ms,
                "preview": entry.preview,
            })
        })
        .collect();
    json!({
        "monitored": session.monitored,
        "completion_history": history,
    })
}

pub fn ephemeral_record(session: &Session) -> Value {
    json!({
        "state": session.state.as_str(),
        "state_changed_at": to_millis(session.state_changed_at),
        "last_signal_timestamp": session.last_signal_timestamp.map(to_millis),
        "generation_started_at": session.generation_started_at.map(to_millis),
        "authoritative_signal": session.authoritative_signal,
    })
}
