//! Core types shared by the detector, the registry and every client.
//!
//! These are the wire shapes too: the daemon serializes `Session` snapshots
//! and `MonitorEvent`s as-is, so field renames are breaking changes.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of entries kept in `Session::completion_history`.
pub const COMPLETION_HISTORY_LIMIT: usize = 5;

// ═══════════════════════════════════════════════════════════════════════════════
// Session State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Generating,
    Thinking,
    Writing,
    Completed,
}

impl SessionState {
    /// Members of the active super-state.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Generating | SessionState::Thinking | SessionState::Writing
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Generating => "Generating",
            SessionState::Thinking => "Thinking",
            SessionState::Writing => "Writing",
            SessionState::Completed => "Completed",
        }
    }

    /// Parses a persisted or wire state name. Matching is case-insensitive so
    /// records written by older clients in lowercase still restore.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "idle" => Some(SessionState::Idle),
            "generating" => Some(SessionState::Generating),
            "thinking" => Some(SessionState::Thinking),
            "writing" => Some(SessionState::Writing),
            "completed" => Some(SessionState::Completed),
            _ => None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Entity
// ═══════════════════════════════════════════════════════════════════════════════

/// One finished generation, as shown in a session's recent history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub timestamp: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub preview: String,
}

/// Display metadata reported by discovery for one live session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SessionDescriptor {
    pub id: String,
    #[serde(default)]
    pub window_group: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub locator: String,
}

impl SessionDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub window_group: String,
    pub title: String,
    pub locator: String,
    pub monitored: bool,
    pub state: SessionState,
    pub state_changed_at: DateTime<Utc>,
    pub last_signal_timestamp: Option<DateTime<Utc>>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub completion_history: Vec<CompletionRecord>,
    /// Set once the signal source has supplied its own timestamp; local
    /// observation times no longer overwrite `last_signal_timestamp` after that.
    /// Kept in the ephemeral record, not in snapshots.
    #[serde(skip)]
    pub(crate) authoritative_signal: bool,
}

impl Session {
    pub fn new(descriptor: &SessionDescriptor, monitored: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: descriptor.id.clone(),
            window_group: descriptor.window_group.clone(),
            title: descriptor.title.clone(),
            locator: descriptor.locator.clone(),
            monitored,
            state: SessionState::Idle,
            state_changed_at: now,
            last_signal_timestamp: None,
            generation_started_at: None,
            completion_history: Vec::new(),
            authoritative_signal: false,
        }
    }

    /// Prepends a completion and evicts the oldest entries past the limit.
    pub fn push_completion(&mut self, record: CompletionRecord) {
        self.completion_history.insert(0, record);
        self.completion_history.truncate(COMPLETION_HISTORY_LIMIT);
    }

    pub(crate) fn apply_descriptor(&mut self, descriptor: &SessionDescriptor) {
        self.window_group = descriptor.window_group.clone();
        self.title = descriptor.title.clone();
        self.locator = descriptor.locator.clone();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Detector Events
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedEvent {
    pub session_id: String,
    pub state: SessionState,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub session_id: String,
    pub preview: String,
    pub duration_ms: Option<u64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalTimestampEvent {
    pub session_id: String,
    pub at: DateTime<Utc>,
}

/// Everything a detector can put on its outbound channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectorEvent {
    StateChanged(StateChangedEvent),
    Completion(CompletionEvent),
    SignalTimestamp(SignalTimestampEvent),
}

impl DetectorEvent {
    pub fn session_id(&self) -> &str {
        match self {
            DetectorEvent::StateChanged(event) => &event.session_id,
            DetectorEvent::Completion(event) => &event.session_id,
            DetectorEvent::SignalTimestamp(event) => &event.session_id,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Notifications
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// `<session_id>::<created_at_ms>`; see [`notification_id`].
    pub id: String,
    pub session_id: String,
    pub window_group: String,
    pub title: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SoundRequest {
    pub session_id: String,
    pub sound_id: String,
    pub volume: f64,
}

/// Where activating a notification should bring the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationTarget {
    pub session_id: String,
    pub window_group: String,
}

/// Everything pushed to observers of the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MonitorEvent {
    Sessions {
        sessions: Vec<Session>,
        active_count: usize,
    },
    Notification(Notification),
    Sound(SoundRequest),
    Focus(ActivationTarget),
}

const NOTIFICATION_ID_SEPARATOR: &str = "::";

pub fn notification_id(session_id: &str, created_at: DateTime<Utc>) -> String {
    format!(
        "{}{}{}",
        session_id,
        NOTIFICATION_ID_SEPARATOR,
        created_at.timestamp_millis()
    )
}

/// Splits a notification id back into its session id and creation time.
/// Session ids may themselves contain the separator, so split from the right.
pub fn parse_notification_id(id: &str) -> Option<(String, DateTime<Utc>)> {
    let (session_id, millis) = id.rsplit_once(NOTIFICATION_ID_SEPARATOR)?;
    if session_id.is_empty() {
        return None;
    }
    let created_at = from_millis(millis.parse().ok()?)?;
    Some((session_id.to_string(), created_at))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Time helpers
// ═══════════════════════════════════════════════════════════════════════════════

pub fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub fn from_millis(value: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value).single()
}
