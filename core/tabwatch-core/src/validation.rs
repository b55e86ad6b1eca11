//! Field-by-field validation of untyped persisted records.
//!
//! Restored session state and the settings file are both partial, untyped
//! records written by older builds, other processes or by hand. Each field is
//! checked on its own; an invalid field is dropped (and reported) while its
//! siblings survive, so one bad value never throws away a whole record.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{Map, Value};

use crate::config::Settings;
use crate::error::MonitorError;
use crate::types::{from_millis, CompletionRecord, SessionState, COMPLETION_HISTORY_LIMIT};

/// Timestamps further than this in the future are treated as corrupt.
const MAX_CLOCK_SKEW_SECS: i64 = 60;

/// Ephemeral subset of a session as recovered from the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestoredEphemeral {
    pub state: Option<SessionState>,
    pub state_changed_at: Option<DateTime<Utc>>,
    pub last_signal_timestamp: Option<DateTime<Utc>>,
    pub generation_started_at: Option<DateTime<Utc>>,
    pub authoritative_signal: Option<bool>,
}

/// Durable subset of a session as recovered from the store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RestoredDurable {
    pub monitored: Option<bool>,
    pub completion_history: Option<Vec<CompletionRecord>>,
}

struct FieldCheck<'a> {
    session_id: &'a str,
    record: Option<&'a Map<String, Value>>,
    rejected: Vec<MonitorError>,
}

impl<'a> FieldCheck<'a> {
    fn new(session_id: &'a str, value: &'a Value) -> Self {
        let mut check = Self {
            session_id,
            record: value.as_object(),
            rejected: Vec::new(),
        };
        if check.record.is_none() && !value.is_null() {
            check.reject("<record>", "record is not an object");
        }
        check
    }

    fn reject(&mut self, field: &str, reason: impl Into<String>) {
        self.rejected.push(MonitorError::StaleRestoredState {
            session_id: self.session_id.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        });
    }

    fn get(&self, field: &str) -> Option<&'a Value> {
        self.record
            .and_then(|record| record.get(field))
            .filter(|value| !value.is_null())
    }

    fn timestamp(&mut self, field: &str, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let value = self.get(field)?;
        match parse_timestamp(value, now) {
            Ok(parsed) => Some(parsed),
            Err(reason) => {
                self.reject(field, reason);
                None
            }
        }
    }

    fn boolean(&mut self, field: &str) -> Option<bool> {
        let value = self.get(field)?;
        match value.as_bool() {
            Some(flag) => Some(flag),
            None => {
                self.reject(field, "expected a boolean");
                None
            }
        }
    }
}

fn parse_timestamp(value: &Value, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let millis = value
        .as_i64()
        .ok_or_else(|| "expected integer epoch milliseconds".to_string())?;
    if millis <= 0 {
        return Err(format!("non-positive timestamp {}", millis));
    }
    let parsed = from_millis(millis).ok_or_else(|| format!("timestamp {} out of range", millis))?;
    if parsed > now + TimeDelta::seconds(MAX_CLOCK_SKEW_SECS) {
        return Err(format!("timestamp {} is in the future", millis));
    }
    Ok(parsed)
}

/// Validates a restored ephemeral record. Returns the surviving fields and
/// one `StaleRestoredState` per discarded field.
pub fn validate_ephemeral(
    session_id: &str,
    value: &Value,
    now: DateTime<Utc>,
) -> (RestoredEphemeral, Vec<MonitorError>) {
    let mut check = FieldCheck::new(session_id, value);

    let state = match check.get("state") {
        Some(raw) => match raw.as_str().and_then(SessionState::parse) {
            Some(state) => Some(state),
            None => {
                check.reject("state", format!("unrecognized state {}", raw));
                None
            }
        },
        None => None,
    };
    let state_changed_at = check.timestamp("state_changed_at", now);
    let last_signal_timestamp = check.timestamp("last_signal_timestamp", now);
    let mut generation_started_at = check.timestamp("generation_started_at", now);
    let authoritative_signal = check.boolean("authoritative_signal");

    // A start time only means something while the session is generating.
    if generation_started_at.is_some() && !state.map(|s| s.is_active()).unwrap_or(false) {
        check.reject("generation_started_at", "session is not in an active state");
        generation_started_at = None;
    }

    (
        RestoredEphemeral {
            state,
            state_changed_at,
            last_signal_timestamp,
            generation_started_at,
            authoritative_signal,
        },
        check.rejected,
    )
}

/// Validates a restored durable record.
pub fn validate_durable(
    session_id: &str,
    value: &Value,
    now: DateTime<Utc>,
) -> (RestoredDurable, Vec<MonitorError>) {
    let mut check = FieldCheck::new(session_id, value);
    let monitored = check.boolean("monitored");

    let completion_history = match check.get("completion_history") {
        Some(Value::Array(entries)) => {
            let mut history = Vec::new();
            for (index, entry) in entries.iter().enumerate() {
                match parse_completion(entry, now) {
                    Ok(record) => history.push(record),
                    Err(reason) => {
                        check.reject(&format!("completion_history[{}]", index), reason);
                    }
                }
            }
            history.truncate(COMPLETION_HISTORY_LIMIT);
            Some(history)
        }
        Some(_) => {
            check.reject("completion_history", "expected an array");
            None
        }
        None => None,
    };

    (
        RestoredDurable {
            monitored,
            completion_history,
        },
        check.rejected,
    )
}

fn parse_completion(entry: &Value, now: DateTime<Utc>) -> Result<CompletionRecord, String> {
    let object = entry
        .as_object()
        .ok_or_else(|| "entry is not an object".to_string())?;
    let timestamp = parse_timestamp(
        object
            .get("timestamp")
            .ok_or_else(|| "missing timestamp".to_string())?,
        now,
    )?;
    let duration_ms = match object.get("duration_ms") {
        None | Some(Value::Null) => None,
        Some(value) => Some(
            value
                .as_u64()
                .ok_or_else(|| "duration_ms must be a non-negative integer".to_string())?,
        ),
    };
    let preview = match object.get("preview") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(_) => return Err("preview must be a string".to_string()),
    };

    Ok(CompletionRecord {
        timestamp,
        duration_ms,
        preview,
    })
}

/// Copies every recognized, type- and range-valid field of `value` onto
/// `defaults`. Returns the merged settings and the names of rejected fields.
pub fn merge_settings(defaults: &Settings, value: &Value) -> (Settings, Vec<String>) {
    let mut settings = defaults.clone();
    let mut rejected = Vec::new();
    let Some(record) = value.as_object() else {
        if !value.is_null() {
            rejected.push("<settings>".to_string());
        }
        return (settings, rejected);
    };

    for (key, raw) in record {
        let accepted = match key.as_str() {
            "sound_enabled" => raw.as_bool().map(|v| settings.sound_enabled = v).is_some(),
            "notifications_enabled" => raw
                .as_bool()
                .map(|v| settings.notifications_enabled = v)
                .is_some(),
            "auto_enable_enabled" => raw
                .as_bool()
                .map(|v| settings.auto_enable_enabled = v)
                .is_some(),
            "sound_volume" => raw
                .as_f64()
                .filter(|v| (0.0..=1.0).contains(v))
                .map(|v| settings.sound_volume = v)
                .is_some(),
            "selected_sound" => raw
                .as_str()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(|v| settings.selected_sound = v.to_string())
                .is_some(),
            "preview_length" => raw
                .as_u64()
                .map(|v| settings.preview_length = v as usize)
                .is_some(),
            "stability_window_ms" => positive(raw)
                .map(|v| settings.stability_window_ms = v)
                .is_some(),
            "poll_interval_ms" => positive(raw)
                .map(|v| settings.poll_interval_ms = v)
                .is_some(),
            "completion_grace_ms" => positive(raw)
                .map(|v| settings.completion_grace_ms = v)
                .is_some(),
            "discovery_interval_ms" => positive(raw)
                .map(|v| settings.discovery_interval_ms = v)
                .is_some(),
            "dedupe_window_ms" => raw
                .as_u64()
                .map(|v| settings.dedupe_window_ms = v)
                .is_some(),
            "restore_grace_ms" => raw
                .as_u64()
                .map(|v| settings.restore_grace_ms = v)
                .is_some(),
            "liveness_ttl_ms" => positive(raw)
                .map(|v| settings.liveness_ttl_ms = v)
                .is_some(),
            _ => false,
        };
        if !accepted {
            rejected.push(key.clone());
        }
    }

    (settings, rejected)
}

fn positive(value: &Value) -> Option<u64> {
    value.as_u64().filter(|v| *v > 0)
}
