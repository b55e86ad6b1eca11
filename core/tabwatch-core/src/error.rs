//! Error types for tabwatch-core operations.
//!
//! Nothing in the core is fatal: every variant here is recovered locally by
//! the caller (logged, defaulted or dropped). The enum exists so those
//! recoveries are explicit and testable.

use std::path::PathBuf;

/// All errors that can occur in tabwatch-core operations.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    // ─────────────────────────────────────────────────────────────────────
    // Detection Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Signal unavailable for session {session_id}: {details}")]
    SignalUnavailable { session_id: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Restore Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Discarded restored field {field} for session {session_id}: {reason}")]
    StaleRestoredState {
        session_id: String,
        field: String,
        reason: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Delivery Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Delivery failed ({target}): {details}")]
    DeliveryFailure { target: String, details: String },

    #[error("Duplicate completion for session {session_id}")]
    DuplicateCompletion { session_id: String },

    // ─────────────────────────────────────────────────────────────────────
    // Storage / Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Store error: {0}")]
    Store(String),

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON parsing error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl MonitorError {
    pub fn signal_unavailable(session_id: &str, details: impl Into<String>) -> Self {
        MonitorError::SignalUnavailable {
            session_id: session_id.to_string(),
            details: details.into(),
        }
    }

    pub fn delivery(target: &str, details: impl Into<String>) -> Self {
        MonitorError::DeliveryFailure {
            target: target.to_string(),
            details: details.into(),
        }
    }
}

/// Convenience type alias for Results using MonitorError.
pub type Result<T> = std::result::Result<T, MonitorError>;

impl From<MonitorError> for String {
    fn from(err: MonitorError) -> String {
        err.to_string()
    }
}
