//! Signal source contract.
//!
//! The signal source is whatever can tell us, per session, whether a
//! generation is running (DOM inspection in a browser extension, an HTTP API,
//! a test fake). It is noisy and may be unavailable; [`SignalSample::read`]
//! folds every failure into the "nothing is happening" sample so the detector
//! never has to handle errors itself.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::MonitorError;
use crate::types::SessionDescriptor;

/// Per-session probe. Implementations must be cheap; they are called once per
/// poll interval.
pub trait SignalSource: Send + Sync {
    fn is_active(&self) -> Result<bool, MonitorError>;

    /// Secondary "thinking" indicator. Sources without one return `Ok(false)`.
    fn is_intermediate_phase(&self) -> Result<bool, MonitorError>;

    /// Growing output text; empty when there is none.
    fn content_snapshot(&self) -> Result<String, MonitorError>;

    /// Out-of-band timestamp pushed by the source. Display only.
    fn authoritative_timestamp(&self) -> Option<DateTime<Utc>>;
}

/// Enumerates the sessions that currently exist.
pub trait SessionCatalog: Send + Sync {
    fn live_sessions(&self) -> Vec<SessionDescriptor>;
}

/// One poll's worth of readings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SignalSample {
    pub active: bool,
    pub intermediate: bool,
    pub content: String,
    pub authoritative_timestamp: Option<DateTime<Utc>>,
}

impl SignalSample {
    pub fn new(active: bool, content: &str) -> Self {
        Self {
            active,
            content: content.to_string(),
            ..Self::default()
        }
    }

    pub fn thinking(mut self) -> Self {
        self.intermediate = true;
        self
    }

    /// Reads every signal, treating unavailable readings as inactive/empty.
    pub fn read(session_id: &str, source: &dyn SignalSource) -> Self {
        let active = source.is_active().unwrap_or_else(|err| {
            debug!(session_id = %session_id, error = %err, "Activity signal unavailable");
            false
        });
        let intermediate = if active {
            source.is_intermediate_phase().unwrap_or_else(|err| {
                debug!(session_id = %session_id, error = %err, "Phase signal unavailable");
                false
            })
        } else {
            false
        };
        let content = source.content_snapshot().unwrap_or_else(|err| {
            debug!(session_id = %session_id, error = %err, "Content probe unavailable");
            String::new()
        });

        Self {
            active,
            intermediate,
            content,
            authoritative_timestamp: source.authoritative_timestamp(),
        }
    }
}
