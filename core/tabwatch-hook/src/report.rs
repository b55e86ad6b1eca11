//! Signal and lifecycle reporting (`signal`, `open`, `close`).
//!
//! Called from browser integrations on every poll, so these never disturb
//! the caller: `main` logs failures and still exits 0.

use serde_json::Value;
use std::io::Read;
use tabwatch_daemon_protocol::{Method, SessionOpen, SessionRef, SignalReport};

use crate::daemon_client;

#[derive(Debug, Clone, Default)]
pub struct SignalArgs {
    pub session_id: String,
    pub active: bool,
    pub intermediate: bool,
    pub content: Option<String>,
    pub content_from_stdin: bool,
    pub signal_timestamp: Option<String>,
}

pub fn signal(args: SignalArgs) -> Result<(), String> {
    let content = if args.content_from_stdin {
        read_stdin()?
    } else {
        args.content.clone().unwrap_or_default()
    };
    let report = build_signal_report(args, content)?;
    let params = to_params(&report)?;
    daemon_client::call(Method::ReportSignal, Some(params))?;
    tracing::debug!(session_id = %report.session_id, active = report.active, "Signal sent");
    Ok(())
}

pub fn open(open: SessionOpen) -> Result<(), String> {
    let params = to_params(&open)?;
    daemon_client::call(Method::OpenSession, Some(params))?;
    tracing::info!(session_id = %open.session_id, "Session opened");
    Ok(())
}

pub fn close(session_id: String) -> Result<(), String> {
    let session = SessionRef { session_id };
    let params = to_params(&session)?;
    daemon_client::call(Method::CloseSession, Some(params))?;
    tracing::info!(session_id = %session.session_id, "Session closed");
    Ok(())
}

/// Validates locally so malformed input is logged here rather than
/// round-tripped to the daemon.
fn build_signal_report(args: SignalArgs, content: String) -> Result<SignalReport, String> {
    let report = SignalReport {
        session_id: args.session_id.trim().to_string(),
        active: args.active,
        intermediate: args.intermediate,
        content,
        signal_timestamp: args.signal_timestamp,
    };
    report
        .validate()
        .map_err(|err| format!("{}: {}", err.code, err.message))?;
    Ok(report)
}

fn read_stdin() -> Result<String, String> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .map_err(|err| format!("Failed to read content from stdin: {}", err))?;
    Ok(content)
}

fn to_params<T: serde::Serialize>(value: &T) -> Result<Value, String> {
    serde_json::to_value(value).map_err(|err| format!("Failed to serialize params: {}", err))
}
