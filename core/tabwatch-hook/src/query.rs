//! Commands whose output the caller reads: `sessions`, `monitor`, `activate`,
//! `watch` and `health`. Results are printed to stdout as JSON; failures are
//! returned so `main` can exit non-zero.

use serde_json::{json, Value};
use std::io::Write;
use tabwatch_daemon_protocol::{ActivationRequest, Method, MonitorToggle};

use crate::daemon_client;

pub fn sessions() -> Result<(), String> {
    let data = daemon_client::call(Method::GetSessions, None)?;
    print_json(&data)
}

pub fn monitor(session_id: String, monitored: bool) -> Result<(), String> {
    let toggle = MonitorToggle {
        session_id,
        monitored,
    };
    let params = serde_json::to_value(&toggle)
        .map_err(|err| format!("Failed to serialize params: {}", err))?;
    let data = daemon_client::call(Method::SetMonitored, Some(params))?;
    print_json(&data)
}

/// An id the daemon cannot resolve is not an error; the printed payload says
/// `"resolved": false`.
pub fn activate(notification_id: String) -> Result<(), String> {
    let request = ActivationRequest { notification_id };
    let params = serde_json::to_value(&request)
        .map_err(|err| format!("Failed to serialize params: {}", err))?;
    let data = daemon_client::call(Method::ActivateNotification, Some(params))?;
    print_json(&data)
}

pub fn health() -> Result<(), String> {
    let data = daemon_client::call(Method::GetHealth, None)?;
    print_json(&data)?;
    match data.get("status").and_then(Value::as_str) {
        Some("ok") => Ok(()),
        status => Err(format!("Daemon unhealthy: {}", status.unwrap_or("unknown"))),
    }
}

/// Echoes every event line until the daemon goes away or stdout closes.
pub fn watch() -> Result<(), String> {
    let stdout = std::io::stdout();
    daemon_client::watch(|line| {
        let mut out = stdout.lock();
        writeln!(out, "{}", line).and_then(|_| out.flush()).is_ok()
    })
}

fn print_json(data: &Value) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(data)
        .unwrap_or_else(|_| json!({ "error": "unprintable response" }).to_string());
    let mut out = std::io::stdout().lock();
    writeln!(out, "{}", rendered).map_err(|err| format!("Failed to write output: {}", err))
}
