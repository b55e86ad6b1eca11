//! IPC protocol types and validation for tabwatch-daemon.
//!
//! This crate is shared by the daemon and its clients to prevent schema drift.
//! The daemon remains the authority on validation, but clients can reuse the
//! same types to construct valid requests.
//!
//! Framing is one JSON object per line. Every method answers with a single
//! [`Response`] line except `watch`, which keeps the connection open and
//! streams one event object per line until the client disconnects.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB
pub const MAX_SESSION_ID_LEN: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    GetSessions,
    ReportSignal,
    OpenSession,
    CloseSession,
    SetMonitored,
    ActivateNotification,
    GetSettings,
    UpdateSettings,
    Watch,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(method: Method, params: Option<Value>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            id: None,
            params,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// One poll result pushed by a browser integration (`report_signal`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SignalReport {
    pub session_id: String,
    pub active: bool,
    #[serde(default)]
    pub intermediate: bool,
    #[serde(default)]
    pub content: String,
    /// RFC3339 time the source itself attributes to this signal.
    #[serde(default)]
    pub signal_timestamp: Option<String>,
}

impl SignalReport {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        require_session_id(&self.session_id)?;
        if let Some(value) = &self.signal_timestamp {
            parse_timestamp(value)?;
        }
        Ok(())
    }

    /// The authoritative timestamp, if one was supplied. Call after
    /// [`SignalReport::validate`].
    pub fn parsed_signal_timestamp(&self) -> Option<DateTime<Utc>> {
        self.signal_timestamp
            .as_deref()
            .and_then(|value| parse_timestamp(value).ok())
    }
}

/// A session appearing (`open_session`). Display fields are optional.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionOpen {
    pub session_id: String,
    #[serde(default)]
    pub window_group: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub locator: String,
}

/// Params for methods that only name a session (`close_session`).
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct MonitorToggle {
    pub session_id: String,
    pub monitored: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ActivationRequest {
    pub notification_id: String,
}

pub fn parse_signal_report(params: Value) -> Result<SignalReport, ErrorInfo> {
    let report: SignalReport = from_params(params, "signal report")?;
    report.validate()?;
    Ok(report)
}

pub fn parse_session_open(params: Value) -> Result<SessionOpen, ErrorInfo> {
    let open: SessionOpen = from_params(params, "session")?;
    require_session_id(&open.session_id)?;
    Ok(open)
}

pub fn parse_session_ref(params: Value) -> Result<SessionRef, ErrorInfo> {
    let session: SessionRef = from_params(params, "session")?;
    require_session_id(&session.session_id)?;
    Ok(session)
}

pub fn parse_monitor_toggle(params: Value) -> Result<MonitorToggle, ErrorInfo> {
    let toggle: MonitorToggle = from_params(params, "monitor toggle")?;
    require_session_id(&toggle.session_id)?;
    Ok(toggle)
}

pub fn parse_activation(params: Value) -> Result<ActivationRequest, ErrorInfo> {
    let request: ActivationRequest = from_params(params, "activation")?;
    if request.notification_id.trim().is_empty() {
        return Err(ErrorInfo::new(
            "missing_field",
            "notification_id is required",
        ));
    }
    Ok(request)
}

/// Settings updates are partial objects; per-field validation happens in the
/// daemon against the current settings.
pub fn parse_settings_patch(params: Value) -> Result<Value, ErrorInfo> {
    if !params.is_object() {
        return Err(ErrorInfo::new(
            "invalid_params",
            "settings patch must be an object",
        ));
    }
    Ok(params)
}

fn from_params<T: serde::de::DeserializeOwned>(params: Value, what: &str) -> Result<T, ErrorInfo> {
    serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("{} payload is invalid: {}", what, err),
        )
    })
}

fn require_session_id(value: &str) -> Result<(), ErrorInfo> {
    if value.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "session_id is required"));
    }
    if value.len() > MAX_SESSION_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_session_id",
            format!(
                "session_id must be {} characters or fewer",
                MAX_SESSION_ID_LEN
            ),
        ));
    }
    Ok(())
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, ErrorInfo> {
    DateTime::parse_from_rfc3339(value)
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| {
            ErrorInfo::new(
                "invalid_timestamp",
                "signal_timestamp must be RFC3339",
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_signal_report() {
        let report = parse_signal_report(json!({ "session_id": "tab-1", "active": true }))
            .expect("valid report");
        assert!(report.active);
        assert!(!report.intermediate);
        assert!(report.content.is_empty());
        assert!(report.parsed_signal_timestamp().is_none());
    }

    #[test]
    fn parses_signal_timestamp() {
        let report = parse_signal_report(json!({
            "session_id": "tab-1",
            "active": false,
            "signal_timestamp": "2026-01-30T12:00:00+02:00",
        }))
        .expect("valid report");
        assert_eq!(
            report.parsed_signal_timestamp().map(|t| t.to_rfc3339()),
            Some("2026-01-30T10:00:00+00:00".to_string())
        );
    }

    #[test]
    fn rejects_bad_signal_timestamp() {
        let err = parse_signal_report(json!({
            "session_id": "tab-1",
            "active": true,
            "signal_timestamp": "soon",
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_timestamp");
    }

    #[test]
    fn rejects_missing_session_id() {
        let err = parse_session_ref(json!({ "session_id": "  " })).unwrap_err();
        assert_eq!(err.code, "missing_field");
    }

    #[test]
    fn rejects_long_session_id() {
        let err = parse_session_open(json!({ "session_id": "a".repeat(300) })).unwrap_err();
        assert_eq!(err.code, "invalid_session_id");
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = parse_monitor_toggle(json!({
            "session_id": "tab-1",
            "monitored": true,
            "extra": 1,
        }))
        .unwrap_err();
        assert_eq!(err.code, "invalid_params");
    }

    #[test]
    fn settings_patch_must_be_object() {
        assert!(parse_settings_patch(json!({ "sound_enabled": false })).is_ok());
        assert!(parse_settings_patch(json!([1, 2])).is_err());
    }

    #[test]
    fn request_round_trips_method_names() {
        let request = Request::new(Method::ActivateNotification, None);
        let line = serde_json::to_string(&request).expect("serialize");
        assert!(line.contains("\"activate_notification\""));
        let parsed: Request = serde_json::from_str(&line).expect("parse");
        assert_eq!(parsed.method, Method::ActivateNotification);
    }
}
