//! Tabwatch daemon entrypoint.
//!
//! A small, single-writer service: a Unix socket listener with strict request
//! validation, a signal board fed by browser integrations, one detector task
//! per session and the registry actor that owns all session state.
//! Durable state lives in SQLite; ephemeral state in the runtime dir.

use chrono::Utc;
use fs_err as fs;
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tabwatch_core::{
    daemon_socket_path, get_durable_db_path, get_ephemeral_state_path, get_settings_path,
    load_settings, JsonFileStore, NotificationDispatcher, PersistenceBridge, SessionCatalog,
    SessionDescriptor, SessionRegistry, Settings,
};
use tabwatch_daemon_protocol::{
    parse_activation, parse_monitor_toggle, parse_session_open, parse_session_ref,
    parse_settings_patch, parse_signal_report, ErrorInfo, Method, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};

mod board;
mod db;
mod poller;
mod state;
mod writer;

use board::{Reading, SignalBoard};
use db::Db;
use state::{BroadcastSurface, RegistryActor, RegistryHandle, EVENT_BUFFER};
use writer::QueuedStore;

const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

#[derive(Clone)]
struct Daemon {
    registry: RegistryHandle,
    board: SignalBoard,
}

#[tokio::main]
async fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    let settings_path = get_settings_path();
    let settings = load_daemon_settings(settings_path.as_deref());

    let db_path = match get_durable_db_path() {
        Some(path) => path,
        None => {
            error!("Failed to resolve daemon database path: home directory not found");
            std::process::exit(1);
        }
    };
    let persistence = match open_persistence(db_path, &get_ephemeral_state_path()) {
        Ok(persistence) => persistence,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon persistence");
            std::process::exit(1);
        }
    };

    let (events, _) = broadcast::channel(EVENT_BUFFER);
    let surface = BroadcastSurface::new(events.clone());
    let registry = SessionRegistry::new(
        settings.clone(),
        persistence,
        NotificationDispatcher::new(Box::new(surface.clone()), Box::new(surface)),
        Utc::now(),
    );

    let shutdown = CancellationToken::new();
    spawn_shutdown_listener(shutdown.clone());

    let board = SignalBoard::new(Duration::from_millis(settings.liveness_ttl_ms));
    let (registry, actor) = RegistryActor::spawn(
        registry,
        board.clone(),
        events,
        settings_path,
        shutdown.clone(),
    );
    spawn_discovery(
        registry.clone(),
        board.clone(),
        Duration::from_millis(settings.discovery_interval_ms),
        shutdown.clone(),
    );

    info!(path = %socket_path.display(), "Tabwatch daemon started");

    let daemon = Daemon { registry, board };
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(handle_connection(stream, daemon.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "Failed to accept daemon connection");
                }
            },
        }
    }

    match actor.await {
        Ok(registry) => flush_persistence(registry).await,
        Err(err) => error!(error = %err, "Registry actor failed; queued writes may be lost"),
    }
    if let Err(err) = remove_existing_socket(&socket_path) {
        warn!(error = %err, "Failed to clean up daemon socket");
    }
    info!("Tabwatch daemon stopped");
}

fn init_logging() {
    let debug_enabled = env::var("TABWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_daemon_settings(path: Option<&Path>) -> Settings {
    let Some(path) = path else {
        warn!("Home directory not found; using default settings");
        return Settings::default();
    };
    match load_settings(path) {
        Ok(settings) => settings,
        Err(err) => {
            warn!(error = %err, "Failed to load settings; using defaults");
            Settings::default()
        }
    }
}

fn open_persistence(db_path: PathBuf, ephemeral_path: &Path) -> Result<PersistenceBridge, String> {
    let db = Db::new(db_path)?;
    let durable = QueuedStore::spawn("durable", Box::new(db))?;
    let ephemeral = QueuedStore::spawn("ephemeral", Box::new(JsonFileStore::open(ephemeral_path)))?;
    Ok(PersistenceBridge::new(Box::new(durable), Box::new(ephemeral)))
}

/// Waits for the writer threads to drain, then joins them by dropping the
/// registry's stores.
async fn flush_persistence(mut registry: SessionRegistry) {
    let flushed = tokio::task::spawn_blocking(move || {
        registry.flush();
        drop(registry);
    })
    .await;
    if let Err(err) = flushed {
        error!(error = %err, "Failed to flush persistence on shutdown");
    }
}

fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                let _ = ctrl_c.await;
            }
        }
        info!("Shutdown signal received");
        shutdown.cancel();
    });
}

/// Periodically enumerates the catalog so sessions that vanished without a
/// `close_session` are removed and their detectors stopped.
fn spawn_discovery(
    registry: RegistryHandle,
    catalog: SignalBoard,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = registry.reconcile(catalog.live_sessions()) {
                        warn!(error = %err, "Discovery pass failed");
                        break;
                    }
                }
            }
        }
    });
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

async fn handle_connection(mut stream: UnixStream, daemon: Daemon) {
    let request = match read_request(&mut stream).await {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, &response).await;
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    if request.method == Method::Watch && request.protocol_version == PROTOCOL_VERSION {
        watch(stream, request.id, daemon).await;
        return;
    }
    let response = handle_request(request, &daemon).await;
    let _ = write_response(&mut stream, &response).await;
}

async fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        let read = tokio::time::timeout(
            Duration::from_secs(READ_TIMEOUT_SECS),
            stream.read(&mut chunk),
        )
        .await;
        match read {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Ok(Err(err)) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
            Err(_) => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let request_bytes = match newline_index {
        Some(index) => {
            if buffer.len() > index + 1 {
                let trailing = &buffer[index + 1..];
                if trailing.iter().any(|b| !b.is_ascii_whitespace()) {
                    warn!("Extra bytes detected after newline; ignoring trailing data");
                }
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

async fn handle_request(request: Request, daemon: &Daemon) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    let id = request.id;
    let result = match request.method {
        Method::GetHealth => get_health(daemon).await,
        Method::GetSessions => to_data(daemon.registry.snapshot().await, "sessions_error"),
        Method::ReportSignal => report_signal(request.params, daemon).await,
        Method::OpenSession => open_session(request.params, daemon).await,
        Method::CloseSession => close_session(request.params, daemon).await,
        Method::SetMonitored => set_monitored(request.params, daemon).await,
        Method::ActivateNotification => activate_notification(request.params, daemon).await,
        Method::GetSettings => to_data(daemon.registry.settings().await, "settings_error"),
        Method::UpdateSettings => update_settings(request.params, daemon).await,
        Method::Watch => Err(ErrorInfo::new(
            "invalid_method",
            "watch must be the only request on its connection",
        )),
    };

    match result {
        Ok(data) => Response::ok(id, data),
        Err(err) => Response::error_with_info(id, err),
    }
}

fn require_params(params: Option<Value>, what: &str) -> Result<Value, ErrorInfo> {
    params.ok_or_else(|| ErrorInfo::new("invalid_params", format!("{} is required", what)))
}

fn to_data<T: serde::Serialize>(result: Result<T, String>, code: &str) -> Result<Value, ErrorInfo> {
    let value = result.map_err(|err| ErrorInfo::new(code, err))?;
    serde_json::to_value(value).map_err(|err| {
        ErrorInfo::new(
            "serialization_error",
            format!("Failed to serialize response: {}", err),
        )
    })
}

async fn get_health(daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let mut data = serde_json::json!({
        "status": "ok",
        "pid": std::process::id(),
        "version": env!("CARGO_PKG_VERSION"),
        "protocol_version": PROTOCOL_VERSION,
    });
    match daemon.registry.health().await {
        Ok(health) => {
            if let Ok(value) = serde_json::to_value(health) {
                data["registry"] = value;
            }
        }
        Err(err) => {
            data["status"] = Value::String("degraded".to_string());
            data["registry_error"] = Value::String(err);
        }
    }
    Ok(data)
}

async fn report_signal(params: Option<Value>, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let report = parse_signal_report(require_params(params, "signal report")?)?;
    let signal_timestamp = report.parsed_signal_timestamp();
    let created = daemon.board.report(
        &report.session_id,
        Reading {
            active: report.active,
            intermediate: report.intermediate,
            content: report.content,
            signal_timestamp,
        },
    );
    if created {
        let descriptor = daemon
            .board
            .descriptor(&report.session_id)
            .unwrap_or_else(|| SessionDescriptor::new(report.session_id.clone()));
        daemon
            .registry
            .open(descriptor)
            .await
            .map_err(|err| ErrorInfo::new("registry_error", err))?;
    }
    tracing::debug!(session_id = %report.session_id, active = report.active, "Signal reported");
    Ok(serde_json::json!({ "accepted": true }))
}

async fn open_session(params: Option<Value>, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let open = parse_session_open(require_params(params, "session")?)?;
    let descriptor = SessionDescriptor {
        id: open.session_id,
        window_group: open.window_group,
        title: open.title,
        locator: open.locator,
    };
    daemon.board.open(descriptor.clone());
    to_data(daemon.registry.open(descriptor).await, "registry_error")
}

async fn close_session(params: Option<Value>, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let session = parse_session_ref(require_params(params, "session")?)?;
    daemon.board.close(&session.session_id);
    let removed = daemon
        .registry
        .close(&session.session_id)
        .await
        .map_err(|err| ErrorInfo::new("registry_error", err))?;
    Ok(serde_json::json!({ "removed": removed }))
}

async fn set_monitored(params: Option<Value>, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let toggle = parse_monitor_toggle(require_params(params, "monitor toggle")?)?;
    let result = daemon
        .registry
        .set_monitored(&toggle.session_id, toggle.monitored)
        .await
        .map_err(|err| ErrorInfo::new("registry_error", err))?;
    match result {
        Some(monitored) => Ok(serde_json::json!({
            "session_id": toggle.session_id,
            "monitored": monitored,
        })),
        None => Err(ErrorInfo::new(
            "unknown_session",
            format!("no session {}", toggle.session_id),
        )),
    }
}

async fn activate_notification(params: Option<Value>, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let activation = parse_activation(require_params(params, "activation")?)?;
    let target = daemon
        .registry
        .activate(&activation.notification_id)
        .await
        .map_err(|err| ErrorInfo::new("registry_error", err))?;
    match target {
        Some(target) => Ok(serde_json::json!({
            "resolved": true,
            "session_id": target.session_id,
            "window_group": target.window_group,
        })),
        None => Ok(serde_json::json!({ "resolved": false })),
    }
}

async fn update_settings(params: Option<Value>, daemon: &Daemon) -> Result<Value, ErrorInfo> {
    let patch = parse_settings_patch(require_params(params, "settings patch")?)?;
    to_data(daemon.registry.update_settings(patch).await, "settings_error")
}

/// Streams monitor events until the client disconnects. The first line is
/// the usual response, the second a full session snapshot.
async fn watch(stream: UnixStream, id: Option<String>, daemon: Daemon) {
    let mut events = daemon.registry.subscribe();
    let (mut reader, mut writer) = stream.into_split();

    let snapshot = match daemon.registry.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            let response = Response::error(id, "sessions_error", err);
            let _ = write_line(&mut writer, &response).await;
            return;
        }
    };
    let ack = Response::ok(id, serde_json::json!({ "watching": true }));
    let initial = tabwatch_core::MonitorEvent::Sessions {
        sessions: snapshot.sessions,
        active_count: snapshot.active_count,
    };
    if write_line(&mut writer, &ack).await.is_err()
        || write_line(&mut writer, &initial).await.is_err()
    {
        return;
    }

    info!("Watcher connected");
    let mut scratch = [0u8; 64];
    loop {
        tokio::select! {
            read = reader.read(&mut scratch) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            },
            received = events.recv() => match received {
                Ok(event) => {
                    if write_line(&mut writer, &event).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Watcher lagged; events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    info!("Watcher disconnected");
}

async fn write_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

async fn write_response(stream: &mut UnixStream, response: &Response) -> std::io::Result<()> {
    write_line(stream, response).await
}
