//! Client helper for talking to the tabwatch daemon.
//!
//! The daemon owns all session state. Failures are surfaced to the caller;
//! `main` decides whether a failure is worth a non-zero exit.

use chrono::Utc;
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;
use tabwatch_daemon_protocol::{Method, Request, Response, MAX_REQUEST_BYTES};

const ENABLE_ENV: &str = "TABWATCH_DAEMON_ENABLED";
const READ_TIMEOUT_MS: u64 = 600;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

/// Sends one request, retrying once with the same request id. Returns the
/// response data (`null` when the daemon sent none).
pub fn call(method: Method, params: Option<Value>) -> Result<Value, String> {
    if !daemon_enabled() {
        return Err("Daemon disabled".to_string());
    }

    let id = make_request_id(method);
    let build = || Request {
        id: Some(id.clone()),
        ..Request::new(method, params.clone())
    };

    match send(build()) {
        Ok(data) => Ok(data),
        Err(err) => {
            tracing::warn!(error = %err, ?method, "Daemon request failed; retrying");
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send(build()).map_err(|retry_err| {
                tracing::warn!(error = %retry_err, ?method, "Retry failed");
                retry_err
            })
        }
    }
}

/// Opens a watch stream and hands every event line to `on_event` until the
/// daemon closes the connection or `on_event` returns false.
pub fn watch<F>(mut on_event: F) -> Result<(), String>
where
    F: FnMut(&str) -> bool,
{
    if !daemon_enabled() {
        return Err("Daemon disabled".to_string());
    }

    let mut stream = connect()?;
    write_request(&mut stream, &Request::new(Method::Watch, None))?;
    // Events may be minutes apart.
    let _ = stream.set_read_timeout(None);

    let mut reader = BufReader::new(stream);
    let mut ack = String::new();
    reader
        .read_line(&mut ack)
        .map_err(|err| format!("Failed to read watch ack: {}", err))?;
    let ack: Response = serde_json::from_str(ack.trim())
        .map_err(|err| format!("Failed to parse watch ack: {}", err))?;
    into_data(ack)?;

    for line in reader.lines() {
        let line = line.map_err(|err| format!("Watch stream failed: {}", err))?;
        if line.trim().is_empty() {
            continue;
        }
        if !on_event(&line) {
            break;
        }
    }
    Ok(())
}

fn socket_path() -> Result<PathBuf, String> {
    tabwatch_core::daemon_socket_path().map_err(|err| err.to_string())
}

fn connect() -> Result<UnixStream, String> {
    let socket = socket_path()?;
    let stream = UnixStream::connect(&socket)
        .map_err(|err| format!("Failed to connect to daemon socket: {}", err))?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));
    Ok(stream)
}

fn write_request(stream: &mut UnixStream, request: &Request) -> Result<(), String> {
    serde_json::to_writer(&mut *stream, request)
        .map_err(|err| format!("Failed to write request: {}", err))?;
    stream
        .write_all(b"\n")
        .map_err(|err| format!("Failed to flush request: {}", err))?;
    stream.flush().ok();
    Ok(())
}

fn send(request: Request) -> Result<Value, String> {
    let mut stream = connect()?;
    write_request(&mut stream, &request)?;
    into_data(read_response(&mut stream)?)
}

fn into_data(response: Response) -> Result<Value, String> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(response
            .error
            .map(|err| format!("{}: {}", err.code, err.message))
            .unwrap_or_else(|| "Unknown daemon error".to_string()))
    }
}

fn read_response(stream: &mut UnixStream) -> Result<Response, String> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err("Response exceeded maximum size".to_string());
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                return Err("Timed out waiting for daemon response".to_string());
            }
            Err(err) => return Err(format!("Failed to read response: {}", err)),
        }
    }

    let newline_index = buffer.iter().position(|b| *b == b'\n');
    let response_bytes = match newline_index {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err("Daemon response was empty".to_string());
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| format!("Failed to parse response JSON: {}", err))
}

fn make_request_id(method: Method) -> String {
    let mut random = rand::thread_rng();
    format!(
        "{:?}-{}-{}-{:x}",
        method,
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
