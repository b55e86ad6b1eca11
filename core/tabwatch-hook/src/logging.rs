//! File logging for the hook CLI.
//!
//! Integrations read the CLI's stdout, so logs go to a daily rolling file
//! under `~/.tabwatch/logs/`. Without a home directory logging is disabled.

use fs_err as fs;
use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const LOG_FILE_PREFIX: &str = "hook.log";

/// Installs the subscriber. Keep the guard alive until exit so buffered lines
/// are flushed.
pub fn init() -> Option<WorkerGuard> {
    let dir = tabwatch_core::get_log_dir()?;
    if fs::create_dir_all(&dir).is_err() {
        return None;
    }

    let appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .with_writer(writer)
        .with_ansi(false)
        .try_init()
        .ok()?;

    Some(guard)
}

fn filter() -> EnvFilter {
    let debug_enabled = env::var("TABWATCH_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}
