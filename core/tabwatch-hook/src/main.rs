//! tabwatch-hook: CLI bridge between browser integrations and the tabwatch
//! daemon.
//!
//! Integrations (a native messaging host, userscripts, shell glue) call it to
//! push signal readings and tab lifecycle events; people call it to inspect
//! and control the daemon.
//!
//! ## Subcommands
//!
//! - `signal`, `open`, `close`: reporting; failures are logged, exit code 0
//! - `sessions`, `monitor`, `activate`, `watch`, `health`: queries; failures
//!   exit 1

mod daemon_client;
mod logging;
mod query;
mod report;

use clap::{ArgAction, Parser, Subcommand};
use tabwatch_daemon_protocol::SessionOpen;

#[derive(Parser)]
#[command(name = "tabwatch-hook")]
#[command(about = "Tabwatch completion monitor client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Report the latest signal reading for a session
    Signal {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        /// Output is currently being generated
        #[arg(long)]
        active: bool,

        /// The session is between generation phases (e.g. running a tool)
        #[arg(long)]
        intermediate: bool,

        /// Current reply text
        #[arg(long, conflicts_with = "stdin")]
        content: Option<String>,

        /// Read the reply text from stdin
        #[arg(long)]
        stdin: bool,

        /// RFC3339 time the page attributes to this signal
        #[arg(long, value_name = "RFC3339")]
        timestamp: Option<String>,
    },

    /// Register a session (tab) with the daemon
    Open {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        /// Window the tab lives in; activation focuses this window
        #[arg(long, default_value = "")]
        window_group: String,

        #[arg(long, default_value = "")]
        title: String,

        /// URL or other locator for the tab
        #[arg(long, default_value = "")]
        locator: String,
    },

    /// Tell the daemon a session went away
    Close {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,
    },

    /// Print all sessions as JSON
    Sessions,

    /// Turn monitoring for a session on or off
    Monitor {
        #[arg(value_name = "SESSION_ID")]
        session_id: String,

        #[arg(value_name = "ENABLED", action = ArgAction::Set)]
        enabled: bool,
    },

    /// Resolve a notification id to its session and focus it
    Activate {
        #[arg(value_name = "NOTIFICATION_ID")]
        notification_id: String,
    },

    /// Stream monitor events as JSON lines
    Watch,

    /// Check that the daemon is up
    Health,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Signal {
            session_id,
            active,
            intermediate,
            content,
            stdin,
            timestamp,
        } => {
            let args = report::SignalArgs {
                session_id,
                active,
                intermediate,
                content,
                content_from_stdin: stdin,
                signal_timestamp: timestamp,
            };
            // Reporting is best-effort; never disrupt the integration.
            if let Err(e) = report::signal(args) {
                tracing::warn!(error = %e, "tabwatch-hook signal failed");
            }
        }
        Commands::Open {
            session_id,
            window_group,
            title,
            locator,
        } => {
            let open = SessionOpen {
                session_id,
                window_group,
                title,
                locator,
            };
            if let Err(e) = report::open(open) {
                tracing::warn!(error = %e, "tabwatch-hook open failed");
            }
        }
        Commands::Close { session_id } => {
            if let Err(e) = report::close(session_id) {
                tracing::warn!(error = %e, "tabwatch-hook close failed");
            }
        }
        Commands::Sessions => exit_on_error("sessions", query::sessions()),
        Commands::Monitor {
            session_id,
            enabled,
        } => exit_on_error("monitor", query::monitor(session_id, enabled)),
        Commands::Activate { notification_id } => {
            exit_on_error("activate", query::activate(notification_id))
        }
        Commands::Watch => exit_on_error("watch", query::watch()),
        Commands::Health => exit_on_error("health", query::health()),
    }
}

fn exit_on_error(command: &str, result: Result<(), String>) {
    if let Err(e) = result {
        tracing::error!(error = %e, command, "tabwatch-hook query failed");
        eprintln!("tabwatch-hook {}: {}", command, e);
        std::process::exit(1);
    }
}
