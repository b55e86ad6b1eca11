//! # tabwatch-core
//!
//! Core library for Tabwatch: detects when a generation in a chat tab has
//! finished and turns that into a notification.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. The daemon drives detectors
//!   from tokio tasks and owns the registry behind an actor.
//! - **Injected collaborators**: signal sources, record stores and
//!   notification surfaces are traits; nothing here touches a browser.
//! - **Graceful degradation**: unreadable signals read as inactive, invalid
//!   persisted fields fall back to defaults, failed deliveries are logged.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tabwatch_core::{Detector, DetectorConfig, SessionRegistry, SignalSample};
//!
//! let mut detector = Detector::new("tab-1", DetectorConfig::default());
//! for event in detector.tick(now, &SignalSample::new(true, "Hel")) {
//!     registry.apply(event)?;
//! }
//! ```

pub mod config;
pub mod detector;
pub mod dispatcher;
pub mod error;
pub mod persistence;
pub mod registry;
pub mod signal;
pub mod types;
pub mod validation;

pub use config::*;
pub use detector::{truncate_preview, Detector, DetectorConfig};
pub use dispatcher::{NotificationDispatcher, NotificationSurface, SoundPlayer};
pub use error::{MonitorError, Result};
pub use persistence::{JsonFileStore, MemoryStore, PersistenceBridge, RecordStore, RestoredSession};
pub use registry::{ReconcileOutcome, SessionRegistry};
pub use signal::{SessionCatalog, SignalSample, SignalSource};
pub use types::*;
