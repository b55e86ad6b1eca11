//! Persistence bridge between the registry and the injected record stores.
//!
//! # Module Structure
//!
//! - [`store`]: the [`RecordStore`] capability plus in-memory and JSON-file
//!   implementations (the daemon adds a SQLite one)
//! - [`bridge`]: durable/ephemeral split, restore-time validation and
//!   best-effort writes

mod bridge;
mod store;

pub use bridge::{durable_record, ephemeral_record, PersistenceBridge, RestoredSession};
pub use store::{JsonFileStore, MemoryStore, RecordStore};
