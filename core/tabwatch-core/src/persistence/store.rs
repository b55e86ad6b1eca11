//! Key-value record stores.
//!
//! A [`RecordStore`] is the injected get/set capability behind both
//! persistence tiers: a mapping from session id to one flat JSON record.
//! Writes overwrite whole records; there is no partial update and no
//! cross-record transaction.
//!
//! # File Format
//!
//! [`JsonFileStore`] keeps every record in a single file:
//!
//! ```json
//! {
//!   "version": 1,
//!   "records": {
//!     "tab-42": { "state": "Generating", "state_changed_at": 1700000000000 }
//!   }
//! }
//! ```
//!
//! Empty, corrupt or wrong-version files load as an empty store; losing
//! ephemeral state is always preferable to refusing to start.
//!
//! # Atomic Writes
//!
//! Uses temp file + rename so a crash mid-write never leaves a torn file.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use fs_err as fs;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::{MonitorError, Result};

const STORE_FILE_VERSION: u32 = 1;

pub trait RecordStore: Send {
    /// Every stored record, keyed by session id.
    fn load_all(&self) -> Result<BTreeMap<String, Value>>;

    fn put(&mut self, session_id: &str, record: Value) -> Result<()>;

    /// Removing an absent id is not an error.
    fn delete(&mut self, session_id: &str) -> Result<()>;

    /// Returns once every earlier write has reached the backing storage.
    /// Stores that write synchronously have nothing to do.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Volatile store for tests and for running without a backing directory.
///
/// Clones share the same records, so a test can keep a handle and inspect
/// what a registry persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    records: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records<I>(records: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        Self {
            records: Arc::new(Mutex::new(records.into_iter().collect())),
        }
    }

    pub fn get(&self, session_id: &str) -> Option<Value> {
        self.records
            .lock()
            .ok()
            .and_then(|records| records.get(session_id).cloned())
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Value>>> {
        self.records
            .lock()
            .map_err(|_| MonitorError::Store("memory store lock poisoned".to_string()))
    }
}

impl RecordStore for MemoryStore {
    fn load_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.locked()?.clone())
    }

    fn put(&mut self, session_id: &str, record: Value) -> Result<()> {
        self.locked()?.insert(session_id.to_string(), record);
        Ok(())
    }

    fn delete(&mut self, session_id: &str) -> Result<()> {
        self.locked()?.remove(session_id);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    records: BTreeMap<String, Value>,
}

/// File-backed store: the whole map is cached in memory and rewritten on
/// every change.
#[derive(Debug)]
pub struct JsonFileStore {
    records: BTreeMap<String, Value>,
    file_path: PathBuf,
}

impl JsonFileStore {
    pub fn open(file_path: &Path) -> Self {
        let records = match read_store_file(file_path) {
            Ok(records) => records,
            Err(err) => {
                warn!(
                    path = %file_path.display(),
                    error = %err,
                    "Failed to read record file, starting empty"
                );
                BTreeMap::new()
            }
        };
        Self {
            records,
            file_path: file_path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    fn save(&self) -> Result<()> {
        let store_file = StoreFile {
            version: STORE_FILE_VERSION,
            records: self.records.clone(),
        };
        let content = serde_json::to_string_pretty(&store_file).map_err(|source| {
            MonitorError::Json {
                context: "serialize record file".to_string(),
                source,
            }
        })?;

        let parent_dir = self
            .file_path
            .parent()
            .ok_or_else(|| MonitorError::Store("Record file path has no parent".to_string()))?;
        fs::create_dir_all(parent_dir).map_err(|source| MonitorError::Io {
            context: "create record dir".to_string(),
            source,
        })?;
        let mut temp_file = NamedTempFile::new_in(parent_dir).map_err(|source| MonitorError::Io {
            context: "create temp record file".to_string(),
            source,
        })?;
        temp_file
            .write_all(content.as_bytes())
            .map_err(|source| MonitorError::Io {
                context: "write temp record file".to_string(),
                source,
            })?;
        temp_file.flush().map_err(|source| MonitorError::Io {
            context: "flush temp record file".to_string(),
            source,
        })?;
        temp_file
            .persist(&self.file_path)
            .map_err(|err| MonitorError::Io {
                context: format!("persist {}", self.file_path.display()),
                source: err.error,
            })?;
        Ok(())
    }
}

fn read_store_file(file_path: &Path) -> Result<BTreeMap<String, Value>> {
    if !file_path.exists() {
        return Ok(BTreeMap::new());
    }
    let content = fs::read_to_string(file_path).map_err(|source| MonitorError::Io {
        context: "read record file".to_string(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    let store_file: StoreFile =
        serde_json::from_str(&content).map_err(|source| MonitorError::Json {
            context: format!("parse {}", file_path.display()),
            source,
        })?;
    if store_file.version != STORE_FILE_VERSION {
        warn!(
            version = store_file.version,
            expected = STORE_FILE_VERSION,
            "Unsupported record file version, starting empty"
        );
        return Ok(BTreeMap::new());
    }
    Ok(store_file.records)
}

impl RecordStore for JsonFileStore {
    fn load_all(&self) -> Result<BTreeMap<String, Value>> {
        Ok(self.records.clone())
    }

    fn put(&mut self, session_id: &str, record: Value) -> Result<()> {
        self.records.insert(session_id.to_string(), record);
        self.save()
    }

    fn delete(&mut self, session_id: &str) -> Result<()> {
        if self.records.remove(session_id).is_some() {
            self.save()?;
        }
        Ok(())
    }
}
