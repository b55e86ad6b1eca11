//! SQLite persistence for tabwatch-daemon.
//!
//! Holds the durable subset of every session (`monitored`,
//! `completion_history`) so it survives a full restart. Each session is one
//! row whose `record` column is the flat JSON record the registry's
//! persistence bridge produces; validation happens on restore, not here.

use chrono::Utc;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;

use tabwatch_core::{MonitorError, RecordStore};

pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Result<Self, String> {
        let db = Self { path };
        db.init_schema()?;
        Ok(db)
    }

    pub fn upsert_record(&self, session_id: &str, record: &Value) -> Result<(), String> {
        let payload = serde_json::to_string(record)
            .map_err(|err| format!("Failed to serialize session record: {}", err))?;
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO session_records (session_id, record, updated_at) \
                 VALUES (?1, ?2, ?3) \
                 ON CONFLICT(session_id) DO UPDATE SET \
                    record = excluded.record, \
                    updated_at = excluded.updated_at",
                params![session_id, payload, Utc::now().to_rfc3339()],
            )
            .map_err(|err| format!("Failed to upsert session record: {}", err))?;
            Ok(())
        })
    }

    pub fn delete_record(&self, session_id: &str) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute(
                "DELETE FROM session_records WHERE session_id = ?1",
                params![session_id],
            )
            .map_err(|err| format!("Failed to delete session record: {}", err))?;
            Ok(())
        })
    }

    /// Every stored record. Rows whose payload is not JSON are skipped; the
    /// next write for that session replaces them.
    pub fn list_records(&self) -> Result<BTreeMap<String, Value>, String> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare("SELECT session_id, record FROM session_records ORDER BY session_id ASC")
                .map_err(|err| format!("Failed to prepare records query: {}", err))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(|err| format!("Failed to read record rows: {}", err))?;

            let mut records = BTreeMap::new();
            for row in rows {
                let (session_id, payload) =
                    row.map_err(|err| format!("Failed to decode record row: {}", err))?;
                match serde_json::from_str::<Value>(&payload) {
                    Ok(record) => {
                        records.insert(session_id, record);
                    }
                    Err(err) => {
                        tracing::warn!(
                            session_id = %session_id,
                            error = %err,
                            "Skipping unreadable session record"
                        );
                    }
                }
            }
            Ok(records)
        })
    }

    fn init_schema(&self) -> Result<(), String> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS session_records (
                    session_id TEXT PRIMARY KEY,
                    record TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(|err| format!("Failed to initialize schema: {}", err))
        })
    }

    fn with_connection<T>(
        &self,
        op: impl FnOnce(&mut Connection) -> Result<T, String>,
    ) -> Result<T, String> {
        let mut conn = self.open()?;
        op(&mut conn)
    }

    fn open(&self) -> Result<Connection, String> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)
                .map_err(|err| format!("Failed to create daemon data dir: {}", err))?;
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(|err| format!("Failed to open sqlite db: {}", err))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| format!("Failed to enable WAL: {}", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| format!("Failed to set synchronous: {}", err))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(|err| format!("Failed to set busy_timeout: {}", err))?;

        Ok(conn)
    }
}

impl RecordStore for Db {
    fn load_all(&self) -> tabwatch_core::Result<BTreeMap<String, Value>> {
        self.list_records().map_err(MonitorError::Store)
    }

    fn put(&mut self, session_id: &str, record: Value) -> tabwatch_core::Result<()> {
        self.upsert_record(session_id, &record)
            .map_err(MonitorError::Store)
    }

    fn delete(&mut self, session_id: &str) -> tabwatch_core::Result<()> {
        self.delete_record(session_id).map_err(MonitorError::Store)
    }
}
