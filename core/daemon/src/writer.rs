//! Background writer for record stores.
//!
//! The registry actor must never wait on disk. [`QueuedStore`] moves a store
//! onto a dedicated thread and forwards writes to it over a channel; `put`
//! and `delete` return as soon as the operation is queued. Operations are
//! applied in the order they were queued, so a later `load_all` observes
//! every earlier write. Dropping the store closes the queue and joins the
//! thread, so nothing queued is lost on shutdown.

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;
use tracing::warn;

use tabwatch_core::{MonitorError, RecordStore};

enum StoreOp {
    Put(String, Value),
    Delete(String),
    LoadAll(mpsc::Sender<tabwatch_core::Result<BTreeMap<String, Value>>>),
    Flush(mpsc::Sender<tabwatch_core::Result<()>>),
}

pub struct QueuedStore {
    label: &'static str,
    ops: Option<mpsc::Sender<StoreOp>>,
    writer: Option<thread::JoinHandle<()>>,
}

impl QueuedStore {
    /// Spawns the writer thread. It exits once the store is dropped and the
    /// queue has drained.
    pub fn spawn(label: &'static str, mut store: Box<dyn RecordStore>) -> Result<Self, String> {
        let (ops, queue) = mpsc::channel::<StoreOp>();
        let writer = thread::Builder::new()
            .name(format!("tabwatch-{}-writer", label))
            .spawn(move || {
                for op in queue {
                    match op {
                        StoreOp::Put(session_id, record) => {
                            if let Err(err) = store.put(&session_id, record) {
                                warn!(store = label, session_id = %session_id, error = %err, "Queued write failed");
                            }
                        }
                        StoreOp::Delete(session_id) => {
                            if let Err(err) = store.delete(&session_id) {
                                warn!(store = label, session_id = %session_id, error = %err, "Queued delete failed");
                            }
                        }
                        StoreOp::LoadAll(reply) => {
                            let _ = reply.send(store.load_all());
                        }
                        StoreOp::Flush(reply) => {
                            let _ = reply.send(store.flush());
                        }
                    }
                }
            })
            .map_err(|err| format!("Failed to spawn {} writer thread: {}", label, err))?;
        Ok(Self {
            label,
            ops: Some(ops),
            writer: Some(writer),
        })
    }

    fn enqueue(&self, op: StoreOp) -> tabwatch_core::Result<()> {
        self.ops
            .as_ref()
            .ok_or_else(|| self.stopped())?
            .send(op)
            .map_err(|_| self.stopped())
    }

    fn stopped(&self) -> MonitorError {
        MonitorError::Store(format!("{} writer thread has stopped", self.label))
    }
}

impl Drop for QueuedStore {
    fn drop(&mut self) {
        // Closing the sender ends the writer loop once the queue drains.
        self.ops.take();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(store = self.label, "Writer thread panicked; queued writes may be lost");
            }
        }
    }
}

impl RecordStore for QueuedStore {
    /// Blocks until the writer has applied everything queued before it.
    /// Only used at startup, before any detector runs.
    fn load_all(&self) -> tabwatch_core::Result<BTreeMap<String, Value>> {
        let (reply, response) = mpsc::channel();
        self.enqueue(StoreOp::LoadAll(reply))?;
        response.recv().map_err(|_| self.stopped())?
    }

    fn put(&mut self, session_id: &str, record: Value) -> tabwatch_core::Result<()> {
        self.enqueue(StoreOp::Put(session_id.to_string(), record))
    }

    fn delete(&mut self, session_id: &str) -> tabwatch_core::Result<()> {
        self.enqueue(StoreOp::Delete(session_id.to_string()))
    }

    /// Blocks until every earlier write has been applied.
    fn flush(&mut self) -> tabwatch_core::Result<()> {
        let (reply, response) = mpsc::channel();
        self.enqueue(StoreOp::Flush(reply))?;
        response.recv().map_err(|_| self.stopped())?
    }
}
