//! Delivery sink: the boundary to the storage layer that owns the record
//! streams, plus the test-mode trace log.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use xxhash_rust::xxh32::xxh32;

use crate::error::{Result, ShuffleError};
use crate::types::{Epoch, Rank};

/// Where received records go. The implementation behind this trait is the
/// external storage layer; it must tolerate concurrent calls from the
/// transport's progress tasks (per-file serialization is the sink's job).
#[async_trait]
pub trait DeliverySink: Send + Sync {
    /// Append `payload` to the record stream at `path`. Failure is fatal to
    /// the shuffle: a dropped record cannot be recovered.
    async fn deliver(&self, path: &str, payload: &[u8], epoch: Epoch) -> Result<()>;
}

/// Appends records to plain files, one per record stream.
#[derive(Debug, Default)]
pub struct FsAppendSink;

#[async_trait]
impl DeliverySink for FsAppendSink {
    async fn deliver(&self, path: &str, payload: &[u8], _epoch: Epoch) -> Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .await
            .map_err(|e| ShuffleError::Delivery {
                path: path.into(),
                reason: format!("open: {e}"),
            })?;
        file.write_all(payload)
            .await
            .map_err(|e| ShuffleError::Delivery {
                path: path.into(),
                reason: format!("write: {e}"),
            })?;
        Ok(())
    }
}

/// One record as a [`MemorySink`] saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedDelivery {
    pub path: String,
    pub payload: Vec<u8>,
    pub epoch: Epoch,
}

/// Records deliveries in memory, in arrival order. For tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    deliveries: Mutex<Vec<RecordedDelivery>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deliveries(&self) -> Vec<RecordedDelivery> {
        self.deliveries.lock().expect("sink lock").clone()
    }

    pub fn len(&self) -> usize {
        self.deliveries.lock().expect("sink lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeliverySink for MemorySink {
    async fn deliver(&self, path: &str, payload: &[u8], epoch: Epoch) -> Result<()> {
        self.deliveries
            .lock()
            .expect("sink lock")
            .push(RecordedDelivery {
                path: path.into(),
                payload: payload.to_vec(),
                epoch,
            });
        Ok(())
    }
}

/// Test-mode trace of every record sent and received, one line each, with
/// an xxh32 payload checksum so runs can be diffed across ranks.
#[derive(Debug)]
pub struct TraceLog {
    file: Mutex<std::fs::File>,
}

impl TraceLog {
    /// Open (append, create) the trace target.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn send(&self, path: &str, payload: &[u8], epoch: Epoch, src: Rank, dst: Rank) {
        self.line(format!(
            "[SEND] {path} {} bytes (e{epoch}) r{src} >> r{dst} (hash={:08x})\n",
            payload.len(),
            xxh32(payload, 0),
        ));
    }

    pub fn recv(&self, path: &str, payload: &[u8], epoch: Epoch, src: Rank, dst: Rank) {
        self.line(format!(
            "[RECV] {path} {} bytes (e{epoch}) r{dst} << r{src} (hash={:08x})\n",
            payload.len(),
            xxh32(payload, 0),
        ));
    }

    fn line(&self, line: String) {
        use std::io::Write;
        // Trace loss must not take the run down with it.
        let _ = self
            .file
            .lock()
            .expect("trace lock")
            .write_all(line.as_bytes());
    }
}
