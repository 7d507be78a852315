//! Batched writer: serializes records and appends them to batch files.
//!
//! Writes never run on the caller's thread. Every `write` call becomes one
//! task on the writer's [`SequentialWorker`], so records land on disk in
//! submission order and file selection never races. When the queue is full
//! the incoming write is dropped and logged; producers never block.

use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::error::StorageError;
use crate::format::{append_block, encode_event, RawBatchEvent};
use crate::lock::FileLockRegistry;
use crate::orchestrator::FileOrchestrator;
use crate::worker::SequentialWorker;

/// Turns a record into bytes. `None` drops the record.
pub trait Serializer<T>: Send + Sync {
    fn serialize(&self, record: &T) -> Option<Vec<u8>>;
}

/// Serializer for records that are already bytes or text.
#[derive(Debug, Default, Clone, Copy)]
pub struct BytesSerializer;

impl Serializer<Vec<u8>> for BytesSerializer {
    fn serialize(&self, record: &Vec<u8>) -> Option<Vec<u8>> {
        Some(record.clone())
    }
}

impl Serializer<String> for BytesSerializer {
    fn serialize(&self, record: &String) -> Option<Vec<u8>> {
        Some(record.as_bytes().to_vec())
    }
}

/// Serializer for any `serde::Serialize` record, one JSON document each.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl<T: Serialize> Serializer<T> for JsonSerializer {
    fn serialize(&self, record: &T) -> Option<Vec<u8>> {
        match serde_json::to_vec(record) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!(error = %e, "failed to serialize record");
                None
            }
        }
    }
}

/// Accepts records for persistence.
pub trait DataWriter<T>: Send + Sync {
    fn write(&self, record: T);

    fn write_all(&self, records: Vec<T>);
}

/// Inert writer: drops everything.
#[derive(Debug)]
pub struct NoOpDataWriter<T>(PhantomData<fn(T)>);

impl<T> Default for NoOpDataWriter<T> {
    fn default() -> Self {
        NoOpDataWriter(PhantomData)
    }
}

impl<T> DataWriter<T> for NoOpDataWriter<T> {
    fn write(&self, _record: T) {}

    fn write_all(&self, _records: Vec<T>) {}
}

/// Counters kept by a [`BatchWriter`].
#[derive(Debug, Default)]
pub struct WriterStats {
    written: AtomicU64,
    bytes_written: AtomicU64,
    dropped_queue_full: AtomicU64,
    dropped_serialization: AtomicU64,
    dropped_too_large: AtomicU64,
    dropped_unavailable: AtomicU64,
    dropped_io: AtomicU64,
}

/// Point-in-time copy of [`WriterStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterStatsSnapshot {
    pub written: u64,
    pub bytes_written: u64,
    pub dropped_queue_full: u64,
    pub dropped_serialization: u64,
    pub dropped_too_large: u64,
    /// No writable file (consent not granted, directory unusable).
    pub dropped_unavailable: u64,
    pub dropped_io: u64,
}

impl WriterStatsSnapshot {
    pub fn dropped(&self) -> u64 {
        self.dropped_queue_full
            + self.dropped_serialization
            + self.dropped_too_large
            + self.dropped_unavailable
            + self.dropped_io
    }
}

impl WriterStats {
    pub fn snapshot(&self) -> WriterStatsSnapshot {
        WriterStatsSnapshot {
            written: self.written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            dropped_queue_full: self.dropped_queue_full.load(Ordering::Relaxed),
            dropped_serialization: self.dropped_serialization.load(Ordering::Relaxed),
            dropped_too_large: self.dropped_too_large.load(Ordering::Relaxed),
            dropped_unavailable: self.dropped_unavailable.load(Ordering::Relaxed),
            dropped_io: self.dropped_io.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }
}

/// File selections per record: the first pick plus two re-selections after
/// the file vanished or changed underneath the writer.
const MAX_APPEND_ATTEMPTS: u32 = 3;

struct WriterCore<T> {
    orchestrator: Arc<dyn FileOrchestrator>,
    serializer: Arc<dyn Serializer<T>>,
    locks: Arc<FileLockRegistry>,
    max_item_size: u64,
    stats: Arc<WriterStats>,
    /// Last file appended to and its length right after that append.
    tail: Mutex<Option<(PathBuf, u64)>>,
}

impl<T> WriterCore<T> {
    fn write_records(&self, records: Vec<T>) {
        for record in records {
            let Some(data) = self.serializer.serialize(&record) else {
                WriterStats::bump(&self.stats.dropped_serialization, 1);
                warn!("record could not be serialized, dropping");
                continue;
            };
            if data.len() as u64 > self.max_item_size {
                WriterStats::bump(&self.stats.dropped_too_large, 1);
                warn!(
                    size = data.len(),
                    limit = self.max_item_size,
                    "record exceeds max item size, dropping"
                );
                continue;
            }
            let framed = match encode_event(&RawBatchEvent::new(data)) {
                Ok(framed) => framed,
                Err(e) => {
                    WriterStats::bump(&self.stats.dropped_too_large, 1);
                    warn!(error = %e, "record could not be framed, dropping");
                    continue;
                }
            };
            self.append(&framed);
        }
    }

    /// Append one framed record.
    ///
    /// A file that vanished between selection and append (migrated, evicted,
    /// uploaded) is selected again. A file whose length differs from what
    /// this writer left behind is closed, so records never follow bytes the
    /// writer did not produce. After an I/O failure the active file is closed
    /// as well.
    fn append(&self, framed: &[u8]) {
        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let Some(path) = self.orchestrator.get_writable_file(framed.len() as u64) else {
                WriterStats::bump(&self.stats.dropped_unavailable, 1);
                debug!(bytes = framed.len(), "no writable file, dropping record");
                return;
            };

            let expected = self.expected_len(&path);
            let retry = attempt < MAX_APPEND_ATTEMPTS;
            match self
                .locks
                .with_lock(&path, || append_block(&path, framed, expected))
            {
                Ok(len) => {
                    *self.lock_tail() = Some((path.clone(), len));
                    WriterStats::bump(&self.stats.written, 1);
                    WriterStats::bump(&self.stats.bytes_written, framed.len() as u64);
                    trace!(path = %path.display(), bytes = framed.len(), "record appended");
                    return;
                }
                Err(e) if e.is_not_found() && retry => {
                    *self.lock_tail() = None;
                    debug!(path = %path.display(), "batch file vanished before append, reselecting");
                }
                Err(e @ StorageError::UnexpectedLength { .. }) if retry => {
                    *self.lock_tail() = None;
                    self.orchestrator.forget_active_file();
                    warn!(path = %path.display(), error = %e, "batch file changed outside the writer, closing it");
                }
                Err(e) => {
                    *self.lock_tail() = None;
                    self.orchestrator.forget_active_file();
                    WriterStats::bump(&self.stats.dropped_io, 1);
                    warn!(path = %path.display(), error = %e, "failed to append record, dropping");
                    return;
                }
            }
        }
    }

    fn expected_len(&self, path: &Path) -> Option<u64> {
        match self.lock_tail().as_ref() {
            Some((tail_path, len)) if tail_path == path => Some(*len),
            _ => None,
        }
    }

    fn lock_tail(&self) -> MutexGuard<'_, Option<(PathBuf, u64)>> {
        match self.tail.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Writer persisting records through an orchestrator on a sequential worker.
pub struct BatchWriter<T> {
    core: Arc<WriterCore<T>>,
    worker: Arc<SequentialWorker>,
}

impl<T: Send + 'static> BatchWriter<T> {
    pub fn new<S>(
        orchestrator: Arc<dyn FileOrchestrator>,
        serializer: Arc<S>,
        locks: Arc<FileLockRegistry>,
        worker: Arc<SequentialWorker>,
        max_item_size: u64,
    ) -> Self
    where
        S: Serializer<T> + 'static,
    {
        let serializer: Arc<dyn Serializer<T>> = serializer;
        BatchWriter {
            core: Arc::new(WriterCore {
                orchestrator,
                serializer,
                locks,
                max_item_size,
                stats: Arc::new(WriterStats::default()),
                tail: Mutex::new(None),
            }),
            worker,
        }
    }

    pub fn stats(&self) -> WriterStatsSnapshot {
        self.core.stats.snapshot()
    }

    /// Wait until every write submitted so far has reached the disk.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.worker.wait_idle(timeout)
    }

    fn submit(&self, records: Vec<T>) {
        if records.is_empty() {
            return;
        }
        let count = records.len() as u64;
        let core = self.core.clone();
        if let Err(e) = self.worker.submit(move || core.write_records(records)) {
            WriterStats::bump(&self.core.stats.dropped_queue_full, count);
            warn!(worker = %self.worker.name(), records = count, error = %e, "write dropped");
        }
    }
}

impl<T: Send + 'static> DataWriter<T> for BatchWriter<T> {
    fn write(&self, record: T) {
        self.submit(vec![record]);
    }

    fn write_all(&self, records: Vec<T>) {
        self.submit(records);
    }
}
