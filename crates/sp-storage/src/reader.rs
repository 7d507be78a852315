//! Reading batches for upload and deleting them afterwards.
//!
//! A batch handed out by the reader is *checked out*: it is excluded from
//! later reads until it is consumed, discarded or released. Only granted data
//! is ever read for upload.
//!
//! The reader remembers how many bytes it read for each checkout. Consuming
//! a batch removes exactly those bytes, so a record appended after the read
//! stays on disk for the next upload.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use sp_common::PayloadDecoration;
use tracing::{debug, info, warn};

use crate::consent::ConsentAwareFileOrchestrator;
use crate::error::{DeletionReason, StorageError};
use crate::files::{remove_batch_file, remove_consumed_prefix};
use crate::format::{decode_events, RawBatchEvent};
use crate::lock::FileLockRegistry;
use crate::orchestrator::FileOrchestrator;

/// Opaque handle of a checked-out batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId(PathBuf);

impl BatchId {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl From<PathBuf> for BatchId {
    fn from(path: PathBuf) -> Self {
        BatchId(path)
    }
}

impl std::fmt::Display for BatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.file_name() {
            Some(name) => write!(f, "{}", name.to_string_lossy()),
            None => write!(f, "{}", self.0.display()),
        }
    }
}

/// Records of one batch file, in write order.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: BatchId,
    pub events: Vec<RawBatchEvent>,
}

impl Batch {
    /// Upload payload: the records joined by `decoration`. Metadata stays
    /// local.
    pub fn payload(&self, decoration: &PayloadDecoration) -> Vec<u8> {
        decoration.decorate(self.events.iter().map(|e| e.data.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Source of batches for the upload path.
pub trait DataReader: Send + Sync {
    /// Oldest closed batch that is not already checked out.
    fn read_next_batch(&self) -> Option<Batch>;

    /// Delete a successfully uploaded batch. Idempotent.
    fn on_batch_consumed(&self, id: &BatchId);

    /// Delete a batch the server rejected permanently. Idempotent.
    fn discard_batch(&self, id: &BatchId);

    /// Return a batch to the queue without deleting it.
    fn release(&self, id: &BatchId);

    /// Every closed batch not checked out, oldest first.
    fn flushable_batches(&self) -> Vec<BatchId>;

    /// Check out and read a specific batch.
    fn read_batch(&self, id: &BatchId) -> Option<Batch>;

    /// Delete every stored batch in both consent directories.
    fn drop_all(&self);
}

/// Inert reader: never has data.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpDataReader;

impl DataReader for NoOpDataReader {
    fn read_next_batch(&self) -> Option<Batch> {
        None
    }

    fn on_batch_consumed(&self, _id: &BatchId) {}

    fn discard_batch(&self, _id: &BatchId) {}

    fn release(&self, _id: &BatchId) {}

    fn flushable_batches(&self) -> Vec<BatchId> {
        Vec::new()
    }

    fn read_batch(&self, _id: &BatchId) -> Option<Batch> {
        None
    }

    fn drop_all(&self) {}
}

/// Outcome of decoding one file.
enum Loaded {
    /// Decoded events and the number of bytes they were read from.
    Batch(Vec<RawBatchEvent>, u64),
    /// File vanished or was unusable and has been removed.
    Gone,
    /// Transient I/O failure; the file stays.
    Unavailable,
}

/// Checked-out files and the bytes read from each.
#[derive(Default)]
struct Checkouts {
    paths: HashSet<PathBuf>,
    read_len: HashMap<PathBuf, u64>,
}

impl Checkouts {
    fn insert(&mut self, path: PathBuf) -> bool {
        self.paths.insert(path)
    }

    fn set_read_len(&mut self, path: &Path, len: u64) {
        self.read_len.insert(path.to_path_buf(), len);
    }

    fn remove(&mut self, path: &Path) -> Option<u64> {
        let was_checked_out = self.paths.remove(path);
        let len = self.read_len.remove(path);
        if was_checked_out {
            len
        } else {
            None
        }
    }

    fn clear(&mut self) {
        self.paths.clear();
        self.read_len.clear();
    }
}

/// Reader over a consent-aware orchestrator.
pub struct BatchReader {
    orchestrator: Arc<ConsentAwareFileOrchestrator>,
    locks: Arc<FileLockRegistry>,
    checked_out: Mutex<Checkouts>,
}

impl BatchReader {
    pub fn new(orchestrator: Arc<ConsentAwareFileOrchestrator>, locks: Arc<FileLockRegistry>) -> Self {
        BatchReader {
            orchestrator,
            locks,
            checked_out: Mutex::new(Checkouts::default()),
        }
    }

    pub fn checked_out_count(&self) -> usize {
        self.checkouts().paths.len()
    }

    fn checkouts(&self) -> MutexGuard<'_, Checkouts> {
        match self.checked_out.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn load(&self, path: &Path) -> Loaded {
        self.locks.with_lock(path, || {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %path.display(), "batch file vanished before read");
                    return Loaded::Gone;
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read batch file");
                    return Loaded::Unavailable;
                }
            };
            match decode_events(path, &bytes) {
                Ok(decoded) if !decoded.events.is_empty() => {
                    if decoded.truncated_bytes > 0 {
                        warn!(
                            path = %path.display(),
                            truncated_bytes = decoded.truncated_bytes,
                            events = decoded.events.len(),
                            "ignoring incomplete trailing block"
                        );
                    }
                    Loaded::Batch(decoded.events, bytes.len() as u64)
                }
                Ok(_) => {
                    remove_batch_file(path, DeletionReason::Corrupt);
                    Loaded::Gone
                }
                Err(e @ StorageError::CorruptBlock { .. }) => {
                    warn!(path = %path.display(), error = %e, "undecodable batch file");
                    remove_batch_file(path, DeletionReason::Corrupt);
                    Loaded::Gone
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to decode batch file");
                    Loaded::Unavailable
                }
            }
        })
    }

    /// Remove what was read for a checked-out batch. A batch that is not
    /// checked out has nothing to remove, which makes this idempotent.
    fn delete(&self, id: &BatchId, reason: DeletionReason) {
        let path = id.path();
        let mut checked_out = self.checkouts();
        let Some(read_len) = checked_out.remove(path) else {
            debug!(batch = %id, reason = %reason, "batch not checked out, nothing to delete");
            return;
        };
        self.locks
            .with_lock(path, || remove_consumed_prefix(path, read_len, reason));
    }
}

impl DataReader for BatchReader {
    fn read_next_batch(&self) -> Option<Batch> {
        loop {
            let path = {
                let mut checked_out = self.checkouts();
                let path = self.orchestrator.get_readable_file(&checked_out.paths)?;
                checked_out.insert(path.clone());
                path
            };

            match self.load(&path) {
                Loaded::Batch(events, read_len) => {
                    self.checkouts().set_read_len(&path, read_len);
                    debug!(path = %path.display(), events = events.len(), "batch checked out");
                    return Some(Batch {
                        id: BatchId(path),
                        events,
                    });
                }
                Loaded::Gone => {
                    self.checkouts().remove(&path);
                }
                Loaded::Unavailable => {
                    self.checkouts().remove(&path);
                    return None;
                }
            }
        }
    }

    fn on_batch_consumed(&self, id: &BatchId) {
        self.delete(id, DeletionReason::Consumed);
    }

    fn discard_batch(&self, id: &BatchId) {
        self.delete(id, DeletionReason::TerminalUpload);
    }

    fn release(&self, id: &BatchId) {
        self.checkouts().remove(id.path());
    }

    fn flushable_batches(&self) -> Vec<BatchId> {
        let checked_out = self.checkouts();
        self.orchestrator
            .get_flushable_files()
            .into_iter()
            .filter(|f| !checked_out.paths.contains(f))
            .map(BatchId)
            .collect()
    }

    fn read_batch(&self, id: &BatchId) -> Option<Batch> {
        if !self.checkouts().insert(id.0.clone()) {
            debug!(batch = %id, "batch already checked out");
            return None;
        }
        match self.load(id.path()) {
            Loaded::Batch(events, read_len) => {
                self.checkouts().set_read_len(id.path(), read_len);
                Some(Batch {
                    id: id.clone(),
                    events,
                })
            }
            Loaded::Gone | Loaded::Unavailable => {
                self.checkouts().remove(id.path());
                None
            }
        }
    }

    fn drop_all(&self) {
        let mut checked_out = self.checkouts();
        self.orchestrator.forget_active_files();
        let mut deleted = 0usize;
        for file in self.orchestrator.get_all_files_any_consent() {
            if self
                .locks
                .with_lock(&file, || remove_batch_file(&file, DeletionReason::DropAll))
            {
                deleted += 1;
            }
        }
        checked_out.clear();
        info!(deleted, "dropped all stored batches");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::batch_file_name;
    use crate::format::{append_block, encode_event};
    use crate::migrator::NoOpDataMigrator;
    use crate::orchestrator::BatchFileOrchestrator;
    use crate::worker::SequentialWorker;
    use sp_common::{now_millis, ConsentProvider, StorageConfig, TrackingConsent};
    use std::fs;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        _dir: tempfile::TempDir,
        granted_dir: PathBuf,
        pending_dir: PathBuf,
        reader: BatchReader,
    }

    fn fixture(consent: TrackingConsent) -> Fixture {
        let dir = tempdir().unwrap();
        let locks = Arc::new(FileLockRegistry::new());
        let config = StorageConfig::with_root(dir.path().to_path_buf());
        let pending_dir = dir.path().join("r-pending-v1");
        let granted_dir = dir.path().join("r-v1");
        fs::create_dir_all(&pending_dir).unwrap();
        fs::create_dir_all(&granted_dir).unwrap();
        let orchestrator = Arc::new(ConsentAwareFileOrchestrator::new(
            Arc::new(BatchFileOrchestrator::new(pending_dir.clone(), &config, locks.clone())),
            Arc::new(BatchFileOrchestrator::new(granted_dir.clone(), &config, locks.clone())),
            Arc::new(NoOpDataMigrator),
            Arc::new(SequentialWorker::spawn("r-migration", 4).unwrap()),
            &ConsentProvider::new(consent),
            Duration::from_secs(5),
        ));
        Fixture {
            _dir: dir,
            granted_dir,
            pending_dir,
            reader: BatchReader::new(orchestrator, locks),
        }
    }

    /// A closed batch file written `age_secs` ago.
    fn batch_file(dir: &Path, age_secs: u64, records: &[&str]) -> PathBuf {
        let path = dir.join(batch_file_name(now_millis() - age_secs * 1000));
        let mut bytes = Vec::new();
        for record in records {
            bytes.extend(encode_event(&RawBatchEvent::new(record.as_bytes().to_vec())).unwrap());
        }
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn test_reads_oldest_first_and_excludes_checked_out() {
        let f = fixture(TrackingConsent::Granted);
        let older = batch_file(&f.granted_dir, 60, &["a", "b"]);
        let newer = batch_file(&f.granted_dir, 30, &["c"]);

        let first = f.reader.read_next_batch().unwrap();
        assert_eq!(first.id.path(), older);
        assert_eq!(first.payload(&PayloadDecoration::json_array()), b"[a,b]".to_vec());

        let second = f.reader.read_next_batch().unwrap();
        assert_eq!(second.id.path(), newer);
        assert!(f.reader.read_next_batch().is_none());

        f.reader.release(&first.id);
        assert_eq!(f.reader.read_next_batch().unwrap().id, first.id);
    }

    #[test]
    fn test_consume_is_idempotent() {
        let f = fixture(TrackingConsent::Granted);
        let path = batch_file(&f.granted_dir, 60, &["a"]);
        let other = batch_file(&f.granted_dir, 30, &["b"]);

        let batch = f.reader.read_next_batch().unwrap();
        f.reader.on_batch_consumed(&batch.id);
        assert!(!path.exists());
        f.reader.on_batch_consumed(&batch.id);
        assert!(other.exists());
        assert_eq!(f.reader.checked_out_count(), 0);
    }

    #[test]
    fn test_consume_keeps_records_appended_after_read() {
        let f = fixture(TrackingConsent::Granted);
        let path = batch_file(&f.granted_dir, 60, &["a", "b"]);

        let batch = f.reader.read_next_batch().unwrap();
        assert_eq!(batch.len(), 2);
        let late = encode_event(&RawBatchEvent::new(b"late".to_vec())).unwrap();
        let read_len = fs::metadata(&path).unwrap().len();
        append_block(&path, &late, Some(read_len)).unwrap();

        f.reader.on_batch_consumed(&batch.id);
        assert!(path.exists());
        let next = f.reader.read_next_batch().unwrap();
        assert_eq!(next.id.path(), path);
        assert_eq!(next.payload(&PayloadDecoration::json_array()), b"[late]".to_vec());

        f.reader.on_batch_consumed(&next.id);
        assert!(!path.exists());
    }

    #[test]
    fn test_consume_without_checkout_deletes_nothing() {
        let f = fixture(TrackingConsent::Granted);
        let path = batch_file(&f.granted_dir, 60, &["a"]);
        f.reader.on_batch_consumed(&BatchId::from(path.clone()));
        assert!(path.exists());
    }

    #[test]
    fn test_empty_and_corrupt_files_are_removed() {
        let f = fixture(TrackingConsent::Granted);
        let empty = f.granted_dir.join(batch_file_name(now_millis() - 90_000));
        fs::write(&empty, b"").unwrap();
        let corrupt = f.granted_dir.join(batch_file_name(now_millis() - 80_000));
        fs::write(&corrupt, [0xff, 0xff, 0, 0, 0, 1, b'x']).unwrap();
        let good = batch_file(&f.granted_dir, 60, &["ok"]);

        let batch = f.reader.read_next_batch().unwrap();
        assert_eq!(batch.id.path(), good);
        assert!(!empty.exists());
        assert!(!corrupt.exists());
    }

    #[test]
    fn test_pending_data_is_never_read() {
        let f = fixture(TrackingConsent::Pending);
        batch_file(&f.pending_dir, 60, &["private"]);
        assert!(f.reader.read_next_batch().is_none());
        assert!(f.reader.flushable_batches().is_empty());
    }

    #[test]
    fn test_drop_all_clears_both_directories() {
        let f = fixture(TrackingConsent::Pending);
        batch_file(&f.pending_dir, 60, &["p"]);
        batch_file(&f.granted_dir, 60, &["g"]);

        f.reader.drop_all();
        assert_eq!(fs::read_dir(&f.pending_dir).unwrap().count(), 0);
        assert_eq!(fs::read_dir(&f.granted_dir).unwrap().count(), 0);
    }

    #[test]
    fn test_read_batch_checks_out() {
        let f = fixture(TrackingConsent::Granted);
        batch_file(&f.granted_dir, 60, &["a"]);
        let ids = f.reader.flushable_batches();
        assert_eq!(ids.len(), 1);

        let batch = f.reader.read_batch(&ids[0]).unwrap();
        assert_eq!(batch.len(), 1);
        assert!(f.reader.read_batch(&ids[0]).is_none());
        assert!(f.reader.read_next_batch().is_none());
        f.reader.discard_batch(&ids[0]);
        assert!(f.reader.flushable_batches().is_empty());
    }
}
