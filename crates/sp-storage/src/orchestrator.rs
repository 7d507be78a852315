//! Batch file selection within one storage directory.
//!
//! The orchestrator decides which file the writer appends to and which file
//! the reader uploads next. It also enforces the directory's retention:
//!
//! - **Roll-over**: a file stays writable until its size, item count or age
//!   limit is reached; the next write then gets a fresh file.
//! - **Size cap**: while the directory exceeds `max_disk_space`, the oldest
//!   files are deleted first. The newest data is never sacrificed.
//! - **Obsolescence**: files older than `old_file_threshold` are deleted
//!   without upload.
//!
//! Every deletion is logged with its [`DeletionReason`].

use std::collections::HashSet;
use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sp_common::{now_millis, StorageConfig};
use tracing::{debug, warn};

use crate::error::DeletionReason;
use crate::files::{
    batch_age, batch_created_ms, batch_file_name, ensure_dir, file_len,
    list_batch_files_or_empty, remove_batch_file,
};
use crate::lock::FileLockRegistry;

/// Chooses files to write to and read from.
///
/// Absence is never an error: implementations return `None` or an empty list
/// and log whatever went wrong.
pub trait FileOrchestrator: Send + Sync {
    /// File that can take `next_write_size` more bytes, creating one if needed.
    fn get_writable_file(&self, next_write_size: u64) -> Option<PathBuf>;

    /// Oldest closed file not in `excluded`.
    fn get_readable_file(&self, excluded: &HashSet<PathBuf>) -> Option<PathBuf>;

    /// Every batch file, oldest first.
    fn get_all_files(&self) -> Vec<PathBuf>;

    /// Every batch file except one still open for appends, oldest first.
    fn get_flushable_files(&self) -> Vec<PathBuf>;

    fn get_root_dir(&self) -> Option<PathBuf>;

    /// Stop appending to the current file; the next write opens a new one.
    fn forget_active_file(&self);
}

/// Inert orchestrator: stores nothing, reads nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpFileOrchestrator;

impl FileOrchestrator for NoOpFileOrchestrator {
    fn get_writable_file(&self, _next_write_size: u64) -> Option<PathBuf> {
        None
    }

    fn get_readable_file(&self, _excluded: &HashSet<PathBuf>) -> Option<PathBuf> {
        None
    }

    fn get_all_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn get_flushable_files(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn get_root_dir(&self) -> Option<PathBuf> {
        None
    }

    fn forget_active_file(&self) {}
}

/// Limits applied by a [`BatchFileOrchestrator`].
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorLimits {
    pub max_batch_size: u64,
    pub max_items_per_batch: usize,
    pub recent_delay: Duration,
    pub old_file_threshold: Duration,
    pub max_disk_space: u64,
}

impl From<&StorageConfig> for OrchestratorLimits {
    fn from(config: &StorageConfig) -> Self {
        OrchestratorLimits {
            max_batch_size: config.max_batch_size,
            max_items_per_batch: config.max_items_per_batch,
            recent_delay: config.recent_delay(),
            old_file_threshold: config.old_file_threshold(),
            max_disk_space: config.max_disk_space,
        }
    }
}

/// The file currently handed out for appends.
#[derive(Debug, Clone)]
struct ActiveFile {
    path: PathBuf,
    created_ms: u64,
    items: usize,
}

/// Snapshot of a directory's usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryStatus {
    pub root_dir: String,
    pub file_count: usize,
    pub total_bytes: u64,
    pub max_disk_space: u64,
    pub budget_used_pct: f64,
    pub oldest_file_age_ms: Option<u64>,
    pub newest_file_age_ms: Option<u64>,
    pub active_file: Option<String>,
}

/// Orchestrator for one directory of batch files.
pub struct BatchFileOrchestrator {
    root_dir: PathBuf,
    limits: OrchestratorLimits,
    locks: Arc<FileLockRegistry>,
    active: Mutex<Option<ActiveFile>>,
}

impl BatchFileOrchestrator {
    /// Create an orchestrator over `root_dir`. The directory is created lazily.
    pub fn new(root_dir: PathBuf, config: &StorageConfig, locks: Arc<FileLockRegistry>) -> Self {
        Self::with_limits(root_dir, OrchestratorLimits::from(config), locks)
    }

    pub fn with_limits(
        root_dir: PathBuf,
        limits: OrchestratorLimits,
        locks: Arc<FileLockRegistry>,
    ) -> Self {
        BatchFileOrchestrator {
            root_dir,
            limits,
            locks,
            active: Mutex::new(None),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn limits(&self) -> &OrchestratorLimits {
        &self.limits
    }

    /// Current usage of the directory.
    pub fn status(&self) -> DirectoryStatus {
        let now = now_millis();
        let files = list_batch_files_or_empty(&self.root_dir);
        let total_bytes: u64 = files.iter().map(|f| file_len(f)).sum();
        let ages: Vec<u64> = files
            .iter()
            .filter_map(|f| batch_age(f, now))
            .map(|age| age.as_millis() as u64)
            .collect();
        let budget_used_pct = if self.limits.max_disk_space > 0 {
            (total_bytes as f64 / self.limits.max_disk_space as f64) * 100.0
        } else {
            0.0
        };

        DirectoryStatus {
            root_dir: self.root_dir.display().to_string(),
            file_count: files.len(),
            total_bytes,
            max_disk_space: self.limits.max_disk_space,
            budget_used_pct,
            oldest_file_age_ms: ages.iter().copied().max(),
            newest_file_age_ms: ages.iter().copied().min(),
            active_file: self
                .active_state()
                .as_ref()
                .map(|a| a.path.display().to_string()),
        }
    }

    fn active_state(&self) -> MutexGuard<'_, Option<ActiveFile>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_still_writable(&self, active: &ActiveFile, now: u64) -> bool {
        let age = Duration::from_millis(now.saturating_sub(active.created_ms));
        age < self.limits.recent_delay && active.path.exists()
    }

    /// Path of the active file while it can still receive appends.
    fn writable_active_path(&self, now: u64) -> Option<PathBuf> {
        self.active_state()
            .as_ref()
            .filter(|a| self.is_still_writable(a, now))
            .map(|a| a.path.clone())
    }

    fn can_reuse(&self, active: &ActiveFile, next_write_size: u64, now: u64) -> bool {
        self.is_still_writable(active, now)
            && active.items < self.limits.max_items_per_batch
            && file_len(&active.path) + next_write_size <= self.limits.max_batch_size
    }

    /// Delete files past the obsolescence threshold, returning the rest.
    fn delete_obsolete_files(&self, files: Vec<PathBuf>, now: u64) -> Vec<PathBuf> {
        let mut kept = Vec::with_capacity(files.len());
        for file in files {
            let obsolete = batch_age(&file, now)
                .map(|age| age > self.limits.old_file_threshold)
                .unwrap_or(false);
            if obsolete {
                self.locks
                    .with_lock(&file, || remove_batch_file(&file, DeletionReason::Obsolete));
            } else {
                kept.push(file);
            }
        }
        kept
    }

    /// Delete oldest files until the directory plus `incoming` bytes fits the
    /// cap. `keep` is never deleted.
    fn free_space_if_needed(&self, files: &[PathBuf], keep: &Path, incoming: u64) {
        let sizes: Vec<(PathBuf, u64)> = files.iter().map(|f| (f.clone(), file_len(f))).collect();
        let mut total: u64 = sizes.iter().map(|(_, size)| size).sum::<u64>() + incoming;
        if total <= self.limits.max_disk_space {
            return;
        }
        debug!(
            dir = %self.root_dir.display(),
            used_bytes = total,
            budget_bytes = self.limits.max_disk_space,
            "directory over size cap, evicting oldest files"
        );

        for (file, size) in sizes {
            if total <= self.limits.max_disk_space {
                break;
            }
            if file == keep {
                continue;
            }
            if self
                .locks
                .with_lock(&file, || remove_batch_file(&file, DeletionReason::SizeCap))
            {
                total = total.saturating_sub(size);
            }
        }

        if total > self.limits.max_disk_space {
            warn!(
                dir = %self.root_dir.display(),
                used_bytes = total,
                budget_bytes = self.limits.max_disk_space,
                "directory still over size cap after eviction"
            );
        }
    }

    /// Create a new empty batch file named after now, strictly newer than
    /// every existing file.
    fn create_new_file(
        &self,
        files: &[PathBuf],
        active: Option<&ActiveFile>,
        now: u64,
    ) -> io::Result<ActiveFile> {
        let newest_existing = files.iter().filter_map(|f| batch_created_ms(f)).max();
        let newest_active = active.map(|a| a.created_ms);
        let floor = newest_existing
            .into_iter()
            .chain(newest_active)
            .max()
            .map(|ms| ms + 1)
            .unwrap_or(0);
        let mut created_ms = now.max(floor);

        loop {
            let path = self.root_dir.join(batch_file_name(created_ms));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(_) => {
                    debug!(path = %path.display(), "created batch file");
                    return Ok(ActiveFile {
                        path,
                        created_ms,
                        items: 0,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => created_ms += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

impl FileOrchestrator for BatchFileOrchestrator {
    fn get_writable_file(&self, next_write_size: u64) -> Option<PathBuf> {
        if next_write_size > self.limits.max_batch_size {
            warn!(
                size = next_write_size,
                limit = self.limits.max_batch_size,
                "write larger than a batch file, dropping"
            );
            return None;
        }
        if !ensure_dir(&self.root_dir) {
            return None;
        }

        let now = now_millis();
        let files = self.delete_obsolete_files(list_batch_files_or_empty(&self.root_dir), now);

        let mut active = self.active_state();
        let reusable = active
            .as_ref()
            .filter(|a| self.can_reuse(a, next_write_size, now))
            .is_some();

        if !reusable {
            match self.create_new_file(&files, active.as_ref(), now) {
                Ok(file) => *active = Some(file),
                Err(e) => {
                    warn!(dir = %self.root_dir.display(), error = %e, "failed to create batch file");
                    return None;
                }
            }
        }

        let current = active.as_mut()?;
        current.items += 1;
        let path = current.path.clone();
        drop(active);

        self.free_space_if_needed(&files, &path, next_write_size);
        Some(path)
    }

    fn get_readable_file(&self, excluded: &HashSet<PathBuf>) -> Option<PathBuf> {
        let now = now_millis();
        let files = self.delete_obsolete_files(list_batch_files_or_empty(&self.root_dir), now);
        let writable = self.writable_active_path(now);

        files.into_iter().find(|file| {
            !excluded.contains(file)
                && writable.as_ref() != Some(file)
                && batch_age(file, now)
                    .map(|age| age >= self.limits.recent_delay)
                    .unwrap_or(false)
        })
    }

    fn get_all_files(&self) -> Vec<PathBuf> {
        list_batch_files_or_empty(&self.root_dir)
    }

    fn get_flushable_files(&self) -> Vec<PathBuf> {
        let writable = self.writable_active_path(now_millis());
        list_batch_files_or_empty(&self.root_dir)
            .into_iter()
            .filter(|file| writable.as_ref() != Some(file))
            .collect()
    }

    fn get_root_dir(&self) -> Option<PathBuf> {
        Some(self.root_dir.clone())
    }

    fn forget_active_file(&self) {
        *self.active_state() = None;
    }
}
