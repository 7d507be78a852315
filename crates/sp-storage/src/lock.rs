//! Per-file exclusive access.
//!
//! The writer, reader, orchestrators and migrator all touch batch files from
//! different threads. Every mutation or read of one physical file goes through
//! [`FileLockRegistry::with_lock`], so appends never interleave with a move,
//! delete or read of the same path. Locks on different paths are independent.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

/// Registry of one mutex per path, created on demand and released when idle.
#[derive(Debug, Default)]
pub struct FileLockRegistry {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl FileLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the exclusive lock for `path`.
    ///
    /// Not reentrant: `f` must not lock the same path again.
    pub fn with_lock<R, F>(&self, path: &Path, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let lock = {
            let mut locks = self.registry();
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let result = {
            let _guard = match lock.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            f()
        };

        let mut locks = self.registry();
        // Map entry + our clone: nobody else is waiting on this path.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(path);
        }
        result
    }

    /// Number of paths with a live lock entry.
    pub fn tracked_paths(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<PathBuf, Arc<Mutex<()>>>> {
        match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
