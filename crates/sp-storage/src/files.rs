//! Batch file naming, listing and deletion helpers.
//!
//! A batch file is named by its creation time in epoch milliseconds,
//! zero-padded so that lexicographic order equals creation order:
//! `00000001736950000000`. Anything else in a directory is ignored.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::DeletionReason;

/// Width of a batch file name.
pub const BATCH_NAME_WIDTH: usize = 20;

/// Attempts for a single move/delete before the file is skipped.
pub const MAX_FILE_OP_ATTEMPTS: u32 = 3;

/// Pause between attempts.
pub const FILE_OP_RETRY_PAUSE: Duration = Duration::from_millis(25);

/// File name for a batch created at `created_ms`.
pub fn batch_file_name(created_ms: u64) -> String {
    format!("{:0width$}", created_ms, width = BATCH_NAME_WIDTH)
}

/// Creation time encoded in a batch file name, if it is one.
pub fn batch_created_ms(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    if name.len() != BATCH_NAME_WIDTH || !name.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    name.parse().ok()
}

/// Age of a batch file relative to `now_ms`, from its name.
pub fn batch_age(path: &Path, now_ms: u64) -> Option<Duration> {
    batch_created_ms(path).map(|created| Duration::from_millis(now_ms.saturating_sub(created)))
}

/// List batch files in `dir`, oldest first.
pub fn list_batch_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if batch_created_ms(&path).is_some() && entry.file_type()?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Like [`list_batch_files`] but a missing or unreadable directory is empty.
pub fn list_batch_files_or_empty(dir: &Path) -> Vec<PathBuf> {
    match list_batch_files(dir) {
        Ok(files) => files,
        Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to list batch files");
            Vec::new()
        }
    }
}

/// Size of a file, 0 when it cannot be read.
pub fn file_len(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

/// Delete a batch file, logging the reason.
///
/// The caller is responsible for holding the file's lock. Returns `true` when
/// the file was removed by this call; a file that is already gone is not an
/// error.
pub fn remove_batch_file(path: &Path, reason: DeletionReason) -> bool {
    let size = file_len(path);
    let removed = retry_file_op("delete", path, || fs::remove_file(path));
    match removed {
        Ok(true) => {
            info!(path = %path.display(), bytes = size, reason = %reason, "deleted batch file");
            true
        }
        Ok(false) => {
            debug!(path = %path.display(), reason = %reason, "batch file already gone");
            false
        }
        Err(e) => {
            warn!(path = %path.display(), reason = %reason, error = %e, "failed to delete batch file");
            false
        }
    }
}

/// Remove the first `consumed_len` bytes of a batch file.
///
/// Deletes the file when nothing was appended after those bytes were read.
/// Otherwise the records appended since are kept: the tail is written to a
/// sibling temp file that then replaces the batch file. The caller holds the
/// file's lock. Returns `true` when the consumed bytes are gone from disk.
pub fn remove_consumed_prefix(path: &Path, consumed_len: u64, reason: DeletionReason) -> bool {
    if file_len(path) <= consumed_len {
        return remove_batch_file(path, reason) || !path.exists();
    }

    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(path = %path.display(), reason = %reason, error = %e, "failed to read batch file for trimming");
            return false;
        }
    };
    let start = usize::try_from(consumed_len).unwrap_or(bytes.len()).min(bytes.len());
    let tail = &bytes[start..];
    let tmp = path.with_extension("trim");
    let replaced = fs::write(&tmp, tail).and_then(|()| fs::rename(&tmp, path));
    match replaced {
        Ok(()) => {
            info!(
                path = %path.display(),
                removed_bytes = start,
                kept_bytes = tail.len(),
                reason = %reason,
                "trimmed batch file, kept records appended after read"
            );
            true
        }
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            warn!(path = %path.display(), reason = %reason, error = %e, "failed to trim batch file");
            false
        }
    }
}

/// Run a file operation with bounded retries.
///
/// `Ok(true)` when it succeeded, `Ok(false)` when the file did not exist,
/// `Err` with the last error once attempts are exhausted.
pub fn retry_file_op<F>(op: &str, path: &Path, mut f: F) -> io::Result<bool>
where
    F: FnMut() -> io::Result<()>,
{
    let mut attempt = 1;
    loop {
        match f() {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) if attempt >= MAX_FILE_OP_ATTEMPTS => return Err(e),
            Err(e) => {
                debug!(op, path = %path.display(), attempt, error = %e, "file operation failed, retrying");
                attempt += 1;
                thread::sleep(FILE_OP_RETRY_PAUSE);
            }
        }
    }
}

/// Create the directory (and parents) if needed. Returns whether it exists.
pub fn ensure_dir(dir: &Path) -> bool {
    if dir.is_dir() {
        return true;
    }
    match fs::create_dir_all(dir) {
        Ok(()) => true,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "failed to create storage directory");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_remove_consumed_prefix_keeps_later_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(batch_file_name(1_000));
        fs::write(&path, b"readappended").unwrap();

        assert!(remove_consumed_prefix(&path, 4, DeletionReason::Consumed));
        assert_eq!(fs::read(&path).unwrap(), b"appended");
        assert_eq!(list_batch_files(dir.path()).unwrap(), vec![path.clone()]);

        assert!(remove_consumed_prefix(&path, 8, DeletionReason::Consumed));
        assert!(!path.exists());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_batch_name_round_trip_and_order() {
        let a = batch_file_name(999);
        let b = batch_file_name(1_736_950_000_000);
        assert_eq!(a.len(), BATCH_NAME_WIDTH);
        assert!(a < b, "lexicographic order must follow creation time");
        assert_eq!(batch_created_ms(Path::new(&b)), Some(1_736_950_000_000));
    }

    #[test]
    fn test_non_batch_names_ignored() {
        assert_eq!(batch_created_ms(Path::new("/tmp/notes.txt")), None);
        assert_eq!(batch_created_ms(Path::new("/tmp/123")), None);
        assert_eq!(
            batch_created_ms(Path::new("/tmp/0000000000000000000x")),
            None
        );
    }

    #[test]
    fn test_list_sorted_and_filtered() {
        let dir = tempdir().unwrap();
        for ms in [30u64, 10, 20] {
            fs::write(dir.path().join(batch_file_name(ms)), b"x").unwrap();
        }
        fs::write(dir.path().join("README"), b"ignored").unwrap();
        fs::create_dir(dir.path().join(batch_file_name(40))).unwrap();

        let files = list_batch_files(dir.path()).unwrap();
        let times: Vec<_> = files.iter().filter_map(|p| batch_created_ms(p)).collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn test_missing_dir_lists_empty() {
        let dir = tempdir().unwrap();
        assert!(list_batch_files_or_empty(&dir.path().join("nope")).is_empty());
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(batch_file_name(1));
        fs::write(&path, b"abc").unwrap();
        assert!(remove_batch_file(&path, DeletionReason::Consumed));
        assert!(!remove_batch_file(&path, DeletionReason::Consumed));
    }

    #[test]
    fn test_retry_gives_up_after_bounded_attempts() {
        let mut calls = 0;
        let result = retry_file_op("test", Path::new("/x"), || {
            calls += 1;
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "nope"))
        });
        assert!(result.is_err());
        assert_eq!(calls, MAX_FILE_OP_ATTEMPTS);
    }
}
