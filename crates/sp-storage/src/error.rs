//! Storage error types and deletion reasons.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from batch file operations.
///
/// These never reach instrumentation callers: the writer, reader and
/// orchestrators log them and treat the operation as unavailable.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt block in {path} at offset {offset}: {reason}")]
    CorruptBlock {
        path: PathBuf,
        offset: usize,
        reason: String,
    },

    #[error("Item too large: {size} bytes (limit {limit})")]
    ItemTooLarge { size: u64, limit: u64 },

    #[error("Batch file {path} is {actual} bytes, expected {expected}")]
    UnexpectedLength {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
}

impl StorageError {
    /// Whether the error means the file vanished underneath us (migrated,
    /// evicted or dropped concurrently).
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// Why a batch file was deleted. Every deletion is logged with one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionReason {
    /// Uploaded successfully.
    Consumed,
    /// Upload was rejected permanently.
    TerminalUpload,
    /// Directory exceeded its size cap (oldest first).
    SizeCap,
    /// Older than the obsolescence threshold.
    Obsolete,
    /// Consent moved to not granted.
    ConsentWipe,
    /// Explicit clear-all request.
    DropAll,
    /// Empty or undecodable file.
    Corrupt,
}

impl DeletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionReason::Consumed => "consumed",
            DeletionReason::TerminalUpload => "terminal_upload",
            DeletionReason::SizeCap => "size_cap",
            DeletionReason::Obsolete => "obsolete",
            DeletionReason::ConsentWipe => "consent_wipe",
            DeletionReason::DropAll => "drop_all",
            DeletionReason::Corrupt => "corrupt",
        }
    }
}

impl std::fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_detection() {
        let err = StorageError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());
        assert!(!StorageError::UnexpectedLength {
            path: PathBuf::from("/x"),
            expected: 7,
            actual: 11,
        }
        .is_not_found());
        assert!(!StorageError::ItemTooLarge { size: 2, limit: 1 }.is_not_found());
    }

    #[test]
    fn test_deletion_reason_serialization() {
        let json = serde_json::to_string(&DeletionReason::SizeCap).unwrap();
        assert_eq!(json, "\"size_cap\"");
        assert_eq!(DeletionReason::ConsentWipe.to_string(), "consent_wipe");
    }
}
