//! On-disk block framing for batch files.
//!
//! Each record is stored as one or two blocks:
//!
//! ```text
//! +-----------+------------+-----------------+
//! | type: u16 | len: u32   | bytes[len]      |
//! +-----------+------------+-----------------+
//! ```
//!
//! Integers are big-endian. Type `0x0001` carries optional event metadata and
//! is immediately followed by the `0x0000` data block it belongs to. Records
//! are opaque, so framing (rather than separators) keeps arbitrary bytes
//! intact. A partially written trailing block, left by a crash mid-append,
//! is dropped on read.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::warn;

use crate::error::StorageError;

/// Bytes of framing per block.
pub const BLOCK_HEADER_LEN: usize = 6;

const BLOCK_EVENT: u16 = 0x0000;
const BLOCK_METADATA: u16 = 0x0001;

/// One stored record plus its optional metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawBatchEvent {
    pub data: Vec<u8>,
    /// Local-only metadata; never part of the upload payload.
    pub metadata: Vec<u8>,
}

impl RawBatchEvent {
    pub fn new(data: Vec<u8>) -> Self {
        RawBatchEvent {
            data,
            metadata: Vec::new(),
        }
    }

    pub fn with_metadata(mut self, metadata: Vec<u8>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Size of this event once framed.
    pub fn encoded_len(&self) -> usize {
        let meta = if self.metadata.is_empty() {
            0
        } else {
            BLOCK_HEADER_LEN + self.metadata.len()
        };
        meta + BLOCK_HEADER_LEN + self.data.len()
    }
}

/// Frame an event for appending.
pub fn encode_event(event: &RawBatchEvent) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::with_capacity(event.encoded_len());
    if !event.metadata.is_empty() {
        push_block(&mut out, BLOCK_METADATA, &event.metadata)?;
    }
    push_block(&mut out, BLOCK_EVENT, &event.data)?;
    Ok(out)
}

fn push_block(out: &mut Vec<u8>, block_type: u16, bytes: &[u8]) -> Result<(), StorageError> {
    let len = u32::try_from(bytes.len()).map_err(|_| StorageError::ItemTooLarge {
        size: bytes.len() as u64,
        limit: u32::MAX as u64,
    })?;
    out.extend_from_slice(&block_type.to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Result of decoding a batch file's contents.
#[derive(Debug, Default)]
pub struct DecodedBatch {
    pub events: Vec<RawBatchEvent>,
    /// Bytes at the end that did not form a complete block.
    pub truncated_bytes: usize,
}

/// Decode every complete event in `bytes`.
///
/// A torn trailing block is reported through `truncated_bytes`. An unknown
/// block type is corruption: decoding fails and the file should be dropped.
pub fn decode_events(path: &Path, bytes: &[u8]) -> Result<DecodedBatch, StorageError> {
    let mut decoded = DecodedBatch::default();
    let mut pending_metadata: Option<Vec<u8>> = None;
    let mut offset = 0usize;

    while offset < bytes.len() {
        let remaining = bytes.len() - offset;
        if remaining < BLOCK_HEADER_LEN {
            decoded.truncated_bytes = remaining;
            break;
        }
        let block_type = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]);
        let len = u32::from_be_bytes([
            bytes[offset + 2],
            bytes[offset + 3],
            bytes[offset + 4],
            bytes[offset + 5],
        ]) as usize;
        let start = offset + BLOCK_HEADER_LEN;
        if len > bytes.len() - start {
            decoded.truncated_bytes = remaining;
            break;
        }
        let payload = bytes[start..start + len].to_vec();

        match block_type {
            BLOCK_METADATA => pending_metadata = Some(payload),
            BLOCK_EVENT => decoded.events.push(RawBatchEvent {
                data: payload,
                metadata: pending_metadata.take().unwrap_or_default(),
            }),
            other => {
                return Err(StorageError::CorruptBlock {
                    path: path.to_path_buf(),
                    offset,
                    reason: format!("unknown block type {:#06x}", other),
                })
            }
        }
        offset = start + len;
    }

    Ok(decoded)
}

/// Read and decode a batch file.
pub fn read_events(path: &Path) -> Result<Vec<RawBatchEvent>, StorageError> {
    let bytes = fs::read(path)?;
    let decoded = decode_events(path, &bytes)?;
    if decoded.truncated_bytes > 0 {
        warn!(
            path = %path.display(),
            truncated_bytes = decoded.truncated_bytes,
            events = decoded.events.len(),
            "ignoring incomplete trailing block"
        );
    }
    Ok(decoded.events)
}

/// Append already-framed bytes to an existing batch file.
///
/// The file is never created here: a file deleted or migrated concurrently
/// surfaces as `NotFound` instead of being resurrected at its old path.
///
/// When `expected_len` is given and the file is not that long, nothing is
/// written and `UnexpectedLength` is returned. A failed write is cut back to
/// the previous length so no torn block stays in the file. Returns the new
/// file length.
pub fn append_block(
    path: &Path,
    framed: &[u8],
    expected_len: Option<u64>,
) -> Result<u64, StorageError> {
    let mut file = OpenOptions::new().append(true).open(path)?;
    let before = file.metadata()?.len();
    if let Some(expected) = expected_len {
        if before != expected {
            return Err(StorageError::UnexpectedLength {
                path: path.to_path_buf(),
                expected,
                actual: before,
            });
        }
    }

    if let Err(e) = file.write_all(framed).and_then(|()| file.flush()) {
        if let Err(truncate_err) = file.set_len(before) {
            warn!(
                path = %path.display(),
                error = %truncate_err,
                "failed to cut back partial append"
            );
        }
        return Err(e.into());
    }
    Ok(before + framed.len() as u64)
}
