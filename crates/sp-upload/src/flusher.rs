//! Synchronous drain of every closed batch, bypassing the scheduler.
//!
//! Used for best-effort delivery before teardown. Batches are checked out
//! one at a time, so a flush running next to the scheduler never uploads
//! the same batch twice, and no lock is held while the uploader runs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sp_common::PayloadDecoration;
use sp_storage::DataReader;
use tracing::{debug, info, warn};

use crate::uploader::{UploadOutcome, Uploader};

/// Counts from one flush.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub uploaded: usize,
    pub discarded: usize,
    /// Kept on disk after a retryable failure.
    pub kept: usize,
    /// Vanished or unreadable before upload.
    pub skipped: usize,
}

pub struct Flusher {
    reader: Arc<dyn DataReader>,
    decoration: PayloadDecoration,
}

impl Flusher {
    pub fn new(reader: Arc<dyn DataReader>, decoration: PayloadDecoration) -> Self {
        Flusher { reader, decoration }
    }

    /// Upload every flushable batch once, oldest first.
    pub fn flush(&self, uploader: &dyn Uploader) -> FlushReport {
        let mut report = FlushReport::default();
        for id in self.reader.flushable_batches() {
            let Some(batch) = self.reader.read_batch(&id) else {
                report.skipped += 1;
                continue;
            };
            let status = uploader.upload(&batch.payload(&self.decoration));
            match status.outcome() {
                UploadOutcome::Success => {
                    debug!(batch = %id, events = batch.len(), "batch flushed");
                    self.reader.on_batch_consumed(&id);
                    report.uploaded += 1;
                }
                UploadOutcome::TerminalFailure => {
                    warn!(batch = %id, status = %status, "flushed batch rejected, discarding");
                    self.reader.discard_batch(&id);
                    report.discarded += 1;
                }
                UploadOutcome::Retry => {
                    debug!(batch = %id, status = %status, "flush upload failed, keeping batch");
                    self.reader.release(&id);
                    report.kept += 1;
                }
            }
        }
        info!(
            uploaded = report.uploaded,
            discarded = report.discarded,
            kept = report.kept,
            skipped = report.skipped,
            "flush finished"
        );
        report
    }
}
