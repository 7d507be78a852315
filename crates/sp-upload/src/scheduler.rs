//! Periodic upload of stored batches.
//!
//! One [`UploadCycle`] is the testable core: read the oldest batch, check the
//! precondition, upload, act on the outcome and compute the next delay.
//! [`UploadScheduler`] runs cycles on a dedicated thread, one at a time.
//!
//! ```text
//! Idle → Checking → Uploading → Idle
//!          │ no batch / not ready
//!          └──────────────────────→ Idle
//! ```

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sp_common::PayloadDecoration;
use sp_storage::DataReader;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::delay::DelayPolicy;
use crate::precondition::UploadPrecondition;
use crate::uploader::{UploadOutcome, UploadStatus, Uploader};

/// Errors from starting the scheduler.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("failed to spawn upload thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Where the upload loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadState {
    Idle,
    Checking,
    Uploading,
}

impl UploadState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => UploadState::Checking,
            2 => UploadState::Uploading,
            _ => UploadState::Idle,
        }
    }
}

/// What one cycle did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing to upload; no network work.
    NoBatch,
    /// The precondition was unmet; the batch stays for a later cycle.
    NotReady,
    Uploaded {
        batch: String,
        status: UploadStatus,
        outcome: UploadOutcome,
    },
}

/// Outcome of a cycle and the delay before the next one.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub outcome: CycleOutcome,
    pub next_delay: Duration,
}

/// One upload attempt per call, carrying the adaptive delay across calls.
pub struct UploadCycle {
    reader: Arc<dyn DataReader>,
    uploader: Arc<dyn Uploader>,
    precondition: Arc<dyn UploadPrecondition>,
    decoration: PayloadDecoration,
    delay: DelayPolicy,
    state: Arc<AtomicU8>,
}

impl UploadCycle {
    pub fn new(
        reader: Arc<dyn DataReader>,
        uploader: Arc<dyn Uploader>,
        precondition: Arc<dyn UploadPrecondition>,
        decoration: PayloadDecoration,
        delay: DelayPolicy,
    ) -> Self {
        UploadCycle {
            reader,
            uploader,
            precondition,
            decoration,
            delay,
            state: Arc::new(AtomicU8::new(UploadState::Idle as u8)),
        }
    }

    pub fn state(&self) -> UploadState {
        UploadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Delay to wait before the next cycle.
    pub fn next_delay(&self) -> Duration {
        self.delay.current()
    }

    fn enter(&self, state: UploadState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    /// Run one cycle.
    pub fn run_once(&mut self) -> CycleReport {
        self.enter(UploadState::Checking);
        let outcome = self.check_and_upload();
        self.enter(UploadState::Idle);

        let next_delay = match &outcome {
            CycleOutcome::Uploaded {
                outcome: UploadOutcome::Success | UploadOutcome::TerminalFailure,
                ..
            } => self.delay.decrease(),
            _ => self.delay.increase(),
        };
        CycleReport {
            outcome,
            next_delay,
        }
    }

    fn check_and_upload(&mut self) -> CycleOutcome {
        let Some(batch) = self.reader.read_next_batch() else {
            return CycleOutcome::NoBatch;
        };
        if !self.precondition.is_ready() {
            debug!(batch = %batch.id, "upload precondition unmet, keeping batch");
            self.reader.release(&batch.id);
            return CycleOutcome::NotReady;
        }

        self.enter(UploadState::Uploading);
        let payload = batch.payload(&self.decoration);
        let status = self.uploader.upload(&payload);
        let outcome = status.outcome();

        match outcome {
            UploadOutcome::Success => {
                debug!(batch = %batch.id, events = batch.len(), bytes = payload.len(), "batch uploaded");
                self.reader.on_batch_consumed(&batch.id);
            }
            UploadOutcome::TerminalFailure => {
                warn!(batch = %batch.id, status = %status, "batch rejected, discarding");
                self.reader.discard_batch(&batch.id);
            }
            UploadOutcome::Retry => {
                info!(batch = %batch.id, status = %status, "upload failed, will retry");
                self.reader.release(&batch.id);
            }
        }

        CycleOutcome::Uploaded {
            batch: batch.id.to_string(),
            status,
            outcome,
        }
    }
}

/// Runs [`UploadCycle`]s on a background thread until stopped.
pub struct UploadScheduler {
    name: String,
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    state: Arc<AtomicU8>,
}

impl UploadScheduler {
    /// Start the loop. The first cycle runs after the cycle's initial delay.
    pub fn start(name: &str, mut cycle: UploadCycle) -> Result<Self, SchedulerError> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let state = cycle.state.clone();
        let thread_name = name.to_string();

        let handle = thread::Builder::new()
            .name(format!("sp-{}", name))
            .spawn(move || {
                debug!(scheduler = %thread_name, "upload scheduler started");
                loop {
                    match stop_rx.recv_timeout(cycle.next_delay()) {
                        Err(RecvTimeoutError::Timeout) => {
                            let report = cycle.run_once();
                            debug!(
                                scheduler = %thread_name,
                                next_delay_ms = report.next_delay.as_millis() as u64,
                                "upload cycle finished"
                            );
                        }
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!(scheduler = %thread_name, "upload scheduler stopped");
            })?;

        Ok(UploadScheduler {
            name: name.to_string(),
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
            state,
        })
    }

    pub fn state(&self) -> UploadState {
        UploadState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.lock().map(|tx| tx.is_some()).unwrap_or(false)
    }

    /// Cancel future cycles. An in-flight cycle completes first. Idempotent.
    pub fn stop_scheduling(&self) {
        let stop_tx = match self.stop_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = stop_tx {
            let _ = tx.send(());
        }

        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(scheduler = %self.name, "upload thread panicked");
            }
            info!(scheduler = %self.name, "upload scheduling stopped");
        }
    }
}

impl Drop for UploadScheduler {
    fn drop(&mut self) {
        self.stop_scheduling();
    }
}
