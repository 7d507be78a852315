//! Spool upload path.
//!
//! This crate provides:
//! - The [`Uploader`] transport seam and HTTP status classification
//! - Local upload preconditions (reachability)
//! - The adaptive [`DelayPolicy`] between cycles
//! - [`UploadCycle`] and the background [`UploadScheduler`]
//! - The synchronous [`Flusher`] used before teardown
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sp_common::{PayloadDecoration, UploadConfig};
//! use sp_storage::NoOpDataReader;
//! use sp_upload::{AlwaysReady, DelayPolicy, NoOpUploader, UploadCycle, UploadScheduler};
//!
//! let cycle = UploadCycle::new(
//!     Arc::new(NoOpDataReader),
//!     Arc::new(NoOpUploader),
//!     Arc::new(AlwaysReady),
//!     PayloadDecoration::json_array(),
//!     DelayPolicy::from_config(&UploadConfig::default()),
//! );
//! let scheduler = UploadScheduler::start("logs-upload", cycle)?;
//! scheduler.stop_scheduling();
//! # Ok::<(), sp_upload::SchedulerError>(())
//! ```

pub mod delay;
pub mod flusher;
pub mod precondition;
pub mod scheduler;
pub mod uploader;

pub use delay::DelayPolicy;
pub use flusher::{FlushReport, Flusher};
pub use precondition::{AlwaysReady, ReachabilityFlag, UploadPrecondition};
pub use scheduler::{
    CycleOutcome, CycleReport, SchedulerError, UploadCycle, UploadScheduler, UploadState,
};
pub use uploader::{NoOpUploader, UploadOutcome, UploadStatus, Uploader};
