//! Spool feature pipeline.
//!
//! This crate provides:
//! - [`FeaturePipeline`]: per-feature directories, consent-aware storage,
//!   batched writer, reader, flusher and upload scheduler with an explicit
//!   start/stop lifecycle
//! - Structured logging setup for hosts ([`logging`])
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sp_common::{ConsentProvider, SpoolConfig, TrackingConsent};
//! use sp_core::FeaturePipeline;
//! use sp_storage::JsonSerializer;
//! use sp_upload::{AlwaysReady, NoOpUploader};
//!
//! sp_core::logging::init_default_logging();
//!
//! let consent = ConsentProvider::new(TrackingConsent::Pending);
//! let pipeline: FeaturePipeline<serde_json::Value> = FeaturePipeline::new(
//!     "logs",
//!     SpoolConfig::default(),
//!     &consent,
//!     Arc::new(JsonSerializer),
//!     Arc::new(NoOpUploader),
//!     Arc::new(AlwaysReady),
//! )?;
//! pipeline.start_uploads()?;
//! pipeline.writer().write(serde_json::json!({"message": "hello"}));
//!
//! consent.set_consent(TrackingConsent::Granted);
//! pipeline.flush();
//! pipeline.stop();
//! # Ok::<(), sp_core::PipelineError>(())
//! ```

pub mod error;
pub mod logging;
pub mod pipeline;

pub use error::{PipelineError, Result};
pub use pipeline::{feature_dirs, FeaturePipeline, PipelineStatus};
