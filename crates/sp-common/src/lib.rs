//! Shared types for the telemetry spool.
//!
//! This crate provides:
//! - Tracking consent values and the consent provider (subscription channel)
//! - Payload decoration applied when batches are turned into upload payloads
//! - Configuration for storage, writer and upload scheduling (TOML + serde)

pub mod config;
pub mod consent;
pub mod decoration;

pub use config::{
    ConfigError, SpoolConfig, StorageConfig, UploadConfig, UploadFrequency, WriterConfig,
};
pub use consent::{ConsentProvider, TrackingConsent};
pub use decoration::{PayloadDecoration, PayloadFormat};

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Batch file names and ages are derived from this value.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
