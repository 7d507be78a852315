//! Error types for sp-core.

use sp_common::ConfigError;
use sp_upload::SchedulerError;
use thiserror::Error;

/// Errors raised while building or driving a feature pipeline.
///
/// Only construction and lifecycle calls can fail. Writes, reads and
/// uploads contain their own errors and report them through logs and stats.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid feature name {0:?}: use ASCII letters, digits, '-' or '_'")]
    InvalidFeatureName(String),

    #[error("failed to spawn {worker} worker: {source}")]
    WorkerSpawn {
        worker: String,
        #[source]
        source: std::io::Error,
    },

    #[error("upload scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("pipeline {0} is stopped")]
    Stopped(String),
}

/// Result type alias for sp-core operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
