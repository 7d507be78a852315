//! Structured logging for hosts that embed spool pipelines.
//!
//! Provides dual-mode logging on stderr:
//! - Human-readable console output for interactive use
//! - Machine-parseable JSONL for agents and log shippers
//!
//! Every pipeline opens a span carrying `feature` and `pipeline_id`, so
//! events from its writer, migration and upload threads can be correlated.
//!
//! # Example
//!
//! ```no_run
//! use sp_core::logging::{init_logging, LogConfig, LogFormat};
//!
//! let config = LogConfig::from_env(None, Some(LogFormat::Jsonl));
//! init_logging(&config);
//! ```

pub mod config;
pub mod layer;

pub use config::{LogConfig, LogFormat, LogLevel};
pub use layer::JsonlLayer;

use std::io::IsTerminal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Crates whose events the default filter lets through.
const SPOOL_TARGETS: [&str; 4] = ["sp_core", "sp_storage", "sp_upload", "sp_common"];

/// Filter directive enabling `level` for every spool crate.
pub fn default_directives(level: LogLevel) -> String {
    SPOOL_TARGETS
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",")
}

/// Event filter for `config`: its RUST_LOG directives when it carries
/// valid ones, otherwise `config.level` for every spool crate.
pub fn build_filter(config: &LogConfig) -> EnvFilter {
    config
        .rust_log
        .as_deref()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(default_directives(config.level)))
}

/// Initialize the logging subsystem.
///
/// Respects SP_LOG, RUST_LOG and SP_LOG_FORMAT through [`LogConfig`].
/// Returns false when the host already installed a global subscriber.
pub fn init_logging(config: &LogConfig) -> bool {
    let filter = build_filter(config);

    let installed = match config.format {
        LogFormat::Human => {
            let use_ansi = std::io::stderr().is_terminal();
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_thread_names(true)
                .with_ansi(use_ansi);

            if config.timestamps {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer)
                    .try_init()
            } else {
                tracing_subscriber::registry()
                    .with(filter)
                    .with(fmt_layer.without_time())
                    .try_init()
            }
        }
        LogFormat::Jsonl => tracing_subscriber::registry()
            .with(filter)
            .with(JsonlLayer::stderr())
            .try_init(),
    };
    installed.is_ok()
}

/// Initialize logging from the environment (for tests and simple hosts).
pub fn init_default_logging() -> bool {
    init_logging(&LogConfig::from_env(None, None))
}

/// Generate a unique id for one pipeline instance.
pub fn generate_pipeline_id() -> String {
    let uuid = uuid::Uuid::new_v4();
    // Shorten to first 12 hex chars for readability
    format!("sp-{}", &uuid.simple().to_string()[..12])
}
