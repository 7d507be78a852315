//! Spool configuration.
//!
//! All limits are product configuration. Every field has a serde default so a
//! partial TOML file is valid:
//!
//! ```toml
//! [storage]
//! max_batch_size = 1048576
//! recent_delay_ms = 2000
//!
//! [upload]
//! frequency = "frequent"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::decoration::PayloadFormat;

/// Errors from loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration for one spool instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpoolConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub writer: WriterConfig,
    #[serde(default)]
    pub upload: UploadConfig,
}

impl SpoolConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: SpoolConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.storage.validate()?;
        self.writer.validate()?;
        self.upload.validate()?;
        Ok(())
    }
}

/// Limits for batch files and their directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Root under which per-feature directories are created.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Maximum on-disk size of one batch file in bytes.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: u64,

    /// Maximum records per batch file.
    #[serde(default = "default_max_items_per_batch")]
    pub max_items_per_batch: usize,

    /// Largest single serialized record accepted, in bytes.
    #[serde(default = "default_max_item_size")]
    pub max_item_size: u64,

    /// A file is writable while younger than this, and readable only once
    /// at least this old.
    #[serde(default = "default_recent_delay_ms")]
    pub recent_delay_ms: u64,

    /// Files older than this are deleted without upload.
    #[serde(default = "default_old_file_threshold_ms")]
    pub old_file_threshold_ms: u64,

    /// Aggregate size cap for one directory in bytes.
    #[serde(default = "default_max_disk_space")]
    pub max_disk_space: u64,

    /// How each batch is joined into an upload payload.
    #[serde(default)]
    pub payload_format: PayloadFormat,

    /// Upper bound on waiting for a consent migration to finish.
    #[serde(default = "default_migration_timeout_ms")]
    pub migration_timeout_ms: u64,
}

fn default_root_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("spool")
}

fn default_max_batch_size() -> u64 {
    4 * 1024 * 1024 // 4 MiB
}

fn default_max_items_per_batch() -> usize {
    500
}

fn default_max_item_size() -> u64 {
    512 * 1024 // 512 KiB
}

fn default_recent_delay_ms() -> u64 {
    5_000
}

fn default_old_file_threshold_ms() -> u64 {
    18 * 60 * 60 * 1000 // 18 hours
}

fn default_max_disk_space() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

fn default_migration_timeout_ms() -> u64 {
    5_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            root_dir: default_root_dir(),
            max_batch_size: default_max_batch_size(),
            max_items_per_batch: default_max_items_per_batch(),
            max_item_size: default_max_item_size(),
            recent_delay_ms: default_recent_delay_ms(),
            old_file_threshold_ms: default_old_file_threshold_ms(),
            max_disk_space: default_max_disk_space(),
            payload_format: PayloadFormat::default(),
            migration_timeout_ms: default_migration_timeout_ms(),
        }
    }
}

impl StorageConfig {
    /// Defaults rooted at a custom directory.
    pub fn with_root(root_dir: PathBuf) -> Self {
        StorageConfig {
            root_dir,
            ..Default::default()
        }
    }

    pub fn recent_delay(&self) -> Duration {
        Duration::from_millis(self.recent_delay_ms)
    }

    pub fn old_file_threshold(&self) -> Duration {
        Duration::from_millis(self.old_file_threshold_ms)
    }

    pub fn migration_timeout(&self) -> Duration {
        Duration::from_millis(self.migration_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_batch_size must be > 0".to_string(),
            ));
        }
        if self.max_items_per_batch == 0 {
            return Err(ConfigError::Invalid(
                "storage.max_items_per_batch must be > 0".to_string(),
            ));
        }
        if self.max_item_size == 0 || self.max_item_size > self.max_batch_size {
            return Err(ConfigError::Invalid(format!(
                "storage.max_item_size must be in 1..={} (max_batch_size), got {}",
                self.max_batch_size, self.max_item_size
            )));
        }
        if self.max_disk_space < self.max_batch_size {
            return Err(ConfigError::Invalid(format!(
                "storage.max_disk_space ({}) is smaller than max_batch_size ({})",
                self.max_disk_space, self.max_batch_size
            )));
        }
        if self.old_file_threshold_ms <= self.recent_delay_ms {
            return Err(ConfigError::Invalid(
                "storage.old_file_threshold_ms must exceed recent_delay_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Writer queue settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Pending write tasks held before new ones are dropped.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    1024
}

impl Default for WriterConfig {
    fn default() -> Self {
        WriterConfig {
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl WriterConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "writer.queue_capacity must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Preset upload cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadFrequency {
    Frequent,
    #[default]
    Average,
    Rare,
}

impl UploadFrequency {
    /// Base step; min, default and max delays are 1, 5 and 10 steps.
    pub fn base_step(&self) -> Duration {
        match self {
            UploadFrequency::Frequent => Duration::from_millis(500),
            UploadFrequency::Average => Duration::from_millis(2_000),
            UploadFrequency::Rare => Duration::from_millis(5_000),
        }
    }
}

/// Upload scheduling settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadConfig {
    #[serde(default)]
    pub frequency: UploadFrequency,

    /// Explicit overrides; each falls back to the frequency preset.
    #[serde(default)]
    pub min_delay_ms: Option<u64>,
    #[serde(default)]
    pub default_delay_ms: Option<u64>,
    #[serde(default)]
    pub max_delay_ms: Option<u64>,
}

impl Default for UploadConfig {
    fn default() -> Self {
        UploadConfig {
            frequency: UploadFrequency::default(),
            min_delay_ms: None,
            default_delay_ms: None,
            max_delay_ms: None,
        }
    }
}

impl UploadConfig {
    pub fn min_delay(&self) -> Duration {
        self.min_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.frequency.base_step())
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.frequency.base_step() * 5)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.frequency.base_step() * 10)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (min, default, max) = (self.min_delay(), self.default_delay(), self.max_delay());
        if min.is_zero() {
            return Err(ConfigError::Invalid(
                "upload.min_delay_ms must be > 0".to_string(),
            ));
        }
        if !(min <= default && default <= max) {
            return Err(ConfigError::Invalid(format!(
                "upload delays must satisfy min <= default <= max (got {:?} / {:?} / {:?})",
                min, default, max
            )));
        }
        Ok(())
    }
}
