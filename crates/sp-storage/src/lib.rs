//! Spool storage engine.
//!
//! This crate provides:
//! - Batch file orchestration within one directory (roll-over, size cap, TTL)
//! - Consent-aware routing between the pending and granted directories
//! - Data migration on consent changes
//! - A batched writer running on a dedicated sequential worker
//! - A reader that checks batches out for upload and deletes them afterwards
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use sp_common::{ConsentProvider, StorageConfig, TrackingConsent};
//! use sp_storage::{
//!     BatchFileOrchestrator, BatchReader, BatchWriter, BytesSerializer,
//!     ConsentAwareDataMigrator, ConsentAwareFileOrchestrator, DataReader, DataWriter,
//!     FileLockRegistry, SequentialWorker,
//! };
//!
//! let config = StorageConfig::default();
//! let locks = Arc::new(FileLockRegistry::new());
//! let consent = ConsentProvider::new(TrackingConsent::Granted);
//! let pending = Arc::new(BatchFileOrchestrator::new(
//!     config.root_dir.join("logs-pending-v1"), &config, locks.clone()));
//! let granted = Arc::new(BatchFileOrchestrator::new(
//!     config.root_dir.join("logs-v1"), &config, locks.clone()));
//! let migration_worker = Arc::new(SequentialWorker::spawn("logs-migration", 16)?);
//! let orchestrator = Arc::new(ConsentAwareFileOrchestrator::new(
//!     pending, granted,
//!     Arc::new(ConsentAwareDataMigrator::new(locks.clone())),
//!     migration_worker, &consent, config.migration_timeout(),
//! ));
//!
//! let writer_worker = Arc::new(SequentialWorker::spawn("logs-writer", 1024)?);
//! let writer = BatchWriter::new(orchestrator.clone(), Arc::new(BytesSerializer),
//!     locks.clone(), writer_worker, config.max_item_size);
//! writer.write(b"{\"message\":\"hello\"}".to_vec());
//!
//! let reader = BatchReader::new(orchestrator, locks);
//! if let Some(batch) = reader.read_next_batch() {
//!     reader.on_batch_consumed(&batch.id);
//! }
//! # Ok::<(), std::io::Error>(())
//! ```

pub mod consent;
pub mod error;
pub mod files;
pub mod format;
pub mod lock;
pub mod migrator;
pub mod orchestrator;
pub mod reader;
pub mod worker;
pub mod writer;

pub use consent::ConsentAwareFileOrchestrator;
pub use error::{DeletionReason, StorageError};
pub use format::RawBatchEvent;
pub use lock::FileLockRegistry;
pub use migrator::{
    ConsentAwareDataMigrator, DataMigrator, MigrationOperation, MigrationReport, NoOpDataMigrator,
};
pub use orchestrator::{
    BatchFileOrchestrator, DirectoryStatus, FileOrchestrator, NoOpFileOrchestrator,
    OrchestratorLimits,
};
pub use reader::{Batch, BatchId, BatchReader, DataReader, NoOpDataReader};
pub use worker::{SequentialWorker, SubmitError};
pub use writer::{
    BatchWriter, BytesSerializer, DataWriter, JsonSerializer, NoOpDataWriter, Serializer,
    WriterStats, WriterStatsSnapshot,
};
