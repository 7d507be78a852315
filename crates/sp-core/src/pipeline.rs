//! One feature's storage and upload path, wired and owned together.
//!
//! A [`FeaturePipeline`] owns, for a single feature name:
//! - the pending (`<root>/<feature>-pending-v1`) and granted
//!   (`<root>/<feature>-v1`) batch directories
//! - the consent-aware orchestrator and its migration worker
//! - the batched writer and its worker
//! - the reader shared by the upload scheduler and the flusher
//!
//! Construction brings everything up; [`FeaturePipeline::stop`] (also run on
//! drop) stops scheduling and drains both workers. After `stop` the writer
//! and reader handles returned by the pipeline are inert.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sp_common::{ConsentProvider, PayloadDecoration, SpoolConfig, TrackingConsent};
use sp_storage::{
    BatchFileOrchestrator, BatchReader, BatchWriter, ConsentAwareDataMigrator,
    ConsentAwareFileOrchestrator, DataReader, DataWriter, DirectoryStatus, FileLockRegistry,
    NoOpDataReader, NoOpDataWriter, SequentialWorker, Serializer, WriterStatsSnapshot,
};
use sp_upload::{
    DelayPolicy, FlushReport, Flusher, UploadCycle, UploadPrecondition, UploadScheduler,
    UploadState, Uploader,
};
use tracing::{debug, info, info_span, warn, Span};

use crate::error::{PipelineError, Result};
use crate::logging::generate_pipeline_id;

/// Directory format version appended to every feature directory name.
const DIRECTORY_VERSION: &str = "v1";

/// Upper bound on waiting for queued writes before a flush.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Snapshot of a pipeline for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub feature: String,
    pub pipeline_id: String,
    pub consent: TrackingConsent,
    pub pending: DirectoryStatus,
    pub granted: DirectoryStatus,
    pub writer: WriterStatsSnapshot,
    /// `None` until uploads are started, and again after stop.
    pub upload_state: Option<UploadState>,
    pub stopped: bool,
}

/// Persistence and upload for one feature.
pub struct FeaturePipeline<T: Send + 'static> {
    feature: String,
    pipeline_id: String,
    span: Span,
    config: SpoolConfig,
    pending: Arc<BatchFileOrchestrator>,
    granted: Arc<BatchFileOrchestrator>,
    orchestrator: Arc<ConsentAwareFileOrchestrator>,
    writer: Arc<BatchWriter<T>>,
    reader: Arc<BatchReader>,
    uploader: Arc<dyn Uploader>,
    precondition: Arc<dyn UploadPrecondition>,
    writer_worker: Arc<SequentialWorker>,
    migration_worker: Arc<SequentialWorker>,
    scheduler: Mutex<Option<UploadScheduler>>,
    stopped: AtomicBool,
}

impl<T: Send + 'static> FeaturePipeline<T> {
    /// Build the pipeline for `feature` under `config.storage.root_dir`.
    ///
    /// The initial consent is migrated before this returns. Uploads are not
    /// scheduled until [`FeaturePipeline::start_uploads`].
    pub fn new<S>(
        feature: &str,
        config: SpoolConfig,
        consent: &ConsentProvider,
        serializer: Arc<S>,
        uploader: Arc<dyn Uploader>,
        precondition: Arc<dyn UploadPrecondition>,
    ) -> Result<Self>
    where
        S: Serializer<T> + 'static,
    {
        validate_feature_name(feature)?;
        config.validate()?;

        let pipeline_id = generate_pipeline_id();
        let span = info_span!("pipeline", feature = %feature, pipeline_id = %pipeline_id);
        let _enter = span.enter();

        let (pending_dir, granted_dir) = feature_dirs(&config, feature);
        let locks = Arc::new(FileLockRegistry::new());
        let pending = Arc::new(BatchFileOrchestrator::new(
            pending_dir,
            &config.storage,
            locks.clone(),
        ));
        let granted = Arc::new(BatchFileOrchestrator::new(
            granted_dir,
            &config.storage,
            locks.clone(),
        ));

        let migration_worker = Arc::new(spawn_worker(&format!("{}-migration", feature), 16)?);
        let orchestrator = Arc::new(ConsentAwareFileOrchestrator::new(
            pending.clone(),
            granted.clone(),
            Arc::new(ConsentAwareDataMigrator::new(locks.clone())),
            migration_worker.clone(),
            consent,
            config.storage.migration_timeout(),
        ));

        let writer_worker = Arc::new(spawn_worker(
            &format!("{}-writer", feature),
            config.writer.queue_capacity,
        )?);
        let writer = Arc::new(BatchWriter::new(
            orchestrator.clone(),
            serializer,
            locks.clone(),
            writer_worker.clone(),
            config.storage.max_item_size,
        ));
        let reader = Arc::new(BatchReader::new(orchestrator.clone(), locks));

        info!(
            consent = %orchestrator.current_consent(),
            root = %config.storage.root_dir.display(),
            "feature pipeline started"
        );
        drop(_enter);

        Ok(FeaturePipeline {
            feature: feature.to_string(),
            pipeline_id,
            span,
            config,
            pending,
            granted,
            orchestrator,
            writer,
            reader,
            uploader,
            precondition,
            writer_worker,
            migration_worker,
            scheduler: Mutex::new(None),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn feature(&self) -> &str {
        &self.feature
    }

    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Writer handle; inert once the pipeline is stopped.
    pub fn writer(&self) -> Arc<dyn DataWriter<T>> {
        if self.is_stopped() {
            return Arc::new(NoOpDataWriter::default());
        }
        self.writer.clone()
    }

    /// Reader handle; inert once the pipeline is stopped.
    pub fn reader(&self) -> Arc<dyn DataReader> {
        if self.is_stopped() {
            return Arc::new(NoOpDataReader);
        }
        self.reader.clone()
    }

    /// Wait until every record handed to the writer so far is on disk.
    pub fn wait_for_writes(&self, timeout: Duration) -> bool {
        self.writer.wait_idle(timeout)
    }

    /// Upload every closed granted batch now, including what is still
    /// queued in the writer and the file it is currently filling.
    pub fn flush(&self) -> FlushReport {
        let _enter = self.span.enter();
        self.close_active_files_after_queued_writes();
        Flusher::new(self.reader.clone(), self.decoration()).flush(self.uploader.as_ref())
    }

    /// Close the files being filled once every write queued so far is on
    /// disk. Runs on the writer worker so no append is in progress while
    /// the files are closed.
    fn close_active_files_after_queued_writes(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        let orchestrator = self.orchestrator.clone();
        let submitted = self.writer_worker.submit(move || {
            orchestrator.forget_active_files();
            let _ = done_tx.send(());
        });
        match submitted {
            Ok(()) => {
                if done_rx.recv_timeout(WRITER_DRAIN_TIMEOUT).is_err() {
                    warn!("writer did not drain before flush, flushing what is on disk");
                }
            }
            Err(e) => {
                debug!(error = %e, "writer worker unavailable, closing active files inline");
                self.writer.wait_idle(WRITER_DRAIN_TIMEOUT);
                self.orchestrator.forget_active_files();
            }
        }
    }

    /// Delete every stored batch of this feature, whatever the consent.
    ///
    /// Does not wait for the writer: records still queued when this is
    /// called are persisted afterwards.
    pub fn drop_all(&self) {
        let _enter = self.span.enter();
        self.reader.drop_all();
    }

    /// Start the background upload scheduler. Idempotent while running.
    pub fn start_uploads(&self) -> Result<()> {
        let _enter = self.span.enter();
        if self.is_stopped() {
            return Err(PipelineError::Stopped(self.pipeline_id.clone()));
        }
        let mut scheduler = self.lock_scheduler();
        if scheduler.is_some() {
            debug!("upload scheduler already running");
            return Ok(());
        }

        let cycle = UploadCycle::new(
            self.reader.clone(),
            self.uploader.clone(),
            self.precondition.clone(),
            self.decoration(),
            DelayPolicy::from_config(&self.config.upload),
        );
        *scheduler = Some(UploadScheduler::start(
            &format!("{}-upload", self.feature),
            cycle,
        )?);
        info!(frequency = ?self.config.upload.frequency, "uploads scheduled");
        Ok(())
    }

    /// Stop scheduling, then drain and stop the writer and migration workers.
    ///
    /// An in-flight upload or write completes first. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let _enter = self.span.enter();

        let scheduler = self.lock_scheduler().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop_scheduling();
        }
        self.writer_worker.shutdown();
        self.migration_worker.shutdown();

        let stats = self.writer.stats();
        info!(
            written = stats.written,
            dropped = stats.dropped(),
            "feature pipeline stopped"
        );
    }

    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            feature: self.feature.clone(),
            pipeline_id: self.pipeline_id.clone(),
            consent: self.orchestrator.current_consent(),
            pending: self.pending.status(),
            granted: self.granted.status(),
            writer: self.writer.stats(),
            upload_state: self.lock_scheduler().as_ref().map(|s| s.state()),
            stopped: self.is_stopped(),
        }
    }

    fn decoration(&self) -> PayloadDecoration {
        self.config.storage.payload_format.decoration()
    }

    fn lock_scheduler(&self) -> MutexGuard<'_, Option<UploadScheduler>> {
        match self.scheduler.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<T: Send + 'static> Drop for FeaturePipeline<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pending and granted directories for `feature`.
pub fn feature_dirs(config: &SpoolConfig, feature: &str) -> (PathBuf, PathBuf) {
    let root = &config.storage.root_dir;
    (
        root.join(format!("{}-pending-{}", feature, DIRECTORY_VERSION)),
        root.join(format!("{}-{}", feature, DIRECTORY_VERSION)),
    )
}

fn validate_feature_name(feature: &str) -> Result<()> {
    let valid = !feature.is_empty()
        && feature
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PipelineError::InvalidFeatureName(feature.to_string()))
    }
}

fn spawn_worker(name: &str, capacity: usize) -> Result<SequentialWorker> {
    SequentialWorker::spawn(name, capacity).map_err(|source| PipelineError::WorkerSpawn {
        worker: name.to_string(),
        source,
    })
}
