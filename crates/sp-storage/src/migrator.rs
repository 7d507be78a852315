//! Moving or discarding stored batches when tracking consent changes.
//!
//! | previous            | new          | operation                 |
//! |---------------------|--------------|---------------------------|
//! | pending (or none)   | granted      | move pending → granted    |
//! | pending (or none)   | not granted  | wipe pending              |
//! | granted             | anything     | nothing                   |
//! | not granted         | anything     | nothing                   |
//! | same value          | same value   | nothing                   |
//!
//! Granted data is never revoked retroactively. Individual file failures are
//! retried a few times, logged and skipped; a migration always terminates.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sp_common::TrackingConsent;
use tracing::{debug, info, warn};

use crate::error::DeletionReason;
use crate::files::{
    batch_created_ms, batch_file_name, ensure_dir, remove_batch_file, retry_file_op,
};
use crate::lock::FileLockRegistry;
use crate::orchestrator::FileOrchestrator;

/// What a consent transition does to stored data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationOperation {
    Nothing,
    /// Move every file from the previous directory into the new one.
    Move,
    /// Delete every file in the previous directory.
    Wipe,
}

impl MigrationOperation {
    /// Operation for a transition. An unknown previous consent counts as
    /// pending.
    pub fn plan(previous: Option<TrackingConsent>, new: TrackingConsent) -> Self {
        match (previous.unwrap_or(TrackingConsent::Pending), new) {
            (TrackingConsent::Pending, TrackingConsent::Granted) => MigrationOperation::Move,
            (TrackingConsent::Pending, TrackingConsent::NotGranted) => MigrationOperation::Wipe,
            _ => MigrationOperation::Nothing,
        }
    }
}

/// Outcome counters for one migration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub operation: Option<MigrationOperation>,
    pub moved: usize,
    pub deleted: usize,
    pub failed: usize,
}

/// Applies the data policy for a consent transition.
pub trait DataMigrator: Send + Sync {
    fn migrate(
        &self,
        previous: Option<TrackingConsent>,
        previous_orchestrator: &dyn FileOrchestrator,
        new: TrackingConsent,
        new_orchestrator: &dyn FileOrchestrator,
    ) -> MigrationReport;
}

/// Inert migrator: leaves every file where it is.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpDataMigrator;

impl DataMigrator for NoOpDataMigrator {
    fn migrate(
        &self,
        _previous: Option<TrackingConsent>,
        _previous_orchestrator: &dyn FileOrchestrator,
        _new: TrackingConsent,
        _new_orchestrator: &dyn FileOrchestrator,
    ) -> MigrationReport {
        MigrationReport::default()
    }
}

/// Migrator implementing the consent policy on batch directories.
#[derive(Debug)]
pub struct ConsentAwareDataMigrator {
    locks: Arc<FileLockRegistry>,
}

impl ConsentAwareDataMigrator {
    pub fn new(locks: Arc<FileLockRegistry>) -> Self {
        ConsentAwareDataMigrator { locks }
    }

    fn move_files(&self, from: &dyn FileOrchestrator, to: &dyn FileOrchestrator) -> MigrationReport {
        let mut report = MigrationReport {
            operation: Some(MigrationOperation::Move),
            ..Default::default()
        };
        let Some(target_dir) = to.get_root_dir() else {
            warn!("migration target has no directory, leaving files in place");
            return report;
        };
        if !ensure_dir(&target_dir) {
            report.failed = from.get_all_files().len();
            return report;
        }

        for source in from.get_all_files() {
            let moved = self.locks.with_lock(&source, || {
                let Some(dest) = free_destination(&source, &target_dir) else {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidInput,
                        "not a batch file",
                    ));
                };
                self.locks.with_lock(&dest, || {
                    retry_file_op("move", &source, || std::fs::rename(&source, &dest))
                        .map(|done| done.then_some(dest.clone()))
                })
            });

            match moved {
                Ok(Some(dest)) => {
                    debug!(from = %source.display(), to = %dest.display(), "moved batch file");
                    report.moved += 1;
                }
                Ok(None) => debug!(path = %source.display(), "batch file vanished before move"),
                Err(e) => {
                    warn!(path = %source.display(), error = %e, "failed to move batch file, skipping");
                    report.failed += 1;
                }
            }
        }
        report
    }

    fn wipe_files(&self, orchestrator: &dyn FileOrchestrator) -> MigrationReport {
        let mut report = MigrationReport {
            operation: Some(MigrationOperation::Wipe),
            ..Default::default()
        };
        for file in orchestrator.get_all_files() {
            let removed = self
                .locks
                .with_lock(&file, || remove_batch_file(&file, DeletionReason::ConsentWipe));
            if removed {
                report.deleted += 1;
            } else if file.exists() {
                report.failed += 1;
            }
        }
        report
    }
}

impl DataMigrator for ConsentAwareDataMigrator {
    fn migrate(
        &self,
        previous: Option<TrackingConsent>,
        previous_orchestrator: &dyn FileOrchestrator,
        new: TrackingConsent,
        new_orchestrator: &dyn FileOrchestrator,
    ) -> MigrationReport {
        let operation = MigrationOperation::plan(previous, new);
        let report = match operation {
            MigrationOperation::Nothing => return MigrationReport::default(),
            MigrationOperation::Move => {
                previous_orchestrator.forget_active_file();
                self.move_files(previous_orchestrator, new_orchestrator)
            }
            MigrationOperation::Wipe => {
                previous_orchestrator.forget_active_file();
                self.wipe_files(previous_orchestrator)
            }
        };

        info!(
            previous = previous.map(|c| c.as_str()).unwrap_or("unknown"),
            new = %new,
            operation = ?operation,
            moved = report.moved,
            deleted = report.deleted,
            failed = report.failed,
            "consent migration finished"
        );
        report
    }
}

/// Destination for `source` inside `target_dir`: same name when free,
/// otherwise the next unused millisecond name so ordering is kept.
fn free_destination(source: &Path, target_dir: &Path) -> Option<PathBuf> {
    let mut created_ms = batch_created_ms(source)?;
    loop {
        let candidate = target_dir.join(batch_file_name(created_ms));
        if !candidate.exists() {
            return Some(candidate);
        }
        created_ms += 1;
    }
}
