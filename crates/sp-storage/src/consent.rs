//! Routing between the pending and granted directories by tracking consent.
//!
//! The consent-aware orchestrator holds a subscription to the
//! [`ConsentProvider`]. Before serving any request it drains that
//! subscription; each change is migrated on the dedicated migration worker
//! and awaited while the routing lock is held, so writers and readers only
//! ever see a post-migration directory state.
//!
//! Routing rules:
//! - writes go to the directory for the current consent; `NotGranted` writes
//!   are discarded
//! - uploads (readable and flushable files) always come from the granted
//!   directory, whatever the current consent, so pending data never leaves
//!   the device

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use sp_common::{ConsentProvider, TrackingConsent};
use tracing::{debug, error, warn};

use crate::migrator::{DataMigrator, MigrationReport};
use crate::orchestrator::{FileOrchestrator, NoOpFileOrchestrator};
use crate::worker::SequentialWorker;

struct RoutingState {
    consent: TrackingConsent,
    updates: Receiver<TrackingConsent>,
}

/// [`FileOrchestrator`] that delegates by consent and migrates on change.
pub struct ConsentAwareFileOrchestrator {
    pending: Arc<dyn FileOrchestrator>,
    granted: Arc<dyn FileOrchestrator>,
    inert: Arc<dyn FileOrchestrator>,
    migrator: Arc<dyn DataMigrator>,
    worker: Arc<SequentialWorker>,
    migration_timeout: Duration,
    state: Mutex<RoutingState>,
}

impl ConsentAwareFileOrchestrator {
    /// Subscribe to `consent` and migrate from an unknown previous consent to
    /// the current one.
    pub fn new(
        pending: Arc<dyn FileOrchestrator>,
        granted: Arc<dyn FileOrchestrator>,
        migrator: Arc<dyn DataMigrator>,
        worker: Arc<SequentialWorker>,
        consent: &ConsentProvider,
        migration_timeout: Duration,
    ) -> Self {
        let (initial, updates) = consent.subscribe();
        let orchestrator = ConsentAwareFileOrchestrator {
            pending,
            granted,
            inert: Arc::new(NoOpFileOrchestrator),
            migrator,
            worker,
            migration_timeout,
            state: Mutex::new(RoutingState {
                consent: initial,
                updates,
            }),
        };
        orchestrator.run_migration(None, initial);
        orchestrator
    }

    /// Consent currently applied to routing, after draining updates.
    pub fn current_consent(&self) -> TrackingConsent {
        self.synced_state().consent
    }

    pub fn pending(&self) -> &Arc<dyn FileOrchestrator> {
        &self.pending
    }

    pub fn granted(&self) -> &Arc<dyn FileOrchestrator> {
        &self.granted
    }

    /// Files of both directories, pending first, each oldest first.
    pub fn get_all_files_any_consent(&self) -> Vec<PathBuf> {
        let _state = self.synced_state();
        let mut files = self.pending.get_all_files();
        files.extend(self.granted.get_all_files());
        files
    }

    /// Close the active file of both directories.
    pub fn forget_active_files(&self) {
        let _state = self.synced_state();
        self.pending.forget_active_file();
        self.granted.forget_active_file();
    }

    fn orchestrator_for(&self, consent: TrackingConsent) -> &Arc<dyn FileOrchestrator> {
        match consent {
            TrackingConsent::Pending => &self.pending,
            TrackingConsent::Granted => &self.granted,
            TrackingConsent::NotGranted => &self.inert,
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, RoutingState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Lock the routing state, applying every consent change received since
    /// the last request.
    fn synced_state(&self) -> MutexGuard<'_, RoutingState> {
        let mut state = self.lock_state();
        while let Ok(next) = state.updates.try_recv() {
            if next == state.consent {
                continue;
            }
            let previous = state.consent;
            self.run_migration(Some(previous), next);
            state.consent = next;
        }
        state
    }

    /// Run one migration on the migration worker and wait for it.
    ///
    /// Falls back to running inline when the worker refuses the task. Gives
    /// up waiting after `migration_timeout`; the migration keeps running in
    /// the background.
    fn run_migration(&self, previous: Option<TrackingConsent>, new: TrackingConsent) {
        let previous_orchestrator = self
            .orchestrator_for(previous.unwrap_or(TrackingConsent::Pending))
            .clone();
        let new_orchestrator = self.orchestrator_for(new).clone();
        let migrator = self.migrator.clone();
        debug!(
            previous = previous.map(|c| c.as_str()).unwrap_or("unknown"),
            new = %new,
            "scheduling consent migration"
        );

        let (done_tx, done_rx) = mpsc::channel::<MigrationReport>();
        let task = {
            let previous_orchestrator = previous_orchestrator.clone();
            let new_orchestrator = new_orchestrator.clone();
            let migrator = migrator.clone();
            move || {
                let report = migrator.migrate(
                    previous,
                    previous_orchestrator.as_ref(),
                    new,
                    new_orchestrator.as_ref(),
                );
                let _ = done_tx.send(report);
            }
        };

        if let Err(e) = self.worker.submit(task) {
            warn!(error = %e, "migration worker unavailable, migrating inline");
            migrator.migrate(
                previous,
                previous_orchestrator.as_ref(),
                new,
                new_orchestrator.as_ref(),
            );
            return;
        }

        match done_rx.recv_timeout(self.migration_timeout) {
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => warn!(
                timeout_ms = self.migration_timeout.as_millis() as u64,
                new = %new,
                "consent migration still running after timeout, continuing"
            ),
            Err(RecvTimeoutError::Disconnected) => {
                error!(new = %new, "consent migration task did not complete")
            }
        }
    }
}

impl FileOrchestrator for ConsentAwareFileOrchestrator {
    fn get_writable_file(&self, next_write_size: u64) -> Option<PathBuf> {
        let state = self.synced_state();
        self.orchestrator_for(state.consent)
            .get_writable_file(next_write_size)
    }

    fn get_readable_file(&self, excluded: &HashSet<PathBuf>) -> Option<PathBuf> {
        let _state = self.synced_state();
        self.granted.get_readable_file(excluded)
    }

    fn get_all_files(&self) -> Vec<PathBuf> {
        let state = self.synced_state();
        self.orchestrator_for(state.consent).get_all_files()
    }

    fn get_flushable_files(&self) -> Vec<PathBuf> {
        let _state = self.synced_state();
        self.granted.get_flushable_files()
    }

    fn get_root_dir(&self) -> Option<PathBuf> {
        let state = self.synced_state();
        self.orchestrator_for(state.consent).get_root_dir()
    }

    fn forget_active_file(&self) {
        let state = self.synced_state();
        self.orchestrator_for(state.consent).forget_active_file();
    }
}
