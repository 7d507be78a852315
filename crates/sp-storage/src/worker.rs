//! Single-thread sequential task queue.
//!
//! Each feature's writer and each consent-aware orchestrator's migrations run
//! on their own `SequentialWorker`: one named OS thread draining a bounded
//! FIFO queue. Submission never blocks; when the queue is full the task is
//! rejected and the caller decides how to log the loss.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Mutex;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Why a task was not accepted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitError {
    #[error("worker queue is full")]
    QueueFull,

    #[error("worker has shut down")]
    ShutDown,
}

/// A dedicated worker thread executing tasks strictly in submission order.
pub struct SequentialWorker {
    name: String,
    sender: Mutex<Option<SyncSender<Task>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl SequentialWorker {
    /// Spawn the worker thread with a queue of `capacity` pending tasks.
    pub fn spawn(name: &str, capacity: usize) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::sync_channel::<Task>(capacity.max(1));
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(format!("sp-{}", name))
            .spawn(move || {
                for task in rx {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        error!(worker = %thread_name, "worker task panicked");
                    }
                }
                debug!(worker = %thread_name, "worker drained and stopped");
            })?;

        Ok(SequentialWorker {
            name: name.to_string(),
            thread_id: handle.thread().id(),
            sender: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a task without blocking.
    pub fn submit<F>(&self, task: F) -> Result<(), SubmitError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender_clone().ok_or(SubmitError::ShutDown)?;
        match sender.try_send(Box::new(task)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(SubmitError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(SubmitError::ShutDown),
        }
    }

    /// Wait until every task submitted before this call has run.
    ///
    /// Returns `false` if that did not happen within `timeout`. A stopped
    /// worker has nothing pending and returns `true`.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        if thread::current().id() == self.thread_id {
            // Called from one of our own tasks: everything before it already ran.
            return true;
        }
        let deadline = Instant::now() + timeout;
        let Some(sender) = self.sender_clone() else {
            return true;
        };

        let (done_tx, done_rx) = mpsc::channel::<()>();
        let mut fence: Task = Box::new(move || {
            let _ = done_tx.send(());
        });
        loop {
            match sender.try_send(fence) {
                Ok(()) => break,
                Err(TrySendError::Disconnected(_)) => return true,
                Err(TrySendError::Full(returned)) => {
                    if Instant::now() >= deadline {
                        return false;
                    }
                    fence = returned;
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match done_rx.recv_timeout(remaining) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // Sender dropped without running: the worker is gone.
            Err(RecvTimeoutError::Disconnected) => true,
        }
    }

    /// Stop accepting tasks, let queued ones finish, and join the thread.
    ///
    /// Idempotent. Tasks already queued are executed, not discarded.
    pub fn shutdown(&self) {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        drop(sender);

        if thread::current().id() == self.thread_id {
            return;
        }
        let handle = match self.handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!(worker = %self.name, "worker thread panicked during shutdown");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    fn sender_clone(&self) -> Option<SyncSender<Task>> {
        match self.sender.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl Drop for SequentialWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SequentialWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequentialWorker")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .finish()
    }
}
