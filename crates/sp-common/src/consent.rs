//! Tracking consent and its change notifications.
//!
//! Consent is process-wide and mutable. Components that care about changes
//! hold a subscription (an `mpsc::Receiver`) and drain it before acting, so
//! notifications are pulled by the consumer rather than pushed into callbacks.

use std::sync::{mpsc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

/// User-controlled permission gating whether telemetry may be persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingConsent {
    /// No decision yet: data is buffered in the pending area.
    Pending,
    /// Data may be stored and uploaded.
    Granted,
    /// Data must be dropped and pending data discarded.
    NotGranted,
}

impl TrackingConsent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingConsent::Pending => "pending",
            TrackingConsent::Granted => "granted",
            TrackingConsent::NotGranted => "not_granted",
        }
    }
}

impl std::fmt::Display for TrackingConsent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TrackingConsent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TrackingConsent::Pending),
            "granted" => Ok(TrackingConsent::Granted),
            "not_granted" | "not-granted" | "notgranted" | "denied" => {
                Ok(TrackingConsent::NotGranted)
            }
            _ => Err(format!("unknown tracking consent: {}", s)),
        }
    }
}

/// Holds the current consent and broadcasts changes to subscribers.
///
/// Passed explicitly to every component that needs it; there is no global
/// instance.
#[derive(Debug)]
pub struct ConsentProvider {
    current: RwLock<TrackingConsent>,
    senders: Mutex<Vec<mpsc::Sender<TrackingConsent>>>,
}

impl ConsentProvider {
    pub fn new(initial: TrackingConsent) -> Self {
        Self {
            current: RwLock::new(initial),
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Current consent value.
    pub fn consent(&self) -> TrackingConsent {
        match self.current.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Update consent and notify subscribers. Setting the same value again is
    /// a no-op and sends nothing.
    pub fn set_consent(&self, consent: TrackingConsent) {
        let previous = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, consent)
        };
        if previous == consent {
            return;
        }
        info!(previous = %previous, consent = %consent, "tracking consent changed");

        let mut senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders.retain(|sender| sender.send(consent).is_ok());
    }

    /// Subscribe to consent changes.
    ///
    /// Returns the consent at subscription time together with a receiver for
    /// every later change. Both are taken under the subscriber lock so no
    /// change can fall between them.
    pub fn subscribe(&self) -> (TrackingConsent, mpsc::Receiver<TrackingConsent>) {
        let (tx, rx) = mpsc::channel();
        let mut senders = match self.senders.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        senders.push(tx);
        (self.consent(), rx)
    }

    /// Number of live subscriptions (closed receivers are pruned on send).
    pub fn subscriber_count(&self) -> usize {
        self.senders.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl Default for ConsentProvider {
    fn default() -> Self {
        Self::new(TrackingConsent::Pending)
    }
}
