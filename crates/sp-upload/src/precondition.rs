//! Local checks made before contacting the network.

use std::sync::atomic::{AtomicBool, Ordering};

/// Cheap local gate for an upload attempt (e.g. network reachability).
pub trait UploadPrecondition: Send + Sync {
    fn is_ready(&self) -> bool;
}

/// Inert precondition: always ready.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysReady;

impl UploadPrecondition for AlwaysReady {
    fn is_ready(&self) -> bool {
        true
    }
}

/// Reachability reported by the host platform.
#[derive(Debug)]
pub struct ReachabilityFlag {
    reachable: AtomicBool,
}

impl ReachabilityFlag {
    pub fn new(reachable: bool) -> Self {
        ReachabilityFlag {
            reachable: AtomicBool::new(reachable),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

impl Default for ReachabilityFlag {
    fn default() -> Self {
        Self::new(true)
    }
}

impl UploadPrecondition for ReachabilityFlag {
    fn is_ready(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachability_toggles() {
        let flag = ReachabilityFlag::default();
        assert!(flag.is_ready());
        flag.set_reachable(false);
        assert!(!flag.is_ready());
        assert!(AlwaysReady.is_ready());
    }
}
