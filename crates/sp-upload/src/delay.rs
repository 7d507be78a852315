//! Adaptive delay between upload cycles.
//!
//! The delay shrinks by 10% after a cycle that removed a batch (drain a
//! backlog faster) and grows by 10% after an idle, blocked or failed cycle
//! (avoid polling an empty queue or an unhealthy server). It always stays
//! within `[min, max]`.

use std::time::Duration;

use sp_common::UploadConfig;

const INCREASE_FACTOR: f64 = 1.1;
const DECREASE_FACTOR: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct DelayPolicy {
    min: Duration,
    max: Duration,
    current: Duration,
}

impl DelayPolicy {
    /// `default` is clamped into `[min, max]`.
    pub fn new(min: Duration, default: Duration, max: Duration) -> Self {
        let max = max.max(min);
        DelayPolicy {
            min,
            max,
            current: default.clamp(min, max),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.min_delay(), config.default_delay(), config.max_delay())
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn min(&self) -> Duration {
        self.min
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn increase(&mut self) -> Duration {
        self.current = self.current.mul_f64(INCREASE_FACTOR).min(self.max);
        self.current
    }

    pub fn decrease(&mut self) -> Duration {
        self.current = self.current.mul_f64(DECREASE_FACTOR).max(self.min);
        self.current
    }
}
