//! Pool configuration.
//!
//! A [`PoolConfig`] is supplied once at construction and is read-only for the
//! lifetime of the pool; runtime reconfiguration is explicitly out of scope.

use crate::{Error, Result};
use core::time::Duration;

/// Fraction of [`PoolConfig::memory_threshold_bytes`] above which submissions
/// are admitted with a warning.
pub const MEMORY_WARN_FRACTION: f64 = 0.80;

/// Fraction of [`PoolConfig::memory_threshold_bytes`] at or above which
/// submissions are rejected outright and queued work is shed.
pub const MEMORY_CRITICAL_FRACTION: f64 = 0.95;

/// Immutable configuration for a [`ProofPool`](crate::ProofPool).
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of workers kept warm at all times.
    pub min_workers: usize,
    /// Hard upper bound on the number of workers, including ones still
    /// starting up.
    pub max_workers: usize,
    /// Jobs a worker may complete before it is recycled. Bounds slow memory
    /// growth inside a long-lived worker.
    pub max_jobs_per_worker: u32,
    /// Per-dispatched-task deadline. On expiry the task fails with
    /// [`Error::Timeout`](crate::Error::Timeout) and the worker is replaced.
    pub worker_timeout: Duration,
    /// Memory usage bound that admission control compares against.
    pub memory_threshold_bytes: u64,
    /// How long a spawned worker may take to report ready before the spawn
    /// attempt is considered failed.
    pub spawn_timeout: Duration,
    /// Interval of the scale-up/scale-down evaluation.
    pub scale_interval: Duration,
    /// Interval of the stuck-worker and memory-pressure sweep.
    pub health_check_interval: Duration,
    /// Maximum accepted request payload size.
    pub max_payload_bytes: usize,
    /// Capacity of the internal command and event channels.
    pub event_buffer_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: num_cpus::get().max(1),
            max_jobs_per_worker: 32,
            worker_timeout: Duration::from_secs(120),
            memory_threshold_bytes: 4 * 1024 * 1024 * 1024,
            spawn_timeout: Duration::from_secs(30),
            scale_interval: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(10),
            max_payload_bytes: 16 * 1024 * 1024,
            event_buffer_size: 64,
        }
    }
}

impl PoolConfig {
    /// Checks the configuration for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if any bound is zero or inverted.
    pub fn validate(&self) -> Result<()> {
        if self.min_workers == 0 {
            return Err(invalid("min_workers must be at least 1"));
        }
        if self.max_workers < self.min_workers {
            return Err(invalid("max_workers must be >= min_workers"));
        }
        if self.max_jobs_per_worker == 0 {
            return Err(invalid("max_jobs_per_worker must be at least 1"));
        }
        if self.worker_timeout.is_zero() {
            return Err(invalid("worker_timeout must be non-zero"));
        }
        if self.spawn_timeout.is_zero() {
            return Err(invalid("spawn_timeout must be non-zero"));
        }
        if self.scale_interval.is_zero() || self.health_check_interval.is_zero() {
            return Err(invalid("maintenance intervals must be non-zero"));
        }
        if self.memory_threshold_bytes == 0 {
            return Err(invalid("memory_threshold_bytes must be non-zero"));
        }
        if self.max_payload_bytes == 0 {
            return Err(invalid("max_payload_bytes must be non-zero"));
        }
        if self.event_buffer_size == 0 {
            return Err(invalid("event_buffer_size must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> Error {
    Error::Validation {
        reason: reason.to_string(),
    }
}
