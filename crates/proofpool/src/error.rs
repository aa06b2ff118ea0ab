//! Error types for the proof generation pool.
//!
//! This module defines the central `Error` enum, which captures all
//! caller-visible failure cases of the pool.
//!
//! ## Error Cases
//! - `Validation`: The request was malformed and never entered the queue.
//! - `ResourceExhausted`: Admission control rejected the request due to memory
//!   pressure.
//! - `Timeout`: The worker executing the job did not respond in time.
//! - `WorkerCrash`: The worker executing the job terminated unexpectedly.
//! - `Compute`: The proof provider reported a job-level failure.
//! - `Shutdown`: The request was rejected because the pool is draining or has
//!   already shut down.
//! - `Channel`: An internal communication failure between tasks or workers.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the proof generation pool.
///
/// A task-level failure resolves only the completion handle of the task it
/// belongs to. It never affects other queued or in-flight tasks, and the pool
/// itself never terminates because of one.
#[derive(Clone, thiserror::Error, Debug)]
pub enum Error {
    /// The request was malformed or exceeded constraints.
    #[error("Invalid request: {reason}")]
    Validation { reason: String },

    /// Memory pressure is too high to accept new work. Callers should back
    /// off and retry later.
    #[error("Memory pressure too high to accept new work")]
    ResourceExhausted,

    /// The worker failed to respond within the configured timeout. The task
    /// fails and the responsible worker is replaced.
    #[error("Worker did not respond within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The worker exited unexpectedly while executing the job.
    #[error("Worker crashed while executing the job")]
    WorkerCrash,

    /// The proof provider reported a job-level failure. The worker stays
    /// alive; only this task fails.
    #[error("Proof generation failed: {0}")]
    Compute(#[from] ComputeError),

    /// The pool is draining or has already shut down.
    #[error("Pool is shutting down")]
    Shutdown,

    /// Internal channel send/receive failure (e.g., a dropped handle).
    #[error("Channel error: {context}")]
    Channel { context: String },
}

/// A failure reported by the opaque compute function.
///
/// The pool treats the provider as a black box, so the only structure it
/// carries is a human-readable reason.
#[derive(Clone, thiserror::Error, Debug)]
#[error("{reason}")]
pub struct ComputeError {
    pub reason: String,
}

impl ComputeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
