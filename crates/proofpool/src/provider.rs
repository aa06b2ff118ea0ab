//! The compute provider contract.
//!
//! The pool schedules work; it does not know how to produce a proof. The
//! actual computation is an external collaborator implementing
//! [`ProofProvider`], assumed CPU-bound, memory-intensive, and without any
//! internal cancellation hook. Workers run both methods under
//! [`tokio::task::spawn_blocking`] so that N jobs execute with true
//! parallelism while the coordinator stays on a single logical task.

use crate::{ComputeError, ProofRequest, ProofResponse};

/// An opaque, synchronous proof computation.
///
/// A single shared instance is handed to every worker, so implementations
/// must be `Send + Sync`. A panic inside either method is treated as a worker
/// crash: the task fails with
/// [`Error::WorkerCrash`](crate::Error::WorkerCrash) and the worker is
/// replaced.
pub trait ProofProvider: Send + Sync + 'static {
    /// Per-worker warm-up, invoked once before the worker reports ready.
    ///
    /// Typical use is loading static proving material so that the first job
    /// dispatched to the worker does not pay the cold-start cost. The default
    /// does nothing.
    fn initialize(&self) -> core::result::Result<(), ComputeError> {
        Ok(())
    }

    /// Produces a proof for the given request, or a job-level failure.
    ///
    /// There is no cooperative cancellation: once invoked, the computation
    /// runs to completion even if the pool has already timed the task out and
    /// discarded the worker.
    fn prove(&self, request: &ProofRequest)
    -> core::result::Result<ProofResponse, ComputeError>;
}
