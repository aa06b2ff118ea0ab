//! Message types exchanged between the public handle, the coordinator, and
//! the workers.
//!
//! All pool state lives inside the coordinator task; every mutation is
//! expressed as one of these messages and applied one at a time. Workers hold
//! no references into coordinator state.

use crate::{
    ComputeError, PoolStats, ProofRequest, ProofResponse, Result,
    pool::state::WorkerId,
    task::TaskId,
};
use core::time::Duration;
use tokio::sync::oneshot;

/// Commands sent from a [`ProofPool`](crate::ProofPool) handle to the
/// coordinator.
pub(crate) enum PoolCommand {
    /// Submit a job. The sender half doubles as the task's single-resolution
    /// completion handle.
    Submit {
        request: ProofRequest,
        completion: oneshot::Sender<Result<ProofResponse>>,
    },
    /// Snapshot the pool statistics.
    Stats { reply: oneshot::Sender<PoolStats> },
    /// Initiate graceful drain and shutdown.
    Shutdown {
        drain_timeout: Duration,
        reply: oneshot::Sender<()>,
    },
}

/// Requests sent from the coordinator to a single worker over its bounded
/// channel (capacity 1: at most one in-flight request per worker).
pub(crate) enum WorkerRequest {
    /// Execute one job and report back.
    Job {
        task_id: TaskId,
        request: ProofRequest,
    },
    /// Stop after acknowledging.
    Shutdown { ack: oneshot::Sender<()> },
}

/// Why a worker left the pool, made explicit rather than inferred from exit
/// codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ExitReason {
    /// The worker drained its channel or honored a shutdown request.
    Graceful,
    /// The worker hit a panic or failed to initialize.
    Crashed,
}

/// Events delivered to the coordinator from workers and timer tasks.
pub(crate) enum PoolEvent {
    /// The worker finished initializing and can accept work.
    WorkerReady { worker_id: WorkerId },
    /// The worker finished a job, successfully or not. The worker itself is
    /// still healthy either way.
    JobFinished {
        worker_id: WorkerId,
        task_id: TaskId,
        outcome: core::result::Result<ProofResponse, ComputeError>,
    },
    /// The worker's task ended.
    WorkerExited {
        worker_id: WorkerId,
        reason: ExitReason,
    },
    /// A dispatched task's deadline elapsed before the worker responded.
    DispatchTimeout {
        worker_id: WorkerId,
        task_id: TaskId,
    },
    /// A spawned worker failed to report ready within the startup timeout.
    SpawnTimeout { worker_id: WorkerId },
    /// The shutdown drain window elapsed with workers still busy.
    DrainExpired,
}
