//! Pool statistics, polled by an external collector.

/// A point-in-time snapshot of pool state and lifetime counters.
///
/// The pool never pushes metrics; callers poll
/// [`ProofPool::stats`](crate::ProofPool::stats).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolStats {
    /// Live workers, including ones still starting up.
    pub workers: usize,
    /// Workers currently executing a job.
    pub busy_workers: usize,
    /// Tasks admitted but not yet dispatched.
    pub queue_length: usize,
    /// Tasks that resolved successfully since the pool was created.
    pub total_completed: u64,
    /// Tasks that resolved with any error, including admission rejections and
    /// shutdown rejections. Submissions turned away by the handle's fast path
    /// after shutdown never reach the coordinator and are not counted.
    pub total_errors: u64,
    /// Mean dispatch-to-completion time of successful tasks, in milliseconds.
    pub average_duration_ms: f64,
}
