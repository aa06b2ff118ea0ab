//! Bookkeeping owned exclusively by the coordinator task.
//!
//! [`PoolState`] is the single-writer aggregate of the worker map and the
//! FIFO task queue. Workers and timers propose mutations through
//! [`PoolEvent`](crate::pool::messages::PoolEvent)s; nothing else writes
//! here, which is what makes the pool lock-free on its own state.

use crate::{
    PoolStats,
    pool::messages::WorkerRequest,
    task::{PendingTask, TaskId},
};
use core::time::Duration;
use std::{
    collections::{HashMap, VecDeque},
    time::Instant,
};
use tokio::{sync::mpsc, task::JoinHandle};

pub(crate) type WorkerId = u64;

/// Where a worker is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerPhase {
    /// Spawned, provider still initializing; accepts no work yet.
    Starting,
    /// Ready and waiting for a job.
    Idle,
    /// Executing exactly one job.
    Busy,
}

/// A dispatched task occupying a worker, together with its deadline timer.
pub(crate) struct InflightTask {
    pub task: PendingTask,
    pub dispatched_at: Instant,
    /// Timer task that fires a `DispatchTimeout` event; aborted on
    /// completion.
    pub deadline: JoinHandle<()>,
}

impl InflightTask {
    /// Disarms the deadline and yields the task for resolution.
    pub fn into_task(self) -> (PendingTask, Duration) {
        self.deadline.abort();
        (self.task, self.dispatched_at.elapsed())
    }
}

/// Coordinator-side record of a single worker.
///
/// Invariant: `inflight` is `Some` iff `phase == Busy`, and at most one task
/// references a given worker at any time.
pub(crate) struct WorkerHandle {
    pub id: WorkerId,
    pub tx: mpsc::Sender<WorkerRequest>,
    pub join: JoinHandle<()>,
    pub phase: WorkerPhase,
    pub job_count: u32,
    pub last_activity: Instant,
    pub inflight: Option<InflightTask>,
    /// Startup deadline timer; aborted once the worker reports ready.
    pub spawn_deadline: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn is_idle(&self) -> bool {
        self.phase == WorkerPhase::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.phase == WorkerPhase::Busy
    }

    /// Aborts every auxiliary timer attached to this worker.
    pub fn disarm(&mut self) {
        if let Some(deadline) = self.spawn_deadline.take() {
            deadline.abort();
        }
        if let Some(inflight) = &self.inflight {
            inflight.deadline.abort();
        }
    }
}

/// The aggregate the coordinator owns: worker map, FIFO queue, counters.
pub(crate) struct PoolState {
    pub workers: HashMap<WorkerId, WorkerHandle>,
    pub queue: VecDeque<PendingTask>,
    pub draining: bool,
    /// Consecutive worker startup failures; reset by the first ready worker.
    pub startup_failures: u32,
    next_worker_id: WorkerId,
    next_task_id: TaskId,
    total_completed: u64,
    total_errors: u64,
    total_duration: Duration,
}

impl PoolState {
    pub fn new() -> Self {
        Self {
            workers: HashMap::new(),
            queue: VecDeque::new(),
            draining: false,
            startup_failures: 0,
            next_worker_id: 0,
            next_task_id: 0,
            total_completed: 0,
            total_errors: 0,
            total_duration: Duration::ZERO,
        }
    }

    pub fn allocate_worker_id(&mut self) -> WorkerId {
        self.next_worker_id += 1;
        self.next_worker_id
    }

    pub fn allocate_task_id(&mut self) -> TaskId {
        self.next_task_id += 1;
        self.next_task_id
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.values().filter(|w| w.is_busy()).count()
    }

    pub fn starting_workers(&self) -> usize {
        self.workers
            .values()
            .filter(|w| w.phase == WorkerPhase::Starting)
            .count()
    }

    /// Picks any ready worker that has recycling headroom left.
    pub fn pick_idle_worker(&self, max_jobs_per_worker: u32) -> Option<WorkerId> {
        self.workers
            .values()
            .find(|w| w.is_idle() && w.job_count < max_jobs_per_worker)
            .map(|w| w.id)
    }

    /// Picks any ready worker, used by scale-down and recycling.
    pub fn any_idle_worker(&self) -> Option<WorkerId> {
        self.workers.values().find(|w| w.is_idle()).map(|w| w.id)
    }

    pub fn record_completion(&mut self, took: Duration) {
        self.total_completed += 1;
        self.total_duration += took;
    }

    pub fn record_error(&mut self) {
        self.total_errors += 1;
    }

    pub fn stats(&self) -> PoolStats {
        let average_duration_ms = if self.total_completed == 0 {
            0.0
        } else {
            self.total_duration.as_secs_f64() * 1_000.0 / self.total_completed as f64
        };
        PoolStats {
            workers: self.workers.len(),
            busy_workers: self.busy_workers(),
            queue_length: self.queue.len(),
            total_completed: self.total_completed,
            total_errors: self.total_errors,
            average_duration_ms,
        }
    }
}
