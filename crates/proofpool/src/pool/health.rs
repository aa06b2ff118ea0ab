//! Periodic health sweep, independent of task flow.

use crate::{
    Error,
    memory::{AdmissionDecision, admission_decision},
    pool::{coordinator::Coordinator, state::WorkerId},
};
use std::time::Instant;

impl Coordinator {
    /// Two checks on a fixed interval.
    ///
    /// Stuck workers: a backstop for the per-task deadline timer. Any busy
    /// worker whose last activity predates `worker_timeout` has its task
    /// failed with `Timeout` and is replaced.
    ///
    /// Memory pressure: at or above the critical fraction, every queued (not
    /// yet dispatched) task is rejected with `ResourceExhausted`, converting
    /// an unbounded wait into an immediate, actionable failure.
    pub(super) fn run_health_sweep(&mut self) {
        if self.state.draining {
            return;
        }

        let now = Instant::now();
        let stuck: Vec<WorkerId> = self
            .state
            .workers
            .values()
            .filter(|worker| {
                worker.is_busy()
                    && now.duration_since(worker.last_activity) > self.config.worker_timeout
            })
            .map(|worker| worker.id)
            .collect();
        let replaced = !stuck.is_empty();

        for worker_id in stuck {
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {worker_id} looks stuck; replacing it");
            if let Some(inflight) = self.force_remove_worker(worker_id) {
                let (task, _took) = inflight.into_task();
                self.state.record_error();
                task.resolve(Err(Error::Timeout {
                    timeout_ms: self.config.worker_timeout.as_millis() as u64,
                }));
            }
            self.spawn_worker();
        }

        if let AdmissionDecision::Reject { used: _used } = admission_decision(
            self.memory.used_bytes(),
            self.config.memory_threshold_bytes,
        ) {
            if !self.state.queue.is_empty() {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Memory usage {_used} critical; shedding {} queued tasks",
                    self.state.queue.len()
                );
                while let Some(task) = self.state.queue.pop_front() {
                    self.state.record_error();
                    task.resolve(Err(Error::ResourceExhausted));
                }
            }
        }

        // Top the pool back up to its floor. This is also the retry path once
        // repeated startup failures have suspended immediate respawning, which
        // bounds the retry rate to one batch per sweep.
        for _ in self.state.workers.len()..self.config.min_workers {
            self.spawn_worker();
        }

        if replaced {
            self.dispatch();
        }
    }
}
