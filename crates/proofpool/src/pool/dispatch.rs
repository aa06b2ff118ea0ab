//! Dispatching: matching queued tasks to idle workers and policing the
//! per-task deadline.

use crate::{
    ComputeError, Error, ProofResponse,
    pool::{
        coordinator::Coordinator,
        messages::{PoolEvent, WorkerRequest},
        state::{InflightTask, WorkerId, WorkerPhase},
    },
    task::{PendingTask, TaskId},
};
use std::time::Instant;

impl Coordinator {
    /// Drains the queue onto idle workers, FIFO.
    ///
    /// Stops as soon as no eligible worker is left; if the pool still has
    /// headroom, one spare worker is requested and dispatch resumes when its
    /// ready event arrives. At `max_workers`, tasks simply stay queued.
    pub(super) fn dispatch(&mut self) {
        if self.state.draining {
            return;
        }
        while !self.state.queue.is_empty() {
            match self.state.pick_idle_worker(self.config.max_jobs_per_worker) {
                Some(worker_id) => {
                    let Some(task) = self.state.queue.pop_front() else {
                        return;
                    };
                    self.assign(worker_id, task);
                }
                None => {
                    if self.state.workers.len() < self.config.max_workers
                        && self.state.starting_workers() == 0
                        && !self.startup_throttled()
                    {
                        self.spawn_worker();
                    }
                    return;
                }
            }
        }
    }

    /// Hands one task to one idle worker and arms its deadline.
    fn assign(&mut self, worker_id: WorkerId, task: PendingTask) {
        let task_id = task.id;
        let events = self.event_tx.clone();
        let timeout = self.config.worker_timeout;

        let Some(worker) = self.state.workers.get_mut(&worker_id) else {
            self.state.queue.push_front(task);
            return;
        };

        // The worker channel has capacity 1 and an idle worker's channel is
        // empty, so a failed send means the worker is gone or wedged.
        if worker
            .tx
            .try_send(WorkerRequest::Job {
                task_id,
                request: task.request.clone(),
            })
            .is_err()
        {
            #[cfg(feature = "tracing")]
            tracing::warn!("Worker {worker_id} refused a job; replacing it");
            self.state.queue.push_front(task);
            self.force_remove_worker(worker_id);
            if !self.state.draining {
                self.spawn_worker();
            }
            return;
        }

        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = events
                .send(PoolEvent::DispatchTimeout { worker_id, task_id })
                .await;
        });

        let _queued_for = task.created_at.elapsed();
        #[cfg(feature = "tracing")]
        tracing::trace!(
            "Task {task_id} dispatched to worker {worker_id} after {_queued_for:?} in queue"
        );

        let Some(worker) = self.state.workers.get_mut(&worker_id) else {
            deadline.abort();
            self.state.queue.push_front(task);
            return;
        };
        worker.phase = WorkerPhase::Busy;
        worker.last_activity = Instant::now();
        worker.inflight = Some(InflightTask {
            task,
            dispatched_at: Instant::now(),
            deadline,
        });
    }

    /// Applies a worker's completion report: resolve the task, free the
    /// worker, and immediately re-run dispatch so the freed worker is reused
    /// before any new one is spawned.
    pub(super) fn on_job_finished(
        &mut self,
        worker_id: WorkerId,
        task_id: TaskId,
        outcome: core::result::Result<ProofResponse, ComputeError>,
    ) {
        let (task, took, recycle) = {
            let Some(worker) = self.state.workers.get_mut(&worker_id) else {
                // Late report from a worker that was already replaced.
                return;
            };
            if !worker
                .inflight
                .as_ref()
                .is_some_and(|inflight| inflight.task.id == task_id)
            {
                return;
            }
            let Some(inflight) = worker.inflight.take() else {
                return;
            };
            let (task, took) = inflight.into_task();
            worker.phase = WorkerPhase::Idle;
            worker.job_count += 1;
            worker.last_activity = Instant::now();
            (task, took, worker.job_count >= self.config.max_jobs_per_worker)
        };

        match outcome {
            Ok(response) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Task {task_id} completed by worker {worker_id} in {took:?}");
                self.state.record_completion(took);
                task.resolve(Ok(response));
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Task {task_id} failed on worker {worker_id}: {err}");
                self.state.record_error();
                task.resolve(Err(Error::Compute(err)));
            }
        }

        if self.state.draining {
            self.retire_worker(worker_id);
            self.check_drain_complete();
            return;
        }

        if recycle {
            self.recycle_worker(worker_id);
        }
        self.dispatch();
    }

    /// The per-task deadline elapsed. The task fails with `Timeout` and the
    /// worker is discarded: with no cancellation hook into the compute
    /// function, its in-flight state is presumed stuck or corrupt.
    pub(super) fn on_dispatch_timeout(&mut self, worker_id: WorkerId, task_id: TaskId) {
        let current = self
            .state
            .workers
            .get(&worker_id)
            .and_then(|worker| worker.inflight.as_ref())
            .map(|inflight| inflight.task.id);
        if current != Some(task_id) {
            // The job finished while the timeout event was in flight.
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::warn!(
            "Task {task_id} timed out after {:?}; replacing worker {worker_id}",
            self.config.worker_timeout
        );

        if let Some(inflight) = self.force_remove_worker(worker_id) {
            let (task, _took) = inflight.into_task();
            self.state.record_error();
            task.resolve(Err(Error::Timeout {
                timeout_ms: self.config.worker_timeout.as_millis() as u64,
            }));
        }

        if self.state.draining {
            self.check_drain_complete();
            return;
        }
        self.spawn_worker();
        self.dispatch();
    }
}
