//! Worker lifecycle: spawning, recycling, replacement, and the periodic
//! scale-up/scale-down evaluation.

use crate::{
    Error,
    pool::{
        coordinator::Coordinator,
        messages::{ExitReason, PoolEvent, WorkerRequest},
        state::{InflightTask, WorkerHandle, WorkerId, WorkerPhase},
        worker::worker_loop,
    },
};
use core::time::Duration;
use std::{sync::Arc, time::Instant};
use tokio::sync::{mpsc, oneshot};

/// How long a retiring worker gets to acknowledge a shutdown request before
/// its task is aborted outright.
const SHUTDOWN_ACK_TIMEOUT: Duration = Duration::from_secs(3);

/// Consecutive startup failures after which immediate respawning stops and
/// the pool falls back to one retry per health tick. Throttles a provider
/// whose warm-up fails persistently.
const MAX_STARTUP_FAILURES: u32 = 3;

impl Coordinator {
    /// Spawns a worker in the `Starting` phase.
    ///
    /// The worker accepts no work until it reports ready; a startup deadline
    /// turns a wedged spawn into an explicit [`PoolEvent::SpawnTimeout`]
    /// instead of leaving a half-initialized worker in the map.
    pub(super) fn spawn_worker(&mut self) {
        if self.state.workers.len() >= self.config.max_workers {
            return;
        }
        let worker_id = self.state.allocate_worker_id();
        let (tx, rx) = mpsc::channel(1);
        let join = tokio::spawn(worker_loop(
            worker_id,
            rx,
            Arc::clone(&self.provider),
            self.event_tx.clone(),
        ));
        let spawn_deadline = {
            let events = self.event_tx.clone();
            let timeout = self.config.spawn_timeout;
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = events.send(PoolEvent::SpawnTimeout { worker_id }).await;
            })
        };

        #[cfg(feature = "tracing")]
        tracing::debug!("Spawning worker {worker_id}");

        self.state.workers.insert(
            worker_id,
            WorkerHandle {
                id: worker_id,
                tx,
                join,
                phase: WorkerPhase::Starting,
                job_count: 0,
                last_activity: Instant::now(),
                inflight: None,
                spawn_deadline: Some(spawn_deadline),
            },
        );
    }

    pub(super) fn on_worker_ready(&mut self, worker_id: WorkerId) {
        if self.state.draining {
            self.retire_worker(worker_id);
            return;
        }
        let Some(worker) = self.state.workers.get_mut(&worker_id) else {
            // Already removed, e.g. by a spawn timeout that raced the ready
            // signal.
            return;
        };
        if worker.phase != WorkerPhase::Starting {
            return;
        }
        worker.phase = WorkerPhase::Idle;
        worker.last_activity = Instant::now();
        if let Some(deadline) = worker.spawn_deadline.take() {
            deadline.abort();
        }
        self.state.startup_failures = 0;

        #[cfg(feature = "tracing")]
        tracing::debug!("Worker {worker_id} ready");

        self.dispatch();
    }

    /// A tracked worker's task ended on its own. Graceful exits of workers
    /// the coordinator already retired arrive here too and are ignored
    /// because the id is no longer in the map.
    pub(super) fn on_worker_exited(&mut self, worker_id: WorkerId, _reason: ExitReason) {
        let was_starting = self
            .state
            .workers
            .get(&worker_id)
            .map(|worker| worker.phase == WorkerPhase::Starting);
        let Some(was_starting) = was_starting else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::error!("Worker {worker_id} exited unexpectedly ({_reason:?})");

        if let Some(inflight) = self.force_remove_worker(worker_id) {
            let (task, _took) = inflight.into_task();
            self.state.record_error();
            task.resolve(Err(Error::WorkerCrash));
        }
        if was_starting {
            self.state.startup_failures += 1;
        }

        // Replace unless shutting down; the typed reason exists so this
        // decision never has to be inferred from exit codes.
        if self.state.draining {
            self.check_drain_complete();
            return;
        }
        if was_starting && self.state.startup_failures >= MAX_STARTUP_FAILURES {
            #[cfg(feature = "tracing")]
            tracing::error!(
                "{} consecutive startup failures; deferring respawn to the health sweep",
                self.state.startup_failures
            );
        } else {
            self.spawn_worker();
        }
        self.dispatch();
    }

    pub(super) fn on_spawn_timeout(&mut self, worker_id: WorkerId) {
        let still_starting = self
            .state
            .workers
            .get(&worker_id)
            .is_some_and(|worker| worker.phase == WorkerPhase::Starting);
        if !still_starting {
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::error!(
            "Worker {worker_id} failed to start within {:?}",
            self.config.spawn_timeout
        );

        self.force_remove_worker(worker_id);
        if self.state.draining {
            return;
        }
        if self.state.workers.len() < self.config.min_workers {
            self.spawn_worker();
        }
        // Queued tasks must not wait for the next maintenance tick; dispatch
        // spawns a fresh attempt if the queue demands one.
        self.dispatch();
    }

    /// A worker hit its job quota: retire it gracefully and warm up a fresh
    /// replacement. Bounds slow memory growth inside long-lived workers
    /// without requiring the compute function to be leak-free.
    pub(super) fn recycle_worker(&mut self, worker_id: WorkerId) {
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Recycling worker {worker_id} after {} jobs",
            self.config.max_jobs_per_worker
        );
        self.retire_worker(worker_id);
        self.spawn_worker();
    }

    /// Gracefully terminates a worker that is not executing anything:
    /// shutdown request first, abort as a backstop if the ack does not arrive
    /// in time.
    pub(super) fn retire_worker(&mut self, worker_id: WorkerId) {
        let Some(mut worker) = self.state.workers.remove(&worker_id) else {
            return;
        };
        debug_assert!(worker.inflight.is_none(), "retiring a busy worker");
        worker.disarm();

        let (ack, ack_rx) = oneshot::channel();
        match worker.tx.try_send(WorkerRequest::Shutdown { ack }) {
            Ok(()) => {
                let join = worker.join;
                tokio::spawn(async move {
                    if tokio::time::timeout(SHUTDOWN_ACK_TIMEOUT, ack_rx)
                        .await
                        .is_err()
                    {
                        #[cfg(feature = "tracing")]
                        tracing::warn!("Worker {worker_id} shutdown timed out");
                        join.abort();
                    }
                });
            }
            Err(_e) => {
                worker.join.abort();
            }
        }
    }

    /// Whether immediate respawning is suspended after repeated startup
    /// failures. While throttled, only the health sweep attempts new spawns.
    pub(super) fn startup_throttled(&self) -> bool {
        self.state.startup_failures >= MAX_STARTUP_FAILURES
    }

    /// Unconditionally removes and aborts a worker, handing any in-flight
    /// task back to the caller for resolution.
    pub(super) fn force_remove_worker(&mut self, worker_id: WorkerId) -> Option<InflightTask> {
        let mut worker = self.state.workers.remove(&worker_id)?;
        worker.disarm();
        let inflight = worker.inflight.take();
        worker.join.abort();
        inflight
    }

    /// Periodic sizing pass: one worker up when the queue is backed up and
    /// everyone is busy, one idle worker down when the queue is empty and the
    /// pool is above `min_workers`. Sizes the pool to recent demand while
    /// keeping `min_workers` warm for bursts.
    pub(super) fn evaluate_scaling(&mut self) {
        if self.state.draining {
            return;
        }
        let live = self.state.workers.len();
        if !self.state.queue.is_empty()
            && self.state.busy_workers() == live
            && live < self.config.max_workers
            && !self.startup_throttled()
        {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Scaling up: {} queued, {live} workers all busy",
                self.state.queue.len()
            );
            self.spawn_worker();
        } else if self.state.queue.is_empty() && live > self.config.min_workers {
            if let Some(worker_id) = self.state.any_idle_worker() {
                #[cfg(feature = "tracing")]
                tracing::debug!("Scaling down: retiring idle worker {worker_id}");
                self.retire_worker(worker_id);
            }
        }
    }
}
