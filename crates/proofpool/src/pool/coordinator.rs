//! The single-threaded control loop that owns all mutable pool state.
//!
//! The coordinator is the only writer of the worker map and the task queue.
//! Commands from pool handles, completion reports from workers, and timer
//! expiries all arrive as messages and are applied one at a time, which keeps
//! the bookkeeping lock-free while the expensive jobs themselves run in
//! parallel on blocking threads.
//!
//! Dispatching lives in [`dispatch`](super::dispatch), worker lifecycle in
//! [`lifecycle`](super::lifecycle), and the periodic sweep in
//! [`health`](super::health); they are all `impl Coordinator` blocks
//! operating on the state defined here.

use crate::{
    Error, MemoryMonitor, PoolConfig, ProofProvider, ProofRequest, ProofResponse, Result,
    memory::{AdmissionDecision, admission_decision},
    pool::{
        messages::{PoolCommand, PoolEvent},
        state::{PoolState, WorkerId},
    },
    task::PendingTask,
};
use core::time::Duration;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

/// In-progress graceful shutdown.
pub(super) struct DrainState {
    /// Every `shutdown` caller waiting for the drain to finish.
    pub replies: Vec<oneshot::Sender<()>>,
    /// Timer that fires [`PoolEvent::DrainExpired`]; aborted if the drain
    /// completes first.
    pub timer: JoinHandle<()>,
}

pub(crate) struct Coordinator {
    pub(super) config: PoolConfig,
    pub(super) provider: Arc<dyn ProofProvider>,
    pub(super) memory: Arc<dyn MemoryMonitor>,
    pub(super) state: PoolState,
    pub(super) cmd_rx: mpsc::Receiver<PoolCommand>,
    /// Kept alive (and cloned into workers and timers) so the event channel
    /// never closes while the coordinator runs.
    pub(super) event_tx: mpsc::Sender<PoolEvent>,
    pub(super) event_rx: mpsc::Receiver<PoolEvent>,
    pub(super) shutdown_token: CancellationToken,
    pub(super) drain: Option<DrainState>,
}

impl Coordinator {
    pub fn new(
        config: PoolConfig,
        provider: Arc<dyn ProofProvider>,
        memory: Arc<dyn MemoryMonitor>,
        cmd_rx: mpsc::Receiver<PoolCommand>,
        event_tx: mpsc::Sender<PoolEvent>,
        event_rx: mpsc::Receiver<PoolEvent>,
        shutdown_token: CancellationToken,
    ) -> Self {
        Self {
            config,
            provider,
            memory,
            state: PoolState::new(),
            cmd_rx,
            event_tx,
            event_rx,
            shutdown_token,
            drain: None,
        }
    }

    /// Runs the control loop until every pool handle has been dropped.
    ///
    /// The loop multiplexes the command channel, the worker event channel,
    /// and the two maintenance tickers. Handlers are synchronous; anything
    /// that needs to wait (deadlines, drain windows, shutdown acks) is a
    /// spawned task that reports back through the event channel.
    pub async fn run(mut self) {
        for _ in 0..self.config.min_workers {
            self.spawn_worker();
        }

        let mut scale_tick = tokio::time::interval(self.config.scale_interval);
        scale_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut health_tick = tokio::time::interval(self.config.health_check_interval);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.cmd_rx.recv() => match command {
                    Some(command) => self.handle_command(command),
                    // Every handle is gone; no caller can observe the pool
                    // anymore.
                    None => break,
                },
                event = self.event_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_event(event);
                    }
                }
                _ = scale_tick.tick() => self.evaluate_scaling(),
                _ = health_tick.tick() => self.run_health_sweep(),
            }
        }

        self.teardown();
    }

    fn handle_command(&mut self, command: PoolCommand) {
        match command {
            PoolCommand::Submit {
                request,
                completion,
            } => self.handle_submit(request, completion),
            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.state.stats());
            }
            PoolCommand::Shutdown {
                drain_timeout,
                reply,
            } => self.begin_shutdown(drain_timeout, reply),
        }
    }

    fn handle_event(&mut self, event: PoolEvent) {
        match event {
            PoolEvent::WorkerReady { worker_id } => self.on_worker_ready(worker_id),
            PoolEvent::JobFinished {
                worker_id,
                task_id,
                outcome,
            } => self.on_job_finished(worker_id, task_id, outcome),
            PoolEvent::WorkerExited { worker_id, reason } => {
                self.on_worker_exited(worker_id, reason);
            }
            PoolEvent::DispatchTimeout { worker_id, task_id } => {
                self.on_dispatch_timeout(worker_id, task_id);
            }
            PoolEvent::SpawnTimeout { worker_id } => self.on_spawn_timeout(worker_id),
            PoolEvent::DrainExpired => self.on_drain_expired(),
        }
    }

    /// Admission control plus enqueue. Synchronous and non-blocking: the
    /// memory check is a local comparison, and a rejection resolves the
    /// caller's completion handle without the task ever entering the queue.
    fn handle_submit(
        &mut self,
        request: ProofRequest,
        completion: oneshot::Sender<Result<ProofResponse>>,
    ) {
        if self.state.draining {
            self.state.record_error();
            let _ = completion.send(Err(Error::Shutdown));
            return;
        }

        if let Err(err) = request.validate(self.config.max_payload_bytes) {
            self.state.record_error();
            let _ = completion.send(Err(err));
            return;
        }

        match admission_decision(
            self.memory.used_bytes(),
            self.config.memory_threshold_bytes,
        ) {
            AdmissionDecision::Admit => {}
            AdmissionDecision::AdmitWithWarning { used: _used } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Memory usage {_used} of {} elevated; still admitting work",
                    self.config.memory_threshold_bytes
                );
            }
            AdmissionDecision::Reject { used: _used } => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Memory usage {_used} of {} critical; rejecting submission",
                    self.config.memory_threshold_bytes
                );
                self.state.record_error();
                let _ = completion.send(Err(Error::ResourceExhausted));
                return;
            }
        }

        let task_id = self.state.allocate_task_id();
        self.state
            .queue
            .push_back(PendingTask::new(task_id, request, completion));
        self.dispatch();
    }

    /// Starts the drain: new and queued work is rejected with `Shutdown`,
    /// idle workers are retired immediately, and busy workers get until the
    /// drain window closes to finish their job.
    fn begin_shutdown(&mut self, drain_timeout: Duration, reply: oneshot::Sender<()>) {
        if self.state.draining {
            match &mut self.drain {
                // Another caller is already draining; resolve together.
                Some(drain) => drain.replies.push(reply),
                // Drain already finished.
                None => {
                    let _ = reply.send(());
                }
            }
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Shutdown initiated; draining {} busy workers for up to {drain_timeout:?}",
            self.state.busy_workers()
        );

        self.state.draining = true;
        self.shutdown_token.cancel();

        // No queued task is dispatched once shutdown has begun.
        while let Some(task) = self.state.queue.pop_front() {
            self.state.record_error();
            task.resolve(Err(Error::Shutdown));
        }

        let not_busy: Vec<WorkerId> = self
            .state
            .workers
            .values()
            .filter(|w| !w.is_busy())
            .map(|w| w.id)
            .collect();
        for worker_id in not_busy {
            self.retire_worker(worker_id);
        }

        let timer = {
            let events = self.event_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(drain_timeout).await;
                let _ = events.send(PoolEvent::DrainExpired).await;
            })
        };
        self.drain = Some(DrainState {
            replies: vec![reply],
            timer,
        });
        self.check_drain_complete();
    }

    fn on_drain_expired(&mut self) {
        if self.drain.is_some() {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Drain window expired with {} workers still busy",
                self.state.busy_workers()
            );
            self.finish_drain();
        }
    }

    /// Completes the drain once no worker is busy anymore.
    pub(super) fn check_drain_complete(&mut self) {
        if self.drain.is_some() && self.state.busy_workers() == 0 {
            self.finish_drain();
        }
    }

    /// Force-terminates whatever is left and resolves the shutdown replies.
    /// After this, `stats()` reports zero workers but remains answerable.
    pub(super) fn finish_drain(&mut self) {
        let Some(drain) = self.drain.take() else {
            return;
        };
        drain.timer.abort();

        let worker_ids: Vec<WorkerId> = self.state.workers.keys().copied().collect();
        for worker_id in worker_ids {
            if let Some(inflight) = self.force_remove_worker(worker_id) {
                let (task, _took) = inflight.into_task();
                self.state.record_error();
                task.resolve(Err(Error::Shutdown));
            }
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Pool shutdown complete");

        for reply in drain.replies {
            let _ = reply.send(());
        }
    }

    /// Last-resort cleanup when every pool handle has been dropped without an
    /// explicit shutdown.
    fn teardown(mut self) {
        while let Some(task) = self.state.queue.pop_front() {
            task.resolve(Err(Error::Shutdown));
        }
        for (_, mut worker) in self.state.workers.drain() {
            worker.disarm();
            if let Some(inflight) = worker.inflight.take() {
                let (task, _took) = inflight.into_task();
                task.resolve(Err(Error::Shutdown));
            }
            worker.join.abort();
        }
        if let Some(drain) = self.drain.take() {
            drain.timer.abort();
            for reply in drain.replies {
                let _ = reply.send(());
            }
        }
    }
}
