//! Worker task responsible for executing [`WorkerRequest`] messages.
//!
//! Each worker is an isolated execution unit: it receives exactly one job at
//! a time over its MPSC channel, runs the opaque compute function under
//! [`tokio::task::spawn_blocking`], and reports the outcome back to the
//! coordinator as a [`PoolEvent`]. A worker never mutates pool state
//! directly, which is what lets a single worker crash be handled as a local,
//! recoverable event.

use crate::{
    pool::{
        messages::{ExitReason, PoolEvent, WorkerRequest},
        state::WorkerId,
    },
    provider::ProofProvider,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Runs one worker until its channel closes, it crashes, or it is asked to
/// shut down.
///
/// Startup performs the provider's per-worker warm-up before reporting
/// ready; a failed or panicking warm-up exits with [`ExitReason::Crashed`]
/// and the worker never accepts work.
pub(crate) async fn worker_loop(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<WorkerRequest>,
    provider: Arc<dyn ProofProvider>,
    events: mpsc::Sender<PoolEvent>,
) {
    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} started");

    let init = {
        let provider = Arc::clone(&provider);
        tokio::task::spawn_blocking(move || provider.initialize()).await
    };
    match init {
        Ok(Ok(())) => {
            if events
                .send(PoolEvent::WorkerReady { worker_id })
                .await
                .is_err()
            {
                // Coordinator is gone; nothing left to do.
                return;
            }
        }
        Ok(Err(_e)) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {worker_id} failed to initialize: {_e}");
            let _ = events
                .send(PoolEvent::WorkerExited {
                    worker_id,
                    reason: ExitReason::Crashed,
                })
                .await;
            return;
        }
        Err(_join) => {
            #[cfg(feature = "tracing")]
            tracing::error!("Worker {worker_id} panicked during initialization");
            let _ = events
                .send(PoolEvent::WorkerExited {
                    worker_id,
                    reason: ExitReason::Crashed,
                })
                .await;
            return;
        }
    }

    while let Some(request) = rx.recv().await {
        match request {
            WorkerRequest::Job { task_id, request } => {
                let outcome = {
                    let provider = Arc::clone(&provider);
                    tokio::task::spawn_blocking(move || provider.prove(&request)).await
                };
                match outcome {
                    Ok(outcome) => {
                        if events
                            .send(PoolEvent::JobFinished {
                                worker_id,
                                task_id,
                                outcome,
                            })
                            .await
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_join) => {
                        // A panic inside the compute function. The worker is
                        // presumed corrupt and exits; the coordinator fails
                        // the task and spawns a replacement.
                        #[cfg(feature = "tracing")]
                        tracing::error!("Worker {worker_id} crashed executing task {task_id}");
                        let _ = events
                            .send(PoolEvent::WorkerExited {
                                worker_id,
                                reason: ExitReason::Crashed,
                            })
                            .await;
                        return;
                    }
                }
            }
            WorkerRequest::Shutdown { ack } => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Worker {worker_id} received shutdown signal");
                if ack.send(()).is_err() {
                    #[cfg(feature = "tracing")]
                    tracing::trace!("Worker {worker_id} shutdown ack receiver dropped");
                }
                break;
            }
        }
    }

    let _ = events
        .send(PoolEvent::WorkerExited {
            worker_id,
            reason: ExitReason::Graceful,
        })
        .await;

    #[cfg(feature = "tracing")]
    tracing::trace!("Worker {worker_id} stopped");
}
