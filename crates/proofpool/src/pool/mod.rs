//! The pool itself: public handle plus the coordinator it talks to.
//!
//! ## Structure
//!
//! - [`coordinator`] - single-writer control loop owning all pool state.
//! - [`dispatch`] - queue-to-worker matching and per-task deadlines.
//! - [`lifecycle`] - spawn, recycle, replace, scale.
//! - [`health`] - periodic stuck-worker and memory-pressure sweep.
//! - [`worker`] - the isolated execution unit running the compute function.

mod coordinator;
mod dispatch;
mod health;
mod lifecycle;
mod messages;
mod state;
mod worker;

#[cfg(test)]
mod tests;

use crate::{
    Error, MemoryMonitor, PoolConfig, PoolStats, ProofProvider, ProofRequest, ProofResponse,
    Result, SystemMemory,
    pool::{coordinator::Coordinator, messages::PoolCommand},
};
use core::time::Duration;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// A bounded pool of isolated workers executing expensive proof generation
/// jobs.
///
/// The handle is cheap to clone; all clones talk to the same coordinator
/// task. Dropping every handle tears the pool down, but an explicit
/// [`shutdown`](Self::shutdown) is the orderly way out.
#[derive(Clone)]
pub struct ProofPool {
    cmd_tx: mpsc::Sender<PoolCommand>,
    shutdown_token: CancellationToken,
}

impl ProofPool {
    /// Creates a pool and spawns its coordinator, probing real system memory
    /// for admission control.
    ///
    /// Must be called from within a Tokio runtime. `min_workers` workers are
    /// spawned immediately and warm up in the background; submissions made
    /// before they are ready simply queue.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] if the configuration is inconsistent.
    pub fn new(config: PoolConfig, provider: Arc<dyn ProofProvider>) -> Result<Self> {
        Self::with_memory_monitor(config, provider, Arc::new(SystemMemory::new()))
    }

    /// Same as [`new`](Self::new) with an explicit memory probe, letting
    /// tests force a fixed reading.
    pub fn with_memory_monitor(
        config: PoolConfig,
        provider: Arc<dyn ProofProvider>,
        memory: Arc<dyn MemoryMonitor>,
    ) -> Result<Self> {
        config.validate()?;
        let (cmd_tx, cmd_rx) = mpsc::channel(config.event_buffer_size);
        let (event_tx, event_rx) = mpsc::channel(config.event_buffer_size);
        let shutdown_token = CancellationToken::new();

        let coordinator = Coordinator::new(
            config,
            provider,
            memory,
            cmd_rx,
            event_tx,
            event_rx,
            shutdown_token.clone(),
        );
        tokio::spawn(coordinator.run());

        Ok(Self {
            cmd_tx,
            shutdown_token,
        })
    }

    /// Submits a job and suspends until its completion handle resolves.
    ///
    /// The caller is only suspended, never blocked: admission, queuing, and
    /// dispatch all happen on the coordinator. Each task is attempted at most
    /// once; resubmitting after a failure is a caller-level policy.
    ///
    /// # Errors
    ///
    /// - [`Error::Validation`] for malformed requests.
    /// - [`Error::ResourceExhausted`] when admitted under memory pressure is
    ///   not possible; back off and retry later.
    /// - [`Error::Timeout`] if the worker missed the per-task deadline.
    /// - [`Error::WorkerCrash`] if the worker died executing this job.
    /// - [`Error::Compute`] for job-level provider failures.
    /// - [`Error::Shutdown`] once the pool is draining or shut down.
    pub async fn submit(&self, request: ProofRequest) -> Result<ProofResponse> {
        if self.shutdown_token.is_cancelled() {
            return Err(Error::Shutdown);
        }
        let (completion, response) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Submit {
                request,
                completion,
            })
            .await
            .map_err(|_| Error::Shutdown)?;
        response.await.map_err(|_| Error::Channel {
            context: "completion handle dropped".to_string(),
        })?
    }

    /// Snapshots pool statistics. Remains answerable after shutdown, when it
    /// reports zero workers.
    pub async fn stats(&self) -> Result<PoolStats> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Stats { reply })
            .await
            .map_err(|_| Error::Channel {
                context: "coordinator unavailable".to_string(),
            })?;
        response.await.map_err(|_| Error::Channel {
            context: "stats reply dropped".to_string(),
        })
    }

    /// Initiates graceful drain and resolves once the pool is fully shut
    /// down.
    ///
    /// From this call on, new submissions reject immediately with
    /// [`Error::Shutdown`], as do tasks still queued. Busy workers get up to
    /// `drain_timeout` to finish their in-flight job; anything still running
    /// after that is force-terminated and its task fails with
    /// [`Error::Shutdown`].
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.cmd_tx
            .send(PoolCommand::Shutdown {
                drain_timeout,
                reply,
            })
            .await
            .map_err(|_| Error::Channel {
                context: "coordinator unavailable".to_string(),
            })?;
        response.await.map_err(|_| Error::Channel {
            context: "shutdown reply dropped".to_string(),
        })
    }
}
