//! Task types: the opaque job payload, its result, and the pending task that
//! carries a single-resolution completion handle through the pool.

use crate::{Error, Result};
use bytes::Bytes;
use std::time::Instant;
use tokio::sync::oneshot;

/// Opaque identifier assigned to each submitted task.
pub type TaskId = u64;

/// An opaque proof generation request.
///
/// The pool never interprets the payload; it is handed verbatim to the
/// [`ProofProvider`](crate::ProofProvider).
#[derive(Clone, Debug)]
pub struct ProofRequest {
    pub payload: Bytes,
}

impl ProofRequest {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
        }
    }

    /// Synchronous validation performed at submission, before the request
    /// enters the queue.
    pub(crate) fn validate(&self, max_payload_bytes: usize) -> Result<()> {
        if self.payload.is_empty() {
            return Err(Error::Validation {
                reason: "payload must not be empty".to_string(),
            });
        }
        if self.payload.len() > max_payload_bytes {
            return Err(Error::Validation {
                reason: format!(
                    "payload of {} bytes exceeds the {max_payload_bytes} byte limit",
                    self.payload.len()
                ),
            });
        }
        Ok(())
    }
}

/// An opaque proof produced by the compute provider.
#[derive(Clone, Debug)]
pub struct ProofResponse {
    pub proof: Bytes,
}

impl ProofResponse {
    pub fn new(proof: impl Into<Bytes>) -> Self {
        Self {
            proof: proof.into(),
        }
    }
}

/// A submitted task waiting in the queue or executing on a worker.
///
/// The completion handle is a oneshot sender owned by exactly one place at a
/// time (the queue, or the in-flight slot of a single worker), which is what
/// guarantees it resolves at most once.
pub(crate) struct PendingTask {
    pub id: TaskId,
    pub request: ProofRequest,
    pub created_at: Instant,
    completion: oneshot::Sender<Result<ProofResponse>>,
}

impl PendingTask {
    pub fn new(
        id: TaskId,
        request: ProofRequest,
        completion: oneshot::Sender<Result<ProofResponse>>,
    ) -> Self {
        Self {
            id,
            request,
            created_at: Instant::now(),
            completion,
        }
    }

    /// Resolves the completion handle. Consuming `self` makes double
    /// resolution unrepresentable.
    pub fn resolve(self, result: Result<ProofResponse>) {
        // The caller may have dropped the receiving side; nothing to do then.
        let _ = self.completion.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_payload_is_rejected() {
        let req = ProofRequest::new(Bytes::new());
        assert!(matches!(req.validate(1024), Err(Error::Validation { .. })));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let req = ProofRequest::new(vec![0_u8; 32]);
        assert!(matches!(req.validate(16), Err(Error::Validation { .. })));
    }

    #[test]
    fn payload_within_limit_is_accepted() {
        let req = ProofRequest::new(vec![0_u8; 16]);
        assert!(req.validate(16).is_ok());
    }
}
