// src/client/pending.rs

//! Outstanding-call tracking for the RPC client.
//!
//! Maps correlation ids to oneshot senders. Registering a call hands back
//! the receiving half; the reply consumer completes the matching entry
//! when a reply arrives. Entries are removed on completion or timeout,
//! never left dangling.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::CorrelationId;

pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationId, oneshot::Sender<Bytes>>,
}

impl PendingCalls {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new outstanding call.
    ///
    /// Returns the receiver its reply will be delivered on.
    pub fn register(&mut self, correlation_id: CorrelationId) -> oneshot::Receiver<Bytes> {
        // ---
        let (tx, rx) = oneshot::channel();
        self.calls.insert(correlation_id, tx);
        rx
    }

    /// Complete an outstanding call with its reply payload.
    ///
    /// Returns false when the correlation id is unknown or already
    /// resolved; late and duplicate replies are tolerated, not faults.
    pub fn complete(&mut self, correlation_id: &CorrelationId, reply: Bytes) -> bool {
        // ---
        if let Some(tx) = self.calls.remove(correlation_id) {
            // Ignore a receiver dropped by a racing timeout.
            let _ = tx.send(reply);
            true
        } else {
            false
        }
    }

    /// Remove an outstanding call without delivering a reply.
    ///
    /// Used for timeout cleanup; a reply arriving afterwards is discarded
    /// by `complete`.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        // ---
        self.calls.remove(correlation_id).is_some()
    }

    /// Number of outstanding calls.
    pub fn len(&self) -> usize {
        // ---
        self.calls.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_register_and_complete() {
        // ---
        let mut pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let mut rx = pending.register(correlation_id.clone());
        assert_eq!(pending.len(), 1);

        let reply = Bytes::from("reply");
        assert!(pending.complete(&correlation_id, reply.clone()));

        // Entry is gone after completion.
        assert_eq!(pending.len(), 0);
        assert_eq!(rx.try_recv().unwrap(), reply);
    }

    #[test]
    fn test_complete_unknown_id_is_tolerated() {
        // ---
        let mut pending = PendingCalls::new();
        assert!(!pending.complete(&CorrelationId::generate(), Bytes::from("late")));
    }

    #[test]
    fn test_mismatched_id_leaves_call_pending() {
        // ---
        let mut pending = PendingCalls::new();
        let wanted = CorrelationId::generate();

        let mut rx = pending.register(wanted.clone());
        assert!(!pending.complete(&CorrelationId::generate(), Bytes::from("other")));

        assert_eq!(pending.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remove_for_timeout() {
        // ---
        let mut pending = PendingCalls::new();
        let correlation_id = CorrelationId::generate();

        let _rx = pending.register(correlation_id.clone());
        assert!(pending.remove(&correlation_id));
        assert!(!pending.remove(&correlation_id));

        // The late reply is discarded without error.
        assert!(!pending.complete(&correlation_id, Bytes::from("late")));
    }
}
