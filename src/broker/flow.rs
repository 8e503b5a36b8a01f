// src/broker/flow.rs

//! Delivery flow control.
//!
//! Two small bookkeeping structures:
//!
//! - [`FlowController`] lives inside each queue's state and enforces the
//!   per-consumer prefetch bound. It is mutated only under the queue's
//!   lock, which makes the capacity check and the hand-off a single
//!   atomic step across every dispatch loop reading that queue.
//! - [`TagRegistry`] lives inside each session and maps outstanding
//!   delivery tags back to the queue and consumer they belong to, so an
//!   ack or nack can be routed without scanning queues.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Notify;

use crate::AckMode;

/// Flow state of one consumer registration.
pub(crate) struct ConsumerFlow {
    /// Acknowledgment mode of the registration.
    pub ack_mode: AckMode,

    /// Prefetch bound; zero means unbounded.
    pub prefetch: u16,

    /// Unacknowledged deliveries currently held by this consumer.
    pub in_flight: usize,

    /// Wakes this consumer's dispatch loop when a message or capacity
    /// becomes available, or when the consumer is stopped.
    pub wake: Arc<Notify>,
}

impl ConsumerFlow {
    /// Whether a new delivery may be handed to this consumer.
    ///
    /// Auto-acknowledged consumers never hold in-flight deliveries, so
    /// they always have capacity.
    pub fn has_capacity(&self) -> bool {
        // ---
        match self.ack_mode {
            AckMode::Auto => true,
            AckMode::Manual => self.prefetch == 0 || self.in_flight < usize::from(self.prefetch),
        }
    }
}

/// Per-queue prefetch and acknowledgment bookkeeping.
///
/// Consumer entries exist from registration until cancellation or session
/// end; a dispatch loop whose entry has disappeared treats that as its
/// stop signal.
#[derive(Default)]
pub(crate) struct FlowController {
    // ---
    consumers: HashMap<Arc<str>, ConsumerFlow>,
}

impl FlowController {
    // ---
    pub fn register(&mut self, tag: Arc<str>, flow: ConsumerFlow) {
        self.consumers.insert(tag, flow);
    }

    pub fn get(&self, tag: &str) -> Option<&ConsumerFlow> {
        self.consumers.get(tag)
    }

    /// Record a Manual-mode hand-off.
    pub fn on_handoff(&mut self, tag: &str) {
        // ---
        if let Some(c) = self.consumers.get_mut(tag) {
            c.in_flight += 1;
        }
    }

    /// Record a settlement (ack or nack) and wake the freed consumer.
    pub fn on_settle(&mut self, tag: &str) {
        // ---
        if let Some(c) = self.consumers.get_mut(tag) {
            c.in_flight = c.in_flight.saturating_sub(1);
            c.wake.notify_one();
        }
    }

    /// Remove a consumer entry, waking its loop so it observes the stop.
    pub fn stop(&mut self, tag: &str) -> Option<ConsumerFlow> {
        // ---
        let flow = self.consumers.remove(tag);
        if let Some(c) = &flow {
            c.wake.notify_one();
        }
        flow
    }

    /// Wake every registered consumer (new message, freed head slot).
    pub fn wake_all(&self) {
        // ---
        for c in self.consumers.values() {
            c.wake.notify_one();
        }
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Tags of all consumers, for bulk stops when a queue is destroyed.
    pub fn consumer_tags(&self) -> Vec<Arc<str>> {
        self.consumers.keys().cloned().collect()
    }
}

/// Where an outstanding delivery tag points.
#[derive(Debug, Clone)]
pub(crate) struct TagEntry {
    pub queue: Arc<str>,
    pub consumer: Arc<str>,
}

/// Session-wide map of outstanding delivery tags.
///
/// An entry exists from Manual-mode hand-off until the delivery is
/// settled or its consumer is stopped; entries are never left dangling.
#[derive(Default)]
pub(crate) struct TagRegistry {
    // ---
    entries: HashMap<u64, TagEntry>,
}

impl TagRegistry {
    // ---
    pub fn insert(&mut self, tag: u64, entry: TagEntry) {
        self.entries.insert(tag, entry);
    }

    /// Remove a tag, returning where it pointed. `None` means the tag is
    /// unknown or already settled.
    pub fn remove(&mut self, tag: u64) -> Option<TagEntry> {
        // ---
        self.entries.remove(&tag)
    }

    /// Remove every outstanding tag of one consumer, oldest first.
    ///
    /// The ascending order lets the caller requeue head-insertions in
    /// reverse so the oldest delivery ends up frontmost again.
    pub fn drain_consumer(&mut self, queue: &str, consumer: &str) -> Vec<u64> {
        // ---
        let mut tags: Vec<u64> = self
            .entries
            .iter()
            .filter(|(_, e)| &*e.queue == queue && &*e.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();
        for tag in &tags {
            self.entries.remove(tag);
        }
        tags
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn flow(ack_mode: AckMode, prefetch: u16) -> ConsumerFlow {
        // ---
        ConsumerFlow {
            ack_mode,
            prefetch,
            in_flight: 0,
            wake: Arc::new(Notify::new()),
        }
    }

    #[test]
    fn test_prefetch_bound() {
        // ---
        let mut fc = FlowController::default();
        let tag: Arc<str> = Arc::from("ctag-1");
        fc.register(tag.clone(), flow(AckMode::Manual, 1));

        assert!(fc.get(&tag).unwrap().has_capacity());
        fc.on_handoff(&tag);
        assert!(!fc.get(&tag).unwrap().has_capacity());
        fc.on_settle(&tag);
        assert!(fc.get(&tag).unwrap().has_capacity());
    }

    #[test]
    fn test_zero_prefetch_is_unbounded() {
        // ---
        let mut fc = FlowController::default();
        let tag: Arc<str> = Arc::from("ctag-1");
        fc.register(tag.clone(), flow(AckMode::Manual, 0));

        for _ in 0..100 {
            fc.on_handoff(&tag);
        }
        assert!(fc.get(&tag).unwrap().has_capacity());
    }

    #[test]
    fn test_auto_mode_ignores_prefetch() {
        // ---
        let mut fc = FlowController::default();
        let tag: Arc<str> = Arc::from("ctag-1");
        fc.register(tag.clone(), flow(AckMode::Auto, 1));
        assert!(fc.get(&tag).unwrap().has_capacity());
    }

    #[test]
    fn test_drain_consumer_orders_oldest_first() {
        // ---
        let mut tags = TagRegistry::default();
        for t in [7u64, 3, 5] {
            tags.insert(
                t,
                TagEntry {
                    queue: Arc::from("jobs"),
                    consumer: Arc::from("ctag-1"),
                },
            );
        }
        tags.insert(
            4,
            TagEntry {
                queue: Arc::from("jobs"),
                consumer: Arc::from("ctag-2"),
            },
        );

        let drained = tags.drain_consumer("jobs", "ctag-1");
        assert_eq!(drained, vec![3, 5, 7]);
        assert_eq!(tags.len(), 1);
    }
}
