// src/broker/queue.rs

//! Queue store.
//!
//! Each queue is an ordered FIFO buffer split in two: `ready` messages
//! awaiting delivery, and `unacked` messages that have been handed to a
//! Manual-mode consumer but not yet settled. The queue owns message
//! storage either way; a delivery only references it. Acknowledgment
//! removes the message for good, negative acknowledgment moves it back to
//! the head of `ready`.
//!
//! All mutation of one queue goes through its single mutex, so enqueue,
//! hand-off, and settlement are linearized per queue while distinct
//! queues progress independently.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::broker::flow::{ConsumerFlow, FlowController};
use crate::broker::lock_ignore_poison;
use crate::{AckMode, Message, QueueInfo, QueueOptions};

/// Result of one claim attempt by a dispatch loop.
pub(crate) enum Claim {
    // ---
    /// A message was handed off under this delivery tag.
    Delivery {
        tag: u64,
        message: Message,
        ack_mode: AckMode,
    },

    /// Nothing eligible right now (queue empty or prefetch bound hit);
    /// park until woken.
    Wait,

    /// The consumer registration is gone; the loop must exit.
    Stopped,
}

struct QueueState {
    // ---
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    flow: FlowController,
}

/// A named message buffer with durability and exclusivity metadata.
pub(crate) struct Queue {
    // ---
    pub name: Arc<str>,
    pub durable: bool,
    pub exclusive: bool,

    /// Owning session id; set iff the queue is exclusive.
    pub owner: Option<u64>,

    state: Mutex<QueueState>,
}

impl Queue {
    // ---
    pub fn new(name: Arc<str>, opts: QueueOptions, owner: Option<u64>) -> Self {
        // ---
        Self {
            name,
            durable: opts.durable,
            exclusive: opts.exclusive,
            owner,
            state: Mutex::new(QueueState {
                ready: VecDeque::new(),
                unacked: HashMap::new(),
                flow: FlowController::default(),
            }),
        }
    }

    /// Whether a re-declaration with `opts` matches this queue.
    pub fn matches(&self, opts: QueueOptions) -> bool {
        self.durable == opts.durable && self.exclusive == opts.exclusive
    }

    pub fn info(&self) -> QueueInfo {
        // ---
        let state = lock_ignore_poison(&self.state);
        QueueInfo {
            name: self.name.clone(),
            message_count: state.ready.len(),
            consumer_count: state.flow.consumer_count(),
        }
    }

    /// Append a message at the tail and wake the queue's consumers.
    pub fn enqueue(&self, message: Message) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ready.push_back(message);
        state.flow.wake_all();
    }

    /// Copy up to `max` ready messages, head first, without removing them.
    pub fn peek_next(&self, max: usize) -> Vec<Message> {
        // ---
        let state = lock_ignore_poison(&self.state);
        state.ready.iter().take(max).cloned().collect()
    }

    pub fn register_consumer(&self, tag: Arc<str>, flow: ConsumerFlow) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.flow.register(tag, flow);
    }

    /// Attempt to hand the next ready message to `consumer_tag`.
    ///
    /// The capacity check, the pop, and the move to `unacked` happen under
    /// the queue lock, so the prefetch bound holds no matter how many
    /// loops share the queue. `alloc_tag` is only invoked when a message
    /// is actually handed off.
    pub fn try_claim(&self, consumer_tag: &str, alloc_tag: impl FnOnce() -> u64) -> Claim {
        // ---
        let mut state = lock_ignore_poison(&self.state);

        let (ack_mode, has_capacity) = match state.flow.get(consumer_tag) {
            Some(flow) => (flow.ack_mode, flow.has_capacity()),
            None => return Claim::Stopped,
        };

        if !has_capacity || state.ready.is_empty() {
            return Claim::Wait;
        }

        // Checked non-empty above.
        let message = match state.ready.pop_front() {
            Some(m) => m,
            None => return Claim::Wait,
        };

        let tag = alloc_tag();

        if ack_mode == AckMode::Manual {
            state.unacked.insert(tag, message.clone());
            state.flow.on_handoff(consumer_tag);
        }

        Claim::Delivery {
            tag,
            message,
            ack_mode,
        }
    }

    /// Permanently remove an acknowledged message and free its consumer's
    /// in-flight slot.
    pub fn settle_ack(&self, tag: u64, consumer_tag: &str) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.unacked.remove(&tag);
        state.flow.on_settle(consumer_tag);
    }

    /// Requeue a negatively acknowledged message at the head and free its
    /// consumer's in-flight slot.
    pub fn settle_nack(&self, tag: u64, consumer_tag: &str) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        if let Some(message) = state.unacked.remove(&tag) {
            state.ready.push_front(message);
        }
        state.flow.on_settle(consumer_tag);
        state.flow.wake_all();
    }

    /// Remove a consumer registration, requeuing its outstanding
    /// deliveries at the head of the queue.
    ///
    /// `requeue_tags` must be in hand-off order (oldest first); inserting
    /// in reverse keeps the oldest delivery frontmost, preserving the
    /// relative order of the requeued messages.
    pub fn stop_consumer(&self, consumer_tag: &str, requeue_tags: &[u64]) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        for tag in requeue_tags.iter().rev() {
            if let Some(message) = state.unacked.remove(tag) {
                state.ready.push_front(message);
            }
        }
        state.flow.stop(consumer_tag);
        state.flow.wake_all();
    }

    /// Stop every consumer without requeuing (queue is being destroyed;
    /// undelivered messages are discarded with it).
    pub fn stop_all_consumers(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        for tag in state.flow.consumer_tags() {
            state.flow.stop(&tag);
        }
    }

    /// Drop everything a restart would lose: non-persistent ready
    /// messages and any leftover unacked entries.
    pub fn purge_transient(&self) {
        // ---
        let mut state = lock_ignore_poison(&self.state);
        state.ready.retain(|m| m.properties.persistent);
        state.unacked.clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use tokio::sync::Notify;

    fn queue() -> Queue {
        Queue::new(Arc::from("q"), QueueOptions::default(), None)
    }

    fn register(q: &Queue, tag: &str, ack_mode: AckMode, prefetch: u16) {
        // ---
        q.register_consumer(
            Arc::from(tag),
            ConsumerFlow {
                ack_mode,
                prefetch,
                in_flight: 0,
                wake: Arc::new(Notify::new()),
            },
        );
    }

    #[test]
    fn test_fifo_order() {
        // ---
        let q = queue();
        q.enqueue(Message::new("q", "first"));
        q.enqueue(Message::new("q", "second"));

        let heads = q.peek_next(10);
        assert_eq!(heads.len(), 2);
        assert_eq!(heads[0].body, "first");
        assert_eq!(heads[1].body, "second");
    }

    #[test]
    fn test_peek_does_not_remove() {
        // ---
        let q = queue();
        q.enqueue(Message::new("q", "only"));

        assert_eq!(q.peek_next(1).len(), 1);
        assert_eq!(q.info().message_count, 1);
    }

    #[test]
    fn test_claim_respects_prefetch() {
        // ---
        let q = queue();
        register(&q, "c", AckMode::Manual, 1);
        q.enqueue(Message::new("q", "a"));
        q.enqueue(Message::new("q", "b"));

        let mut next = 0u64;
        let mut alloc = || {
            next += 1;
            next
        };

        assert!(matches!(q.try_claim("c", &mut alloc), Claim::Delivery { .. }));
        assert!(matches!(q.try_claim("c", &mut alloc), Claim::Wait));

        q.settle_ack(1, "c");
        assert!(matches!(q.try_claim("c", &mut alloc), Claim::Delivery { .. }));
    }

    #[test]
    fn test_claim_for_unknown_consumer_stops() {
        // ---
        let q = queue();
        assert!(matches!(q.try_claim("nope", || 1), Claim::Stopped));
    }

    #[test]
    fn test_nack_requeues_at_head() {
        // ---
        let q = queue();
        register(&q, "c", AckMode::Manual, 0);
        q.enqueue(Message::new("q", "a"));
        q.enqueue(Message::new("q", "b"));

        let tag = match q.try_claim("c", || 1) {
            Claim::Delivery { tag, .. } => tag,
            _ => panic!("expected a delivery"),
        };

        q.settle_nack(tag, "c");
        let heads = q.peek_next(2);
        assert_eq!(heads[0].body, "a");
        assert_eq!(heads[1].body, "b");
    }

    #[test]
    fn test_stop_consumer_requeues_in_order() {
        // ---
        let q = queue();
        register(&q, "c", AckMode::Manual, 0);
        for body in ["a", "b", "c"] {
            q.enqueue(Message::new("q", body));
        }

        let mut next = 0u64;
        let mut alloc = || {
            next += 1;
            next
        };
        for _ in 0..3 {
            assert!(matches!(q.try_claim("c", &mut alloc), Claim::Delivery { .. }));
        }
        assert_eq!(q.info().message_count, 0);

        q.stop_consumer("c", &[1, 2, 3]);
        let heads = q.peek_next(3);
        assert_eq!(heads[0].body, "a");
        assert_eq!(heads[1].body, "b");
        assert_eq!(heads[2].body, "c");
    }

    #[test]
    fn test_purge_transient_keeps_persistent() {
        // ---
        let q = queue();
        let mut persistent = Message::new("q", "keep");
        persistent.properties.persistent = true;
        q.enqueue(persistent);
        q.enqueue(Message::new("q", "drop"));

        q.purge_transient();
        let heads = q.peek_next(10);
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].body, "keep");
    }
}
