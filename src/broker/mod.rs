// src/broker/mod.rs

//! In-process broker engine.
//!
//! [`Broker`] owns the routing namespace: the exchange router and the
//! queue store. [`Session`] is the per-connection channel: it carries the
//! delivery-tag counter, the registry of outstanding deliveries, the
//! consumers started on it, and ownership of its exclusive queues. Both
//! are cheap-clone handles around shared state; there is no ambient
//! global anywhere.
//!
//! Sessions implement the [`Channel`] trait, which is the whole surface a
//! transport adapter needs. Higher layers (the RPC client and server)
//! only ever see `Arc<dyn Channel>`.

mod consumer;
mod exchange;
mod flow;
mod queue;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};

use bytes::Bytes;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::{
    //
    AckMode,
    Channel,
    ConsumeOptions,
    ConsumerHandle,
    DeliveryHandler,
    Error,
    ExchangeKind,
    Message,
    Properties,
    QueueInfo,
    QueueOptions,
    Result,
};

use consumer::spawn_dispatch_loop;
use exchange::Router;
use flow::{ConsumerFlow, TagEntry, TagRegistry};
use queue::Queue;

/// Acquire a mutex guard, intentionally ignoring poisoning.
///
/// Poisoning indicates another task panicked while holding the lock. None
/// of the protected structures here have invariants spanning multiple
/// fields, so the worst outcome is a dropped message or an unmatched tag,
/// which the settle paths already tolerate.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn read_ignore_poison<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    // ---
    match l.read() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn write_ignore_poison<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    // ---
    match l.write() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct BrokerInner {
    // ---
    router: Mutex<Router>,
    queues: RwLock<HashMap<Arc<str>, Arc<Queue>>>,
    sessions: Mutex<Vec<Weak<SessionInner>>>,
    session_seq: AtomicU64,
}

/// In-process message broker.
///
/// Cheap to clone (internally `Arc`-backed); clones share one routing
/// namespace.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    // ---
    pub fn new() -> Self {
        // ---
        Self {
            inner: Arc::new(BrokerInner {
                router: Mutex::new(Router::new()),
                queues: RwLock::new(HashMap::new()),
                sessions: Mutex::new(Vec::new()),
                session_seq: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new session (channel) on this broker.
    pub fn open_session(&self) -> Session {
        // ---
        let id = self.inner.session_seq.fetch_add(1, Ordering::Relaxed);
        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                broker: self.inner.clone(),
                next_tag: AtomicU64::new(1),
                tags: Mutex::new(TagRegistry::default()),
                consumers: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        };

        let mut sessions = lock_ignore_poison(&self.inner.sessions);
        sessions.retain(|weak| weak.strong_count() > 0);
        sessions.push(Arc::downgrade(&session.inner));

        session
    }

    /// Copy up to `max` ready messages from the head of a queue without
    /// consuming them.
    ///
    /// # Errors
    ///
    /// Returns `Error::QueueNotFound` if the queue does not exist.
    pub fn peek(&self, queue: &str, max: usize) -> Result<Vec<Message>> {
        // ---
        let queues = read_ignore_poison(&self.inner.queues);
        let q = queues
            .get(queue)
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;
        Ok(q.peek_next(max))
    }

    /// Simulate a broker restart.
    ///
    /// Every open session ends as if its transport were lost: consumers
    /// stop, their unacknowledged deliveries are requeued, exclusive
    /// queues are destroyed. Then only durable queues survive, and inside
    /// them only persistent messages. Exchanges and their bindings to
    /// surviving queues remain declared.
    pub fn restart(&self) {
        // ---
        let sessions = std::mem::take(&mut *lock_ignore_poison(&self.inner.sessions));
        for weak in sessions {
            if let Some(session) = weak.upgrade() {
                session.close_internal();
            }
        }

        let removed: Vec<Arc<str>> = {
            let mut queues = write_ignore_poison(&self.inner.queues);
            let removed = queues
                .values()
                .filter(|q| !q.durable)
                .map(|q| q.name.clone())
                .collect();
            queues.retain(|_, q| q.durable);
            for q in queues.values() {
                q.purge_transient();
            }
            removed
        };

        let mut router = lock_ignore_poison(&self.inner.router);
        for name in &removed {
            router.unbind_queue(name);
        }

        crate::log_info!("broker restarted, {} queue(s) dropped", removed.len());
    }
}

/// Record of one consumer started on a session.
struct ConsumerRecord {
    // ---
    tag: Arc<str>,
    queue: Arc<str>,
}

pub(crate) struct SessionInner {
    // ---
    id: u64,
    broker: Arc<BrokerInner>,
    next_tag: AtomicU64,
    tags: Mutex<TagRegistry>,
    consumers: Mutex<Vec<ConsumerRecord>>,
    closed: AtomicBool,
}

impl SessionInner {
    // ---
    fn ensure_open(&self) -> Result<()> {
        // ---
        if self.closed.load(Ordering::Acquire) {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Next delivery tag; monotonically increasing per session.
    pub(crate) fn allocate_tag(&self) -> u64 {
        self.next_tag.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_tag(&self, tag: u64, queue: Arc<str>, consumer: Arc<str>) {
        // ---
        lock_ignore_poison(&self.tags).insert(tag, TagEntry { queue, consumer });
    }

    /// Settle a delivery positively. Used by both the public `ack` and
    /// the dispatch loop, which must keep working for a delivery claimed
    /// just before its session closed.
    pub(crate) fn ack_tag(&self, tag: u64) -> Result<()> {
        // ---
        let entry = lock_ignore_poison(&self.tags)
            .remove(tag)
            .ok_or(Error::UnknownDeliveryTag(tag))?;

        // A destroyed queue already discarded the message.
        let q = read_ignore_poison(&self.broker.queues).get(&*entry.queue).cloned();
        if let Some(q) = q {
            q.settle_ack(tag, &entry.consumer);
        }
        Ok(())
    }

    /// Settle a delivery negatively, requeuing at the head.
    pub(crate) fn nack_tag(&self, tag: u64) -> Result<()> {
        // ---
        let entry = lock_ignore_poison(&self.tags)
            .remove(tag)
            .ok_or(Error::UnknownDeliveryTag(tag))?;

        let q = read_ignore_poison(&self.broker.queues).get(&*entry.queue).cloned();
        if let Some(q) = q {
            q.settle_nack(tag, &entry.consumer);
        }
        Ok(())
    }

    /// Stop one consumer: requeue its outstanding deliveries (oldest
    /// frontmost) and remove its registration.
    fn stop_consumer(&self, record: &ConsumerRecord) {
        // ---
        let requeue = lock_ignore_poison(&self.tags).drain_consumer(&record.queue, &record.tag);

        let q = read_ignore_poison(&self.broker.queues).get(&*record.queue).cloned();
        if let Some(q) = q {
            q.stop_consumer(&record.tag, &requeue);
        }
    }

    fn close_internal(&self) {
        // ---
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let records = std::mem::take(&mut *lock_ignore_poison(&self.consumers));
        for record in &records {
            self.stop_consumer(record);
        }

        // Exclusive queues die with their owning session; whatever they
        // still hold is discarded.
        let destroyed: Vec<Arc<Queue>> = {
            let mut queues = write_ignore_poison(&self.broker.queues);
            let doomed: Vec<Arc<str>> = queues
                .values()
                .filter(|q| q.owner == Some(self.id))
                .map(|q| q.name.clone())
                .collect();
            doomed.iter().filter_map(|name| queues.remove(name)).collect()
        };

        if !destroyed.is_empty() {
            let mut router = lock_ignore_poison(&self.broker.router);
            for q in &destroyed {
                router.unbind_queue(&q.name);
            }
        }
        for q in &destroyed {
            q.stop_all_consumers();
        }

        crate::log_debug!(
            "session {} closed ({} consumer(s), {} exclusive queue(s))",
            self.id,
            records.len(),
            destroyed.len()
        );
    }
}

/// One channel onto a [`Broker`].
///
/// Cheap to clone; clones share the same delivery-tag space and consumer
/// registry. Dropping the last clone does not close the session; call
/// [`Session::close`] (or [`Broker::restart`]) to end it explicitly.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    // ---
    /// Erase this session behind the [`Channel`] interface.
    pub fn into_channel(self) -> crate::ChannelPtr {
        Arc::new(self)
    }

    /// End this session.
    ///
    /// All of its consumers stop, their unacknowledged deliveries are
    /// requeued at the head of their queues, and its exclusive queues are
    /// destroyed (undelivered contents discarded). Idempotent; every
    /// operation afterwards fails with `Error::SessionClosed`.
    pub fn close(&self) {
        self.inner.close_internal();
    }
}

#[async_trait::async_trait]
impl Channel for Session {
    // ---
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<QueueInfo> {
        // ---
        self.inner.ensure_open()?;

        // Empty name asks the broker for a fresh server-named queue.
        let name: Arc<str> = if name.is_empty() {
            Arc::from(format!("gen-{}", Uuid::new_v4()))
        } else {
            Arc::from(name)
        };

        let mut queues = write_ignore_poison(&self.inner.broker.queues);
        if let Some(q) = queues.get(&*name) {
            if q.exclusive && q.owner != Some(self.inner.id) {
                return Err(Error::ResourceLocked(name.to_string()));
            }
            if !q.matches(opts) {
                return Err(Error::QueueDeclareConflict(name.to_string()));
            }
            return Ok(q.info());
        }

        let owner = opts.exclusive.then_some(self.inner.id);
        let q = Arc::new(Queue::new(name.clone(), opts, owner));
        let info = q.info();
        queues.insert(name, q);
        Ok(info)
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()> {
        // ---
        self.inner.ensure_open()?;
        lock_ignore_poison(&self.inner.broker.router).declare(name, kind)
    }

    async fn bind(&self, exchange: &str, queue: &str, binding_key: &str) -> Result<()> {
        // ---
        self.inner.ensure_open()?;

        let queue_name = read_ignore_poison(&self.inner.broker.queues)
            .get(queue)
            .map(|q| q.name.clone())
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        lock_ignore_poison(&self.inner.broker.router).bind(exchange, queue_name, binding_key)
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: Properties,
    ) -> Result<()> {
        // ---
        self.inner.ensure_open()?;

        let targets = lock_ignore_poison(&self.inner.broker.router).route(exchange, routing_key)?;
        let message = Message::with_properties(routing_key, body, properties);

        let queues = read_ignore_poison(&self.inner.broker.queues);
        let mut delivered = 0usize;
        for name in &targets {
            if let Some(q) = queues.get(&**name) {
                q.enqueue(message.clone());
                delivered += 1;
            }
        }

        // Fire-and-forget: an unrouted message is dropped, not an error.
        if delivered == 0 {
            crate::log_debug!("unrouted message on exchange '{exchange}' with key '{routing_key}'");
        }
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        opts: ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<ConsumerHandle> {
        // ---
        self.inner.ensure_open()?;

        let q = read_ignore_poison(&self.inner.broker.queues)
            .get(queue)
            .cloned()
            .ok_or_else(|| Error::QueueNotFound(queue.to_string()))?;

        if q.exclusive && q.owner != Some(self.inner.id) {
            return Err(Error::ResourceLocked(queue.to_string()));
        }

        let tag: Arc<str> = Arc::from(format!("ctag-{}", Uuid::new_v4()));
        let wake = Arc::new(Notify::new());

        q.register_consumer(
            tag.clone(),
            ConsumerFlow {
                ack_mode: opts.ack_mode,
                prefetch: match opts.ack_mode {
                    AckMode::Manual => opts.prefetch_count,
                    AckMode::Auto => 0,
                },
                in_flight: 0,
                wake: wake.clone(),
            },
        );

        lock_ignore_poison(&self.inner.consumers).push(ConsumerRecord {
            tag: tag.clone(),
            queue: q.name.clone(),
        });

        let task = spawn_dispatch_loop(self.inner.clone(), q.clone(), tag.clone(), wake, handler);
        Ok(ConsumerHandle::new(tag, q.name.clone(), task))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        // ---
        self.inner.ensure_open()?;

        // Cancelling an unknown or already-cancelled consumer is a no-op.
        let record = {
            let mut consumers = lock_ignore_poison(&self.inner.consumers);
            match consumers.iter().position(|r| &*r.tag == consumer_tag) {
                Some(idx) => consumers.swap_remove(idx),
                None => return Ok(()),
            }
        };

        self.inner.stop_consumer(&record);
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.inner.ensure_open()?;
        self.inner.ack_tag(delivery_tag)
    }

    async fn nack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.inner.ensure_open()?;
        self.inner.nack_tag(delivery_tag)
    }
}
