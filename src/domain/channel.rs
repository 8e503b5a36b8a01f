// src/domain/channel.rs

//! Channel domain abstraction.
//!
//! This module defines the boundary a transport adapter (or any other
//! caller) programs against: queue/exchange declaration, binding,
//! publishing, consuming, and delivery settlement. It intentionally avoids
//! any reference to the in-process engine that implements it.
//!
//! The in-process [`Session`](crate::Session) is the reference
//! implementation of this interface; the RPC client and server layers are
//! written against [`ChannelPtr`] only, so they stay broker-agnostic.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use tokio::task::JoinHandle;

use crate::{Delivery, Properties, Result};

/// Exchange kinds supported by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    // ---
    /// Routes to the queue whose name equals the routing key, with no
    /// explicit binding. The empty-named default exchange is a standing
    /// exchange of this kind.
    DirectDefault,

    /// Ignores the routing key and targets every bound queue.
    Fanout,

    /// Targets exactly the queues whose binding key equals the routing
    /// key. Exact string match, no wildcards.
    DirectKeyed,
}

/// Acknowledgment mode of a consumer registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    // ---
    /// Deliveries are considered acknowledged at hand-off: no tag
    /// tracking, no in-flight accounting, the message leaves the queue
    /// immediately.
    Auto,

    /// The handler (or an external caller holding the tag) must settle
    /// each delivery explicitly.
    #[default]
    Manual,
}

/// Parameters of a queue declaration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    /// Durable queues (and their persistent messages) survive a broker
    /// restart.
    pub durable: bool,

    /// Exclusive queues belong to the declaring session and are destroyed
    /// when it ends; undelivered messages are discarded.
    pub exclusive: bool,
}

/// Snapshot returned by a queue declaration.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    /// Queue name. For declarations with an empty name this is the
    /// broker-generated name.
    pub name: Arc<str>,

    /// Number of messages ready for delivery at declaration time.
    pub message_count: usize,

    /// Number of active consumers at declaration time.
    pub consumer_count: usize,
}

/// Parameters of a consumer registration.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsumeOptions {
    /// Acknowledgment mode.
    pub ack_mode: AckMode,

    /// Upper bound on unacknowledged deliveries held by this consumer.
    /// Zero means unbounded. Only meaningful in [`AckMode::Manual`];
    /// auto-acknowledged deliveries are never in flight.
    pub prefetch_count: u16,
}

/// Settlement decision returned by a delivery handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    // ---
    /// Acknowledge the delivery; the message is removed for good.
    Ack,

    /// Negatively acknowledge; the message is requeued at the head of its
    /// queue.
    Nack,

    /// The handler already settled the delivery itself (via
    /// [`Channel::ack`] / [`Channel::nack`]); the dispatch loop does
    /// nothing further.
    Settled,
}

/// Boxed future returned by a delivery handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Outcome> + Send>>;

/// Type-erased delivery handler.
///
/// Wrapped in `Arc` so the dispatch loop can invoke it repeatedly without
/// cloning the underlying closure. Use [`handler`] to build one from an
/// ordinary async closure.
pub type DeliveryHandler = Arc<dyn Fn(Delivery) -> HandlerFuture + Send + Sync>;

/// Wrap an async closure into a [`DeliveryHandler`].
///
/// # Example
///
/// ```
/// use mom_broker::{handler, Outcome};
///
/// let h = handler(|delivery| async move {
///     println!("got {:?}", delivery.message.body);
///     Outcome::Ack
/// });
/// # let _ = h;
/// ```
pub fn handler<F, Fut>(f: F) -> DeliveryHandler
where
    F: Fn(Delivery) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Outcome> + Send + 'static,
{
    // ---
    Arc::new(move |delivery| Box::pin(f(delivery)) as HandlerFuture)
}

/// Handle for a running consumer.
///
/// The consumer keeps running until it is cancelled through its channel
/// or its session ends. The handle identifies the consumer and lets the
/// caller await the dispatch loop's exit after cancellation.
#[derive(Debug)]
pub struct ConsumerHandle {
    // ---
    tag: Arc<str>,
    queue: Arc<str>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    pub(crate) fn new(tag: Arc<str>, queue: Arc<str>, task: JoinHandle<()>) -> Self {
        Self { tag, queue, task }
    }

    /// Tag identifying this consumer, for [`Channel::cancel`].
    pub fn consumer_tag(&self) -> &str {
        &self.tag
    }

    /// Name of the queue this consumer reads from.
    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Wait for the dispatch loop to exit.
    ///
    /// Returns immediately once the consumer has been cancelled or its
    /// session closed and any in-flight handler invocation finished.
    pub async fn join(self) {
        // ---
        let _ = self.task.await;
    }
}

/// Channel abstraction.
///
/// A `Channel` exposes the full broker boundary: declaration, binding,
/// publishing, consuming, and settlement. Publishing is fire-and-forget:
/// a message that matches no queue is dropped silently, never reported to
/// the publisher.
///
/// Implementations must linearize all operations on a given queue while
/// leaving different queues free to progress concurrently.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    // ---
    /// Declare a queue, creating it if needed.
    ///
    /// Declaring is a lookup-or-create keyed by name: re-declaring with
    /// identical options returns the existing queue; re-declaring with
    /// different options is a configuration conflict. An empty `name`
    /// asks the broker to generate a fresh unique one (returned in
    /// [`QueueInfo`]).
    ///
    /// # Errors
    ///
    /// - `Error::QueueDeclareConflict` if the queue exists with other options
    /// - `Error::ResourceLocked` if the queue is exclusive to another session
    /// - `Error::SessionClosed` if this session has ended
    async fn declare_queue(&self, name: &str, opts: QueueOptions) -> Result<QueueInfo>;

    /// Declare an exchange of the given kind.
    ///
    /// Re-declaring with the same kind is a no-op. The empty name is
    /// reserved for the standing default exchange.
    ///
    /// # Errors
    ///
    /// - `Error::ExchangeDeclareConflict` if the exchange exists with a
    ///   different kind
    /// - `Error::SessionClosed` if this session has ended
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<()>;

    /// Bind a queue to an exchange under a binding key.
    ///
    /// Declaring the same binding twice has no additional effect. Fanout
    /// exchanges ignore the key at routing time but record it all the
    /// same.
    ///
    /// # Errors
    ///
    /// - `Error::ExchangeNotFound` / `Error::QueueNotFound` for missing
    ///   endpoints
    /// - `Error::SessionClosed` if this session has ended
    async fn bind(&self, exchange: &str, queue: &str, binding_key: &str) -> Result<()>;

    /// Publish a message to an exchange.
    ///
    /// The empty exchange name addresses the default exchange, where the
    /// routing key is the destination queue name. A message that routes
    /// to no existing queue is dropped silently.
    ///
    /// # Errors
    ///
    /// - `Error::ExchangeNotFound` if a named exchange does not exist
    /// - `Error::SessionClosed` if this session has ended
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: Properties,
    ) -> Result<()>;

    /// Register a consumer on a queue and start its dispatch loop.
    ///
    /// The handler runs to completion for one delivery before the loop
    /// claims the next; a slow handler therefore holds back only its own
    /// consumer, up to that consumer's prefetch bound.
    ///
    /// # Errors
    ///
    /// - `Error::QueueNotFound` if the queue does not exist
    /// - `Error::ResourceLocked` if the queue is exclusive to another session
    /// - `Error::SessionClosed` if this session has ended
    async fn consume(
        &self,
        queue: &str,
        opts: ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<ConsumerHandle>;

    /// Cancel a consumer.
    ///
    /// The dispatch loop stops after any in-flight handler invocation and
    /// the consumer's unacknowledged deliveries are requeued at the head
    /// of their queue, oldest first.
    ///
    /// # Errors
    ///
    /// - `Error::SessionClosed` if this session has ended
    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    /// Acknowledge a delivery by tag, removing its message for good.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownDeliveryTag` if the tag is unknown or already
    ///   settled; no queue state is altered
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Negatively acknowledge a delivery by tag, requeuing its message at
    /// the head of the queue it came from.
    ///
    /// # Errors
    ///
    /// - `Error::UnknownDeliveryTag` if the tag is unknown or already
    ///   settled; no queue state is altered
    async fn nack(&self, delivery_tag: u64) -> Result<()>;
}

/// Shared channel pointer.
///
/// This is an `Arc<dyn Channel>`: cheap to clone, and used to erase the
/// concrete broker behind a stable domain interface.
pub type ChannelPtr = Arc<dyn Channel>;
