// src/domain/message.rs

//! Message and delivery types.
//!
//! A [`Message`] is the unit of routing between publishers and queues. It
//! carries an opaque payload plus the small set of properties the broker
//! boundary must move end to end (correlation id, reply-to queue,
//! persistence hint). Messages are immutable once published; queues and
//! deliveries share the same underlying payload bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::CorrelationId;

/// Optional metadata attached to a published message.
///
/// These are the only fields the broker itself interprets; everything
/// else a caller needs must live in the payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    /// Caller-assigned token echoed verbatim by RPC replies.
    pub correlation_id: Option<CorrelationId>,

    /// Queue name to which a reply should be published.
    pub reply_to: Option<Arc<str>>,

    /// Durability hint. Persistent messages in a durable queue survive
    /// a broker restart; everything else is dropped.
    pub persistent: bool,
}

/// An immutable published message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing key the publisher attached. For the default exchange this
    /// is the destination queue name; for a direct exchange it is matched
    /// exactly against binding keys.
    pub routing_key: Arc<str>,

    /// Opaque payload bytes.
    pub body: Bytes,

    /// Message properties.
    pub properties: Properties,
}

impl Message {
    /// Create a message with default properties.
    pub fn new(routing_key: impl Into<Arc<str>>, body: impl Into<Bytes>) -> Self {
        // ---
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            properties: Properties::default(),
        }
    }

    /// Create a message with explicit properties.
    pub fn with_properties(
        routing_key: impl Into<Arc<str>>,
        body: impl Into<Bytes>,
        properties: Properties,
    ) -> Self {
        // ---
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            properties,
        }
    }
}

/// A message handed to a consumer, paired with its delivery tag.
///
/// The tag is monotonically increasing per session and unique while the
/// delivery is unacknowledged. A `Delivery` is a transient view: the
/// queue keeps ownership of the message until the delivery is settled.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag used to ack or nack this delivery on its session.
    pub delivery_tag: u64,

    /// Name of the queue this delivery came from.
    pub queue: Arc<str>,

    /// The delivered message.
    pub message: Message,
}
