// src/client/rpc_client.rs

//! RPC client (caller role).
//!
//! The client declares one exclusive, server-named reply queue at
//! construction and runs a single auto-acknowledging consumer on it. Each
//! call registers a fresh correlation id in the outstanding-call map,
//! publishes the request with `reply_to` pointing at the reply queue, and
//! parks on a oneshot receiver until the reply consumer resolves it or
//! the deadline elapses.
//!
//! Concurrent calls share the one reply queue and the one map; replies
//! carrying an unknown or already-resolved correlation id are discarded
//! without error, so a reply that loses the race against its timeout is
//! harmless.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time;

use crate::broker::lock_ignore_poison;
use crate::{
    //
    handler,
    AckMode,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    CorrelationId,
    Error,
    Outcome,
    Properties,
    QueueOptions,
    Result,
};

use super::pending::PendingCalls;

/// Default deadline for [`RpcClient::call`].
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed); clones share the reply queue
/// and the outstanding-call map.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    channel: ChannelPtr,
    request_queue: Arc<str>,
    reply_queue: Arc<str>,
    pending: Arc<Mutex<PendingCalls>>,
    default_timeout: Duration,

    /// Keeps the reply consumer identifiable; the dispatch loop itself
    /// runs until the session ends.
    _reply_consumer: ConsumerHandle,
}

impl RpcClient {
    // ---
    /// Create a client that issues calls to `request_queue`.
    ///
    /// Declares the request queue (so calls made before any server is up
    /// are buffered rather than dropped) and an exclusive reply queue
    /// owned by this client's session.
    ///
    /// # Errors
    ///
    /// Returns an error if a declaration fails or the reply consumer
    /// cannot be registered.
    pub async fn new(channel: ChannelPtr, request_queue: &str) -> Result<Self> {
        // ---
        Self::with_timeout(channel, request_queue, DEFAULT_CALL_TIMEOUT).await
    }

    /// Create a client with a non-default deadline for [`call`](Self::call).
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub async fn with_timeout(
        channel: ChannelPtr,
        request_queue: &str,
        default_timeout: Duration,
    ) -> Result<Self> {
        // ---
        let request_info = channel
            .declare_queue(request_queue, QueueOptions::default())
            .await?;

        let reply_info = channel
            .declare_queue(
                "",
                QueueOptions {
                    exclusive: true,
                    ..QueueOptions::default()
                },
            )
            .await?;

        let pending = Arc::new(Mutex::new(PendingCalls::new()));

        let reply_pending = pending.clone();
        let reply_consumer = channel
            .consume(
                &reply_info.name,
                ConsumeOptions {
                    ack_mode: AckMode::Auto,
                    prefetch_count: 0,
                },
                handler(move |delivery| {
                    // ---
                    let pending = reply_pending.clone();
                    async move {
                        match &delivery.message.properties.correlation_id {
                            Some(id) => {
                                let resolved = lock_ignore_poison(&pending)
                                    .complete(id, delivery.message.body.clone());
                                if !resolved {
                                    crate::log_debug!(
                                        "discarding reply with unknown correlation id {id}"
                                    );
                                }
                            }
                            None => {
                                crate::log_debug!("discarding reply without correlation id");
                            }
                        }
                        Outcome::Ack
                    }
                }),
            )
            .await?;

        Ok(Self {
            inner: Arc::new(Inner {
                channel,
                request_queue: request_info.name,
                reply_queue: reply_info.name,
                pending,
                default_timeout,
                _reply_consumer: reply_consumer,
            }),
        })
    }

    /// Issue a call and wait for its reply, up to the default deadline.
    ///
    /// # Errors
    ///
    /// - `Error::Timeout` if no matching reply arrives in time; the
    ///   published request is *not* retracted, and its late reply (if
    ///   any) is discarded
    /// - `Error::SessionClosed` if the underlying channel has ended
    pub async fn call(&self, body: Bytes) -> Result<Bytes> {
        // ---
        self.call_with_timeout(body, self.inner.default_timeout).await
    }

    /// Issue a call with an explicit deadline.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call).
    pub async fn call_with_timeout(&self, body: Bytes, timeout: Duration) -> Result<Bytes> {
        // ---
        let correlation_id = CorrelationId::generate();

        let rx = lock_ignore_poison(&self.inner.pending).register(correlation_id.clone());

        let properties = Properties {
            correlation_id: Some(correlation_id.clone()),
            reply_to: Some(self.inner.reply_queue.clone()),
            persistent: false,
        };

        self.inner
            .channel
            .publish("", &self.inner.request_queue, body, properties)
            .await?;

        match time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // Sender dropped without a reply: the client state went away
            // underneath us.
            Ok(Err(_)) => Err(Error::SessionClosed),
            Err(_elapsed) => {
                // ---
                lock_ignore_poison(&self.inner.pending).remove(&correlation_id);
                Err(Error::Timeout)
            }
        }
    }

    /// Issue a call with JSON-serialized request and reply payloads.
    ///
    /// # Errors
    ///
    /// - `Error::Serialization` if either side fails to (de)serialize
    /// - otherwise same as [`call`](Self::call)
    pub async fn call_typed<TReq, TResp>(&self, request: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let body = Bytes::from(serde_json::to_vec(request)?);
        let reply = self.call(body).await?;
        Ok(serde_json::from_slice(&reply)?)
    }

    /// Name of this client's exclusive reply queue.
    pub fn reply_queue(&self) -> &str {
        &self.inner.reply_queue
    }

    /// Number of calls currently awaiting replies.
    pub fn outstanding_calls(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }
}
