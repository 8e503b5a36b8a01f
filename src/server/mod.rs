// src/server/mod.rs

//! RPC server (dispatcher role).
//!
//! Consumes a well-known request queue in Manual mode with a prefetch
//! bound, so several server instances sharing the queue split the load
//! instead of one instance hoarding it. For each request the registered
//! handler runs to completion, the reply is published to the request's
//! `reply_to` queue carrying the same correlation id, and only then is
//! the request acknowledged.
//!
//! A handler fault is still acknowledged: a request that keeps failing
//! would otherwise bounce through requeue forever. Callers that need to
//! see faults encode them in the reply payload.

mod handler;

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{
    //
    handler as delivery_handler,
    AckMode,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    Outcome,
    Properties,
    QueueOptions,
    Result,
};

use handler::{wrap_handler, BoxedRpcHandler};

/// RPC server bound to one request queue.
pub struct RpcServer {
    // ---
    channel: ChannelPtr,
    queue: Arc<str>,
    prefetch: u16,
}

impl RpcServer {
    // ---
    /// Create a server for `request_queue`. Prefetch defaults to one:
    /// a busy instance leaves further requests to its peers.
    pub fn new(channel: ChannelPtr, request_queue: impl Into<Arc<str>>) -> Self {
        // ---
        Self {
            channel,
            queue: request_queue.into(),
            prefetch: 1,
        }
    }

    /// Override the prefetch bound (0 = unbounded).
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        // ---
        self.prefetch = prefetch_count;
        self
    }

    /// Start serving requests with a raw-bytes handler.
    ///
    /// Returns the handle of the consumer running the serve loop; cancel
    /// it through the channel to stop serving.
    ///
    /// # Errors
    ///
    /// Returns an error if declaring the request queue or registering the
    /// consumer fails.
    pub async fn serve<F, Fut>(&self, f: F) -> Result<ConsumerHandle>
    where
        F: Fn(Bytes) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        // ---
        let boxed: BoxedRpcHandler = Arc::new(move |bytes| {
            let f = f.clone();
            let fut = Box::pin(async move { f(bytes).await });
            fut as std::pin::Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>
        });
        self.serve_boxed(boxed).await
    }

    /// Start serving requests with a typed JSON handler.
    ///
    /// # Errors
    ///
    /// Same as [`serve`](Self::serve).
    pub async fn serve_typed<F, Fut, Req, Resp>(&self, f: F) -> Result<ConsumerHandle>
    where
        F: Fn(Req) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<Resp>> + Send + 'static,
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
    {
        // ---
        self.serve_boxed(wrap_handler(f)).await
    }

    async fn serve_boxed(&self, f: BoxedRpcHandler) -> Result<ConsumerHandle> {
        // ---
        self.channel
            .declare_queue(&self.queue, QueueOptions::default())
            .await?;

        let channel = self.channel.clone();
        let dispatch = delivery_handler(move |delivery| {
            // ---
            let channel = channel.clone();
            let f = f.clone();
            async move {
                let properties = delivery.message.properties.clone();

                match f(delivery.message.body.clone()).await {
                    Ok(reply) => match &properties.reply_to {
                        Some(reply_to) => {
                            let reply_properties = Properties {
                                correlation_id: properties.correlation_id.clone(),
                                ..Properties::default()
                            };
                            if let Err(err) =
                                channel.publish("", reply_to, reply, reply_properties).await
                            {
                                crate::log_warn!("failed to publish rpc reply: {err}");
                            }
                        }
                        None => {
                            crate::log_warn!("rpc request without reply-to, dropping reply");
                        }
                    },
                    Err(err) => {
                        crate::log_warn!("rpc handler fault: {err}");
                    }
                }

                // Acked even on fault; a poisoned request must not cycle
                // through redelivery forever.
                Outcome::Ack
            }
        });

        self.channel
            .consume(
                &self.queue,
                ConsumeOptions {
                    ack_mode: AckMode::Manual,
                    prefetch_count: self.prefetch,
                },
                dispatch,
            )
            .await
    }
}
