// src/server/handler.rs

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// Type-erased async request handler.
///
/// Handlers take the raw request payload and return the raw reply
/// payload. Wrapped in `Arc` for cheap cloning into the dispatch closure.
pub(super) type BoxedRpcHandler =
    Arc<dyn Fn(Bytes) -> Pin<Box<dyn Future<Output = Result<Bytes>> + Send>> + Send + Sync>;

/// Wrap a typed handler function into a type-erased handler.
///
/// Request and reply payloads are JSON; a request that fails to
/// deserialize surfaces as a handler fault (acknowledged, no reply).
pub(super) fn wrap_handler<F, Fut, Req, Resp>(handler: F) -> BoxedRpcHandler
where
    F: Fn(Req) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = Result<Resp>> + Send + 'static,
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
{
    // ---
    Arc::new(move |bytes: Bytes| {
        let handler = handler.clone();
        let fut = Box::pin(async move {
            // ---
            let request: Req = serde_json::from_slice(&bytes)?;
            let reply: Resp = handler(request).await?;
            Ok(Bytes::from(serde_json::to_vec(&reply)?))
        });

        fut as Pin<Box<dyn Future<Output = Result<Bytes>> + Send>>
    })
}
