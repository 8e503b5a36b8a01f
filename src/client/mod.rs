// src/client/mod.rs

//! RPC client: correlated request/reply over a [`Channel`](crate::Channel).

mod pending;
mod rpc_client;

pub use rpc_client::{RpcClient, DEFAULT_CALL_TIMEOUT};
