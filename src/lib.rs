//! In-process message broker core with RPC correlation
//!
//! This library provides the reusable heart of a message-oriented system:
//! exchange-based routing into FIFO queues, per-consumer delivery flow
//! control (prefetch/ack bookkeeping), and a correlated request/reply
//! layer built on top of the same primitives.
//!
//! The broker boundary is the [`Channel`] trait; the in-process
//! [`Session`] is its reference implementation. [`RpcClient`] and
//! [`RpcServer`] are written against [`ChannelPtr`] only, so they remain
//! broker-agnostic.
//!

// Import all sub modules once...
mod broker;
mod client;
mod domain;
mod server;

mod correlation;
mod error;
mod macros;

// Re-export main types
pub use broker::{Broker, Session};

pub use client::{RpcClient, DEFAULT_CALL_TIMEOUT};
pub use server::RpcServer;

pub use correlation::CorrelationId;
pub use error::{Error, Result};

// --- public re-exports
pub use domain::{
    //
    handler,
    AckMode,
    Channel,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    DeliveryHandler,
    ExchangeKind,
    HandlerFuture,
    Message,
    Outcome,
    Properties,
    QueueInfo,
    QueueOptions,
};
