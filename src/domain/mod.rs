// src/domain/mod.rs

//! Domain types shared by the broker engine and the RPC layers.

mod channel;
mod message;

pub use channel::{
    //
    handler,
    AckMode,
    Channel,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    DeliveryHandler,
    ExchangeKind,
    HandlerFuture,
    Outcome,
    QueueInfo,
    QueueOptions,
};
pub use message::{Delivery, Message, Properties};
