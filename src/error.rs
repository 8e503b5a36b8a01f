use thiserror::Error;

/// Errors reported by broker and RPC operations.
#[derive(Error, Debug)]
pub enum Error {
    /// RPC call timed out waiting for its reply
    #[error("rpc call timed out")]
    Timeout,

    /// Queue re-declared with different durability or exclusivity flags
    #[error("queue '{0}' re-declared with conflicting parameters")]
    QueueDeclareConflict(String),

    /// Exchange re-declared with a different kind
    #[error("exchange '{0}' re-declared with a different kind")]
    ExchangeDeclareConflict(String),

    /// Operation referenced a queue that does not exist
    #[error("queue not found: '{0}'")]
    QueueNotFound(String),

    /// Publish or bind referenced an exchange that does not exist
    #[error("exchange not found: '{0}'")]
    ExchangeNotFound(String),

    /// Queue is exclusive to another session
    #[error("queue '{0}' is locked by another session")]
    ResourceLocked(String),

    /// Ack or nack named a tag that is unknown or already settled
    #[error("unknown delivery tag: {0}")]
    UnknownDeliveryTag(u64),

    /// Operation attempted on a closed session
    #[error("session is closed")]
    SessionClosed,

    /// JSON serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, Error>;
