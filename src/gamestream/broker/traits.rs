use async_trait::async_trait;
use std::error::Error;
use std::fmt;
use tokio::sync::mpsc;

/// Errors surfaced by broker operations. The broker is mandatory for a
/// worker, so the controller treats publish/consume failures as fatal.
#[derive(Debug, Clone)]
pub enum BrokerError {
    /// The queue or exchange is gone or was never declared.
    NotFound(String),

    /// A queue can feed exactly one consumer loop.
    AlreadyConsumed(String),

    /// Transport-level failure while publishing or acknowledging.
    Transport(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::NotFound(name) => write!(f, "unknown queue or exchange '{}'", name),
            BrokerError::AlreadyConsumed(name) => {
                write!(f, "queue '{}' already has a consumer", name)
            }
            BrokerError::Transport(msg) => write!(f, "broker transport error: {}", msg),
        }
    }
}

impl Error for BrokerError {}

/// One message handed to a consumer, with its acknowledgment handle.
///
/// Acknowledgment consumes the delivery: each is acked or nacked exactly
/// once, and strictly after any downstream publish it caused.
#[async_trait]
pub trait BrokerDelivery: Send {
    fn body(&self) -> &[u8];

    async fn ack(self: Box<Self>) -> Result<(), BrokerError>;

    /// Returns the message to its queue for redelivery. Used for payloads
    /// that failed to unmarshal or could not reach a handler.
    async fn nack_requeue(self: Box<Self>) -> Result<(), BrokerError>;

    /// Drops the message without redelivery. Used to abandon a poisoned
    /// record after a terminal handler error.
    async fn nack_discard(self: Box<Self>) -> Result<(), BrokerError>;
}

/// A declared queue this worker consumes from.
#[async_trait]
pub trait BrokerQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Starts consumption and returns the delivery channel. The channel
    /// closes when the broker connection does.
    async fn consume(&self) -> Result<mpsc::Receiver<Box<dyn BrokerDelivery>>, BrokerError>;
}

/// A declared exchange this worker publishes to.
#[async_trait]
pub trait BrokerExchange: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;
}
