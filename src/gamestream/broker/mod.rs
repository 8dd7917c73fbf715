//! Broker seam between the pipeline core and the message broker
//!
//! The broker client itself lives outside this crate; the controller only
//! sees these traits. The semantics are AMQP-shaped: durable exchanges,
//! named queues with routing-key bindings, manual acknowledgment with
//! requeue-on-nack. [`InMemoryBroker`] implements the same traits for tests
//! and local runs.

mod in_memory;
mod traits;

pub use in_memory::InMemoryBroker;
pub use traits::{BrokerDelivery, BrokerError, BrokerExchange, BrokerQueue};
