//! Distributed stream-processing pipeline core.
//!
//! Worker stages consume partitioned broker queues, route records to per-job
//! handler runtimes, and forward results downstream with idempotency sequence
//! numbers. Jobs terminate by EOF-token accounting; crash recovery replays an
//! append-only state log; a fleet-management ring watches worker liveness.

pub mod gamestream;

// Re-export the main API surface
pub use gamestream::broker::{
    BrokerDelivery, BrokerError, BrokerExchange, BrokerQueue, InMemoryBroker,
};
pub use gamestream::codec::{CodecError, Deserializer, Serializer};
pub use gamestream::config::ArchitectureConfig;
pub use gamestream::controller::{
    Controller, ControllerError, Handler, HandlerError, HandlerFactory,
};
pub use gamestream::protocol::{
    EofToken, EofValidator, JobId, MessageKind, NodeProtocol, Partitionable, Protocol,
    RequiredTokens, Serializable, TokenName, TransportMessage,
};
pub use gamestream::ring::{receive_frame, send_frame, RingManager, RingMessage, RingPeer};
pub use gamestream::state::{
    load_saved_state, save_state, IdempotencyId, IdempotencyStore, ReplayMode,
};
pub use gamestream::storage::TemporaryStorage;
