//! Wire protocol between pipeline stages
//!
//! Every broker payload is a [`TransportMessage`]: job id, idempotency id,
//! data/control tag, and an opaque body. Control messages carry
//! [`EofToken`]s; partition routing hashes application keys onto the
//! configured routing-key space.

mod eof;
mod message;
mod partition;

pub use eof::{EofToken, EofValidator, RequiredTokens, TokenName};
pub use message::{
    JobId, MessageKind, Partitionable, Serializable, TransportMessage,
};
pub use partition::{fnv1a_32, NodeProtocol};

use crate::gamestream::codec::CodecError;
use crate::gamestream::state::IdempotencyId;

/// Codec seam between a controller and its broker queues/exchanges.
///
/// A stage's protocol knows how to frame outgoing records and how to spread
/// them over the downstream partitions.
pub trait Protocol: Send + Sync {
    fn unmarshal(&self, raw: &[u8]) -> Result<TransportMessage, CodecError>;

    fn marshal(
        &self,
        job_id: JobId,
        idem_id: &IdempotencyId,
        kind: MessageKind,
        body: &dyn Serializable,
    ) -> Vec<u8>;

    /// Routing key for one partitioned record.
    fn route(&self, partition_key: &str) -> String;

    /// Every downstream routing key, for fan-out of control messages.
    fn broadcast(&self) -> Vec<String>;
}
