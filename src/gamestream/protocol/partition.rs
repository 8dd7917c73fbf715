use crate::gamestream::codec::CodecError;
use crate::gamestream::state::IdempotencyId;

use super::{JobId, MessageKind, Protocol, Serializable, TransportMessage};

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

/// 32-bit FNV-1a. The partition contract pins this exact hash, so it is
/// implemented here rather than taken from a hasher with its own variant.
pub fn fnv1a_32(data: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in data {
        hash ^= b as u32;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Standard stage protocol: transport framing plus FNV-1a partition routing
/// over `partitions` downstream consumers.
#[derive(Debug, Clone)]
pub struct NodeProtocol {
    partitions: u32,
}

impl NodeProtocol {
    pub fn new(partitions: u32) -> Self {
        assert!(partitions > 0, "partition count must be positive");
        NodeProtocol { partitions }
    }

    pub fn partitions(&self) -> u32 {
        self.partitions
    }
}

impl Protocol for NodeProtocol {
    fn unmarshal(&self, raw: &[u8]) -> Result<TransportMessage, CodecError> {
        TransportMessage::unmarshal(raw)
    }

    fn marshal(
        &self,
        job_id: JobId,
        idem_id: &IdempotencyId,
        kind: MessageKind,
        body: &dyn Serializable,
    ) -> Vec<u8> {
        TransportMessage::new(job_id, idem_id.clone(), kind, body.serialize()).marshal()
    }

    /// Maps the key onto `[1, N]` and renders it as a decimal routing key.
    fn route(&self, partition_key: &str) -> String {
        ((fnv1a_32(partition_key.as_bytes()) % self.partitions) + 1).to_string()
    }

    /// The routing keys `"1"` through `"N"`.
    fn broadcast(&self) -> Vec<String> {
        (1..=self.partitions).map(|i| i.to_string()).collect()
    }
}
