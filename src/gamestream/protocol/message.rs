use uuid::Uuid;

use crate::gamestream::codec::{CodecError, Deserializer, Serializer};
use crate::gamestream::state::IdempotencyId;

/// Opaque 128-bit identifier correlating every message of one pipeline
/// invocation. Equality only.
pub type JobId = Uuid;

/// Anything that can be framed into a message body.
pub trait Serializable {
    fn serialize(&self) -> Vec<u8>;
}

/// A downstream record that also chooses its partition.
///
/// The partition key is an application string (for example `"AppID=42"`)
/// hashed onto a routing key so related records land on the same consumer.
pub trait Partitionable: Serializable {
    fn partition_key(&self) -> String;
}

impl Serializable for Vec<u8> {
    fn serialize(&self) -> Vec<u8> {
        self.clone()
    }
}

/// Data/control tag of a transport message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Data,
    Control,
}

impl MessageKind {
    fn to_wire(self) -> u8 {
        match self {
            MessageKind::Data => 0,
            MessageKind::Control => 1,
        }
    }

    fn from_wire(v: u8) -> Result<Self, CodecError> {
        match v {
            0 => Ok(MessageKind::Data),
            1 => Ok(MessageKind::Control),
            other => Err(CodecError::InvalidString(format!(
                "unknown message kind {}",
                other
            ))),
        }
    }
}

/// One broker payload.
///
/// Wire layout:
///
/// ```text
/// job_id(16) | origin_len(4) | origin | sequence(4) | kind(1) | payload_len(4) | payload
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMessage {
    pub job_id: JobId,
    pub idem_id: IdempotencyId,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl TransportMessage {
    pub fn new(
        job_id: JobId,
        idem_id: IdempotencyId,
        kind: MessageKind,
        payload: Vec<u8>,
    ) -> Self {
        TransportMessage {
            job_id,
            idem_id,
            kind,
            payload,
        }
    }

    /// Control messages carry EOF tokens.
    pub fn is_eof(&self) -> bool {
        self.kind == MessageKind::Control
    }

    pub fn marshal(&self) -> Vec<u8> {
        Serializer::with_capacity(16 + 4 + self.idem_id.origin.len() + 9 + self.payload.len())
            .write_raw(self.job_id.as_bytes())
            .write_string(&self.idem_id.origin)
            .write_u32(self.idem_id.sequence)
            .write_u8(self.kind.to_wire())
            .write_bytes(&self.payload)
            .into_bytes()
    }

    pub fn unmarshal(raw: &[u8]) -> Result<Self, CodecError> {
        let mut d = Deserializer::new(raw);

        let mut job_bytes = [0u8; 16];
        if d.remaining() < 16 {
            return Err(CodecError::Truncated {
                needed: 16,
                remaining: d.remaining(),
            });
        }
        for b in job_bytes.iter_mut() {
            *b = d.read_u8()?;
        }

        let origin = d.read_string()?;
        let sequence = d.read_u32()?;
        let kind = MessageKind::from_wire(d.read_u8()?)?;
        let payload = d.read_bytes()?;

        Ok(TransportMessage {
            job_id: Uuid::from_bytes(job_bytes),
            idem_id: IdempotencyId::new(origin, sequence),
            kind,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_data_message() {
        let msg = TransportMessage::new(
            Uuid::new_v4(),
            IdempotencyId::new("MF1", 17),
            MessageKind::Data,
            b"record body".to_vec(),
        );
        let raw = msg.marshal();
        let back = TransportMessage::unmarshal(&raw).unwrap();
        assert_eq!(back, msg);
        assert!(!back.is_eof());
    }

    #[test]
    fn control_kind_is_eof() {
        let msg = TransportMessage::new(
            Uuid::new_v4(),
            IdempotencyId::new("MF1", 1),
            MessageKind::Control,
            Vec::new(),
        );
        assert!(TransportMessage::unmarshal(&msg.marshal()).unwrap().is_eof());
    }

    #[test]
    fn short_buffer_is_truncated() {
        let msg = TransportMessage::new(
            Uuid::new_v4(),
            IdempotencyId::new("A", 1),
            MessageKind::Data,
            vec![9; 8],
        );
        let raw = msg.marshal();
        assert!(matches!(
            TransportMessage::unmarshal(&raw[..raw.len() - 3]),
            Err(CodecError::Truncated { .. })
        ));
        assert!(matches!(
            TransportMessage::unmarshal(&raw[..10]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_kind_rejected() {
        let msg = TransportMessage::new(
            Uuid::new_v4(),
            IdempotencyId::new("A", 1),
            MessageKind::Data,
            Vec::new(),
        );
        let mut raw = msg.marshal();
        // kind byte sits right after job id + origin + sequence
        let kind_at = 16 + 4 + 1 + 4;
        raw[kind_at] = 9;
        assert!(TransportMessage::unmarshal(&raw).is_err());
    }
}
