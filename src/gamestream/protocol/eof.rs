use std::collections::HashMap;

use crate::gamestream::codec::{CodecError, Deserializer, Serializer};

use super::Serializable;

/// Logical upstream stream named by an EOF token.
///
/// `Game`/`Review` identify the two ingress streams; `Partition(n)` names one
/// partitioned upstream consumer of an intermediate stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenName {
    Game,
    Review,
    Partition(u32),
}

const TOKEN_GAME: u8 = 0;
const TOKEN_REVIEW: u8 = 1;
const TOKEN_PARTITION: u8 = 2;

/// A control-message payload declaring that one logical upstream finished
/// emitting for a job. `count` lets a single token stand for several drained
/// upstream partitions at once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EofToken {
    pub name: TokenName,
    pub count: u32,
}

impl EofToken {
    pub fn new(name: TokenName, count: u32) -> Self {
        EofToken { name, count }
    }

    pub fn deserialize(d: &mut Deserializer<'_>) -> Result<Self, CodecError> {
        let name = match d.read_u8()? {
            TOKEN_GAME => TokenName::Game,
            TOKEN_REVIEW => TokenName::Review,
            TOKEN_PARTITION => TokenName::Partition(d.read_u32()?),
            other => {
                return Err(CodecError::InvalidString(format!(
                    "unknown EOF token tag {}",
                    other
                )))
            }
        };
        Ok(EofToken {
            name,
            count: d.read_u32()?,
        })
    }
}

impl Serializable for EofToken {
    fn serialize(&self) -> Vec<u8> {
        let s = match self.name {
            TokenName::Game => Serializer::new().write_u8(TOKEN_GAME),
            TokenName::Review => Serializer::new().write_u8(TOKEN_REVIEW),
            TokenName::Partition(n) => Serializer::new().write_u8(TOKEN_PARTITION).write_u32(n),
        };
        s.write_u32(self.count).into_bytes()
    }
}

/// Decides when every required upstream has drained for a job.
///
/// The runtime feeds it the multiset of received tokens after each control
/// message; `finish` returns the EOF token to broadcast downstream once the
/// received multiset covers the requirement.
pub trait EofValidator: Send {
    fn finish(&self, received: &HashMap<TokenName, u32>) -> Option<EofToken>;
}

/// Validator over a fixed required multiset.
pub struct RequiredTokens {
    required: HashMap<TokenName, u32>,
    emit: EofToken,
}

impl RequiredTokens {
    /// `required` is the multiset of upstream tokens that must arrive;
    /// `emit` is broadcast downstream when they have.
    pub fn new(required: impl IntoIterator<Item = (TokenName, u32)>, emit: EofToken) -> Self {
        RequiredTokens {
            required: required.into_iter().collect(),
            emit,
        }
    }
}

impl EofValidator for RequiredTokens {
    fn finish(&self, received: &HashMap<TokenName, u32>) -> Option<EofToken> {
        let covered = self
            .required
            .iter()
            .all(|(name, needed)| received.get(name).copied().unwrap_or(0) >= *needed);
        if covered {
            Some(self.emit.clone())
        } else {
            None
        }
    }
}
