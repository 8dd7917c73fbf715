//! Crash-safe replay of the append-only state log
//!
//! The log is a concatenation of self-delimiting records:
//!
//! ```text
//! sequence(4) | origin_len(4) | origin | <application delta bytes>
//! ```
//!
//! Delta encoding belongs to the application; replay is handed a decoder for
//! it. An unflushed tail record left by a crash is truncated during load —
//! before any subsequent append — so the file only ever grows from a prefix
//! of whole records.

use std::error::Error;
use std::fmt;

use crate::gamestream::codec::{CodecError, Deserializer, Serializer};
use crate::gamestream::storage::TemporaryStorage;

use super::{IdempotencyId, IdempotencyStore};

/// How replayed deltas become in-memory state.
pub enum ReplayMode<S> {
    /// `state = fold(state, delta)` for every record in file order.
    /// Duplicate `(origin, sequence)` pairs are still applied: fold deltas
    /// are persisted per event and their combination is the state.
    Fold(Box<dyn Fn(S, S) -> S + Send>),

    /// The last record in file order supplies the state by replacement.
    Overwrite,
}

impl<S> ReplayMode<S> {
    pub fn fold(f: impl Fn(S, S) -> S + Send + 'static) -> Self {
        ReplayMode::Fold(Box::new(f))
    }
}

/// Errors surfaced by state replay.
#[derive(Debug)]
pub enum StateError {
    Io(std::io::Error),

    /// The log decoded to garbage that is not a torn tail (for example a
    /// non-UTF-8 origin). Truncation cannot repair this.
    Corrupt(CodecError),
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateError::Io(e) => write!(f, "state log I/O error: {}", e),
            StateError::Corrupt(e) => write!(f, "state log corrupted: {}", e),
        }
    }
}

impl Error for StateError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StateError::Io(e) => Some(e),
            StateError::Corrupt(e) => Some(e),
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io(e)
    }
}

/// Appends one `(id, delta)` record to the log.
pub fn save_state(
    storage: &mut TemporaryStorage,
    id: &IdempotencyId,
    delta: &[u8],
) -> std::io::Result<()> {
    let record = Serializer::new()
        .write_u32(id.sequence)
        .write_string(&id.origin)
        .write_raw(delta)
        .into_bytes();
    storage.append(&record)?;
    Ok(())
}

/// Replays the log into `(last-seen ids, state)`.
///
/// Records are applied in file order. If a record fails to decode because the
/// buffer ran out, the file is truncated to the offset before that record and
/// the surviving prefix is the result; loading again afterwards yields the
/// same answer. Any other decode failure is [`StateError::Corrupt`].
pub fn load_saved_state<S, D>(
    storage: &mut TemporaryStorage,
    decode_delta: D,
    mode: ReplayMode<S>,
    zero: S,
) -> Result<(IdempotencyStore, S), StateError>
where
    D: Fn(&mut Deserializer<'_>) -> Result<S, CodecError>,
{
    let buf = storage.read_all()?;
    let total = buf.len();
    let mut cursor = Deserializer::new(&buf);

    let mut last_ids = IdempotencyStore::new();
    let mut state = zero;
    let mut torn_at: Option<u64> = None;

    loop {
        if cursor.remaining() == 0 {
            break;
        }
        let record_start = (total - cursor.remaining()) as u64;

        let delta = match read_record(&mut cursor, &decode_delta, &mut last_ids) {
            Ok(delta) => delta,
            Err(CodecError::Truncated { .. }) => {
                torn_at = Some(record_start);
                break;
            }
            Err(e) => return Err(StateError::Corrupt(e)),
        };

        state = match &mode {
            ReplayMode::Fold(fold) => fold(state, delta),
            ReplayMode::Overwrite => delta,
        };
    }

    if let Some(offset) = torn_at {
        storage.truncate(offset)?;
    }

    Ok((last_ids, state))
}

fn read_record<S, D>(
    cursor: &mut Deserializer<'_>,
    decode_delta: &D,
    last_ids: &mut IdempotencyStore,
) -> Result<S, CodecError>
where
    D: Fn(&mut Deserializer<'_>) -> Result<S, CodecError>,
{
    let sequence = cursor.read_u32()?;
    let origin = cursor.read_string()?;
    let delta = decode_delta(cursor)?;
    last_ids.update(&IdempotencyId::new(origin, sequence));
    Ok(delta)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter {
        count: u32,
    }

    fn decode_counter(d: &mut Deserializer<'_>) -> Result<Counter, CodecError> {
        Ok(Counter {
            count: d.read_u32()?,
        })
    }

    fn write_log(stg: &mut TemporaryStorage) {
        for (seq, origin, delta) in [
            (1, "A", 1),
            (1, "B", 2),
            (2, "A", 3),
            (2, "B", 4),
            (3, "A", 5),
        ] {
            save_state(stg, &IdempotencyId::new(origin, seq), &delta_bytes(delta)).unwrap();
        }
    }

    fn delta_bytes(v: u32) -> Vec<u8> {
        Serializer::new().write_u32(v).into_bytes()
    }

    #[test]
    fn replay_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut stg = TemporaryStorage::new(dir.path().join("state")).unwrap();
        write_log(&mut stg);
        // Tear the last record mid-delta.
        let len = stg.size().unwrap();
        stg.truncate(len - 2).unwrap();

        let (ids1, s1) = load_saved_state(
            &mut stg,
            decode_counter,
            ReplayMode::fold(|old: Counter, new| Counter {
                count: old.count + new.count,
            }),
            Counter { count: 0 },
        )
        .unwrap();

        let (ids2, s2) = load_saved_state(
            &mut stg,
            decode_counter,
            ReplayMode::fold(|old: Counter, new| Counter {
                count: old.count + new.count,
            }),
            Counter { count: 0 },
        )
        .unwrap();

        assert_eq!(s1.count, s2.count);
        assert_eq!(
            ids1.last_for_origin("A").unwrap(),
            ids2.last_for_origin("A").unwrap()
        );
        assert_eq!(
            ids1.last_for_origin("B").unwrap(),
            ids2.last_for_origin("B").unwrap()
        );
    }

    #[test]
    fn empty_log_yields_zero() {
        let dir = tempfile::tempdir().unwrap();
        let mut stg = TemporaryStorage::new(dir.path().join("state")).unwrap();
        let (ids, state) = load_saved_state(
            &mut stg,
            decode_counter,
            ReplayMode::Overwrite,
            Counter { count: 99 },
        )
        .unwrap();
        assert!(ids.is_empty());
        assert_eq!(state.count, 99);
    }
}
