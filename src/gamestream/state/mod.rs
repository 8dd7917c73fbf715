//! Idempotency tracking and the crash-safe per-job state log

mod idempotency;
mod recovery;

pub use idempotency::{IdempotencyId, IdempotencyStore};
pub use recovery::{load_saved_state, save_state, ReplayMode, StateError};
