//! Fleet-management ring
//!
//! Peer nodes form a unidirectional ring ordered by identifier, elect a
//! leader with Chang–Roberts, and exchange healthcheck/alive messages. The
//! wire is length-prefixed ASCII frames of the form `TYPE|content`.

mod manager;
mod protocol;

pub use manager::{RingManager, RingPeer};
pub use protocol::{receive_frame, send_frame, RingError, RingMessage};
