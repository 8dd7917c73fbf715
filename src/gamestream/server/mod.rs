//! Process-level concerns shared by every worker

mod origin;
mod shutdown;

pub use origin::origin_name;
pub use shutdown::{shutdown_signal, ShutdownSignal};
