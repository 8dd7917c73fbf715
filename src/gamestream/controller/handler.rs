use std::error::Error;
use std::fmt;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::gamestream::codec::CodecError;
use crate::gamestream::protocol::{EofValidator, JobId, Partitionable};

/// Errors reported by application handlers. All of them are terminal for the
/// job that produced them.
#[derive(Debug)]
pub enum HandlerError {
    /// A payload did not decode to the record this stage consumes.
    Codec(CodecError),

    /// Persistent storage failed underneath the handler.
    Io(std::io::Error),

    /// The operator itself gave up on the job.
    Failed(String),
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerError::Codec(e) => write!(f, "handler payload decode failed: {}", e),
            HandlerError::Io(e) => write!(f, "handler storage failed: {}", e),
            HandlerError::Failed(msg) => write!(f, "handler failed: {}", msg),
        }
    }
}

impl Error for HandlerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HandlerError::Codec(e) => Some(e),
            HandlerError::Io(e) => Some(e),
            HandlerError::Failed(_) => None,
        }
    }
}

impl From<CodecError> for HandlerError {
    fn from(e: CodecError) -> Self {
        HandlerError::Codec(e)
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(e: std::io::Error) -> Self {
        HandlerError::Io(e)
    }
}

/// A business operator processing one job's records on one stage.
///
/// The runtime drives it: `handle` per data message, `next_stage` once every
/// required upstream has drained, `shutdown` exactly once at the end of the
/// job's life. Implementations are free to persist through
/// [`TemporaryStorage`](crate::TemporaryStorage) and
/// [`load_saved_state`](crate::load_saved_state).
#[async_trait]
pub trait Handler: Send {
    /// Processes one data payload, optionally producing a downstream record.
    async fn handle(
        &mut self,
        payload: &[u8],
    ) -> Result<Option<Box<dyn Partitionable + Send>>, HandlerError>;

    /// Starts the final aggregation once the job's inputs are complete.
    ///
    /// Returns a lazy finite sequence of records plus an error channel; both
    /// close to signal completion. An error is terminal for the job.
    fn next_stage(
        &mut self,
    ) -> (
        mpsc::Receiver<Box<dyn Partitionable + Send>>,
        mpsc::Receiver<HandlerError>,
    );

    /// Releases resources. With `delete` the handler may remove persisted
    /// artifacts; without it they must survive for a later resumption.
    async fn shutdown(&mut self, delete: bool) -> Result<(), HandlerError>;
}

/// Builds the handler/validator pair for a job on first sight.
pub type HandlerFactory = Box<
    dyn Fn(JobId) -> Result<(Box<dyn Handler>, Box<dyn EofValidator>), HandlerError>
        + Send
        + Sync,
>;
