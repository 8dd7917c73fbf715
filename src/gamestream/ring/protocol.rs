use std::error::Error;
use std::fmt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

#[derive(Debug)]
pub enum RingError {
    Io(std::io::Error),
    Malformed(String),
}

impl fmt::Display for RingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RingError::Io(e) => write!(f, "ring I/O error: {}", e),
            RingError::Malformed(raw) => write!(f, "malformed ring message: {}", raw),
        }
    }
}

impl Error for RingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RingError::Io(e) => Some(e),
            RingError::Malformed(_) => None,
        }
    }
}

impl From<std::io::Error> for RingError {
    fn from(e: std::io::Error) -> Self {
        RingError::Io(e)
    }
}

/// One ring protocol message: `TYPE|content`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RingMessage {
    /// Election payload carrying the highest node id seen so far.
    Election(u32),
    /// Coordinator announcement carrying the elected id.
    Coordinator(u32),
    /// Healthcheck ping.
    HealthCheck,
    /// Alive reply.
    Alive,
}

impl RingMessage {
    pub fn is_election(&self) -> bool {
        matches!(self, RingMessage::Election(_))
    }

    pub fn is_coordinator(&self) -> bool {
        matches!(self, RingMessage::Coordinator(_))
    }

    pub fn is_health_check(&self) -> bool {
        matches!(self, RingMessage::HealthCheck)
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, RingMessage::Alive)
    }

    pub fn serialize(&self) -> String {
        match self {
            RingMessage::Election(id) => format!("ELE|{}", id),
            RingMessage::Coordinator(id) => format!("COO|{}", id),
            RingMessage::HealthCheck => "HCK|".to_string(),
            RingMessage::Alive => "ALV|".to_string(),
        }
    }

    /// Parses `TYPE|content`. A missing delimiter is tolerated for the
    /// content-free types, so a bare `"ALV"` still parses.
    pub fn deserialize(raw: &str) -> Result<Self, RingError> {
        let (kind, content) = match raw.split_once('|') {
            Some((kind, content)) => (kind, content),
            None => (raw, ""),
        };
        match kind {
            "ELE" => content
                .parse::<u32>()
                .map(RingMessage::Election)
                .map_err(|_| RingError::Malformed(raw.to_string())),
            "COO" => content
                .parse::<u32>()
                .map(RingMessage::Coordinator)
                .map_err(|_| RingError::Malformed(raw.to_string())),
            "HCK" => Ok(RingMessage::HealthCheck),
            "ALV" => Ok(RingMessage::Alive),
            _ => Err(RingError::Malformed(raw.to_string())),
        }
    }
}

impl fmt::Display for RingMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

/// Writes one frame: big-endian u32 length, then the UTF-8 bytes.
pub async fn send_frame(stream: &mut TcpStream, message: &RingMessage) -> Result<(), RingError> {
    let payload = message.serialize();
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload.as_bytes());
    stream.write_all(&frame).await?;
    Ok(())
}

/// Reads one length-prefixed frame and parses it.
pub async fn receive_frame(stream: &mut TcpStream) -> Result<RingMessage, RingError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload).await?;
    let text = String::from_utf8(payload)
        .map_err(|e| RingError::Malformed(format!("non-UTF-8 frame: {}", e)))?;
    RingMessage::deserialize(&text)
}
