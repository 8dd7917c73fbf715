//! Length-prefixed binary codec shared by the wire protocol and the state log
//!
//! All integers are big-endian. Strings are a u32 length followed by UTF-8
//! bytes, so every encoded value is self-delimiting and a reader can walk a
//! concatenation of records without an outer frame.

use std::error::Error;
use std::fmt;

/// Errors produced while decoding a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the value was complete. This is the only
    /// recoverable codec error: state-log replay uses it to find the last
    /// whole record, the broker path answers it with a requeue.
    Truncated { needed: usize, remaining: usize },

    /// A decoded string was not valid UTF-8
    InvalidString(String),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Truncated { needed, remaining } => {
                write!(
                    f,
                    "truncated input: needed {} bytes, {} remaining",
                    needed, remaining
                )
            }
            CodecError::InvalidString(msg) => write!(f, "invalid string payload: {}", msg),
        }
    }
}

impl Error for CodecError {}

/// Chainable writer for the binary format
///
/// # Examples
///
/// ```
/// use gamestream::Serializer;
///
/// let bytes = Serializer::new()
///     .write_u32(7)
///     .write_string("origin-1")
///     .into_bytes();
/// assert_eq!(bytes.len(), 4 + 4 + 8);
/// ```
#[derive(Debug, Default)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Serializer { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Serializer {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_u8(mut self, v: u8) -> Self {
        self.buf.push(v);
        self
    }

    pub fn write_u32(mut self, v: u32) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_f64(mut self, v: f64) -> Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    pub fn write_string(mut self, v: &str) -> Self {
        self.buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(v.as_bytes());
        self
    }

    /// Appends raw bytes without a length prefix. Used for payloads that are
    /// already self-delimiting (nested records, application deltas).
    pub fn write_raw(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(v);
        self
    }

    /// Appends a u32 length prefix followed by the bytes.
    pub fn write_bytes(mut self, v: &[u8]) -> Self {
        self.buf.extend_from_slice(&(v.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(v);
        self
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded buffer
///
/// Every `read_*` either consumes the value or fails with
/// [`CodecError::Truncated`] leaving the cursor untouched, so a caller can
/// retry the same position against a longer buffer.
#[derive(Debug)]
pub struct Deserializer<'a> {
    buf: &'a [u8],
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Deserializer { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_f64(&mut self) -> Result<f64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(f64::from_be_bytes(raw))
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        let snapshot = self.buf;
        let len = self.read_u32()? as usize;
        match self.take(len) {
            Ok(b) => String::from_utf8(b.to_vec())
                .map_err(|e| CodecError::InvalidString(e.to_string())),
            Err(e) => {
                self.buf = snapshot;
                Err(e)
            }
        }
    }

    /// Reads a u32 length prefix followed by that many raw bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let snapshot = self.buf;
        let len = self.read_u32()? as usize;
        match self.take(len) {
            Ok(b) => Ok(b.to_vec()),
            Err(e) => {
                self.buf = snapshot;
                Err(e)
            }
        }
    }

    /// Consumes the rest of the buffer.
    pub fn read_to_end(&mut self) -> Vec<u8> {
        let out = self.buf.to_vec();
        self.buf = &self.buf[self.buf.len()..];
        out
    }
}
