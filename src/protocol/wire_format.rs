//! Wire format encoding and decoding.
//!
//! Implements the 12-byte packet header:
//! ```text
//! ┌──────────┬──────────┬──────────┐
//! │ Magic    │ Type     │ Length   │
//! │ 4 bytes  │ 4 bytes  │ 4 bytes  │
//! │ \0REQ/RES│ uint32 BE│ uint32 BE│
//! └──────────┴──────────┴──────────┘
//! ```
//!
//! The body that follows holds the command's arguments separated by NUL
//! bytes. The last argument runs to the end of the body.

use crate::error::{GearmanError, Result};

/// Header size in bytes (fixed, exactly 12).
pub const HEADER_SIZE: usize = 12;

/// Default maximum body size (64 MB).
pub const DEFAULT_MAX_BODY_SIZE: u32 = 64 * 1024 * 1024;

/// Byte separating arguments inside a body.
pub const ARGUMENT_DELIMITER: u8 = 0;

/// Magic of request packets.
pub const REQUEST_MAGIC: [u8; 4] = *b"\0REQ";

/// Magic of response packets.
pub const RESPONSE_MAGIC: [u8; 4] = *b"\0RES";

/// Frame kind marker carried in the first four header bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Magic {
    /// Packet sent by a client or worker to the server.
    Request,
    /// Packet sent by the server.
    Response,
}

impl Magic {
    /// The four magic bytes of this frame kind.
    #[inline]
    pub fn bytes(self) -> [u8; 4] {
        match self {
            Magic::Request => REQUEST_MAGIC,
            Magic::Response => RESPONSE_MAGIC,
        }
    }

    /// Parse magic bytes.
    pub fn from_bytes(bytes: [u8; 4]) -> Result<Self> {
        match bytes {
            REQUEST_MAGIC => Ok(Magic::Request),
            RESPONSE_MAGIC => Ok(Magic::Response),
            other => Err(GearmanError::Protocol(format!(
                "Invalid packet magic {:?}",
                other
            ))),
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Request or response packet.
    pub magic: Magic,
    /// Numeric command type code.
    pub code: u32,
    /// Body length in bytes.
    pub body_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(magic: Magic, code: u32, body_length: u32) -> Self {
        Self {
            magic,
            code,
            body_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use gearman_async::protocol::{Header, Magic};
    ///
    /// let header = Header::new(Magic::Request, 16, 3);
    /// let bytes = header.encode();
    /// assert_eq!(&bytes[..4], b"\0REQ");
    /// assert_eq!(bytes.len(), 12);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Encode header into an existing buffer.
    ///
    /// # Panics
    ///
    /// Panics if buffer is smaller than `HEADER_SIZE` (12 bytes).
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0..4].copy_from_slice(&self.magic.bytes());
        buf[4..8].copy_from_slice(&self.code.to_be_bytes());
        buf[8..12].copy_from_slice(&self.body_length.to_be_bytes());
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short and an error if the
    /// magic is neither `\0REQ` nor `\0RES`.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let magic = Magic::from_bytes([buf[0], buf[1], buf[2], buf[3]])?;
        Ok(Some(Self {
            magic,
            code: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            body_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        }))
    }

    /// Validate the body length against a maximum.
    pub fn validate(&self, max_body_size: u32) -> Result<()> {
        if self.body_length > max_body_size {
            return Err(GearmanError::Protocol(format!(
                "Body size {} exceeds maximum {}",
                self.body_length, max_body_size
            )));
        }
        Ok(())
    }
}
