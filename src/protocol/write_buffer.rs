//! Encoder turning commands into wire bytes.

use bytes::{BufMut, Bytes, BytesMut};

use super::command::Command;
use super::wire_format::{Header, ARGUMENT_DELIMITER, HEADER_SIZE};
use crate::error::{GearmanError, Result};

/// Accumulates encoded commands until they are shifted out.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    buffer: BytesMut,
}

impl WriteBuffer {
    /// Create an empty write buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a command and append it.
    ///
    /// Returns the total number of buffered bytes.
    ///
    /// # Errors
    ///
    /// Fails if an argument other than the last contains a NUL byte, or if
    /// the body does not fit the 32-bit length field.
    pub fn push(&mut self, command: &Command) -> Result<usize> {
        let arguments = command.command_type().arguments;
        let last = arguments.len().saturating_sub(1);

        let mut body_length = arguments.len().saturating_sub(1);
        for (i, (argument, value)) in command.values().enumerate() {
            let value = value.map(|v| &v[..]).unwrap_or_default();
            if i != last && value.contains(&ARGUMENT_DELIMITER) {
                return Err(GearmanError::Protocol(format!(
                    "{} argument {} contains a NUL byte",
                    command.name(),
                    argument
                )));
            }
            body_length += value.len();
        }
        let body_length = u32::try_from(body_length).map_err(|_| {
            GearmanError::Protocol(format!("{} body is too large", command.name()))
        })?;

        let header = Header::new(command.magic(), command.code(), body_length);
        self.buffer.reserve(HEADER_SIZE + body_length as usize);
        self.buffer.put_slice(&header.encode());
        for (i, (_, value)) in command.values().enumerate() {
            if i > 0 {
                self.buffer.put_u8(ARGUMENT_DELIMITER);
            }
            if let Some(value) = value {
                self.buffer.put_slice(value);
            }
        }

        Ok(self.buffer.len())
    }

    /// Remove and return buffered bytes.
    ///
    /// With `None` every buffered byte is returned.
    ///
    /// # Errors
    ///
    /// Fails if `n` is zero or larger than the buffered length.
    pub fn shift(&mut self, n: Option<usize>) -> Result<Bytes> {
        let n = match n {
            None => self.buffer.len(),
            Some(0) => {
                return Err(GearmanError::InvalidShift(
                    "must shift at least one byte".to_string(),
                ))
            }
            Some(n) if n > self.buffer.len() => {
                return Err(GearmanError::InvalidShift(format!(
                    "requested {} bytes but only {} are buffered",
                    n,
                    self.buffer.len()
                )))
            }
            Some(n) => n,
        };
        Ok(self.buffer.split_to(n).freeze())
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
