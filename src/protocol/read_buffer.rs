//! Decoder turning arbitrary byte chunks into commands.
//!
//! Uses `bytes::BytesMut` for buffering and a two-phase state machine:
//! - `WaitingForHeader`: need 12 bytes
//! - `WaitingForBody`: header parsed, need `body_length` more bytes
//!
//! Decoded commands are queued FIFO until [`ReadBuffer::shift`] takes them.
//!
//! # Example
//!
//! ```
//! use gearman_async::protocol::{catalog, Argument, Command, CommandRegistry, Magic, ReadBuffer, WriteBuffer};
//! use std::sync::Arc;
//!
//! let cmd = Command::new(&catalog::ECHO_RES, Magic::Response)
//!     .with(Argument::Data, "abc123").unwrap();
//! let mut out = WriteBuffer::new();
//! out.push(&cmd).unwrap();
//! let bytes = out.shift(None).unwrap();
//!
//! let mut buffer = ReadBuffer::new(Arc::new(CommandRegistry::with_catalog()));
//! assert!(!buffer.push(&bytes[..5]).unwrap());
//! assert!(buffer.push(&bytes[5..]).unwrap());
//! assert_eq!(buffer.shift(), Some(cmd));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use super::command::Command;
use super::registry::CommandRegistry;
use super::wire_format::{Header, ARGUMENT_DELIMITER, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE};
use crate::error::{GearmanError, Result};

/// State machine for packet parsing.
#[derive(Debug)]
enum State {
    /// Waiting for a complete header.
    WaitingForHeader,
    /// Header parsed, waiting for the body.
    WaitingForBody { command: Command, body_length: usize },
}

/// Buffer accumulating incoming bytes and extracting complete commands.
pub struct ReadBuffer {
    registry: Arc<CommandRegistry>,
    buffer: BytesMut,
    state: State,
    queue: VecDeque<Command>,
    max_body_size: u32,
}

impl ReadBuffer {
    /// Create a read buffer with the default body size limit.
    pub fn new(registry: Arc<CommandRegistry>) -> Self {
        Self::with_max_body(registry, DEFAULT_MAX_BODY_SIZE)
    }

    /// Create a read buffer with a custom body size limit.
    pub fn with_max_body(registry: Arc<CommandRegistry>, max_body_size: u32) -> Self {
        Self {
            registry,
            buffer: BytesMut::with_capacity(8 * 1024),
            state: State::WaitingForHeader,
            queue: VecDeque::new(),
            max_body_size,
        }
    }

    /// Append bytes and decode every command they complete.
    ///
    /// Returns `true` when at least one decoded command is waiting in the
    /// queue.
    ///
    /// # Errors
    ///
    /// Returns error on invalid magic, unknown command code, oversized body
    /// or a body that does not split into the declared arguments.
    pub fn push(&mut self, data: &[u8]) -> Result<bool> {
        self.buffer.extend_from_slice(data);

        while let Some(command) = self.try_extract_one()? {
            self.queue.push_back(command);
        }

        Ok(!self.queue.is_empty())
    }

    /// Take the oldest decoded command.
    pub fn shift(&mut self) -> Option<Command> {
        self.queue.pop_front()
    }

    /// Number of decoded commands waiting.
    pub fn count(&self) -> usize {
        self.queue.len()
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check whether no undecoded bytes are buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes the next state transition consumes.
    pub fn bytes_needed(&self) -> usize {
        match &self.state {
            State::WaitingForHeader => HEADER_SIZE,
            State::WaitingForBody { body_length, .. } => *body_length,
        }
    }

    fn try_extract_one(&mut self) -> Result<Option<Command>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer)? {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_body_size)?;
                    let command_type = self.registry.by_code(header.code)?;

                    let _ = self.buffer.split_to(HEADER_SIZE);
                    self.state = State::WaitingForBody {
                        command: Command::new(command_type, header.magic),
                        body_length: header.body_length as usize,
                    };
                }
                State::WaitingForBody { body_length, .. } => {
                    if self.buffer.len() < *body_length {
                        return Ok(None);
                    }
                    let body = self.buffer.split_to(*body_length).freeze();
                    if let State::WaitingForBody { mut command, .. } =
                        std::mem::replace(&mut self.state, State::WaitingForHeader)
                    {
                        fill_arguments(&mut command, body)?;
                        return Ok(Some(command));
                    }
                }
            }
        }
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForBody { .. } => "WaitingForBody",
        }
    }
}

/// Split a body into the command's declared arguments.
///
/// All but the last argument end at a NUL byte; the last one takes the rest
/// of the body verbatim.
fn fill_arguments(command: &mut Command, body: Bytes) -> Result<()> {
    let arguments = command.command_type().arguments;
    if arguments.is_empty() {
        if body.is_empty() {
            return Ok(());
        }
        return Err(mismatch(command));
    }

    let mut rest = body;
    let last = arguments.len() - 1;
    for (i, argument) in arguments.iter().enumerate() {
        let value = if i == last {
            std::mem::take(&mut rest)
        } else {
            let end = rest
                .iter()
                .position(|b| *b == ARGUMENT_DELIMITER)
                .ok_or_else(|| mismatch(command))?;
            let value = rest.split_to(end);
            let _ = rest.split_to(1);
            value
        };
        command.set(*argument, value)?;
    }
    Ok(())
}

fn mismatch(command: &Command) -> GearmanError {
    GearmanError::Protocol(format!(
        "{} body did not contain the expected number of arguments",
        command.name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{catalog, Argument, Magic, WriteBuffer};

    fn registry() -> Arc<CommandRegistry> {
        Arc::new(CommandRegistry::with_catalog())
    }

    fn raw_packet(code: u32, body: &[u8]) -> Vec<u8> {
        let mut bytes = Header::new(Magic::Response, code, body.len() as u32)
            .encode()
            .to_vec();
        bytes.extend_from_slice(body);
        bytes
    }

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::new(&catalog::JOB_CREATED, Magic::Response)
                .with(Argument::JobHandle, "H:job:1")
                .unwrap(),
            Command::new(&catalog::NOOP, Magic::Response),
            Command::new(&catalog::JOB_ASSIGN_UNIQ, Magic::Response)
                .with(Argument::JobHandle, "H:job:2")
                .unwrap()
                .with(Argument::FunctionName, "reverse")
                .unwrap()
                .with(Argument::UniqueId, "u-1")
                .unwrap()
                .with(Argument::Data, &b"bin\0ary\0"[..])
                .unwrap(),
            Command::new(&catalog::STATUS_RES, Magic::Response)
                .with(Argument::JobHandle, "H:job:1")
                .unwrap()
                .with(Argument::Status, "1")
                .unwrap()
                .with(Argument::RunningStatus, "1")
                .unwrap()
                .with(Argument::Numerator, "3")
                .unwrap()
                .with(Argument::Denominator, "10")
                .unwrap(),
        ]
    }

    fn encode_all(commands: &[Command]) -> Bytes {
        let mut out = WriteBuffer::new();
        for cmd in commands {
            out.push(cmd).unwrap();
        }
        out.shift(None).unwrap()
    }

    fn drain(buffer: &mut ReadBuffer) -> Vec<Command> {
        std::iter::from_fn(|| buffer.shift()).collect()
    }

    #[test]
    fn test_single_command() {
        let mut buffer = ReadBuffer::new(registry());
        let has = buffer.push(&raw_packet(8, b"H:lap:1")).unwrap();

        assert!(has);
        assert_eq!(buffer.count(), 1);
        let cmd = buffer.shift().unwrap();
        assert!(cmd.is(&catalog::JOB_CREATED));
        assert_eq!(cmd.magic(), Magic::Response);
        assert_eq!(cmd.get_string(Argument::JobHandle).unwrap(), "H:lap:1");
        assert!(buffer.is_empty());
        assert!(buffer.shift().is_none());
    }

    #[test]
    fn test_multiple_commands_in_one_push() {
        let commands = sample_commands();
        let mut buffer = ReadBuffer::new(registry());

        buffer.push(&encode_all(&commands)).unwrap();

        assert_eq!(buffer.count(), commands.len());
        assert_eq!(drain(&mut buffer), commands);
    }

    #[test]
    fn test_byte_at_a_time() {
        let commands = sample_commands();
        let bytes = encode_all(&commands);
        let mut buffer = ReadBuffer::new(registry());

        let mut decoded = Vec::new();
        for byte in bytes.iter() {
            buffer.push(&[*byte]).unwrap();
            decoded.extend(drain(&mut buffer));
        }

        assert_eq!(decoded, commands);
    }

    #[test]
    fn test_arbitrary_chunking() {
        let commands = sample_commands();
        let bytes = encode_all(&commands);

        for chunk_size in [2, 5, 11, 12, 13, 29, 64] {
            let mut buffer = ReadBuffer::new(registry());
            let mut decoded = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                buffer.push(chunk).unwrap();
                decoded.extend(drain(&mut buffer));
            }
            assert_eq!(decoded, commands, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn test_fragmented_header_and_body() {
        let bytes = raw_packet(13, b"H:1\0result");
        let mut buffer = ReadBuffer::new(registry());

        assert!(!buffer.push(&bytes[..5]).unwrap());
        assert_eq!(buffer.state_name(), "WaitingForHeader");
        assert_eq!(buffer.bytes_needed(), HEADER_SIZE);

        assert!(!buffer.push(&bytes[5..HEADER_SIZE + 2]).unwrap());
        assert_eq!(buffer.state_name(), "WaitingForBody");
        assert_eq!(buffer.bytes_needed(), 10);

        assert!(buffer.push(&bytes[HEADER_SIZE + 2..]).unwrap());
        let cmd = buffer.shift().unwrap();
        assert_eq!(cmd.get(Argument::Data).unwrap().unwrap(), "result");
        assert_eq!(buffer.state_name(), "WaitingForHeader");
    }

    #[test]
    fn test_data_keeps_embedded_nul() {
        let mut buffer = ReadBuffer::new(registry());
        buffer.push(&raw_packet(28, b"H:1\0a\0b\0")).unwrap();

        let cmd = buffer.shift().unwrap();
        assert_eq!(cmd.get_string(Argument::JobHandle).unwrap(), "H:1");
        assert_eq!(&cmd.get(Argument::Data).unwrap().unwrap()[..], b"a\0b\0");
    }

    #[test]
    fn test_empty_arguments() {
        let mut buffer = ReadBuffer::new(registry());
        buffer.push(&raw_packet(13, b"H:1\0")).unwrap();

        let cmd = buffer.shift().unwrap();
        assert_eq!(cmd.get(Argument::Data).unwrap().unwrap().len(), 0);
    }

    #[test]
    fn test_wrong_argument_count() {
        let mut buffer = ReadBuffer::new(registry());
        let err = buffer.push(&raw_packet(12, b"H:1\05")).unwrap_err();

        assert!(matches!(err, GearmanError::Protocol(_)));
        assert!(err
            .to_string()
            .contains("did not contain the expected number of arguments"));
    }

    #[test]
    fn test_body_on_argumentless_command() {
        let mut buffer = ReadBuffer::new(registry());
        assert!(buffer.push(&raw_packet(6, b"x")).is_err());
    }

    #[test]
    fn test_unknown_code() {
        let mut buffer = ReadBuffer::new(registry());
        let err = buffer.push(&raw_packet(99, b"")).unwrap_err();
        assert!(matches!(err, GearmanError::UnknownCommand(_)));
    }

    #[test]
    fn test_max_body_validation() {
        let mut buffer = ReadBuffer::with_max_body(registry(), 100);
        let header = Header::new(Magic::Response, 13, 1000).encode();

        let result = buffer.push(&header);
        assert!(result.unwrap_err().to_string().contains("exceeds maximum"));
    }
}
