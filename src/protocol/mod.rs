//! Protocol module - wire format, command model and framing.
//!
//! This module implements the Gearman binary protocol:
//! - 12-byte header encoding/decoding
//! - Command types, the fixed catalog and a registry to look them up
//! - Read buffer for decoding partial reads into commands
//! - Write buffer for encoding commands

pub mod catalog;
mod command;
mod read_buffer;
mod registry;
mod wire_format;
mod write_buffer;

pub use command::{Argument, Command, CommandType};
pub use read_buffer::ReadBuffer;
pub use registry::CommandRegistry;
pub use wire_format::{
    Header, Magic, ARGUMENT_DELIMITER, DEFAULT_MAX_BODY_SIZE, HEADER_SIZE, REQUEST_MAGIC,
    RESPONSE_MAGIC,
};
pub use write_buffer::WriteBuffer;
