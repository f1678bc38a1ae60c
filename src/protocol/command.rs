//! Command types and command instances.
//!
//! A [`CommandType`] is the immutable description of one packet kind: its
//! name, numeric code and the ordered list of arguments that make up the
//! body. A [`Command`] is one packet of that type with its argument values.
//!
//! # Example
//!
//! ```
//! use gearman_async::protocol::{catalog, Argument, Command, Magic};
//!
//! let cmd = Command::new(&catalog::SUBMIT_JOB, Magic::Request)
//!     .with(Argument::FunctionName, "reverse").unwrap()
//!     .with(Argument::Data, "hello").unwrap();
//!
//! assert_eq!(cmd.get_string(Argument::FunctionName).unwrap(), "reverse");
//! assert!(cmd.get(Argument::JobHandle).is_err());
//! ```

use std::fmt;

use bytes::Bytes;

use super::wire_format::Magic;
use crate::error::{GearmanError, Result};

/// Argument slots a command body can declare.
///
/// [`Argument::Data`] is the opaque payload slot. It is always declared last
/// and may contain arbitrary bytes, including NUL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Argument {
    FunctionName,
    UniqueId,
    JobHandle,
    Numerator,
    Denominator,
    Code,
    Message,
    Status,
    RunningStatus,
    WorkerId,
    Timeout,
    OptionName,
    Data,
}

impl Argument {
    /// Protocol name of the argument.
    pub fn name(self) -> &'static str {
        match self {
            Argument::FunctionName => "function_name",
            Argument::UniqueId => "id",
            Argument::JobHandle => "job_handle",
            Argument::Numerator => "complete_numerator",
            Argument::Denominator => "complete_denominator",
            Argument::Code => "code",
            Argument::Message => "message",
            Argument::Status => "status",
            Argument::RunningStatus => "running_status",
            Argument::WorkerId => "worker_id",
            Argument::Timeout => "timeout",
            Argument::OptionName => "option_name",
            Argument::Data => "data",
        }
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Specification of a binary command packet.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct CommandType {
    /// Protocol name, e.g. `SUBMIT_JOB`.
    pub name: &'static str,
    /// Numeric type code written in the header.
    pub code: u32,
    /// Body arguments in wire order.
    pub arguments: &'static [Argument],
}

impl CommandType {
    /// Create a command type.
    pub const fn new(name: &'static str, code: u32, arguments: &'static [Argument]) -> Self {
        Self {
            name,
            code,
            arguments,
        }
    }

    /// Position of an argument in the body, if declared.
    #[inline]
    pub fn position(&self, argument: Argument) -> Option<usize> {
        self.arguments.iter().position(|a| *a == argument)
    }

    /// Check whether the type declares an argument.
    #[inline]
    pub fn has_argument(&self, argument: Argument) -> bool {
        self.position(argument).is_some()
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.code)
    }
}

/// One command packet: a type, a frame kind and argument values.
///
/// Values are only accepted for arguments the type declares; unset arguments
/// are written as empty strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    command_type: &'static CommandType,
    magic: Magic,
    values: Vec<Option<Bytes>>,
}

impl Command {
    /// Create a command without any argument values.
    pub fn new(command_type: &'static CommandType, magic: Magic) -> Self {
        Self {
            command_type,
            magic,
            values: vec![None; command_type.arguments.len()],
        }
    }

    /// Create a request command.
    pub fn request(command_type: &'static CommandType) -> Self {
        Self::new(command_type, Magic::Request)
    }

    /// Create a command and set the given values.
    pub fn with_values<I, V>(
        command_type: &'static CommandType,
        magic: Magic,
        values: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = (Argument, V)>,
        V: Into<Bytes>,
    {
        let mut command = Self::new(command_type, magic);
        for (argument, value) in values {
            command.set(argument, value)?;
        }
        Ok(command)
    }

    /// Builder form of [`Command::set`].
    pub fn with(mut self, argument: Argument, value: impl Into<Bytes>) -> Result<Self> {
        self.set(argument, value)?;
        Ok(self)
    }

    fn slot(&self, argument: Argument) -> Result<usize> {
        self.command_type
            .position(argument)
            .ok_or(GearmanError::UnknownArgument {
                command: self.command_type.name,
                argument: argument.name(),
            })
    }

    /// Set an argument value.
    pub fn set(&mut self, argument: Argument, value: impl Into<Bytes>) -> Result<()> {
        let slot = self.slot(argument)?;
        self.values[slot] = Some(value.into());
        Ok(())
    }

    /// Get an argument value, `None` when unset.
    pub fn get(&self, argument: Argument) -> Result<Option<&Bytes>> {
        let slot = self.slot(argument)?;
        Ok(self.values[slot].as_ref())
    }

    /// Get an argument value, falling back to `default` when unset.
    pub fn get_or<'a>(&'a self, argument: Argument, default: &'a [u8]) -> Result<&'a [u8]> {
        Ok(self.get(argument)?.map(|b| &b[..]).unwrap_or(default))
    }

    /// Get an argument as text. Unset arguments read as the empty string.
    pub fn get_string(&self, argument: Argument) -> Result<String> {
        Ok(String::from_utf8_lossy(self.get_or(argument, b"")?).into_owned())
    }

    /// Get an argument as an unsigned integer. Unset or empty reads as 0.
    pub fn get_u32(&self, argument: Argument) -> Result<u32> {
        let raw = self.get_string(argument)?;
        if raw.is_empty() {
            return Ok(0);
        }
        raw.trim().parse().map_err(|_| {
            GearmanError::Protocol(format!(
                "{} argument {} is not a number: {:?}",
                self.command_type.name, argument, raw
            ))
        })
    }

    /// All argument values in wire order.
    pub fn values(&self) -> impl Iterator<Item = (Argument, Option<&Bytes>)> + '_ {
        self.command_type
            .arguments
            .iter()
            .copied()
            .zip(self.values.iter().map(Option::as_ref))
    }

    /// The command type.
    #[inline]
    pub fn command_type(&self) -> &'static CommandType {
        self.command_type
    }

    /// Protocol name of the command type.
    #[inline]
    pub fn name(&self) -> &'static str {
        self.command_type.name
    }

    /// Numeric code of the command type.
    #[inline]
    pub fn code(&self) -> u32 {
        self.command_type.code
    }

    /// Request or response frame.
    #[inline]
    pub fn magic(&self) -> Magic {
        self.magic
    }

    /// Check the command's type.
    #[inline]
    pub fn is(&self, command_type: &CommandType) -> bool {
        self.command_type == command_type
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[", self.command_type)?;
        for (i, (argument, value)) in self.values().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            match value {
                Some(v) => write!(f, "{}={}", argument, String::from_utf8_lossy(v))?,
                None => write!(f, "{}=NULL", argument)?,
            }
        }
        f.write_str("]")
    }
}
