//! Error types for gearman-async.

use thiserror::Error;

/// Main error type for all Gearman operations.
#[derive(Debug, Error)]
pub enum GearmanError {
    /// I/O error on the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    /// Protocol violation (malformed frame, mismatched response, unexpected command).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server answered with an ERROR packet.
    #[error("Server error {code}: {message}")]
    Server {
        /// Error code as sent by the server.
        code: String,
        /// Human readable message as sent by the server.
        message: String,
    },

    /// The command type does not declare the argument.
    #[error("{command} does not have a {argument} argument")]
    UnknownArgument {
        /// Name of the command type.
        command: &'static str,
        /// Name of the argument.
        argument: &'static str,
    },

    /// No command type is registered under this name or code.
    #[error("Unknown command type: {0}")]
    UnknownCommand(String),

    /// Invalid byte count requested from the write buffer.
    #[error("Invalid shift: {0}")]
    InvalidShift(String),

    /// Sending on a connection that is already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection went away while the operation was pending.
    #[error("Lost connection")]
    ConnectionLost,

    /// A job with the same function and unique id is still outstanding.
    #[error("Job with unique id {unique_id} already submitted for {function}")]
    DuplicateJob {
        /// Function name of the submission.
        function: String,
        /// Caller supplied unique id.
        unique_id: String,
    },

    /// Client option not supported by this library.
    #[error("Unsupported option: {0}")]
    UnsupportedOption(String),

    /// Unregistering a function that was never registered.
    #[error("Cannot unregister unknown function {0}")]
    NotRegistered(String),

    /// Operation not allowed while the worker shuts down.
    #[error("Worker is shutting down")]
    ShuttingDown,

    /// Job is no longer running.
    #[error("Job is in status {actual}, expected {expected}")]
    InvalidJobState {
        /// Status the operation requires.
        expected: &'static str,
        /// Status the job is actually in.
        actual: &'static str,
    },
}

/// Result type alias using GearmanError.
pub type Result<T> = std::result::Result<T, GearmanError>;
