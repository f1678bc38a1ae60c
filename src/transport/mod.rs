//! Transport module - TCP connections to a job server.
//!
//! Any `AsyncRead + AsyncWrite` stream can back a connection; this module
//! provides the TCP one used in production.

mod tcp;

pub use tcp::{connect, BoxedStream, DEFAULT_PORT};
