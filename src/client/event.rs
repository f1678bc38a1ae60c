use crate::connection::CloseReason;

use super::{StatusEvent, TaskInfo};

/// Client level events, see [`Client::events`](super::Client::events).
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// The server confirmed a submission.
    TaskSubmitted(TaskInfo),
    /// A ping round trip succeeded.
    Ping,
    /// The server accepted an option.
    Option(String),
    /// Answer to a status query.
    Status(StatusEvent),
    /// A work packet arrived for a handle this client does not track.
    TaskUnknown {
        handle: String,
        command: &'static str,
    },
    /// The server sent something that made no sense at this point.
    ProtocolViolation(String),
    Close(CloseReason),
}
