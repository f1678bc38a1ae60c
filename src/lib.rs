//! # gearman-async
//!
//! Async client and worker for the Gearman job server protocol.
//!
//! A connection carries exactly one participant: a [`Client`] that submits
//! jobs and follows their progress, or a [`Worker`] that registers functions
//! and runs the jobs the server assigns to it.
//!
//! ## Architecture
//!
//! - **Framing** ([`protocol`]): binary packets with a 12 byte header and
//!   NUL separated arguments
//! - **Connection**: one read loop and one writer task per transport
//! - **Participants**: request/response matching, send ordering and flow
//!   control shared by clients and workers
//!
//! ## Example
//!
//! ```ignore
//! use gearman_async::{ClientBuilder, Submission, TaskEvent};
//!
//! #[tokio::main]
//! async fn main() -> gearman_async::Result<()> {
//!     let client = ClientBuilder::new().connect("127.0.0.1:4730").await?;
//!
//!     let mut task = client.submit(Submission::new("reverse").workload("hello")).await?;
//!     if let Some(TaskEvent::Complete(data)) = task.finished().await {
//!         println!("{}", String::from_utf8_lossy(&data));
//!     }
//!
//!     client.disconnect(true);
//!     Ok(())
//! }
//! ```

pub mod codec;
pub mod error;
pub mod id;
pub mod protocol;
pub mod transport;

mod backpressure;
mod client;
mod connection;
mod factory;
mod participant;
mod worker;
mod writer;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use client::{
    Client, ClientEvent, Priority, StatusEvent, Submission, Task, TaskEvent, TaskInfo, TaskRef,
    EXCEPTIONS_OPTION,
};
pub use connection::CloseReason;
pub use error::{GearmanError, Result};
pub use factory::{
    ClientBuilder, WorkerBuilder, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_PARALLEL_REQUESTS,
};
pub use worker::{
    BoxFuture, FnHandler, Handler, Job, JobStatus, TypedHandler, Worker, WorkerEvent,
};

/// Lock a mutex, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
