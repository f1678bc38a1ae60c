//! Builders that connect, start and handshake a client or worker.
//!
//! Both builders return a participant only after a successful ping, so a
//! returned [`Client`] or [`Worker`] talks to a live server.

use std::sync::Arc;

use tokio::net::ToSocketAddrs;

use crate::client::Client;
use crate::connection::Connection;
use crate::error::Result;
use crate::id::{IdGenerator, UuidGenerator};
use crate::protocol::{CommandRegistry, DEFAULT_MAX_BODY_SIZE};
use crate::transport::{self, BoxedStream};
use crate::worker::Worker;

/// Default capacity of the event stream. Slow subscribers lag past it.
pub const DEFAULT_EVENT_CAPACITY: usize = 64;

/// Default number of jobs a worker grabs or runs at the same time.
pub const DEFAULT_MAX_PARALLEL_REQUESTS: usize = 1;

#[derive(Clone)]
struct Options {
    registry: Arc<CommandRegistry>,
    ids: Arc<dyn IdGenerator>,
    event_capacity: usize,
    max_body_size: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            registry: CommandRegistry::shared(),
            ids: Arc::new(UuidGenerator),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

impl Options {
    fn connection<S: BoxedStream>(&self, stream: S) -> Arc<Connection> {
        Connection::with_max_body(stream, self.registry.clone(), self.max_body_size)
    }
}

/// Builder for a [`Client`].
///
/// # Example
///
/// ```ignore
/// let client = ClientBuilder::new()
///     .event_capacity(256)
///     .connect(("gearman.local", gearman_async::transport::DEFAULT_PORT))
///     .await?;
/// ```
#[derive(Clone, Default)]
pub struct ClientBuilder {
    options: Options,
}

impl ClientBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command catalog used for decoding.
    pub fn registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.options.registry = registry;
        self
    }

    /// Source of generated unique ids and ping nonces.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.options.ids = ids;
        self
    }

    /// Capacity of the client event stream.
    ///
    /// Default: 64
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity;
        self
    }

    /// Largest packet body accepted from the server.
    ///
    /// Default: 64 MB
    pub fn max_body_size(mut self, size: u32) -> Self {
        self.options.max_body_size = size;
        self
    }

    /// Connect over TCP.
    pub async fn connect<A: ToSocketAddrs>(self, addr: A) -> Result<Client> {
        let stream = transport::connect(addr).await?;
        self.connect_stream(stream).await
    }

    /// Use an established stream.
    pub async fn connect_stream<S: BoxedStream>(self, stream: S) -> Result<Client> {
        let options = self.options;
        let client = Client::start(options.connection(stream), options.ids, options.event_capacity)?;
        if let Err(e) = client.ping().await {
            client.disconnect(false);
            return Err(e);
        }
        tracing::debug!("client connected");
        Ok(client)
    }
}

/// Builder for a [`Worker`].
#[derive(Clone)]
pub struct WorkerBuilder {
    options: Options,
    max_parallel_requests: usize,
    grab_uniques: bool,
}

impl WorkerBuilder {
    pub fn new() -> Self {
        Self {
            options: Options::default(),
            max_parallel_requests: DEFAULT_MAX_PARALLEL_REQUESTS,
            grab_uniques: false,
        }
    }

    /// Command catalog used for decoding.
    pub fn registry(mut self, registry: Arc<CommandRegistry>) -> Self {
        self.options.registry = registry;
        self
    }

    /// Source of ping nonces.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.options.ids = ids;
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.options.event_capacity = capacity;
        self
    }

    pub fn max_body_size(mut self, size: u32) -> Self {
        self.options.max_body_size = size;
        self
    }

    /// Jobs grabbed or running at the same time.
    ///
    /// Default: 1
    pub fn max_parallel_requests(mut self, max: usize) -> Self {
        self.max_parallel_requests = max;
        self
    }

    /// Grab with GRAB_JOB_UNIQ so jobs carry their unique id.
    pub fn grab_uniques(mut self, enabled: bool) -> Self {
        self.grab_uniques = enabled;
        self
    }

    /// Connect over TCP.
    pub async fn connect<A: ToSocketAddrs>(self, addr: A) -> Result<Worker> {
        let stream = transport::connect(addr).await?;
        self.connect_stream(stream).await
    }

    /// Use an established stream.
    pub async fn connect_stream<S: BoxedStream>(self, stream: S) -> Result<Worker> {
        let options = self.options;
        let worker = Worker::start(
            options.connection(stream),
            options.ids,
            options.event_capacity,
            self.max_parallel_requests,
            self.grab_uniques,
        )?;
        if let Err(e) = worker.ping().await {
            worker.disconnect(false);
            return Err(e);
        }
        tracing::debug!("worker connected");
        Ok(worker)
    }
}

impl Default for WorkerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
