//! A single protocol connection.
//!
//! The [`Connection`] owns the transport together with the packet decoder and
//! encoder. Once started it runs two tasks:
//!
//! ```text
//! Transport ─► read loop ─► ReadBuffer ─► CommandListener::on_command
//! send()    ─► WriteBuffer ─► WriterHandle ─► writer task ─► Transport
//! ```
//!
//! The listener is told exactly once, through [`CommandListener::on_close`],
//! when the connection goes away.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::backpressure::ReadGate;
use crate::error::{GearmanError, Result};
use crate::lock;
use crate::protocol::{Command, CommandRegistry, ReadBuffer, WriteBuffer, DEFAULT_MAX_BODY_SIZE};
use crate::transport::BoxedStream;
use crate::writer::{spawn_writer_task, WriterExit, WriterHandle};

/// Size of a single transport read.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed or ended by this side.
    Local,
    /// The peer closed the stream.
    Remote,
    /// A transport or decoding error.
    Error(String),
}

impl CloseReason {
    /// Check whether the connection closed because of an error.
    pub fn had_error(&self) -> bool {
        matches!(self, CloseReason::Error(_))
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Local => f.write_str("closed locally"),
            CloseReason::Remote => f.write_str("closed by peer"),
            CloseReason::Error(e) => write!(f, "closed on error: {}", e),
        }
    }
}

/// Receiver of decoded commands.
pub trait CommandListener: Send + Sync + 'static {
    /// A command was decoded. Called from the read loop, in wire order.
    fn on_command(&self, command: Command);

    /// The connection closed. Called once, after the last command.
    fn on_close(&self, reason: CloseReason);
}

struct ReadHalf {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    decoder: ReadBuffer,
}

/// Connection to a job server.
pub struct Connection {
    registry: Arc<CommandRegistry>,
    encoder: Mutex<WriteBuffer>,
    writer: WriterHandle,
    gate: ReadGate,
    closed: AtomicBool,
    close_reason: Mutex<Option<CloseReason>>,
    stop: Notify,
    read_half: Mutex<Option<ReadHalf>>,
    writer_task: Mutex<Option<JoinHandle<Result<WriterExit>>>>,
}

impl Connection {
    /// Wrap a stream with the default body size limit.
    ///
    /// Must be called within a tokio runtime: the writer task starts here.
    pub fn new<S: BoxedStream>(stream: S, registry: Arc<CommandRegistry>) -> Arc<Self> {
        Self::with_max_body(stream, registry, DEFAULT_MAX_BODY_SIZE)
    }

    /// Wrap a stream with a custom body size limit.
    pub fn with_max_body<S: BoxedStream>(
        stream: S,
        registry: Arc<CommandRegistry>,
        max_body_size: u32,
    ) -> Arc<Self> {
        let (reader, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half);
        let decoder = ReadBuffer::with_max_body(registry.clone(), max_body_size);

        Arc::new(Self {
            registry,
            encoder: Mutex::new(WriteBuffer::new()),
            writer,
            gate: ReadGate::new(),
            closed: AtomicBool::new(false),
            close_reason: Mutex::new(None),
            stop: Notify::new(),
            read_half: Mutex::new(Some(ReadHalf {
                reader: Box::new(reader),
                decoder,
            })),
            writer_task: Mutex::new(Some(writer_task)),
        })
    }

    /// Start the read loop, delivering commands to `listener`.
    ///
    /// # Errors
    ///
    /// Fails if the connection was already started.
    pub fn start(self: &Arc<Self>, listener: Arc<dyn CommandListener>) -> Result<()> {
        let half = lock(&self.read_half)
            .take()
            .ok_or_else(|| GearmanError::Protocol("connection already started".to_string()))?;

        if let Some(task) = lock(&self.writer_task).take() {
            let weak = Arc::downgrade(self);
            tokio::spawn(async move {
                let reason = match task.await {
                    Ok(Ok(_)) => CloseReason::Local,
                    Ok(Err(e)) => {
                        tracing::error!("Write error: {}", e);
                        CloseReason::Error(e.to_string())
                    }
                    Err(e) => CloseReason::Error(e.to_string()),
                };
                if let Some(connection) = weak.upgrade() {
                    connection.shutdown(reason);
                }
            });
        }

        tokio::spawn(self.clone().read_loop(half, listener));
        Ok(())
    }

    async fn read_loop(self: Arc<Self>, mut half: ReadHalf, listener: Arc<dyn CommandListener>) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        let reason = loop {
            let read = tokio::select! {
                _ = self.stop.notified() => break self.local_close_reason(),
                read = gated_read(&self.gate, &mut half.reader, &mut buf) => read,
            };

            match read {
                Ok(0) => break CloseReason::Remote,
                Ok(n) => {
                    let pushed = half.decoder.push(&buf[..n]);
                    while let Some(command) = half.decoder.shift() {
                        tracing::debug!("< {}", command);
                        listener.on_command(command);
                    }
                    if let Err(e) = pushed {
                        tracing::error!("Failed to decode packet: {}", e);
                        break CloseReason::Error(e.to_string());
                    }
                }
                Err(e) => {
                    tracing::error!("Read error: {}", e);
                    break CloseReason::Error(e.to_string());
                }
            }
        };

        self.closed.store(true, Ordering::Release);
        self.writer.close();
        tracing::debug!("connection {}", reason);
        listener.on_close(reason);
    }

    /// Encode and queue a command.
    ///
    /// # Errors
    ///
    /// Fails with [`GearmanError::ConnectionClosed`] once the connection is
    /// closed or ending, or if the command cannot be encoded.
    pub fn send(&self, command: &Command) -> Result<()> {
        if self.is_closed() {
            return Err(GearmanError::ConnectionClosed);
        }

        let frame = {
            let mut encoder = lock(&self.encoder);
            encoder.push(command)?;
            encoder.shift(None)?
        };
        tracing::debug!("> {}", command);
        self.writer.send(frame)
    }

    /// Stop reading from the transport.
    pub fn pause(&self) {
        self.gate.pause();
    }

    /// Resume reading from the transport.
    pub fn resume(&self) {
        self.gate.resume();
    }

    /// Check whether reads are paused.
    pub fn is_paused(&self) -> bool {
        self.gate.is_paused()
    }

    /// Graceful close: write everything queued, then close.
    pub fn end(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.writer.end();
        }
    }

    /// Close immediately, dropping unwritten packets.
    pub fn close(&self) {
        self.shutdown(CloseReason::Local);
    }

    /// Check whether sending is no longer possible.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn local_close_reason(&self) -> CloseReason {
        lock(&self.close_reason)
            .clone()
            .unwrap_or(CloseReason::Local)
    }

    fn shutdown(&self, reason: CloseReason) {
        self.closed.store(true, Ordering::Release);
        lock(&self.close_reason).get_or_insert(reason);
        self.writer.close();
        self.stop.notify_one();
    }
}

/// Read once the gate is open. A pending read is abandoned when the gate
/// closes.
async fn gated_read<R>(gate: &ReadGate, reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    loop {
        gate.wait_open().await;
        tokio::select! {
            read = reader.read(buf) => return read,
            _ = gate.wait_paused() => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{catalog, Argument, Magic};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    enum Seen {
        Command(Command),
        Close(CloseReason),
    }

    struct Recorder(mpsc::UnboundedSender<Seen>);

    impl CommandListener for Recorder {
        fn on_command(&self, command: Command) {
            let _ = self.0.send(Seen::Command(command));
        }

        fn on_close(&self, reason: CloseReason) {
            let _ = self.0.send(Seen::Close(reason));
        }
    }

    fn started() -> (Arc<Connection>, DuplexStream, mpsc::UnboundedReceiver<Seen>) {
        let (client, server) = duplex(64 * 1024);
        let connection = Connection::new(client, CommandRegistry::shared());
        let (tx, rx) = mpsc::unbounded_channel();
        connection.start(Arc::new(Recorder(tx))).unwrap();
        (connection, server, rx)
    }

    fn encode(command: &Command) -> bytes::Bytes {
        let mut out = WriteBuffer::new();
        out.push(command).unwrap();
        out.shift(None).unwrap()
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Seen>) -> Seen {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_commands_are_delivered_in_order() {
        let (_connection, mut server, mut rx) = started();
        let noop = Command::new(&catalog::NOOP, Magic::Response);
        let created = Command::new(&catalog::JOB_CREATED, Magic::Response)
            .with(Argument::JobHandle, "H:1")
            .unwrap();

        let mut bytes = encode(&noop).to_vec();
        bytes.extend_from_slice(&encode(&created));
        server.write_all(&bytes).await.unwrap();

        assert!(matches!(next(&mut rx).await, Seen::Command(c) if c == noop));
        assert!(matches!(next(&mut rx).await, Seen::Command(c) if c == created));
    }

    #[tokio::test]
    async fn test_send_writes_encoded_command() {
        let (connection, mut server, _rx) = started();
        let echo = Command::request(&catalog::ECHO_REQ)
            .with(Argument::Data, "abc")
            .unwrap();

        connection.send(&echo).unwrap();

        let expected = encode(&echo);
        let mut buf = vec![0u8; expected.len()];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..], &expected[..]);
    }

    #[tokio::test]
    async fn test_remote_close() {
        let (connection, server, mut rx) = started();
        drop(server);

        assert!(matches!(next(&mut rx).await, Seen::Close(CloseReason::Remote)));
        assert!(connection.is_closed());
        assert!(matches!(
            connection.send(&Command::request(&catalog::NOOP)),
            Err(GearmanError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_local_close() {
        let (connection, _server, mut rx) = started();
        connection.close();

        assert!(matches!(next(&mut rx).await, Seen::Close(CloseReason::Local)));
    }

    #[tokio::test]
    async fn test_end_flushes_then_closes() {
        let (connection, mut server, mut rx) = started();
        connection.send(&Command::request(&catalog::RESET_ABILITIES)).unwrap();
        connection.end();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, encode(&Command::request(&catalog::RESET_ABILITIES)));
        assert!(matches!(next(&mut rx).await, Seen::Close(CloseReason::Local)));
    }

    #[tokio::test]
    async fn test_decode_error_closes_with_error() {
        let (_connection, mut server, mut rx) = started();
        server.write_all(b"\0RES\0\0\0\x63\0\0\0\0").await.unwrap();

        match next(&mut rx).await {
            Seen::Close(reason) => assert!(reason.had_error()),
            Seen::Command(c) => panic!("unexpected command {}", c),
        }
    }

    #[tokio::test]
    async fn test_pause_holds_back_reads() {
        let (connection, mut server, mut rx) = started();
        connection.pause();
        tokio::time::sleep(Duration::from_millis(10)).await;

        server
            .write_all(&encode(&Command::new(&catalog::NOOP, Magic::Response)))
            .await
            .unwrap();
        let held = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(held.is_err());

        connection.resume();
        assert!(matches!(next(&mut rx).await, Seen::Command(_)));
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (connection, _server, _rx) = started();
        let (tx, _rx2) = mpsc::unbounded_channel();
        assert!(connection.start(Arc::new(Recorder(tx))).is_err());
    }
}
