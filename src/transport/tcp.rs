//! TCP transport.
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> gearman_async::error::Result<()> {
//! use gearman_async::transport::connect;
//!
//! let stream = connect("127.0.0.1:4730").await?;
//! # Ok(())
//! # }
//! ```

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};

use crate::error::Result;

/// Default Gearman job server port.
pub const DEFAULT_PORT: u16 = 4730;

/// Stream type a connection can run over.
pub trait BoxedStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> BoxedStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Connect to a job server.
///
/// Resolves `addr`, connects and sets `TCP_NODELAY`.
pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    tracing::debug!(peer = ?stream.peer_addr().ok(), "connected");
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_sets_nodelay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let stream = connect(addr).await.unwrap();
        accept.await.unwrap();

        assert!(stream.nodelay().unwrap());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        assert!(connect(addr).await.is_err());
    }
}
