//! Datagram socket seam shared by the tunnel and the direct handshake.
//!
//! One `Transport` per endpoint. Any number of tasks may call `send_to`
//! concurrently; a single task owns `recv_from`.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;

/// Transport failures
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket-level failure
    #[error("socket error: {0}")]
    Io(#[from] io::Error),

    /// `close` was called
    #[error("transport closed")]
    Closed,

    /// Socket could not be created or bound
    #[error("cannot bind {0}")]
    BindFailed(String),
}

/// Result alias for transport calls
pub type TransportResult<T> = Result<T, TransportError>;

/// Unreliable, unordered datagram socket.
///
/// ```no_run
/// use chimera_transport::{AsyncUdpTransport, Transport};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let socket = AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await?;
/// socket.send_to(b"hello", "127.0.0.1:7000".parse()?).await?;
///
/// let mut buf = vec![0u8; chimera_transport::MAX_DATAGRAM_SIZE];
/// let (len, from) = socket.recv_from(&mut buf).await?;
/// println!("{len} bytes from {from}");
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one datagram to `addr`.
    ///
    /// # Errors
    /// [`TransportError::Closed`] after `close`, otherwise the socket error.
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Wait for one datagram. A pending call returns
    /// [`TransportError::Closed`] as soon as `close` runs.
    ///
    /// # Errors
    /// [`TransportError::Closed`] after `close`, otherwise the socket error.
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Bound local address.
    ///
    /// # Errors
    /// The socket error if the address cannot be read.
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop the transport and wake any pending receive.
    ///
    /// # Errors
    /// Implementations may report a failure to release the socket.
    async fn close(&self) -> TransportResult<()>;

    /// Whether `close` has run.
    fn is_closed(&self) -> bool;

    /// Traffic totals, logged when an endpoint stops.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Datagram and byte totals for one transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Datagrams handed to the socket
    pub datagrams_sent: u64,
    /// Datagrams read from the socket
    pub datagrams_received: u64,
    /// Bytes handed to the socket
    pub bytes_sent: u64,
    /// Bytes read from the socket
    pub bytes_received: u64,
}
