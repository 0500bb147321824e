//! Tokio UDP socket behind the [`Transport`] trait.
//!
//! The same socket carries the direct handshake and then every sealed
//! frame, so the address a listener learns during the handshake is the one
//! tunnel traffic comes from.

use crate::TransportConfig;
use crate::transport::{Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::Notify;

/// UDP transport; clones share the socket, counters and close state.
#[derive(Clone)]
pub struct AsyncUdpTransport {
    socket: Arc<UdpSocket>,
    state: Arc<State>,
}

#[derive(Default)]
struct State {
    closed: AtomicBool,
    close_signal: Notify,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl AsyncUdpTransport {
    /// Bind with the default 2 MiB kernel buffers. Port 0 picks a free port.
    ///
    /// # Errors
    /// [`TransportError::BindFailed`] if the socket cannot be set up.
    pub async fn bind<A: Into<SocketAddr>>(addr: A) -> TransportResult<Self> {
        Self::bind_with_config(addr, &TransportConfig::default()).await
    }

    /// Bind with explicit kernel buffer sizes.
    ///
    /// # Errors
    /// [`TransportError::BindFailed`] if the socket cannot be set up.
    pub async fn bind_with_config<A: Into<SocketAddr>>(
        addr: A,
        config: &TransportConfig,
    ) -> TransportResult<Self> {
        let addr = addr.into();
        let bind_err = |e: std::io::Error| TransportError::BindFailed(format!("{addr}: {e}"));

        let domain = socket2::Domain::for_address(addr);
        let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
            .map_err(bind_err)?;

        // The kernel may clamp these; a smaller buffer only costs burst headroom
        if let Err(e) = raw.set_recv_buffer_size(config.recv_buffer_size) {
            tracing::debug!(%addr, error = %e, "UDP receive buffer not applied");
        }
        if let Err(e) = raw.set_send_buffer_size(config.send_buffer_size) {
            tracing::debug!(%addr, error = %e, "UDP send buffer not applied");
        }

        raw.bind(&addr.into()).map_err(bind_err)?;
        raw.set_nonblocking(true).map_err(bind_err)?;
        let socket = UdpSocket::from_std(raw.into()).map_err(bind_err)?;

        Ok(Self::from_socket(socket))
    }

    /// Wrap an already bound tokio socket.
    #[must_use]
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self {
            socket: Arc::new(socket),
            state: Arc::new(State::default()),
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.state.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for AsyncUdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        self.ensure_open()?;
        let sent = self.socket.send_to(buf, addr).await?;
        self.state.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.state
            .bytes_sent
            .fetch_add(sent as u64, Ordering::Relaxed);
        Ok(sent)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        // Register for the close signal before checking the flag so a
        // concurrent close cannot slip between the two
        let closed = self.state.close_signal.notified();
        tokio::pin!(closed);
        closed.as_mut().enable();
        self.ensure_open()?;

        tokio::select! {
            () = &mut closed => Err(TransportError::Closed),
            received = self.socket.recv_from(buf) => {
                let (len, from) = received?;
                self.state.datagrams_received.fetch_add(1, Ordering::Relaxed);
                self.state
                    .bytes_received
                    .fetch_add(len as u64, Ordering::Relaxed);
                Ok((len, from))
            }
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn close(&self) -> TransportResult<()> {
        self.state.closed.store(true, Ordering::Release);
        self.state.close_signal.notify_waiters();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            datagrams_sent: self.state.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.state.datagrams_received.load(Ordering::Relaxed),
            bytes_sent: self.state.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.state.bytes_received.load(Ordering::Relaxed),
        }
    }
}
