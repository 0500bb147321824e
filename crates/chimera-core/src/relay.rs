//! Relay endpoint: accepts local TCP connections and opens a tunnel stream
//! for each one.
//!
//! connIDs are assigned from a counter starting at 1 and are never reused
//! within a run. Once the 32-bit space is exhausted, further connections are
//! refused.

use crate::error::MuxError;
use crate::mux::{Multiplexer, MuxConfig, MuxStats};
use crate::tunnel::Tunnel;
use chimera_transport::MAX_DATAGRAM_SIZE;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Pause after a failed `accept` (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Relay side of the tunnel
pub struct RelayEndpoint {
    listener: TcpListener,
    mux: Arc<Multiplexer>,
    next_conn_id: AtomicU64,
}

impl RelayEndpoint {
    /// Bind the local TCP listener and prepare the multiplexer.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Connection`] if the listener cannot be bound.
    pub async fn bind(
        listen_addr: SocketAddr,
        tunnel: Tunnel,
        config: MuxConfig,
    ) -> Result<Arc<Self>, MuxError> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(
            listen = %listener.local_addr()?,
            peer = %tunnel.peer_addr(),
            "Relay listening"
        );

        Ok(Arc::new(Self {
            listener,
            mux: Multiplexer::new(tunnel, config),
            next_conn_id: AtomicU64::new(1),
        }))
    }

    /// Address the TCP listener is bound to.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Connection`] if the address cannot be read.
    pub fn local_addr(&self) -> Result<SocketAddr, MuxError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections and serve the tunnel until the transport closes.
    ///
    /// Dropping the returned future stops the tunnel reader; call
    /// [`shutdown`](Self::shutdown) afterwards to close live streams.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Tunnel`] once the transport is closed.
    pub async fn run(self: Arc<Self>) -> Result<(), MuxError> {
        let mut reader = AbortOnDrop(tokio::spawn(Arc::clone(&self).tunnel_loop()));

        tokio::select! {
            result = self.accept_loop() => result,
            joined = &mut reader.0 => match joined {
                Ok(result) => result,
                Err(e) => Err(MuxError::Task(e.to_string())),
            },
        }
    }

    /// Close every live stream, sending `FIN` for each. Returns how many.
    pub async fn shutdown(&self) -> usize {
        let closed = self.mux.shutdown_all().await;
        info!(closed, "Relay shut down");
        closed
    }

    /// Number of live streams.
    #[must_use]
    pub fn active_streams(&self) -> usize {
        self.mux.table().len()
    }

    /// Multiplexer statistics.
    #[must_use]
    pub fn stats(&self) -> MuxStats {
        self.mux.stats()
    }

    async fn accept_loop(&self) -> Result<(), MuxError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, from)) => self.open_stream(stream, from).await,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn open_stream(&self, stream: TcpStream, from: SocketAddr) {
        let Some(conn_id) = self.allocate_conn_id() else {
            warn!(client = %from, "connID space exhausted, connection refused");
            return;
        };

        info!(conn_id, client = %from, "Accepted TCP connection");
        if let Err(e) = self.mux.attach(conn_id, stream, true).await {
            warn!(conn_id, error = %e, "Failed to open stream");
        }
    }

    fn allocate_conn_id(&self) -> Option<u32> {
        u32::try_from(self.next_conn_id.fetch_add(1, Ordering::Relaxed)).ok()
    }

    async fn tunnel_loop(self: Arc<Self>) -> Result<(), MuxError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let frame = self.mux.next_frame(&mut buf).await?;
            self.mux.dispatch(frame).await;
        }
    }
}

struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::padding::PaddingMode;
    use chimera_crypto::SessionKey;
    use chimera_transport::{AsyncUdpTransport, Transport};

    async fn relay() -> Arc<RelayEndpoint> {
        let transport = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let tunnel = Tunnel::new(
            transport,
            "127.0.0.1:9".parse().unwrap(),
            &SessionKey::new([1; 32]),
            PaddingMode::None,
        );
        RelayEndpoint::bind("127.0.0.1:0".parse().unwrap(), tunnel, MuxConfig::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_conn_ids_increase_from_one() {
        let relay = relay().await;
        assert_eq!(relay.allocate_conn_id(), Some(1));
        assert_eq!(relay.allocate_conn_id(), Some(2));
        assert_eq!(relay.allocate_conn_id(), Some(3));
    }

    #[tokio::test]
    async fn test_conn_id_exhaustion_refuses() {
        let relay = relay().await;
        relay
            .next_conn_id
            .store(u64::from(u32::MAX), Ordering::Relaxed);

        assert_eq!(relay.allocate_conn_id(), Some(u32::MAX));
        assert_eq!(relay.allocate_conn_id(), None);
        assert_eq!(relay.allocate_conn_id(), None);
    }

    #[tokio::test]
    async fn test_bound_listener_address() {
        let relay = relay().await;
        let addr = relay.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(relay.active_streams(), 0);
    }

    #[tokio::test]
    async fn test_wire_sequence_per_stream() {
        use crate::frame::{Frame, FrameType};
        use std::collections::BTreeMap;
        use tokio::io::AsyncWriteExt;

        let key = SessionKey::new([7; 32]);
        let relay_transport =
            Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let peer_transport = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let relay_udp = relay_transport.local_addr().unwrap();
        let peer_udp = peer_transport.local_addr().unwrap();

        let tunnel = Tunnel::new(relay_transport, peer_udp, &key, PaddingMode::Random);
        let relay = RelayEndpoint::bind("127.0.0.1:0".parse().unwrap(), tunnel, MuxConfig::default())
            .await
            .unwrap();
        let listen = relay.local_addr().unwrap();
        let running = tokio::spawn(Arc::clone(&relay).run());

        // Raw tunnel standing in for the client endpoint
        let peer = Tunnel::new(peer_transport, relay_udp, &key, PaddingMode::None);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let mut streams = Vec::new();
        for _ in 0..3 {
            streams.push(TcpStream::connect(listen).await.unwrap());
        }
        for stream in &mut streams {
            stream.write_all(b"ping").await.unwrap();
        }
        drop(streams);

        let mut per_stream: BTreeMap<u32, Vec<Frame>> = BTreeMap::new();
        let mut opened = Vec::new();
        let mut fins = 0;
        while fins < 3 {
            let frame = tokio::time::timeout(Duration::from_secs(5), peer.recv(&mut buf))
                .await
                .expect("Timeout")
                .unwrap();
            match frame.frame_type {
                FrameType::New => opened.push(frame.conn_id),
                FrameType::Fin => fins += 1,
                _ => {}
            }
            per_stream.entry(frame.conn_id).or_default().push(frame);
        }

        // connIDs handed out in accept order, starting at 1
        assert_eq!(opened, vec![1, 2, 3]);
        assert_eq!(per_stream.keys().copied().collect::<Vec<_>>(), vec![1, 2, 3]);

        for (conn_id, frames) in &per_stream {
            let types: Vec<FrameType> = frames.iter().map(|f| f.frame_type).collect();
            assert_eq!(types.first(), Some(&FrameType::New), "stream {conn_id}");
            assert_eq!(types.last(), Some(&FrameType::Fin), "stream {conn_id}");
            assert_eq!(types.iter().filter(|t| **t == FrameType::New).count(), 1);
            assert_eq!(types.iter().filter(|t| **t == FrameType::Fin).count(), 1);

            let data: Vec<u8> = frames
                .iter()
                .filter(|f| f.frame_type == FrameType::Data)
                .flat_map(|f| f.payload.iter().copied())
                .collect();
            assert_eq!(data, b"ping", "stream {conn_id}");
        }
        assert_eq!(relay.active_streams(), 0);

        // Acknowledging the FINs must not draw any further frames
        for conn_id in 1..=3 {
            peer.send(&Frame::fin(conn_id)).await.unwrap();
        }
        let quiet = tokio::time::timeout(Duration::from_millis(300), peer.recv(&mut buf)).await;
        assert!(quiet.is_err(), "unexpected frame after FIN ack: {quiet:?}");
        assert_eq!(relay.stats().streams_closed, 3);

        running.abort();
    }

    #[tokio::test]
    async fn test_run_ends_when_transport_closes() {
        let transport = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        transport.close().await.unwrap();
        let tunnel = Tunnel::new(
            transport,
            "127.0.0.1:9".parse().unwrap(),
            &SessionKey::new([1; 32]),
            PaddingMode::None,
        );
        let relay = RelayEndpoint::bind("127.0.0.1:0".parse().unwrap(), tunnel, MuxConfig::default())
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), relay.run())
            .await
            .expect("Timeout");
        assert!(matches!(result, Err(MuxError::Tunnel(_))));
    }
}
