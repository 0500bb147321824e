//! Client endpoint: dials the fixed destination for every `NEW` from the
//! relay and bridges the resulting TCP connection into the stream.

use crate::error::MuxError;
use crate::frame::FrameType;
use crate::mux::{Multiplexer, MuxConfig, MuxStats};
use crate::tunnel::Tunnel;
use chimera_transport::MAX_DATAGRAM_SIZE;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Client side of the tunnel
pub struct ClientEndpoint {
    destination: String,
    mux: Arc<Multiplexer>,
}

impl ClientEndpoint {
    /// Create a client that dials `destination` (`host:port`) per stream.
    #[must_use]
    pub fn new(tunnel: Tunnel, destination: impl Into<String>, config: MuxConfig) -> Arc<Self> {
        let destination = destination.into();
        info!(
            destination = %destination,
            peer = %tunnel.peer_addr(),
            "Client ready"
        );
        Arc::new(Self {
            destination,
            mux: Multiplexer::new(tunnel, config),
        })
    }

    /// Destination dialed for each stream.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Serve the tunnel until the transport closes.
    ///
    /// A `NEW` is handled to completion (dial included) before the next frame
    /// is read, so `DATA` that follows a `NEW` always finds its stream.
    ///
    /// # Errors
    ///
    /// Returns [`MuxError::Tunnel`] once the transport is closed.
    pub async fn run(self: Arc<Self>) -> Result<(), MuxError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let frame = self.mux.next_frame(&mut buf).await?;
            match frame.frame_type {
                FrameType::New => self.open_stream(frame.conn_id).await,
                _ => self.mux.dispatch(frame).await,
            }
        }
    }

    /// Close every live stream, sending `FIN` for each. Returns how many.
    pub async fn shutdown(&self) -> usize {
        let closed = self.mux.shutdown_all().await;
        info!(closed, "Client shut down");
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

    async fn open_stream(&self, conn_id: u32) {
        if self.mux.table().contains(conn_id) {
            warn!(
                conn_id,
                frame_type = %FrameType::New,
                peer = %self.mux.tunnel().peer_addr(),
                "Duplicate NEW ignored"
            );
            return;
        }
        if self.mux.table().is_retired(conn_id) {
            debug!(
                conn_id,
                frame_type = %FrameType::New,
                peer = %self.mux.tunnel().peer_addr(),
                "NEW for closed stream ignored"
            );
            return;
        }

        let dial = timeout(
            self.mux.config().dial_timeout,
            TcpStream::connect(self.destination.as_str()),
        )
        .await;

        let stream = match dial {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                warn!(conn_id, destination = %self.destination, error = %e, "Dial failed");
                self.mux.table().retire(conn_id);
                self.mux.send_fin(conn_id).await;
                return;
            }
            Err(_) => {
                warn!(conn_id, destination = %self.destination, "Dial timed out");
                self.mux.table().retire(conn_id);
                self.mux.send_fin(conn_id).await;
                return;
            }
        };

        if let Err(e) = self.mux.attach(conn_id, stream, false).await {
            warn!(conn_id, error = %e, "Failed to open stream");
        }
    }
}
