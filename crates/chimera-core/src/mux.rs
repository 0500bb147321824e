//! Stream multiplexer shared by the relay and client endpoints.
//!
//! Each live stream owns two tasks:
//! - a pump that reads the TCP socket in `read_chunk` pieces and sends `DATA`
//! - a writer that drains queued inbound payloads into the TCP socket
//!
//! A stream ends when either side reads EOF or fails, or when the peer sends
//! `FIN`/`ERROR`. Whoever removes the table entry sends exactly one `FIN`; a
//! `FIN` for a connID that is not in the table is ignored, so the two sides
//! never bounce `FIN` back and forth.

use crate::error::{MuxError, TunnelError};
use crate::frame::{Frame, FrameType};
use crate::table::{ConnectionTable, StreamEntry};
use crate::tunnel::Tunnel;
use crate::{DEFAULT_READ_CHUNK, MAX_PAYLOAD_SIZE};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, trace, warn};

/// Default inbound queue depth per stream
pub const DEFAULT_WRITE_QUEUE: usize = 64;

/// Default time the client waits for a destination dial
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Multiplexer tuning
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Bytes read from TCP per `DATA` frame (clamped to `1..=MAX_PAYLOAD_SIZE`)
    pub read_chunk: usize,
    /// Inbound payloads buffered per stream before the tunnel reader waits
    pub write_queue: usize,
    /// Destination dial timeout (client only)
    pub dial_timeout: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            write_queue: DEFAULT_WRITE_QUEUE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// Multiplexer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MuxStats {
    /// Streams added to the connection table
    pub streams_opened: u64,
    /// Streams removed from the connection table
    pub streams_closed: u64,
    /// Streams currently live
    pub active_streams: usize,
    /// Frames sealed and sent
    pub frames_sent: u64,
    /// Frames received and decoded
    pub frames_received: u64,
    /// Datagrams or frames discarded (bad peer, auth, format, unknown connID)
    pub frames_dropped: u64,
}

#[derive(Default)]
struct Counters {
    streams_opened: AtomicU64,
    streams_closed: AtomicU64,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    frames_dropped: AtomicU64,
}

/// Why a stream is being removed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Teardown {
    LocalEof,
    LocalError,
    PeerFin,
    PeerError,
    Shutdown,
}

impl Teardown {
    fn as_str(self) -> &'static str {
        match self {
            Self::LocalEof => "local EOF",
            Self::LocalError => "local error",
            Self::PeerFin => "peer FIN",
            Self::PeerError => "peer ERROR",
            Self::Shutdown => "shutdown",
        }
    }

    fn frame_type(self) -> Option<FrameType> {
        match self {
            Self::PeerFin => Some(FrameType::Fin),
            Self::PeerError => Some(FrameType::Error),
            _ => None,
        }
    }
}

/// Connection table plus the tunnel it feeds
pub(crate) struct Multiplexer {
    tunnel: Tunnel,
    table: ConnectionTable,
    config: MuxConfig,
    counters: Counters,
}

impl Multiplexer {
    pub(crate) fn new(tunnel: Tunnel, config: MuxConfig) -> Arc<Self> {
        Arc::new(Self {
            tunnel,
            table: ConnectionTable::new(),
            config,
            counters: Counters::default(),
        })
    }

    pub(crate) fn tunnel(&self) -> &Tunnel {
        &self.tunnel
    }

    pub(crate) fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub(crate) fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub(crate) fn stats(&self) -> MuxStats {
        MuxStats {
            streams_opened: self.counters.streams_opened.load(Ordering::Relaxed),
            streams_closed: self.counters.streams_closed.load(Ordering::Relaxed),
            active_streams: self.table.len(),
            frames_sent: self.counters.frames_sent.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.counters.frames_dropped.load(Ordering::Relaxed),
        }
    }

    pub(crate) async fn send(&self, frame: &Frame) -> Result<(), TunnelError> {
        self.tunnel.send(frame).await?;
        self.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        trace!(
            conn_id = frame.conn_id,
            frame_type = %frame.frame_type,
            len = frame.payload.len(),
            "Frame sent"
        );
        Ok(())
    }

    /// Next valid frame from the tunnel. Rejected datagrams are logged and
    /// skipped; only a closed transport ends the loop.
    pub(crate) async fn next_frame(&self, buf: &mut [u8]) -> Result<Frame, MuxError> {
        loop {
            match self.tunnel.recv(buf).await {
                Ok(frame) => {
                    self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    trace!(
                        conn_id = frame.conn_id,
                        frame_type = %frame.frame_type,
                        len = frame.payload.len(),
                        "Frame received"
                    );
                    return Ok(frame);
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                    log_rejected(&e);
                }
            }
        }
    }

    /// Register `stream` under `conn_id` and start its pump and writer.
    ///
    /// With `announce`, a `NEW` frame is sent before any `DATA` can be.
    pub(crate) async fn attach(
        self: &Arc<Self>,
        conn_id: u32,
        stream: TcpStream,
        announce: bool,
    ) -> Result<(), MuxError> {
        let (data_tx, data_rx) = mpsc::channel(self.config.write_queue.max(1));
        let shutdown = Arc::new(Notify::new());

        if !self
            .table
            .insert(conn_id, StreamEntry::new(data_tx, Arc::clone(&shutdown)))
        {
            return Err(MuxError::DuplicateStream(conn_id));
        }

        if announce {
            if let Err(e) = self.send(&Frame::open(conn_id)).await {
                self.table.remove(conn_id);
                return Err(e.into());
            }
        }

        self.counters.streams_opened.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, peer = %self.tunnel.peer_addr(), "Stream opened");

        let (reader, writer) = stream.into_split();
        tokio::spawn(Arc::clone(self).write_loop(conn_id, data_rx, writer));
        tokio::spawn(Arc::clone(self).pump(conn_id, reader, shutdown));
        Ok(())
    }

    /// Handle `DATA`, `FIN` and `ERROR`. `NEW` is endpoint specific; any
    /// `NEW` reaching here is dropped.
    pub(crate) async fn dispatch(&self, frame: Frame) {
        match frame.frame_type {
            FrameType::Data => self.deliver(frame.conn_id, frame.payload).await,
            FrameType::Fin => {
                self.close_stream(frame.conn_id, Teardown::PeerFin).await;
            }
            FrameType::Error => {
                warn!(
                    conn_id = frame.conn_id,
                    peer = %self.tunnel.peer_addr(),
                    reason = %String::from_utf8_lossy(&frame.payload),
                    "Peer aborted stream"
                );
                self.close_stream(frame.conn_id, Teardown::PeerError).await;
            }
            FrameType::New => {
                self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    conn_id = frame.conn_id,
                    frame_type = %FrameType::New,
                    peer = %self.tunnel.peer_addr(),
                    "Unexpected NEW dropped"
                );
            }
        }
    }

    /// Remove `conn_id` and send `FIN` if it was live. Returns whether an
    /// entry was removed.
    pub(crate) async fn close_stream(&self, conn_id: u32, cause: Teardown) -> bool {
        let Some(entry) = self.table.remove(conn_id) else {
            if let Some(frame_type) = cause.frame_type() {
                debug!(
                    conn_id,
                    frame_type = %frame_type,
                    peer = %self.tunnel.peer_addr(),
                    "Close for unknown stream ignored"
                );
            }
            return false;
        };

        entry.close();
        self.counters.streams_closed.fetch_add(1, Ordering::Relaxed);
        info!(conn_id, cause = cause.as_str(), "Stream closed");

        if let Err(e) = self.send(&Frame::fin(conn_id)).await {
            warn!(conn_id, error = %e, "Failed to send FIN");
        }
        true
    }

    /// Close every live stream, sending `FIN` for each. Returns how many.
    pub(crate) async fn shutdown_all(&self) -> usize {
        let mut closed = 0;
        for conn_id in self.table.conn_ids() {
            if self.close_stream(conn_id, Teardown::Shutdown).await {
                closed += 1;
            }
        }
        closed
    }

    pub(crate) async fn send_fin(&self, conn_id: u32) {
        if let Err(e) = self.send(&Frame::fin(conn_id)).await {
            warn!(conn_id, error = %e, "Failed to send FIN");
        }
    }

    async fn deliver(&self, conn_id: u32, payload: Vec<u8>) {
        // Clone the sender out so no table lock is held while waiting
        let Some(data_tx) = self.table.sender(conn_id) else {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(
                conn_id,
                frame_type = %FrameType::Data,
                peer = %self.tunnel.peer_addr(),
                "DATA for unknown stream dropped"
            );
            return;
        };

        if data_tx.send(payload).await.is_err() {
            self.counters.frames_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(conn_id, "Stream writer gone, DATA dropped");
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        conn_id: u32,
        mut data_rx: mpsc::Receiver<Vec<u8>>,
        mut writer: OwnedWriteHalf,
    ) {
        while let Some(chunk) = data_rx.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                debug!(conn_id, error = %e, "TCP write failed");
                self.close_stream(conn_id, Teardown::LocalError).await;
                return;
            }
        }

        // Queue closed: the entry is gone, pass the close on to TCP
        if let Err(e) = writer.shutdown().await {
            trace!(conn_id, error = %e, "TCP shutdown failed");
        }
    }

    async fn pump(self: Arc<Self>, conn_id: u32, mut reader: OwnedReadHalf, shutdown: Arc<Notify>) {
        let mut buf = vec![0u8; self.config.read_chunk.clamp(1, MAX_PAYLOAD_SIZE)];

        loop {
            let read = tokio::select! {
                () = shutdown.notified() => {
                    trace!(conn_id, "Pump stopped");
                    return;
                }
                read = reader.read(&mut buf) => read,
            };

            match read {
                Ok(0) => {
                    self.close_stream(conn_id, Teardown::LocalEof).await;
                    return;
                }
                Ok(n) => {
                    if let Err(e) = self.send(&Frame::data(conn_id, buf[..n].to_vec())).await {
                        if e.is_fatal() {
                            return;
                        }
                        warn!(conn_id, error = %e, "Failed to send DATA");
                    }
                }
                Err(e) => {
                    debug!(conn_id, error = %e, "TCP read failed");
                    self.close_stream(conn_id, Teardown::LocalError).await;
                    return;
                }
            }
        }
    }
}

fn log_rejected(error: &TunnelError) {
    match error {
        TunnelError::UnexpectedPeer(from) => {
            debug!(peer = %from, "Datagram from unexpected peer dropped");
        }
        TunnelError::Auth { peer } => {
            warn!(peer = %peer, "Datagram failed authentication, dropped");
        }
        TunnelError::Frame { peer, source } => {
            warn!(peer = %peer, error = %source, "Malformed frame dropped");
        }
        other => warn!(error = %other, "Tunnel receive failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::padding::PaddingMode;
    use chimera_crypto::SessionKey;
    use chimera_transport::{AsyncUdpTransport, MAX_DATAGRAM_SIZE, Transport};
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    /// Multiplexer plus a raw tunnel standing in for the remote endpoint.
    async fn harness() -> (Arc<Multiplexer>, Tunnel) {
        let key = SessionKey::new([0x33; 32]);
        let local = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let remote = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let local_addr = local.local_addr().unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let mux = Multiplexer::new(
            Tunnel::new(local, remote_addr, &key, PaddingMode::None),
            MuxConfig::default(),
        );
        (mux, Tunnel::new(remote, local_addr, &key, PaddingMode::None))
    }

    async fn recv(tunnel: &Tunnel) -> Frame {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        timeout(WAIT, tunnel.recv(&mut buf))
            .await
            .expect("Timeout")
            .unwrap()
    }

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_attach_announces_then_pumps() {
        let (mux, remote) = harness().await;
        let (mut app, stream) = tcp_pair().await;

        mux.attach(1, stream, true).await.unwrap();
        assert_eq!(recv(&remote).await, Frame::open(1));

        app.write_all(b"hello").await.unwrap();
        assert_eq!(recv(&remote).await, Frame::data(1, b"hello".to_vec()));
    }

    #[tokio::test]
    async fn test_duplicate_attach_rejected() {
        let (mux, _remote) = harness().await;
        let (_app1, s1) = tcp_pair().await;
        let (_app2, s2) = tcp_pair().await;

        mux.attach(4, s1, false).await.unwrap();
        assert!(matches!(
            mux.attach(4, s2, false).await,
            Err(MuxError::DuplicateStream(4))
        ));
        assert_eq!(mux.table().len(), 1);
    }

    #[tokio::test]
    async fn test_data_reaches_tcp_in_order() {
        let (mux, _remote) = harness().await;
        let (mut app, stream) = tcp_pair().await;
        mux.attach(2, stream, false).await.unwrap();

        for part in [&b"one "[..], b"two ", b"three"] {
            mux.dispatch(Frame::data(2, part.to_vec())).await;
        }

        let mut buf = [0u8; 13];
        timeout(WAIT, app.read_exact(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(&buf, b"one two three");
    }

    #[tokio::test]
    async fn test_unknown_conn_id_is_noop() {
        let (mux, _remote) = harness().await;
        let (_app, stream) = tcp_pair().await;
        mux.attach(1, stream, false).await.unwrap();

        mux.dispatch(Frame::data(99, b"lost".to_vec())).await;
        mux.dispatch(Frame::fin(99)).await;

        assert_eq!(mux.table().conn_ids(), vec![1]);
        let stats = mux.stats();
        assert_eq!(stats.frames_sent, 0);
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_peer_fin_acks_and_closes_tcp() {
        let (mux, remote) = harness().await;
        let (mut app, stream) = tcp_pair().await;
        mux.attach(7, stream, false).await.unwrap();

        mux.dispatch(Frame::fin(7)).await;
        assert!(mux.table().is_empty());
        assert_eq!(recv(&remote).await, Frame::fin(7));

        let mut buf = [0u8; 8];
        let n = timeout(WAIT, app.read(&mut buf))
            .await
            .expect("Timeout")
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_peer_error_treated_as_fin() {
        let (mux, remote) = harness().await;
        let (_app, stream) = tcp_pair().await;
        mux.attach(3, stream, false).await.unwrap();

        mux.dispatch(Frame::error(3, "boom")).await;
        assert!(!mux.table().contains(3));
        assert_eq!(recv(&remote).await, Frame::fin(3));
        assert_eq!(mux.stats().streams_closed, 1);
    }

    #[tokio::test]
    async fn test_local_eof_sends_single_fin() {
        let (mux, remote) = harness().await;
        let (app, stream) = tcp_pair().await;
        mux.attach(5, stream, false).await.unwrap();

        drop(app);
        assert_eq!(recv(&remote).await, Frame::fin(5));

        // The peer's FIN ack finds no entry and produces nothing
        mux.dispatch(Frame::fin(5)).await;
        assert!(mux.table().is_empty());
        assert_eq!(mux.stats().streams_closed, 1);

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let quiet = timeout(Duration::from_millis(200), remote.recv(&mut buf)).await;
        assert!(quiet.is_err(), "no second FIN expected");
    }

    #[tokio::test]
    async fn test_new_dropped_by_dispatch() {
        let (mux, _remote) = harness().await;
        mux.dispatch(Frame::open(1)).await;
        assert!(mux.table().is_empty());
        assert_eq!(mux.stats().frames_dropped, 1);
    }

    #[tokio::test]
    async fn test_shutdown_all_fins_every_stream() {
        let (mux, remote) = harness().await;
        let mut apps = Vec::new();
        for id in [1, 2, 3] {
            let (app, stream) = tcp_pair().await;
            apps.push(app);
            mux.attach(id, stream, false).await.unwrap();
        }

        assert_eq!(mux.shutdown_all().await, 3);
        assert!(mux.table().is_empty());

        let mut fins = Vec::new();
        for _ in 0..3 {
            let frame = recv(&remote).await;
            assert_eq!(frame.frame_type, FrameType::Fin);
            fins.push(frame.conn_id);
        }
        fins.sort_unstable();
        assert_eq!(fins, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_read_chunk_bounds_data_frames() {
        let key = SessionKey::new([0x44; 32]);
        let local = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let remote = Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap());
        let local_addr = local.local_addr().unwrap();
        let remote_addr = remote.local_addr().unwrap();
        let config = MuxConfig {
            read_chunk: 4,
            ..MuxConfig::default()
        };
        let mux = Multiplexer::new(
            Tunnel::new(local, remote_addr, &key, PaddingMode::Random),
            config,
        );
        let remote = Tunnel::new(remote, local_addr, &key, PaddingMode::Random);

        let (mut app, stream) = tcp_pair().await;
        mux.attach(1, stream, false).await.unwrap();
        app.write_all(b"abcdefghij").await.unwrap();

        let mut received = Vec::new();
        while received.len() < 10 {
            let frame = recv(&remote).await;
            assert!(frame.payload.len() <= 4);
            received.extend_from_slice(&frame.payload);
        }
        assert_eq!(received, b"abcdefghij");
    }
}
