//! Direct carrier: public keys exchanged as raw 32-byte datagrams.
//!
//! Runs on the tunnel's own transport, so the sender address observed by the
//! listener is exactly where tunnel datagrams must go.

use crate::carrier::{Carrier, Rendezvous};
use crate::error::HandshakeError;
use crate::{DIRECT_REPLY_TIMEOUT, LISTEN_TIMEOUT};
use async_trait::async_trait;
use chimera_crypto::{EphemeralKeyPair, PublicKey, X25519_PUBLIC_KEY_SIZE};
use chimera_transport::{MAX_DATAGRAM_SIZE, Transport};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info};

/// Handshake over the tunnel's datagram transport
pub struct DirectCarrier {
    transport: Arc<dyn Transport>,
    peer: Option<SocketAddr>,
    reply_timeout: Duration,
    listen_timeout: Option<Duration>,
}

impl DirectCarrier {
    /// Create a carrier on `transport` with default timeouts and no peer.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            peer: None,
            reply_timeout: DIRECT_REPLY_TIMEOUT,
            listen_timeout: Some(LISTEN_TIMEOUT),
        }
    }

    /// Address to connect to. Required for [`Carrier::connect`].
    #[must_use]
    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// How long `connect` waits for the reply.
    #[must_use]
    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    /// How long `listen` waits; `None` waits until cancelled.
    #[must_use]
    pub fn with_listen_timeout(mut self, listen_timeout: Option<Duration>) -> Self {
        self.listen_timeout = listen_timeout;
        self
    }

    async fn accept_one(&self) -> Result<Rendezvous, HandshakeError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, from) = self.transport.recv_from(&mut buf).await?;
        let peer_public = peer_key(&buf[..len])?;

        // Derive before replying so a bad key gets no answer
        let own = EphemeralKeyPair::generate();
        let session_key = own.exchange(&peer_public)?.session_key();

        self.transport
            .send_to(own.public_key().as_bytes(), from)
            .await?;
        info!(peer = %from, "Answered direct handshake");

        Ok(Rendezvous {
            session_key,
            peer_addr: Some(from),
        })
    }

    async fn await_reply(&self, peer: SocketAddr) -> Result<PublicKey, HandshakeError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = self.transport.recv_from(&mut buf).await?;
            if from != peer {
                debug!(peer = %from, expected = %peer, "Ignoring datagram from unexpected sender");
                continue;
            }
            return peer_key(&buf[..len]);
        }
    }
}

#[async_trait]
impl Carrier for DirectCarrier {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn listen(&self) -> Result<Rendezvous, HandshakeError> {
        info!(local = %self.transport.local_addr()?, "Waiting for direct handshake");
        match self.listen_timeout {
            Some(limit) => timeout(limit, self.accept_one())
                .await
                .map_err(|_| HandshakeError::Timeout(limit))?,
            None => self.accept_one().await,
        }
    }

    async fn connect(&self) -> Result<Rendezvous, HandshakeError> {
        let peer = self.peer.ok_or_else(|| {
            HandshakeError::Config("direct connect needs a peer address".to_string())
        })?;

        let own = EphemeralKeyPair::generate();
        self.transport
            .send_to(own.public_key().as_bytes(), peer)
            .await?;
        debug!(peer = %peer, "Sent direct handshake");

        let peer_public = timeout(self.reply_timeout, self.await_reply(peer))
            .await
            .map_err(|_| HandshakeError::Timeout(self.reply_timeout))??;
        let session_key = own.exchange(&peer_public)?.session_key();

        Ok(Rendezvous {
            session_key,
            peer_addr: Some(peer),
        })
    }
}

fn peer_key(datagram: &[u8]) -> Result<PublicKey, HandshakeError> {
    if datagram.len() != X25519_PUBLIC_KEY_SIZE {
        return Err(HandshakeError::InvalidKey(format!(
            "expected {X25519_PUBLIC_KEY_SIZE} bytes, got {}",
            datagram.len()
        )));
    }
    Ok(PublicKey::from_slice(datagram)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chimera_crypto::aead::{open, seal};
    use chimera_transport::AsyncUdpTransport;

    async fn transport() -> Arc<AsyncUdpTransport> {
        Arc::new(AsyncUdpTransport::bind(([127, 0, 0, 1], 0)).await.unwrap())
    }

    #[tokio::test]
    async fn test_direct_handshake_agrees() {
        let listen_side = transport().await;
        let connect_side = transport().await;
        let listen_addr = listen_side.local_addr().unwrap();
        let connect_addr = connect_side.local_addr().unwrap();

        let listener = DirectCarrier::new(listen_side);
        let connector = DirectCarrier::new(connect_side).with_peer(listen_addr);

        let (listened, connected) = tokio::join!(listener.listen(), connector.connect());
        let listened = listened.unwrap();
        let connected = connected.unwrap();

        assert_eq!(listened.session_key, connected.session_key);
        assert_eq!(listened.peer_addr, Some(connect_addr));
        assert_eq!(connected.peer_addr, Some(listen_addr));

        let envelope = seal(&listened.session_key, b"ping").unwrap();
        assert_eq!(open(&connected.session_key, &envelope).unwrap(), b"ping");
    }

    #[tokio::test]
    async fn test_connect_times_out_without_listener() {
        let silent = transport().await;
        let connector = DirectCarrier::new(transport().await)
            .with_peer(silent.local_addr().unwrap())
            .with_reply_timeout(Duration::from_millis(200));

        assert!(matches!(
            connector.connect().await,
            Err(HandshakeError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_rejects_short_key() {
        let listen_side = transport().await;
        let listen_addr = listen_side.local_addr().unwrap();
        let sender = transport().await;

        let listener = DirectCarrier::new(listen_side);
        sender.send_to(&[7u8; 31], listen_addr).await.unwrap();

        assert!(matches!(
            listener.listen().await,
            Err(HandshakeError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_listen_rejects_zero_key_without_reply() {
        let listen_side = transport().await;
        let listen_addr = listen_side.local_addr().unwrap();
        let sender = transport().await;

        let listener = DirectCarrier::new(listen_side);
        sender.send_to(&[0u8; 32], listen_addr).await.unwrap();
        assert!(matches!(
            listener.listen().await,
            Err(HandshakeError::InvalidKey(_))
        ));

        let mut buf = [0u8; 64];
        let reply = timeout(Duration::from_millis(200), sender.recv_from(&mut buf)).await;
        assert!(reply.is_err(), "invalid key must not be answered");
    }

    #[tokio::test]
    async fn test_listen_timeout() {
        let listener =
            DirectCarrier::new(transport().await).with_listen_timeout(Some(Duration::from_millis(100)));
        assert!(matches!(
            listener.listen().await,
            Err(HandshakeError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_ignores_other_senders() {
        let listen_side = transport().await;
        let connect_side = transport().await;
        let listen_addr = listen_side.local_addr().unwrap();
        let connect_addr = connect_side.local_addr().unwrap();
        let stranger = transport().await;

        let listener = DirectCarrier::new(listen_side);
        let connector = DirectCarrier::new(connect_side)
            .with_peer(listen_addr)
            .with_reply_timeout(Duration::from_secs(2));

        let noise = async {
            stranger.send_to(&[9u8; 32], connect_addr).await.unwrap();
        };
        let (listened, connected, ()) = tokio::join!(listener.listen(), connector.connect(), noise);
        assert_eq!(listened.unwrap().session_key, connected.unwrap().session_key);
    }

    #[tokio::test]
    async fn test_connect_without_peer_is_config_error() {
        let connector = DirectCarrier::new(transport().await);
        assert!(matches!(
            connector.connect().await,
            Err(HandshakeError::Config(_))
        ));
    }
}
