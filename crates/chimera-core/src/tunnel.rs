//! Sealed tunnel between exactly two endpoints.
//!
//! Outgoing: encode, pad, seal, send one datagram to the peer.
//! Incoming: receive, check sender, open, decode.
//!
//! A tunnel datagram is at most `MAX_FRAME_SIZE + SEAL_OVERHEAD` bytes.

use crate::error::TunnelError;
use crate::frame::Frame;
use crate::padding::PaddingMode;
use chimera_crypto::{SessionKey, TunnelCipher};
use chimera_transport::Transport;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Sealed frame channel to one peer over a shared datagram transport
pub struct Tunnel {
    transport: Arc<dyn Transport>,
    peer: SocketAddr,
    cipher: TunnelCipher,
    padding: PaddingMode,
}

impl Tunnel {
    /// Create a tunnel to `peer` keyed with the session key from the handshake.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        peer: SocketAddr,
        key: &SessionKey,
        padding: PaddingMode,
    ) -> Self {
        Self {
            transport,
            peer,
            cipher: TunnelCipher::new(key),
            padding,
        }
    }

    /// Address of the tunnel peer.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Padding mode applied to outgoing frames.
    #[must_use]
    pub fn padding(&self) -> PaddingMode {
        self.padding
    }

    /// The shared datagram transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Seal `frame` and send it to the peer.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::Encode`] for an oversized payload,
    /// [`TunnelError::Seal`] if sealing fails, or [`TunnelError::Transport`]
    /// if the datagram cannot be sent.
    pub async fn send(&self, frame: &Frame) -> Result<(), TunnelError> {
        let encoded = frame.encode_padded(self.padding)?;
        let sealed = self.cipher.seal(&encoded)?;
        self.transport.send_to(&sealed, self.peer).await?;
        Ok(())
    }

    /// Receive one datagram and return the frame it carries.
    ///
    /// `buf` must hold a full datagram. Every error except a closed transport
    /// concerns this datagram only; callers log it and keep reading.
    ///
    /// # Errors
    ///
    /// - [`TunnelError::UnexpectedPeer`] if the sender is not the peer
    /// - [`TunnelError::Auth`] if the envelope does not open
    /// - [`TunnelError::Frame`] if the plaintext is not a valid frame
    /// - [`TunnelError::Transport`] if receiving fails
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Frame, TunnelError> {
        let (len, from) = self.transport.recv_from(buf).await?;
        if from != self.peer {
            return Err(TunnelError::UnexpectedPeer(from));
        }

        let plaintext = self
            .cipher
            .open(&buf[..len])
            .map_err(|_| TunnelError::Auth { peer: from })?;

        Frame::decode(&plaintext).map_err(|source| TunnelError::Frame { peer: from, source })
    }
}

impl fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tunnel")
            .field("peer", &self.peer)
            .field("padding", &self.padding)
            .finish_non_exhaustive()
    }
}
