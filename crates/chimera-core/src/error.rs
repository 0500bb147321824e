//! Error types for the Chimera tunnel core.

use chimera_crypto::CryptoError;
use chimera_transport::TransportError;
use std::net::SocketAddr;
use thiserror::Error;

/// Frame-level errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Declared payload length exceeds the bytes present
    #[error("payload length {declared} exceeds remaining {available} bytes")]
    PayloadOverflow {
        /// Length written in the header
        declared: usize,
        /// Bytes actually following the header
        available: usize,
    },

    /// Payload does not fit into one frame
    #[error("payload of {0} bytes exceeds frame capacity")]
    PayloadTooLarge(usize),

    /// Unknown frame type byte
    #[error("unknown frame type: 0x{0:02X}")]
    UnknownFrameType(u8),

    /// No randomness available for padding
    #[error("padding failed: {0}")]
    Padding(#[from] CryptoError),
}

/// Errors from the sealed tunnel
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Underlying datagram transport failed
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Datagram came from somewhere other than the tunnel peer
    #[error("datagram from unexpected peer {0}")]
    UnexpectedPeer(SocketAddr),

    /// Datagram failed authentication
    #[error("authentication failed for datagram from {peer}")]
    Auth {
        /// Sender of the rejected datagram
        peer: SocketAddr,
    },

    /// Datagram opened but the frame inside is malformed
    #[error("malformed frame from {peer}: {source}")]
    Frame {
        /// Sender of the rejected datagram
        peer: SocketAddr,
        /// Decode failure
        #[source]
        source: FrameError,
    },

    /// Outgoing frame could not be encoded
    #[error("frame encode failed: {0}")]
    Encode(#[from] FrameError),

    /// Outgoing frame could not be sealed
    #[error("seal failed: {0}")]
    Seal(#[from] CryptoError),
}

impl TunnelError {
    /// Whether the tunnel can no longer carry traffic.
    ///
    /// Everything except a closed transport only affects one datagram.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(TransportError::Closed))
    }
}

/// Multiplexer and endpoint errors
#[derive(Debug, Error)]
pub enum MuxError {
    /// Tunnel failure
    #[error("tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    /// Local TCP listener or socket failure
    #[error("connection error: {0}")]
    Connection(#[from] std::io::Error),

    /// connID already present in the connection table
    #[error("stream {0} already exists")]
    DuplicateStream(u32),

    /// Background task panicked or was cancelled
    #[error("task failed: {0}")]
    Task(String),
}
