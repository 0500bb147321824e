//! Handshake error types.

use chimera_crypto::CryptoError;
use chimera_transport::TransportError;
use std::time::Duration;
use thiserror::Error;

/// Handshake errors. All of them end the attempt.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Peer public key is malformed or degenerate
    #[error("invalid peer public key: {0}")]
    InvalidKey(String),

    /// No handshake or reply arrived in time
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),

    /// Datagram carrier failed
    #[error("carrier error: {0}")]
    Carrier(#[from] TransportError),

    /// Broker rejected a request or returned garbage
    #[error("broker error: {0}")]
    Broker(String),

    /// HTTP request to the broker failed
    #[error("broker request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Local cryptographic failure (CSPRNG)
    #[error("crypto error: {0}")]
    Crypto(CryptoError),

    /// Carrier cannot run with the given settings
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CryptoError> for HandshakeError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::InvalidPublicKey => Self::InvalidKey(err.to_string()),
            other => Self::Crypto(other),
        }
    }
}
