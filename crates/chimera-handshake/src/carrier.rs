//! Carrier strategy trait.

use crate::config::Side;
use crate::error::HandshakeError;
use async_trait::async_trait;
use chimera_crypto::SessionKey;
use std::net::SocketAddr;
use tracing::info;

/// Outcome of a successful handshake
#[derive(Debug)]
pub struct Rendezvous {
    /// Session key shared with the peer
    pub session_key: SessionKey,
    /// Peer's tunnel address, when the carrier learned one
    pub peer_addr: Option<SocketAddr>,
}

/// Mechanism that carries the public-key exchange between two endpoints.
///
/// Both operations block until success, timeout, or carrier failure.
#[async_trait]
pub trait Carrier: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Wait for one inbound handshake and answer it.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on malformed key, timeout, or carrier failure.
    async fn listen(&self) -> Result<Rendezvous, HandshakeError>;

    /// Initiate a handshake and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns [`HandshakeError`] on malformed key, timeout, or carrier failure.
    async fn connect(&self) -> Result<Rendezvous, HandshakeError>;
}

/// Run one handshake attempt on `side`.
///
/// # Errors
///
/// Propagates the carrier's [`HandshakeError`]; nothing is retried.
pub async fn perform(carrier: &dyn Carrier, side: Side) -> Result<Rendezvous, HandshakeError> {
    info!(carrier = carrier.name(), side = %side, "Starting handshake");
    let rendezvous = match side {
        Side::Listen => carrier.listen().await?,
        Side::Connect => carrier.connect().await?,
    };
    info!(
        carrier = carrier.name(),
        peer = ?rendezvous.peer_addr,
        "Handshake complete"
    );
    Ok(rendezvous)
}
