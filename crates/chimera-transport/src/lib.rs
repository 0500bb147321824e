//! # Chimera Transport
//!
//! Datagram transport layer for the Chimera tunnel.
//!
//! This crate provides:
//! - The [`Transport`](transport::Transport) trait the tunnel and the direct
//!   handshake carrier are written against
//! - [`AsyncUdpTransport`](udp::AsyncUdpTransport), a tokio UDP socket bound
//!   through `socket2` with enlarged kernel buffers and traffic counters

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp;

pub use transport::{Transport, TransportError, TransportResult, TransportStats};
pub use udp::AsyncUdpTransport;

/// Largest datagram the tunnel ever reads (sealed frame plus headroom)
pub const MAX_DATAGRAM_SIZE: usize = 2048;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Kernel receive buffer size
    pub recv_buffer_size: usize,
    /// Kernel send buffer size
    pub send_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 2 * 1024 * 1024,
            send_buffer_size: 2 * 1024 * 1024,
        }
    }
}
