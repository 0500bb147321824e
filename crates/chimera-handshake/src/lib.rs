//! # Chimera Handshake
//!
//! Agrees the tunnel session key between relay and client, and tells the
//! listening side where its peer's tunnel socket is.
//!
//! Two interchangeable carriers implement [`Carrier`]:
//! - [`DirectCarrier`]: raw 32-byte public keys exchanged as UDP datagrams
//!   on the tunnel socket itself
//! - [`BrokerCarrier`]: JSON handshake messages relayed through a
//!   publish/subscribe [`Broker`] for endpoints that cannot dial each other
//!
//! Every attempt uses a fresh ephemeral X25519 key pair. Failures are
//! reported, never retried.
//!
//! ```no_run
//! use chimera_handshake::{Carrier, DirectCarrier, Side, perform};
//! use chimera_transport::AsyncUdpTransport;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transport = Arc::new(AsyncUdpTransport::bind(([0, 0, 0, 0], 9000)).await?);
//! let carrier = DirectCarrier::new(transport);
//! let rendezvous = perform(&carrier, Side::Listen).await?;
//! println!("peer at {:?}", rendezvous.peer_addr);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod carrier;
pub mod config;
pub mod direct;
pub mod error;

pub use broker::{Broker, BrokerCarrier, GooglePubSubBroker, HandshakeMessage, MemoryBroker};
pub use carrier::{Carrier, Rendezvous, perform};
pub use config::{BrokerConfig, HandshakeConfig, Method, Side};
pub use direct::DirectCarrier;
pub use error::HandshakeError;

use std::time::Duration;

/// Default wait for the peer's reply on the direct carrier
pub const DIRECT_REPLY_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for the listener's reply on the broker carrier
pub const BROKER_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

/// Default wait for an inbound handshake on the listening side
pub const LISTEN_TIMEOUT: Duration = Duration::from_secs(120);
