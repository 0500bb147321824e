//! # Chimera Core
//!
//! Core tunnel implementation for Chimera: many TCP byte-streams multiplexed
//! over one UDP socket between a relay and a client.
//!
//! This crate provides:
//! - Frame encoding and decoding with CSPRNG length padding
//! - The sealed tunnel (every frame is padded, then AEAD-sealed)
//! - The connection table and per-stream pump/writer tasks
//! - [`RelayEndpoint`] (accepts TCP, opens streams) and
//!   [`ClientEndpoint`] (dials a fixed destination per stream)
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  TCP   ┌──────────────┐  UDP (sealed frames)  ┌──────────────┐  TCP   ┌─────────────┐
//! │ local client │ ─────► │ RelayEndpoint│ ◄───────────────────► │ClientEndpoint│ ─────► │ destination │
//! └──────────────┘        └──────────────┘                        └──────────────┘        └─────────────┘
//!                          connID 1, 2, 3...                       one dial per NEW
//! ```
//!
//! Each side owns one connection table. Per stream, one pump task drains the
//! TCP socket into `DATA` frames and one writer task drains queued inbound
//! payloads into the socket; a single tunnel task reads and dispatches frames.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod client;
pub mod error;
pub mod frame;
pub mod mux;
pub mod padding;
pub mod relay;
pub mod table;
pub mod tunnel;

pub use client::ClientEndpoint;
pub use error::{FrameError, MuxError, TunnelError};
pub use frame::{Frame, FrameType};
pub use mux::{MuxConfig, MuxStats};
pub use padding::PaddingMode;
pub use relay::RelayEndpoint;
pub use table::ConnectionTable;
pub use tunnel::Tunnel;

/// Wire format version written into every frame
pub const FRAME_VERSION: u8 = 1;

/// Fixed frame header size in bytes: version(1) type(1) connID(4) payloadLen(2)
pub const FRAME_HEADER_SIZE: usize = 8;

/// Ceiling on an encoded (padded, unsealed) frame, kept below common path MTUs
pub const MAX_FRAME_SIZE: usize = 1200;

/// Largest payload a single frame can carry
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Default TCP read size per `DATA` frame
pub const DEFAULT_READ_CHUNK: usize = 1024;
