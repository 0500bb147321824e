//! # Chimera Crypto
//!
//! Cryptographic primitives for the Chimera tunnel.
//!
//! This crate provides:
//! - `XChaCha20-Poly1305` envelope sealing with a fresh random nonce per datagram
//! - Ephemeral X25519 key exchange with degenerate-point rejection
//! - Session-key derivation from the raw Diffie-Hellman output
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Key Exchange | X25519 | 128-bit |
//! | AEAD | XChaCha20-Poly1305 | 256-bit key |
//! | KDF | BLAKE3 `derive_key` | 128-bit |

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod error;
pub mod random;
pub mod x25519;

pub use aead::{SessionKey, TunnelCipher};
pub use error::CryptoError;
pub use x25519::{EphemeralKeyPair, PublicKey};

/// X25519 public key size
pub const X25519_PUBLIC_KEY_SIZE: usize = 32;

/// X25519 secret key size
pub const X25519_SECRET_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 key size
pub const XCHACHA_KEY_SIZE: usize = 32;

/// XChaCha20-Poly1305 nonce size
pub const XCHACHA_NONCE_SIZE: usize = 24;

/// Poly1305 authentication tag size
pub const XCHACHA_TAG_SIZE: usize = 16;

/// Bytes a sealed envelope adds on top of its plaintext (nonce + tag)
pub const SEAL_OVERHEAD: usize = XCHACHA_NONCE_SIZE + XCHACHA_TAG_SIZE;
