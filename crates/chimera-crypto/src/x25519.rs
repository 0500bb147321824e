//! Ephemeral X25519 Diffie-Hellman key exchange (RFC 7748).
//!
//! Provides curve25519-based key exchange with:
//! - Fresh key pairs from the OS CSPRNG, one per handshake attempt
//! - Low-order / identity point rejection
//! - Zeroization of private scalars and shared secrets
//! - Session-key derivation through BLAKE3 `derive_key`

use crate::CryptoError;
use crate::aead::SessionKey;
use crate::{X25519_PUBLIC_KEY_SIZE, XCHACHA_KEY_SIZE};
use rand_core::OsRng;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Domain-separation context for deriving the tunnel session key.
const SESSION_KEY_CONTEXT: &str = "chimera-tunnel 2024-01 session key v1";

/// X25519 public key (32 bytes). Safe to transmit.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(x25519_dalek::PublicKey);

/// Ephemeral key pair. The private scalar never leaves this type.
pub struct EphemeralKeyPair {
    secret: PrivateScalar,
    public: PublicKey,
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct PrivateScalar(x25519_dalek::StaticSecret);

/// Raw X25519 shared secret (32 bytes).
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; 32]);

/// Generate a fresh ephemeral key pair.
#[must_use]
pub fn generate_key_pair() -> EphemeralKeyPair {
    EphemeralKeyPair::generate()
}

/// Compute the shared secret between our private scalar and a peer's public key.
///
/// # Errors
///
/// Returns [`CryptoError::InvalidPublicKey`] if the peer key is a low-order
/// point (the exchange would not be contributory).
pub fn derive_shared_secret(
    own: &EphemeralKeyPair,
    peer_public: &PublicKey,
) -> Result<SharedSecret, CryptoError> {
    own.exchange(peer_public)
}

impl EphemeralKeyPair {
    /// Generate a new random key pair with RFC 7748 clamping.
    #[must_use]
    pub fn generate() -> Self {
        let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret));
        Self {
            secret: PrivateScalar(secret),
            public,
        }
    }

    /// Our public key.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Perform Diffie-Hellman key exchange.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if the result is not
    /// contributory, which happens exactly for low-order peer points
    /// (including the all-zero identity encoding).
    pub fn exchange(&self, peer_public: &PublicKey) -> Result<SharedSecret, CryptoError> {
        let shared = self.secret.0.diffie_hellman(&peer_public.0);

        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        Ok(SharedSecret(*shared.as_bytes()))
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

impl PublicKey {
    /// Export public key as bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; X25519_PUBLIC_KEY_SIZE] {
        *self.0.as_bytes()
    }

    /// Import public key from bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; X25519_PUBLIC_KEY_SIZE]) -> Self {
        Self(x25519_dalek::PublicKey::from(bytes))
    }

    /// Import a public key received off the wire.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidPublicKey`] if `slice` is not exactly 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; X25519_PUBLIC_KEY_SIZE] = slice
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Ok(Self::from_bytes(bytes))
    }

    /// Get bytes as a slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; X25519_PUBLIC_KEY_SIZE] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey(")?;
        for byte in &self.as_bytes()[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

impl SharedSecret {
    /// Get shared secret as bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive the tunnel session key from this secret.
    #[must_use]
    pub fn session_key(&self) -> SessionKey {
        let derived: [u8; XCHACHA_KEY_SIZE] = blake3::derive_key(SESSION_KEY_CONTEXT, &self.0);
        SessionKey::new(derived)
    }
}
