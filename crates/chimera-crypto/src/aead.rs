//! `XChaCha20-Poly1305` tunnel envelope.
//!
//! Every tunnel datagram is sealed as:
//!
//! ```text
//! ┌────────────────┬──────────────────────────────┐
//! │ nonce (24 B)   │ ciphertext ‖ tag (16 B)      │
//! └────────────────┴──────────────────────────────┘
//! ```
//!
//! The nonce is drawn fresh from the OS CSPRNG on every seal. With a 192-bit
//! nonce, random collisions are negligible (birthday bound is 2^96 messages),
//! so no counter state has to be shared between the two endpoints and lost or
//! reordered datagrams never desynchronise the cipher.

use crate::random::random_24;
use crate::{CryptoError, XCHACHA_KEY_SIZE, XCHACHA_NONCE_SIZE, XCHACHA_TAG_SIZE};
use chacha20poly1305::{
    XChaCha20Poly1305, XNonce,
    aead::{Aead, KeyInit},
};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// 32-byte symmetric session key shared by exactly two endpoints.
///
/// Never persisted; zeroized on drop. `Debug` output is redacted.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; XCHACHA_KEY_SIZE]);

impl SessionKey {
    /// Create a key from raw bytes.
    #[must_use]
    pub fn new(bytes: [u8; XCHACHA_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Create from slice.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKeyLength` if slice length is not 32 bytes.
    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; XCHACHA_KEY_SIZE] =
            slice
                .try_into()
                .map_err(|_| CryptoError::InvalidKeyLength {
                    expected: XCHACHA_KEY_SIZE,
                    actual: slice.len(),
                })?;
        Ok(Self(bytes))
    }

    /// Generate a random key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        let mut bytes = [0u8; XCHACHA_KEY_SIZE];
        crate::random::fill_random(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get raw key bytes.
    ///
    /// # Security
    ///
    /// Handle with extreme care - this exposes the raw key material.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; XCHACHA_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Seal `plaintext` under `key`, returning `nonce ‖ ciphertext ‖ tag`.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if no nonce can be drawn, or
/// [`CryptoError::EncryptionFailed`] if the AEAD rejects the input.
pub fn seal(key: &SessionKey, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    TunnelCipher::new(key).seal(plaintext)
}

/// Open an envelope produced by [`seal`].
///
/// # Errors
///
/// Returns [`CryptoError::DecryptionFailed`] if the envelope is shorter than a
/// nonce plus tag, or if the tag does not verify. No partial plaintext is ever
/// returned.
pub fn open(key: &SessionKey, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
    TunnelCipher::new(key).open(envelope)
}

/// Keyed cipher for sealing tunnel datagrams.
///
/// Holds the expanded key so per-datagram calls skip key setup. Cheap to
/// share behind an `Arc`; all methods take `&self`.
#[derive(Clone)]
pub struct TunnelCipher {
    cipher: XChaCha20Poly1305,
}

impl TunnelCipher {
    /// Create a cipher for the given session key.
    #[must_use]
    pub fn new(key: &SessionKey) -> Self {
        Self {
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Seal a plaintext with a freshly drawn random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] or [`CryptoError::EncryptionFailed`].
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = random_24()?;
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut envelope = Vec::with_capacity(XCHACHA_NONCE_SIZE + ciphertext.len());
        envelope.extend_from_slice(&nonce);
        envelope.extend_from_slice(&ciphertext);
        Ok(envelope)
    }

    /// Open a sealed envelope.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::DecryptionFailed`] on short input or tag mismatch.
    pub fn open(&self, envelope: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if envelope.len() < XCHACHA_NONCE_SIZE + XCHACHA_TAG_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }
        let (nonce, ciphertext) = envelope.split_at(XCHACHA_NONCE_SIZE);

        self.cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl fmt::Debug for TunnelCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelCipher").finish_non_exhaustive()
    }
}
