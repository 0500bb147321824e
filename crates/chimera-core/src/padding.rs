//! Frame length padding.
//!
//! Padding hides payload length from an on-path observer. It is applied to
//! the encoded frame before sealing, so the padded bytes are authenticated
//! with everything else, and the receiver ignores them after decoding.

use crate::MAX_FRAME_SIZE;
use chimera_crypto::CryptoError;
use chimera_crypto::random::random_up_to;
use serde::{Deserialize, Serialize};

/// Padding size classes (bytes). The last class equals [`MAX_FRAME_SIZE`].
pub const PADDING_CLASSES: &[usize] = &[64, 256, 512, 1024, 1200];

/// How encoded frames are padded before sealing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaddingMode {
    /// Uniform random length in `[len, MAX_FRAME_SIZE]`
    #[default]
    Random,
    /// Round up to the next size class
    SizeClasses,
    /// No padding
    None,
}

impl PaddingMode {
    /// Total length an encoded frame of `unpadded` bytes is padded to.
    ///
    /// Never returns less than `unpadded`, and never more than
    /// [`MAX_FRAME_SIZE`] unless `unpadded` already exceeds it.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the CSPRNG fails in
    /// [`PaddingMode::Random`].
    pub fn padded_len(self, unpadded: usize) -> Result<usize, CryptoError> {
        if unpadded >= MAX_FRAME_SIZE {
            return Ok(unpadded);
        }

        match self {
            Self::Random => Ok(unpadded + random_up_to(MAX_FRAME_SIZE - unpadded)?),
            Self::SizeClasses => Ok(select_padding_class(unpadded)),
            Self::None => Ok(unpadded),
        }
    }
}

/// Smallest padding class that holds `len` bytes.
#[must_use]
pub fn select_padding_class(len: usize) -> usize {
    PADDING_CLASSES
        .iter()
        .find(|&&size| size >= len)
        .copied()
        .unwrap_or(MAX_FRAME_SIZE.max(len))
}

impl std::fmt::Display for PaddingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => write!(f, "random"),
            Self::SizeClasses => write!(f, "size-classes"),
            Self::None => write!(f, "none"),
        }
    }
}
