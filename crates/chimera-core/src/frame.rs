//! Frame encoding and decoding for the tunnel wire protocol.
//!
//! ```text
//! ┌─────────┬──────┬──────────────┬──────────────┬─────────────┬─────────────┐
//! │ version │ type │ connID (BE)  │ length (BE)  │ payload     │ padding     │
//! │ 1 B     │ 1 B  │ 4 B          │ 2 B          │ length B    │ 0..N B      │
//! └─────────┴──────┴──────────────┴──────────────┴─────────────┴─────────────┘
//! ```
//!
//! Bytes after `payload` are padding and are ignored on decode. The version
//! byte is written as [`FRAME_VERSION`] but not checked on decode.

use crate::error::FrameError;
use crate::padding::PaddingMode;
use crate::{FRAME_HEADER_SIZE, FRAME_VERSION, MAX_PAYLOAD_SIZE};
use chimera_crypto::random::fill_random;
use std::fmt;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Open a stream (relay to client only)
    New = 0x01,
    /// Stream bytes
    Data = 0x02,
    /// Half-close of a stream, also sent as the close acknowledgement
    Fin = 0x03,
    /// Abortive close carrying a reason; treated as `Fin` on receipt
    Error = 0x04,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, FrameError> {
        match value {
            0x01 => Ok(FrameType::New),
            0x02 => Ok(FrameType::Data),
            0x03 => Ok(FrameType::Fin),
            0x04 => Ok(FrameType::Error),
            _ => Err(FrameError::UnknownFrameType(value)),
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Data => "DATA",
            Self::Fin => "FIN",
            Self::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// One protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Wire format version
    pub version: u8,
    /// Frame type
    pub frame_type: FrameType,
    /// Stream identifier
    pub conn_id: u32,
    /// Frame payload (empty for `New` and `Fin`)
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with the current wire version.
    #[must_use]
    pub fn new(frame_type: FrameType, conn_id: u32, payload: Vec<u8>) -> Self {
        Self {
            version: FRAME_VERSION,
            frame_type,
            conn_id,
            payload,
        }
    }

    /// `NEW` frame announcing a stream.
    #[must_use]
    pub fn open(conn_id: u32) -> Self {
        Self::new(FrameType::New, conn_id, Vec::new())
    }

    /// `DATA` frame carrying stream bytes.
    #[must_use]
    pub fn data(conn_id: u32, payload: Vec<u8>) -> Self {
        Self::new(FrameType::Data, conn_id, payload)
    }

    /// `FIN` frame closing a stream.
    #[must_use]
    pub fn fin(conn_id: u32) -> Self {
        Self::new(FrameType::Fin, conn_id, Vec::new())
    }

    /// `ERROR` frame with a human-readable reason.
    #[must_use]
    pub fn error(conn_id: u32, reason: &str) -> Self {
        let mut payload = reason.as_bytes().to_vec();
        payload.truncate(MAX_PAYLOAD_SIZE);
        Self::new(FrameType::Error, conn_id, payload)
    }

    /// Length of the header plus payload, before padding.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Encode without padding.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        self.encode_padded(PaddingMode::None)
    }

    /// Encode and append random padding chosen by `padding`.
    ///
    /// Padding bytes come from the OS CSPRNG.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`], or [`FrameError::Padding`] if no randomness is
    /// available.
    pub fn encode_padded(&self, padding: PaddingMode) -> Result<Vec<u8>, FrameError> {
        let payload_len = self.payload.len();
        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        let unpadded = self.encoded_len();
        let total = padding.padded_len(unpadded)?;
        let mut buf = Vec::with_capacity(total);

        buf.push(self.version);
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.conn_id.to_be_bytes());
        // Fits: payload_len <= MAX_PAYLOAD_SIZE < u16::MAX
        buf.extend_from_slice(&(payload_len as u16).to_be_bytes());
        buf.extend_from_slice(&self.payload);

        if total > unpadded {
            buf.resize(total, 0);
            fill_random(&mut buf[unpadded..])?;
        }

        Ok(buf)
    }

    /// Decode a frame, ignoring any bytes after the payload.
    ///
    /// # Errors
    ///
    /// - [`FrameError::TooShort`] if `data` is shorter than the header
    /// - [`FrameError::PayloadOverflow`] if the declared length runs past `data`
    /// - [`FrameError::UnknownFrameType`] if the type byte is not 1..=4
    pub fn decode(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: data.len(),
            });
        }

        let version = data[0];
        let frame_type = FrameType::try_from(data[1])?;
        let conn_id = u32::from_be_bytes([data[2], data[3], data[4], data[5]]);
        let payload_len = u16::from_be_bytes([data[6], data[7]]) as usize;

        let available = data.len() - FRAME_HEADER_SIZE;
        if payload_len > available {
            return Err(FrameError::PayloadOverflow {
                declared: payload_len,
                available,
            });
        }

        Ok(Self {
            version,
            frame_type,
            conn_id,
            payload: data[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + payload_len].to_vec(),
        })
    }
}
