//! Transport frame encoding.
//!
//! ```text
//! +------+----------------+-------------+-----------+
//! | type | sequence (u64) | length (u32)| payload   |
//! | 1 B  | 8 B, BE        | 4 B, BE     | length B  |
//! +------+----------------+-------------+-----------+
//! ```
//!
//! `Ack` carries the receiver's next expected sequence number (cumulative);
//! `Nack` carries the first missing one. Neither has a payload.

use crate::error::FrameError;

/// Fixed header size
pub const FRAME_HEADER_SIZE: usize = 13;

/// Largest payload one frame may carry (8 MiB)
pub const MAX_FRAME_PAYLOAD: usize = 8 * 1024 * 1024;

/// Frame type discriminant
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Sequenced payload
    Data = 0x01,
    /// Cumulative acknowledgement
    Ack = 0x02,
    /// Retransmission request
    Nack = 0x03,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Data),
            0x02 => Ok(Self::Ack),
            0x03 => Ok(Self::Nack),
            other => Err(FrameError::InvalidFrameType(other)),
        }
    }
}

/// A decoded transport frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Sequence number (data) or referenced sequence number (ack/nack)
    pub sequence: u64,
    /// Payload, empty for control frames
    pub payload: Vec<u8>,
}

impl Frame {
    /// Data frame.
    #[must_use]
    pub fn data(sequence: u64, payload: Vec<u8>) -> Self {
        Self {
            frame_type: FrameType::Data,
            sequence,
            payload,
        }
    }

    /// Cumulative ACK: every sequence below `next_expected` was delivered.
    #[must_use]
    pub fn ack(next_expected: u64) -> Self {
        Self {
            frame_type: FrameType::Ack,
            sequence: next_expected,
            payload: Vec::new(),
        }
    }

    /// NACK for `missing`.
    #[must_use]
    pub fn nack(missing: u64) -> Self {
        Self {
            frame_type: FrameType::Nack,
            sequence: missing,
            payload: Vec::new(),
        }
    }

    /// Encoded length.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Serialize to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] above [`MAX_FRAME_PAYLOAD`].
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        if self.payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(self.payload.len()));
        }
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.push(self.frame_type as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Parse from bytes. Trailing bytes after the payload are ignored.
    ///
    /// # Errors
    ///
    /// Returns a [`FrameError`] for short input, an unknown type, or a
    /// declared length that exceeds the input or the protocol maximum.
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: FRAME_HEADER_SIZE,
                actual: bytes.len(),
            });
        }

        let frame_type = FrameType::try_from(bytes[0])?;
        let mut seq = [0u8; 8];
        seq.copy_from_slice(&bytes[1..9]);
        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[9..13]);
        let payload_len = u32::from_be_bytes(len) as usize;

        if payload_len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }
        let end = FRAME_HEADER_SIZE
            .checked_add(payload_len)
            .ok_or(FrameError::PayloadOverflow)?;
        if end > bytes.len() {
            return Err(FrameError::PayloadOverflow);
        }

        Ok(Self {
            frame_type,
            sequence: u64::from_be_bytes(seq),
            payload: bytes[FRAME_HEADER_SIZE..end].to_vec(),
        })
    }
}
