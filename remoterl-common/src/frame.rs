//! Binary data frame header.
//!
//! Data frames are opaque to the relay except for an 8-byte big-endian slot
//! id prefix, which is what lets many env-runner streams share one socket.
//! The relay forwards the whole frame, header included, without copying or
//! inspecting the payload.

use crate::protocol::SlotId;

/// Length of the slot id prefix.
pub const DATA_HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("data frame too short: {0} bytes, need at least 8")]
    TooShort(usize),
}

/// Borrowed view of a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataFrame<'a> {
    pub slot_id: SlotId,
    pub payload: &'a [u8],
}

impl<'a> DataFrame<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, FrameError> {
        if bytes.len() < DATA_HEADER_LEN {
            return Err(FrameError::TooShort(bytes.len()));
        }
        let (header, payload) = bytes.split_at(DATA_HEADER_LEN);
        let mut id = [0u8; DATA_HEADER_LEN];
        id.copy_from_slice(header);
        Ok(Self {
            slot_id: SlotId::from_be_bytes(id),
            payload,
        })
    }

    /// Read just the slot id.
    pub fn peek_slot(bytes: &[u8]) -> Result<SlotId, FrameError> {
        DataFrame::parse(bytes).map(|f| f.slot_id)
    }

    pub fn encode(slot_id: SlotId, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(DATA_HEADER_LEN + payload.len());
        out.extend_from_slice(&slot_id.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_prefixes_slot() {
        let frame = DataFrame::encode(0x0102, b"obs");
        assert_eq!(frame.len(), DATA_HEADER_LEN + 3);
        assert_eq!(&frame[..8], &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(&frame[8..], b"obs");
    }

    #[test]
    fn test_parse_empty_payload() {
        let frame = DataFrame::encode(7, &[]);
        let parsed = DataFrame::parse(&frame).unwrap();
        assert_eq!(parsed.slot_id, 7);
        assert!(parsed.payload.is_empty());
    }

    #[test]
    fn test_parse_too_short() {
        assert_eq!(DataFrame::parse(&[1, 2, 3]), Err(FrameError::TooShort(3)));
        assert_eq!(DataFrame::peek_slot(&[]), Err(FrameError::TooShort(0)));
    }

    #[test]
    fn test_peek_slot_on_owned_buffer() {
        let frame: Vec<u8> = DataFrame::encode(42, b"action");
        let slot = DataFrame::peek_slot(&frame).unwrap();
        drop(frame);
        assert_eq!(slot, 42);
    }
}
