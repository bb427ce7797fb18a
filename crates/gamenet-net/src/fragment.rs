//! Fragment envelope for payloads larger than a single frame.
//!
//! A logical payload above [`MAX_MESSAGE_SIZE`] is split into chunks, each
//! carried as the payload of a frame with [`FrameFlags::FRAGMENT`] set:
//!
//! ```text
//! +--------------------+--------------+-------------------+-----------------+
//! | transfer id (16)   | offset (8)   | total length (8)  | chunk           |
//! | random 128-bit     | i64 LE       | i64 LE            | <= MAX_FRAGMENT_DATA |
//! +--------------------+--------------+-------------------+-----------------+
//! ```
//!
//! Only the chunk size is bounded by the frame limit; the total length of a
//! transfer is not.
//!
//! [`FrameFlags::FRAGMENT`]: crate::framing::FrameFlags::FRAGMENT

use std::fmt;

use uuid::Uuid;

use crate::framing::MAX_MESSAGE_SIZE;

/// Envelope overhead: transfer id + offset + total length.
pub const FRAGMENT_META_SIZE: usize = 16 + 8 + 8;

/// Largest chunk that still fits a frame once wrapped in the envelope.
pub const MAX_FRAGMENT_DATA: usize = MAX_MESSAGE_SIZE - FRAGMENT_META_SIZE;

/// Identifier grouping all fragments of one large send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferId(Uuid);

impl TransferId {
    /// A fresh random id, one per logical large send.
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Rebuild an id from its 16 wire bytes.
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// The 16 wire bytes of this id.
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Errors produced while building or parsing fragment envelopes.
#[derive(Debug, thiserror::Error)]
pub enum FragmentError {
    /// The payload is shorter than the envelope header.
    #[error("fragment payload of {0} bytes is shorter than the {FRAGMENT_META_SIZE}-byte envelope")]
    Truncated(usize),

    /// Offset or total length was negative on the wire.
    #[error("negative {field} in fragment envelope: {value}")]
    NegativeField {
        /// Which envelope field was negative.
        field: &'static str,
        /// The value read.
        value: i64,
    },

    /// A chunk larger than [`MAX_FRAGMENT_DATA`] was offered for wrapping.
    #[error("fragment chunk of {len} bytes exceeds maximum {max}")]
    ChunkTooLarge {
        /// Chunk length.
        len: usize,
        /// Enforced maximum.
        max: usize,
    },

    /// `offset + chunk length` runs past the declared total length.
    #[error("fragment chunk [{offset}, +{len}) exceeds total length {total}")]
    ChunkBeyondTotal {
        /// Chunk offset.
        offset: u64,
        /// Chunk length.
        len: usize,
        /// Declared total length.
        total: u64,
    },
}

/// A parsed fragment envelope borrowing its chunk from the frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment<'a> {
    /// Transfer this chunk belongs to.
    pub transfer_id: TransferId,
    /// Absolute position of the chunk within the logical payload.
    pub offset: u64,
    /// Length of the complete logical payload.
    pub total_length: u64,
    /// The chunk bytes.
    pub chunk: &'a [u8],
}

fn check_bounds(offset: u64, len: usize, total: u64) -> Result<(), FragmentError> {
    let end = offset.checked_add(len as u64);
    match end {
        Some(end) if end <= total => Ok(()),
        _ => Err(FragmentError::ChunkBeyondTotal { offset, len, total }),
    }
}

/// Wrap `chunk` in a fragment envelope.
///
/// The result never exceeds [`MAX_MESSAGE_SIZE`] because the chunk is capped
/// at [`MAX_FRAGMENT_DATA`].
pub fn build_fragment_payload(
    transfer_id: TransferId,
    offset: u64,
    total_length: u64,
    chunk: &[u8],
) -> Result<Vec<u8>, FragmentError> {
    if chunk.len() > MAX_FRAGMENT_DATA {
        return Err(FragmentError::ChunkTooLarge {
            len: chunk.len(),
            max: MAX_FRAGMENT_DATA,
        });
    }
    check_bounds(offset, chunk.len(), total_length)?;
    let offset_wire = i64::try_from(offset).map_err(|_| FragmentError::ChunkBeyondTotal {
        offset,
        len: chunk.len(),
        total: total_length,
    })?;
    let total_wire = i64::try_from(total_length).map_err(|_| FragmentError::ChunkBeyondTotal {
        offset,
        len: chunk.len(),
        total: total_length,
    })?;

    let mut payload = Vec::with_capacity(FRAGMENT_META_SIZE + chunk.len());
    payload.extend_from_slice(transfer_id.as_bytes());
    payload.extend_from_slice(&offset_wire.to_le_bytes());
    payload.extend_from_slice(&total_wire.to_le_bytes());
    payload.extend_from_slice(chunk);
    Ok(payload)
}

/// Split a fragment envelope into its fields.
pub fn parse_fragment_payload(payload: &[u8]) -> Result<Fragment<'_>, FragmentError> {
    if payload.len() < FRAGMENT_META_SIZE {
        return Err(FragmentError::Truncated(payload.len()));
    }

    let mut id = [0u8; 16];
    id.copy_from_slice(&payload[0..16]);

    let mut word = [0u8; 8];
    word.copy_from_slice(&payload[16..24]);
    let offset = i64::from_le_bytes(word);
    word.copy_from_slice(&payload[24..32]);
    let total = i64::from_le_bytes(word);

    let offset = u64::try_from(offset).map_err(|_| FragmentError::NegativeField {
        field: "offset",
        value: offset,
    })?;
    let total_length = u64::try_from(total).map_err(|_| FragmentError::NegativeField {
        field: "total length",
        value: total,
    })?;

    let chunk = &payload[FRAGMENT_META_SIZE..];
    check_bounds(offset, chunk.len(), total_length)?;

    Ok(Fragment {
        transfer_id: TransferId::from_bytes(id),
        offset,
        total_length,
        chunk,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let id = TransferId::new_random();
        let chunk = b"some chunk bytes";

        let payload = build_fragment_payload(id, 100, 1_000, chunk).unwrap();
        assert_eq!(payload.len(), FRAGMENT_META_SIZE + chunk.len());

        let fragment = parse_fragment_payload(&payload).unwrap();
        assert_eq!(fragment.transfer_id, id);
        assert_eq!(fragment.offset, 100);
        assert_eq!(fragment.total_length, 1_000);
        assert_eq!(fragment.chunk, chunk);
    }

    #[test]
    fn test_envelope_field_order() {
        let id = TransferId::from_bytes([7u8; 16]);
        let payload = build_fragment_payload(id, 1, 3, &[0xEE, 0xFF]).unwrap();

        assert_eq!(&payload[0..16], &[7u8; 16]);
        assert_eq!(&payload[16..24], &1i64.to_le_bytes());
        assert_eq!(&payload[24..32], &3i64.to_le_bytes());
        assert_eq!(&payload[32..], &[0xEE, 0xFF]);
    }

    #[test]
    fn test_empty_chunk_is_valid() {
        let id = TransferId::new_random();
        let payload = build_fragment_payload(id, 10, 10, &[]).unwrap();
        let fragment = parse_fragment_payload(&payload).unwrap();
        assert!(fragment.chunk.is_empty());
        assert_eq!(fragment.offset, 10);
    }

    #[test]
    fn test_truncated_envelope_rejected() {
        let result = parse_fragment_payload(&[0u8; FRAGMENT_META_SIZE - 1]);
        assert!(matches!(result, Err(FragmentError::Truncated(31))));
    }

    #[test]
    fn test_negative_offset_rejected() {
        let mut payload = build_fragment_payload(TransferId::new_random(), 0, 4, b"abcd").unwrap();
        payload[16..24].copy_from_slice(&(-1i64).to_le_bytes());
        assert!(matches!(
            parse_fragment_payload(&payload),
            Err(FragmentError::NegativeField { field: "offset", .. })
        ));
    }

    #[test]
    fn test_chunk_past_total_rejected() {
        let mut payload = build_fragment_payload(TransferId::new_random(), 0, 4, b"abcd").unwrap();
        payload[24..32].copy_from_slice(&2i64.to_le_bytes());
        assert!(matches!(
            parse_fragment_payload(&payload),
            Err(FragmentError::ChunkBeyondTotal { .. })
        ));

        assert!(build_fragment_payload(TransferId::new_random(), 3, 4, b"ab").is_err());
    }

    #[test]
    fn test_max_chunk_fits_one_frame() {
        let chunk = vec![1u8; MAX_FRAGMENT_DATA];
        let payload =
            build_fragment_payload(TransferId::new_random(), 0, chunk.len() as u64 * 2, &chunk)
                .unwrap();
        assert_eq!(payload.len(), MAX_MESSAGE_SIZE);

        let too_big = vec![1u8; MAX_FRAGMENT_DATA + 1];
        assert!(matches!(
            build_fragment_payload(TransferId::new_random(), 0, u64::MAX / 2, &too_big),
            Err(FragmentError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_transfer_ids_are_unique() {
        let a = TransferId::new_random();
        let b = TransferId::new_random();
        assert_ne!(a, b);
        assert_eq!(TransferId::from_bytes(*a.as_bytes()), a);
    }
}
