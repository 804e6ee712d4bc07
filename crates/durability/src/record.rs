//! Bucket record format
//!
//! # Record Layout
//!
//! ```text
//! ┌─────────────────┬─────────────────────────┬──────────┐
//! │ Length (4 bytes)│ Payload (variable)      │ CRC32 (4)│
//! └─────────────────┴─────────────────────────┴──────────┘
//!
//! Payload:
//! ┌─────────────┬────────────┬────────────┬────────────────────┬────────────────────┐
//! │ Channel (2) │ Offset (8) │ Memory (8) │ Source (4 + bytes) │ Target (4 + bytes) │
//! └─────────────┴────────────┴────────────┴────────────────────┴────────────────────┘
//! ```
//!
//! The length field contains the size of (payload + crc32). All integers
//! are little-endian; strings are UTF-8 with a u32 length prefix.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use std::io::{Cursor, Read};
use tmstore_core::{ChannelId, MemoryId, Offset, TranslationUnit};

/// Fixed part of the payload: channel + offset + memory + two length prefixes
const FIXED_PAYLOAD_SIZE: usize = 2 + 8 + 8 + 4 + 4;

/// One sentence pair waiting in a bucket.
///
/// The direction is implied by the bucket the record lives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedUnit {
    /// Channel the unit was delivered on
    pub channel: ChannelId,
    /// Position inside the channel
    pub offset: Offset,
    /// Destination memory
    pub memory: MemoryId,
    /// Source sentence
    pub source: String,
    /// Target sentence
    pub target: String,
}

impl BufferedUnit {
    /// Create a new buffered unit
    pub fn new(
        channel: ChannelId,
        offset: Offset,
        memory: MemoryId,
        source: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        BufferedUnit {
            channel,
            offset,
            memory,
            source: source.into(),
            target: target.into(),
        }
    }

    /// The same pair with source and target swapped
    pub fn reversed(&self) -> BufferedUnit {
        BufferedUnit {
            channel: self.channel,
            offset: self.offset,
            memory: self.memory,
            source: self.target.clone(),
            target: self.source.clone(),
        }
    }

    /// Serialize to a framed record.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity(FIXED_PAYLOAD_SIZE + self.source.len() + self.target.len());
        // Writes into a Vec cannot fail
        let _ = payload.write_u16::<LittleEndian>(self.channel);
        let _ = payload.write_u64::<LittleEndian>(self.offset);
        let _ = payload.write_u64::<LittleEndian>(self.memory.as_u64());
        let _ = payload.write_u32::<LittleEndian>(self.source.len() as u32);
        payload.extend_from_slice(self.source.as_bytes());
        let _ = payload.write_u32::<LittleEndian>(self.target.len() as u32);
        payload.extend_from_slice(self.target.as_bytes());

        let crc = compute_crc(&payload);
        let total_len = payload.len() + 4;
        let mut record = Vec::with_capacity(4 + total_len);
        record.extend_from_slice(&(total_len as u32).to_le_bytes());
        record.extend_from_slice(&payload);
        record.extend_from_slice(&crc.to_le_bytes());
        record
    }

    /// Deserialize one record from the front of `bytes`.
    ///
    /// Returns (unit, bytes_consumed) on success.
    pub fn from_bytes(bytes: &[u8]) -> Result<(Self, usize), RecordError> {
        if bytes.len() < 4 {
            return Err(RecordError::InsufficientData);
        }

        let length = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if length < FIXED_PAYLOAD_SIZE + 4 {
            return Err(RecordError::InvalidFormat);
        }
        if bytes.len() < 4 + length {
            return Err(RecordError::InsufficientData);
        }

        let payload = &bytes[4..4 + length - 4];
        let crc_bytes = &bytes[4 + length - 4..4 + length];
        let stored_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let computed_crc = compute_crc(payload);
        if stored_crc != computed_crc {
            return Err(RecordError::ChecksumMismatch {
                expected: stored_crc,
                computed: computed_crc,
            });
        }

        let unit = Self::decode_payload(payload).ok_or(RecordError::InvalidFormat)?;
        Ok((unit, 4 + length))
    }

    fn decode_payload(payload: &[u8]) -> Option<BufferedUnit> {
        let mut cursor = Cursor::new(payload);
        let channel = cursor.read_u16::<LittleEndian>().ok()?;
        let offset = cursor.read_u64::<LittleEndian>().ok()?;
        let memory = MemoryId(cursor.read_u64::<LittleEndian>().ok()?);
        let source = read_string(&mut cursor)?;
        let target = read_string(&mut cursor)?;
        if cursor.position() as usize != payload.len() {
            return None;
        }
        Some(BufferedUnit {
            channel,
            offset,
            memory,
            source,
            target,
        })
    }

    /// Encoded size of this unit as a framed record
    pub fn encoded_len(&self) -> usize {
        4 + FIXED_PAYLOAD_SIZE + self.source.len() + self.target.len() + 4
    }
}

impl From<&TranslationUnit> for BufferedUnit {
    fn from(unit: &TranslationUnit) -> Self {
        BufferedUnit {
            channel: unit.channel,
            offset: unit.offset,
            memory: unit.memory,
            source: unit.source.clone(),
            target: unit.target.clone(),
        }
    }
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Option<String> {
    let len = cursor.read_u32::<LittleEndian>().ok()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return None;
    }
    let mut buf = vec![0u8; len];
    cursor.read_exact(&mut buf).ok()?;
    String::from_utf8(buf).ok()
}

fn compute_crc(data: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Record parsing errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    /// Not enough data to parse record (torn write)
    #[error("Insufficient data to parse record")]
    InsufficientData,

    /// Record format is invalid
    #[error("Invalid record format")]
    InvalidFormat,

    /// Checksum verification failed
    #[error("Checksum mismatch: expected {expected:08x}, computed {computed:08x}")]
    ChecksumMismatch {
        /// Expected checksum from record
        expected: u32,
        /// Computed checksum
        computed: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample() -> BufferedUnit {
        BufferedUnit::new(3, 42, MemoryId(7), "the cat sat", "il gatto sedeva")
    }

    #[test]
    fn test_roundtrip() {
        let unit = sample();
        let bytes = unit.to_bytes();
        assert_eq!(bytes.len(), unit.encoded_len());

        let (decoded, consumed) = BufferedUnit::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, unit);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_truncated_record_is_insufficient() {
        let bytes = sample().to_bytes();
        for cut in [0, 3, 4, 10, bytes.len() - 1] {
            assert_eq!(
                BufferedUnit::from_bytes(&bytes[..cut]),
                Err(RecordError::InsufficientData)
            );
        }
    }

    #[test]
    fn test_flipped_bit_is_checksum_mismatch() {
        let mut bytes = sample().to_bytes();
        bytes[12] ^= 0x01;
        assert!(matches!(
            BufferedUnit::from_bytes(&bytes),
            Err(RecordError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_zero_length_is_invalid() {
        let bytes = [0u8; 16];
        assert_eq!(
            BufferedUnit::from_bytes(&bytes),
            Err(RecordError::InvalidFormat)
        );
    }

    #[test]
    fn test_reversed() {
        let rev = sample().reversed();
        assert_eq!(rev.source, "il gatto sedeva");
        assert_eq!(rev.target, "the cat sat");
        assert_eq!(rev.offset, 42);
    }

    proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..128)) {
            let _ = BufferedUnit::from_bytes(&bytes);
        }

        #[test]
        fn prop_concatenated_records_decode_in_order(
            texts in proptest::collection::vec(("\\PC{0,20}", "\\PC{0,20}"), 1..10)
        ) {
            let units: Vec<BufferedUnit> = texts
                .into_iter()
                .enumerate()
                .map(|(i, (s, t))| BufferedUnit::new(0, i as u64, MemoryId(1), s, t))
                .collect();
            let mut buf = Vec::new();
            for u in &units {
                buf.extend_from_slice(&u.to_bytes());
            }

            let mut pos = 0;
            let mut decoded = Vec::new();
            while pos < buf.len() {
                let (u, n) = BufferedUnit::from_bytes(&buf[pos..]).unwrap();
                decoded.push(u);
                pos += n;
            }
            prop_assert_eq!(decoded, units);
        }
    }
}
