// Shared identifier types for the index core.
//
// A record name is an opaque 256-bit content hash supplied by the caller.
// The core never hashes anything itself; it only bit-slices names into the
// three fixed regions used by the lookup pipeline.

use std::fmt;

/// Size of a record name in bytes (256 bits)
pub const RECORD_NAME_BYTES: usize = 32;

/// Size of the opaque record payload in bytes
pub const RECORD_DATA_BYTES: usize = 16;

/// On-disk stride of one volume record: name followed by payload
pub const VOLUME_RECORD_BYTES: usize = RECORD_NAME_BYTES + RECORD_DATA_BYTES;

/// Monotonically increasing chapter identifier, never reused
pub type VirtualChapter = u64;

/// "No chapter" sentinel for lookups
pub const NO_CHAPTER: VirtualChapter = u64::MAX;

// Byte regions of a record name. The regions are disjoint so that the
// volume index, the chapter index, and the sampling decision each see
// independent bits of the hash.
const VOLUME_INDEX_OFFSET: usize = 0;
const CHAPTER_INDEX_OFFSET: usize = 8;
const SAMPLE_OFFSET: usize = 14;

/// A 256-bit record name (content hash).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordName(pub [u8; RECORD_NAME_BYTES]);

impl RecordName {
    #[inline]
    pub fn from_bytes(bytes: [u8; RECORD_NAME_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; RECORD_NAME_BYTES] {
        &self.0
    }

    // The 64 bits consumed by the volume index
    #[inline]
    pub fn volume_index_bits(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[VOLUME_INDEX_OFFSET..VOLUME_INDEX_OFFSET + 8]);
        u64::from_le_bytes(bytes)
    }

    // The 48 bits consumed by a chapter index
    #[inline]
    pub fn chapter_index_bits(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes[..6].copy_from_slice(&self.0[CHAPTER_INDEX_OFFSET..CHAPTER_INDEX_OFFSET + 6]);
        u64::from_le_bytes(bytes)
    }

    // The 16 bits consumed by the sparse sampling decision
    #[inline]
    pub fn sample_bits(&self) -> u16 {
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.0[SAMPLE_OFFSET..SAMPLE_OFFSET + 2]);
        u16::from_le_bytes(bytes)
    }
}

impl fmt::Debug for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// The fixed-width opaque payload stored with each record.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RecordData(pub [u8; RECORD_DATA_BYTES]);

impl RecordData {
    #[inline]
    pub fn from_bytes(bytes: [u8; RECORD_DATA_BYTES]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; RECORD_DATA_BYTES] {
        &self.0
    }
}

/// Bits needed to store any value in `0..=max_value`.
#[inline]
pub fn bits_to_represent(max_value: u64) -> u32 {
    (64 - max_value.leading_zeros()).max(1)
}
