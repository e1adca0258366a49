//! Bit-packed encoding of a changed-block set.
//!
//! A bitmap records, for one volume, which fixed-size blocks differ between
//! two snapshots: bit `i` is set iff block `i` changed. The wire envelope is
//! JSON with the bit vector as base64 bytes:
//! `{bitVector, blockSize, volumeSizeBytes, totalBlocks}`.

use serde::{Deserialize, Serialize};

use crate::error::{DeltaError, DeltaResult, ErrorCode};
use crate::models::{ChangedBlockEntry, DataToken};

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Compact encoding of a changed-block set for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangedBlocksBitmap {
    #[serde(rename = "bitVector", with = "base64_bytes")]
    bits: Vec<u8>,
    #[serde(rename = "blockSize")]
    block_size_bytes: u64,
    volume_size_bytes: u64,
    total_blocks: u64,
}

impl ChangedBlocksBitmap {
    /// Creates an empty bitmap for a volume of `volume_size_bytes` split
    /// into blocks of `block_size_bytes`.
    pub fn new(block_size_bytes: u64, volume_size_bytes: u64) -> DeltaResult<Self> {
        if block_size_bytes == 0 {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidInput,
                "blockSizeBytes must be greater than zero",
            ));
        }
        let total_blocks = volume_size_bytes.div_ceil(block_size_bytes);
        let byte_len = total_blocks.div_ceil(8) as usize;
        Ok(Self {
            bits: vec![0u8; byte_len],
            block_size_bytes,
            volume_size_bytes,
            total_blocks,
        })
    }

    pub fn block_size_bytes(&self) -> u64 {
        self.block_size_bytes
    }

    pub fn volume_size_bytes(&self) -> u64 {
        self.volume_size_bytes
    }

    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Returns the raw bit vector, exactly `ceil(totalBlocks/8)` bytes.
    pub fn bits(&self) -> &[u8] {
        &self.bits
    }

    /// Marks block `index` as changed.
    pub fn set(&mut self, index: u64) -> DeltaResult<()> {
        if index >= self.total_blocks {
            return Err(DeltaError::with_message(
                ErrorCode::InvalidOffset,
                format!(
                    "block index {index} is out of range for {} blocks",
                    self.total_blocks
                ),
            ));
        }
        self.bits[(index / 8) as usize] |= 1 << (index % 8);
        Ok(())
    }

    /// Returns whether block `index` is marked as changed.
    pub fn get(&self, index: u64) -> bool {
        if index >= self.total_blocks {
            return false;
        }
        self.bits[(index / 8) as usize] & (1 << (index % 8)) != 0
    }

    /// Serializes the bitmap into its JSON wire envelope.
    pub fn encode(&self) -> DeltaResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| DeltaError::with_message(ErrorCode::InternalError, e.to_string()))
    }

    /// Deserializes a bitmap from its JSON wire envelope.
    ///
    /// A bit vector whose length does not match the declared block count is
    /// a format error, never silently truncated or padded.
    pub fn decode(data: &[u8]) -> DeltaResult<Self> {
        let bitmap: Self = serde_json::from_slice(data)
            .map_err(|e| DeltaError::with_message(ErrorCode::FormatError, e.to_string()))?;

        let expected = bitmap.total_blocks.div_ceil(8) as usize;
        if bitmap.bits.len() != expected {
            return Err(DeltaError::with_message(
                ErrorCode::FormatError,
                format!(
                    "bit vector is {} bytes, expected {} for {} blocks",
                    bitmap.bits.len(),
                    expected,
                    bitmap.total_blocks
                ),
            ));
        }
        Ok(bitmap)
    }

    /// Builds a bitmap from explicit changed-block entries.
    ///
    /// Every entry offset must be aligned to `block_size_bytes` and fall
    /// within the volume.
    pub fn from_entries(
        entries: &[ChangedBlockEntry],
        block_size_bytes: u64,
        volume_size_bytes: u64,
    ) -> DeltaResult<Self> {
        let mut bitmap = Self::new(block_size_bytes, volume_size_bytes)?;
        for entry in entries {
            if entry.offset % block_size_bytes != 0 {
                return Err(DeltaError::with_message(
                    ErrorCode::InvalidOffset,
                    format!(
                        "offset {} is not aligned to block size {}",
                        entry.offset, block_size_bytes
                    ),
                ));
            }
            bitmap.set(entry.offset / block_size_bytes)?;
        }
        Ok(bitmap)
    }

    /// Expands the bitmap back into entries, one per set bit, in strictly
    /// ascending block-index order.
    ///
    /// The codec never synthesizes retrieval credentials; the caller supplies
    /// a data token per block index (typically from a token issuer).
    pub fn to_entries<F>(&self, mut data_token: F) -> Vec<ChangedBlockEntry>
    where
        F: FnMut(u64) -> DataToken,
    {
        (0..self.total_blocks)
            .filter(|&index| self.get(index))
            .map(|index| ChangedBlockEntry {
                offset: index * self.block_size_bytes,
                block_size_bytes: self.block_size_bytes,
                data_token: data_token(index),
            })
            .collect()
    }

    /// Returns the indices of all set bits in ascending order.
    pub fn set_indices(&self) -> Vec<u64> {
        (0..self.total_blocks).filter(|&i| self.get(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn token(index: u64) -> DataToken {
        DataToken {
            token: format!("tok-{index}"),
            issuance_time: Utc::now(),
            ttl_seconds: 3600,
        }
    }

    fn entry(offset: u64, block_size: u64) -> ChangedBlockEntry {
        ChangedBlockEntry {
            offset,
            block_size_bytes: block_size,
            data_token: token(offset),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let mut bitmap = ChangedBlocksBitmap::new(4096, 1 << 20).unwrap();
        for index in [0, 3, 17, 255] {
            bitmap.set(index).unwrap();
        }

        let encoded = bitmap.encode().unwrap();
        let decoded = ChangedBlocksBitmap::decode(&encoded).unwrap();
        assert_eq!(decoded, bitmap);
    }

    #[test]
    fn decode_rejects_mismatched_bit_vector_length() {
        let bitmap = ChangedBlocksBitmap::new(4096, 1 << 20).unwrap();
        let mut value: serde_json::Value =
            serde_json::from_slice(&bitmap.encode().unwrap()).unwrap();

        // Declare more blocks than the bit vector can hold.
        value["totalBlocks"] = serde_json::json!(100_000);
        let tampered = serde_json::to_vec(&value).unwrap();

        let err = ChangedBlocksBitmap::decode(&tampered).unwrap_err();
        assert_eq!(err.code, ErrorCode::FormatError);
    }

    #[test]
    fn decode_rejects_malformed_json() {
        let err = ChangedBlocksBitmap::decode(b"{not json").unwrap_err();
        assert_eq!(err.code, ErrorCode::FormatError);
    }

    #[test]
    fn from_entries_rejects_unaligned_offsets() {
        let entries = vec![entry(4096, 4096), entry(6000, 4096)];
        let err = ChangedBlocksBitmap::from_entries(&entries, 4096, 1 << 20).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOffset);
    }

    #[test]
    fn from_entries_rejects_offsets_beyond_the_volume() {
        let entries = vec![entry(1 << 21, 4096)];
        let err = ChangedBlocksBitmap::from_entries(&entries, 4096, 1 << 20).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidOffset);
    }

    #[test]
    fn entries_round_trip_preserves_offsets_in_ascending_order() {
        let block_size = 4096u64;
        let volume_size = 1u64 << 20;
        let offsets = [12 * 4096, 0, 4096, 200 * 4096, 7 * 4096];
        let entries: Vec<_> = offsets.iter().map(|&o| entry(o, block_size)).collect();

        let bitmap =
            ChangedBlocksBitmap::from_entries(&entries, block_size, volume_size).unwrap();
        let out = bitmap.to_entries(token);

        let mut expected: Vec<u64> = offsets.to_vec();
        expected.sort_unstable();
        let got: Vec<u64> = out.iter().map(|e| e.offset).collect();
        assert_eq!(got, expected);
        assert!(out.iter().all(|e| e.block_size_bytes == block_size));
    }

    #[test]
    fn four_gigabyte_volume_example() {
        let volume_size = 4u64 * 1024 * 1024 * 1024;
        let block_size = 524_288u64;

        let mut indices: Vec<u64> = (0..=13).collect();
        indices.extend(15..=27);
        indices.push(29);
        indices.push(800);
        indices.push(802);

        let mut bitmap = ChangedBlocksBitmap::new(block_size, volume_size).unwrap();
        assert_eq!(bitmap.total_blocks(), 8192);
        assert_eq!(bitmap.bits().len(), 1024);

        for &index in &indices {
            bitmap.set(index).unwrap();
        }

        let decoded = ChangedBlocksBitmap::decode(&bitmap.encode().unwrap()).unwrap();
        assert_eq!(decoded.set_indices(), indices);
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let err = ChangedBlocksBitmap::new(0, 1 << 20).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidInput);
    }
}
