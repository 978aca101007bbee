use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{DiskError, Result};

/// Default block size for overlay-backed disks (64 KiB).
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;

/// Footprint of modified/stored data for a [`BlockDevice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockStats {
    pub block_count: u64,
    pub total_bytes: u64,
}

impl BlockStats {
    pub fn for_blocks(block_count: u64, block_size: usize) -> Self {
        Self {
            block_count,
            total_bytes: block_count.saturating_mul(block_size as u64),
        }
    }
}

/// Block-addressed async storage interface shared by the overlay store and the copy-on-write
/// device.
///
/// Reads are sparse: an index with no data is `Ok(None)` (or simply absent from the map returned
/// by [`BlockDevice::read_blocks`]), never an error. Writes must be exactly one block long.
#[async_trait]
pub trait BlockDevice: Send + Sync {
    /// Fixed block size in bytes for the lifetime of this device.
    fn block_size(&self) -> usize;

    async fn read_block(&self, index: u64) -> Result<Option<Vec<u8>>>;

    /// Batched read. Only indices that could be resolved are present in the result.
    async fn read_blocks(&self, indices: &[u64]) -> Result<BTreeMap<u64, Vec<u8>>>;

    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()>;

    /// Write `data` across consecutive blocks starting at `start_index`.
    ///
    /// `data` does not need to be block aligned; the final partial block is zero-padded and the
    /// padding becomes part of that block.
    async fn write_blocks(&self, start_index: u64, data: &[u8]) -> Result<()> {
        for (i, block) in split_into_blocks(data, self.block_size())?
            .into_iter()
            .enumerate()
        {
            let index = start_index
                .checked_add(i as u64)
                .ok_or(DiskError::OffsetOverflow)?;
            self.write_block(index, &block).await?;
        }
        Ok(())
    }

    async fn stats(&self) -> Result<BlockStats>;
}

/// Split `data` into `block_size` chunks, zero-padding the final chunk.
pub fn split_into_blocks(data: &[u8], block_size: usize) -> Result<Vec<Vec<u8>>> {
    if block_size == 0 {
        return Err(DiskError::InvalidConfig("block_size must be > 0"));
    }
    Ok(data
        .chunks(block_size)
        .map(|chunk| {
            let mut block = chunk.to_vec();
            block.resize(block_size, 0);
            block
        })
        .collect())
}

pub(crate) fn ensure_block_len(data: &[u8], block_size: usize) -> Result<()> {
    if data.len() != block_size {
        return Err(DiskError::InvalidBlockLength {
            expected: block_size,
            actual: data.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_pads_final_partial_block() {
        let blocks = split_into_blocks(&[1, 2, 3, 4, 5], 2).unwrap();
        assert_eq!(blocks, vec![vec![1, 2], vec![3, 4], vec![5, 0]]);
    }

    #[test]
    fn split_of_aligned_payload_has_no_padding() {
        let blocks = split_into_blocks(&[7; 8], 4).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b == &vec![7; 4]));
        assert!(split_into_blocks(&[], 4).unwrap().is_empty());
    }

    #[test]
    fn block_len_is_enforced_exactly() {
        ensure_block_len(&[0; 16], 16).unwrap();
        let err = ensure_block_len(&[0; 15], 16).unwrap_err();
        assert!(matches!(
            err,
            DiskError::InvalidBlockLength {
                expected: 16,
                actual: 15
            }
        ));
        assert!(ensure_block_len(&[0; 17], 16).is_err());
    }

    #[test]
    fn stats_multiply_by_block_size() {
        assert_eq!(
            BlockStats::for_blocks(3, DEFAULT_BLOCK_SIZE),
            BlockStats {
                block_count: 3,
                total_bytes: 3 * 65536
            }
        );
    }
}
