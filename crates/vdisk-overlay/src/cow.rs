use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::base::BaseImage;
use crate::block::{split_into_blocks, BlockDevice, BlockStats};
use crate::db::OverlayDb;
use crate::ranges::{coalesce_ranges, BlockRange};
use crate::util::{block_offset, div_ceil_u64};
use crate::{OverlayStore, Result};

/// Where a block read through a [`CowBlockDevice`] was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    Overlay,
    Base,
}

/// Copy-on-write disk built from a read-only base image plus a persistent overlay.
///
/// Reads consult the overlay first; if the block has no overlay entry the data is read from the
/// base. Writes always go to the overlay, and base bytes read on a miss are not copied into it.
pub struct CowBlockDevice<B, D> {
    base: B,
    overlay: OverlayStore<D>,
    base_reads: AtomicU64,
}

impl<B: BaseImage, D: OverlayDb> CowBlockDevice<B, D> {
    pub fn new(base: B, overlay: OverlayStore<D>) -> Self {
        Self {
            base,
            overlay,
            base_reads: AtomicU64::new(0),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.overlay.init().await
    }

    pub async fn close(&self) -> Result<()> {
        self.overlay.close().await
    }

    pub fn base(&self) -> &B {
        &self.base
    }

    pub fn overlay(&self) -> &OverlayStore<D> {
        &self.overlay
    }

    pub fn into_parts(self) -> (B, OverlayStore<D>) {
        (self.base, self.overlay)
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.base.capacity_bytes()
    }

    /// Number of blocks the base can supply, counting a trailing partial block.
    pub fn capacity_blocks(&self) -> Result<u64> {
        div_ceil_u64(
            self.base.capacity_bytes(),
            self.overlay.config().block_size as u64,
        )
    }

    /// Blocks fetched from the base so far.
    pub fn base_read_count(&self) -> u64 {
        self.base_reads.load(Ordering::Relaxed)
    }

    /// Like [`BlockDevice::read_block`], also reporting which layer supplied the bytes.
    pub async fn read_block_with_source(
        &self,
        index: u64,
    ) -> Result<Option<(Vec<u8>, BlockSource)>> {
        if let Some(data) = self.overlay.read_block(index).await? {
            return Ok(Some((data, BlockSource::Overlay)));
        }
        if index >= self.capacity_blocks()? {
            return Ok(None);
        }
        let mut blocks = self.read_base_range(BlockRange::single(index)).await?;
        Ok(blocks.pop().map(|data| (data, BlockSource::Base)))
    }

    /// Read `range` from the base, one zero-padded buffer per block.
    ///
    /// `range` must lie within [`CowBlockDevice::capacity_blocks`].
    async fn read_base_range(&self, range: BlockRange) -> Result<Vec<Vec<u8>>> {
        let block_size = self.overlay.config().block_size;
        let start = block_offset(range.start, block_size)?;
        let end = block_offset(range.end, block_size)?
            .saturating_add(block_size as u64)
            .min(self.base.capacity_bytes());
        let bytes = self.base.read_at(start, (end - start) as usize).await?;
        self.base_reads.fetch_add(range.len(), Ordering::Relaxed);

        split_into_blocks(&bytes, block_size)
    }
}

#[async_trait]
impl<B: BaseImage, D: OverlayDb> BlockDevice for CowBlockDevice<B, D> {
    fn block_size(&self) -> usize {
        self.overlay.config().block_size
    }

    async fn read_block(&self, index: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .read_block_with_source(index)
            .await?
            .map(|(data, _)| data))
    }

    async fn read_blocks(&self, indices: &[u64]) -> Result<BTreeMap<u64, Vec<u8>>> {
        let mut out = self.overlay.read_blocks(indices).await?;

        let capacity_blocks = self.capacity_blocks()?;
        let misses: Vec<u64> = indices
            .iter()
            .copied()
            .filter(|index| *index < capacity_blocks && !out.contains_key(index))
            .collect();
        for range in coalesce_ranges(&misses) {
            let blocks = self.read_base_range(range).await?;
            for (index, data) in (range.start..=range.end).zip(blocks) {
                out.insert(index, data);
            }
        }
        Ok(out)
    }

    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        self.overlay.write_block(index, data).await
    }

    async fn stats(&self) -> Result<BlockStats> {
        BlockDevice::stats(&self.overlay).await
    }
}
