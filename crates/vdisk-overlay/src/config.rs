use serde::{Deserialize, Serialize};

use crate::block::DEFAULT_BLOCK_SIZE;
use crate::{DiskError, Result};

/// Number of buffered blocks that triggers an automatic flush.
pub const DEFAULT_FLUSH_THRESHOLD: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OverlayConfig {
    /// Block size in bytes. Fixed for the lifetime of a disk.
    pub block_size: usize,
    /// Buffered block count at which writes are committed to the durable store.
    pub flush_threshold: usize,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            flush_threshold: DEFAULT_FLUSH_THRESHOLD,
        }
    }
}

impl OverlayConfig {
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_flush_threshold(mut self, flush_threshold: usize) -> Self {
        self.flush_threshold = flush_threshold;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(DiskError::InvalidConfig("block_size must be > 0"));
        }
        if self.block_size > u32::MAX as usize {
            return Err(DiskError::InvalidConfig("block_size must fit in 32 bits"));
        }
        if self.flush_threshold == 0 {
            return Err(DiskError::InvalidConfig("flush_threshold must be > 0"));
        }
        Ok(())
    }
}
