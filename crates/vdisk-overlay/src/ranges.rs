use serde::{Deserialize, Serialize};

/// An inclusive run of contiguous block indices `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub start: u64,
    pub end: u64,
}

impl BlockRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn single(index: u64) -> Self {
        Self {
            start: index,
            end: index,
        }
    }

    /// Number of blocks covered by the range.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start).saturating_add(1)
    }

    pub fn contains(&self, index: u64) -> bool {
        self.start <= index && index <= self.end
    }

    fn extends_to(&self, index: u64) -> bool {
        self.end.checked_add(1) == Some(index)
    }
}

/// Coalesce block indices into maximal runs of numerically adjacent indices.
///
/// The input does not need to be sorted and may contain duplicates.
pub fn coalesce_ranges(indices: &[u64]) -> Vec<BlockRange> {
    let mut sorted = indices.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut out: Vec<BlockRange> = Vec::new();
    for index in sorted {
        match out.last_mut() {
            Some(cur) if cur.extends_to(index) => cur.end = index,
            _ => out.push(BlockRange::single(index)),
        }
    }
    out
}
