use std::time::{SystemTime, UNIX_EPOCH};

use crate::{DiskError, Result};

pub fn div_ceil_u64(n: u64, d: u64) -> Result<u64> {
    if d == 0 {
        return Err(DiskError::OffsetOverflow);
    }
    Ok(n.div_ceil(d))
}

/// Byte offset of `block_index` for the given block size.
pub fn block_offset(block_index: u64, block_size: usize) -> Result<u64> {
    block_index
        .checked_mul(block_size as u64)
        .ok_or(DiskError::OffsetOverflow)
}

pub fn checked_range(offset: u64, len: usize, capacity: u64) -> Result<()> {
    let end = offset
        .checked_add(len as u64)
        .ok_or(DiskError::OffsetOverflow)?;
    if end > capacity {
        return Err(DiskError::OutOfBounds {
            offset,
            len,
            capacity,
        });
    }
    Ok(())
}

/// Milliseconds since the Unix epoch; clamps to 0 if the clock is before the epoch.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn div_ceil_u64_errors_on_zero_divisor() {
        assert!(matches!(
            div_ceil_u64(1, 0).unwrap_err(),
            DiskError::OffsetOverflow
        ));
        assert_eq!(div_ceil_u64(0, 4096).unwrap(), 0);
        assert_eq!(div_ceil_u64(4097, 4096).unwrap(), 2);
    }

    #[test]
    fn block_offset_reports_overflow() {
        assert_eq!(block_offset(3, 512).unwrap(), 1536);
        assert!(matches!(
            block_offset(u64::MAX, 2).unwrap_err(),
            DiskError::OffsetOverflow
        ));
    }

    #[test]
    fn checked_range_rejects_reads_past_capacity() {
        checked_range(0, 10, 10).unwrap();
        assert!(matches!(
            checked_range(5, 10, 10).unwrap_err(),
            DiskError::OutOfBounds { .. }
        ));
        assert!(matches!(
            checked_range(u64::MAX, 1, u64::MAX).unwrap_err(),
            DiskError::OffsetOverflow
        ));
    }
}
