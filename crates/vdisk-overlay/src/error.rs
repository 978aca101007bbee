use thiserror::Error;

pub type Result<T> = std::result::Result<T, DiskError>;

/// Unified error type for overlay, copy-on-write and base-image operations.
///
/// A read that finds no overlay entry is *not* an error; it is reported as `Ok(None)` (or by an
/// absent key in a batched read) so callers can fall through to the base image.
///
/// Note: [`DiskError::Io`] stores a human-readable `String` rather than `std::io::Error` so the
/// filesystem, in-memory and HTTP backends can all surface failures through one variant.
#[derive(Debug, Error)]
pub enum DiskError {
    #[error("block payload is {actual} bytes (expected exactly {expected})")]
    InvalidBlockLength { expected: usize, actual: usize },

    #[error("overlay store is not initialized (or has been closed)")]
    Uninitialized,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid disk identity: {0}")]
    InvalidIdentity(String),

    #[error("integer overflow while computing byte offsets")]
    OffsetOverflow,

    #[error("out of bounds: offset={offset} len={len} capacity={capacity}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        capacity: u64,
    },

    #[error("corrupt overlay data: {0}")]
    Corrupt(&'static str),

    #[error("base image unavailable: {0}")]
    BaseUnavailable(String),

    #[error("remote request failed with HTTP status {status}")]
    HttpStatus { status: u16 },

    #[error("remote request failed: {0}")]
    Http(String),

    #[error("serialization error: {0}")]
    Serde(String),

    /// Generic I/O failure.
    ///
    /// This is a catch-all for errors that do not map to a more structured variant.
    #[error("io error: {0}")]
    Io(String),
}

impl DiskError {
    /// Whether this error is a caller contract violation rather than a backend failure.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            DiskError::InvalidBlockLength { .. }
                | DiskError::Uninitialized
                | DiskError::InvalidConfig(_)
                | DiskError::InvalidIdentity(_)
        )
    }
}

impl From<std::io::Error> for DiskError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<serde_json::Error> for DiskError {
    fn from(value: serde_json::Error) -> Self {
        Self::Serde(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contract_violations_are_distinguished_from_backend_failures() {
        assert!(DiskError::InvalidBlockLength {
            expected: 4096,
            actual: 1
        }
        .is_contract_violation());
        assert!(DiskError::Uninitialized.is_contract_violation());
        assert!(!DiskError::Io("disk full".to_string()).is_contract_violation());
        assert!(!DiskError::HttpStatus { status: 503 }.is_contract_violation());
    }
}
