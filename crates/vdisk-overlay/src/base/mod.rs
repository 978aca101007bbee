//! Read-only base images that a [`crate::CowBlockDevice`] falls back to.
//!
//! Base readers are byte-addressed. They never see overlay writes and never cache anything on
//! behalf of the overlay.

mod http;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use url::Url;

use crate::util::checked_range;
use crate::{DiskError, Result};

pub use http::HttpRangeImage;

/// Immutable byte source backing a copy-on-write disk.
#[async_trait]
pub trait BaseImage: Send + Sync {
    fn capacity_bytes(&self) -> u64;

    /// Read exactly `len` bytes at `offset`.
    ///
    /// Reads that extend past [`BaseImage::capacity_bytes`] fail with
    /// [`DiskError::OutOfBounds`]; a transport that cannot answer reports
    /// [`DiskError::BaseUnavailable`] (or an HTTP error), never zeros.
    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct MemBaseImage {
    bytes: Vec<u8>,
}

impl MemBaseImage {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[async_trait]
impl BaseImage for MemBaseImage {
    fn capacity_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        checked_range(offset, len, self.capacity_bytes())?;
        let start = offset as usize;
        Ok(self.bytes[start..start + len].to_vec())
    }
}

/// A local image file opened read-only.
#[derive(Debug)]
pub struct FileBaseImage {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
    len: u64,
}

impl FileBaseImage {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = tokio::fs::File::open(&path).await.map_err(|err| {
            DiskError::BaseUnavailable(format!("failed to open {}: {err}", path.display()))
        })?;
        let len = file.metadata().await?.len();
        Ok(Self {
            path,
            file: Mutex::new(file),
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl BaseImage for FileBaseImage {
    fn capacity_bytes(&self) -> u64 {
        self.len
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        checked_range(offset, len, self.len)?;
        let mut buf = vec![0u8; len];
        if len == 0 {
            return Ok(buf);
        }
        let mut file = self.file.lock().await;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}

/// Configured base image kind, chosen when a disk is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum BaseSourceConfig {
    File {
        path: PathBuf,
    },
    Http {
        url: Url,
        #[serde(default)]
        headers: Vec<(String, String)>,
    },
    Memory {
        #[serde(default)]
        bytes: Vec<u8>,
    },
}

impl BaseSourceConfig {
    pub async fn open(&self) -> Result<BaseSource> {
        Ok(match self {
            BaseSourceConfig::File { path } => BaseSource::File(FileBaseImage::open(path).await?),
            BaseSourceConfig::Http { url, headers } => {
                BaseSource::Http(HttpRangeImage::open(url.clone(), headers).await?)
            }
            BaseSourceConfig::Memory { bytes } => {
                BaseSource::Memory(MemBaseImage::new(bytes.clone()))
            }
        })
    }
}

/// An opened base image of any supported kind.
#[derive(Debug)]
pub enum BaseSource {
    File(FileBaseImage),
    Http(HttpRangeImage),
    Memory(MemBaseImage),
}

#[async_trait]
impl BaseImage for BaseSource {
    fn capacity_bytes(&self) -> u64 {
        match self {
            BaseSource::File(b) => b.capacity_bytes(),
            BaseSource::Http(b) => b.capacity_bytes(),
            BaseSource::Memory(b) => b.capacity_bytes(),
        }
    }

    async fn read_at(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        match self {
            BaseSource::File(b) => b.read_at(offset, len).await,
            BaseSource::Http(b) => b.read_at(offset, len).await,
            BaseSource::Memory(b) => b.read_at(offset, len).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mem_base_rejects_reads_past_the_end() {
        let base = MemBaseImage::new(vec![7u8; 10]);
        assert_eq!(base.read_at(8, 2).await.unwrap(), vec![7, 7]);
        assert!(matches!(
            base.read_at(8, 3).await.unwrap_err(),
            DiskError::OutOfBounds { .. }
        ));
    }

    #[tokio::test]
    async fn file_base_reads_positionally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("base.img");
        let bytes: Vec<u8> = (0..=255u8).collect();
        std::fs::write(&path, &bytes).unwrap();

        let base = FileBaseImage::open(&path).await.unwrap();
        assert_eq!(base.capacity_bytes(), 256);
        assert_eq!(base.read_at(250, 6).await.unwrap(), bytes[250..].to_vec());
        assert_eq!(base.read_at(3, 2).await.unwrap(), vec![3, 4]);
    }

    #[tokio::test]
    async fn missing_file_is_reported_as_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = FileBaseImage::open(dir.path().join("nope.img"))
            .await
            .unwrap_err();
        assert!(matches!(err, DiskError::BaseUnavailable(_)));
    }

    #[tokio::test]
    async fn config_selects_the_variant() {
        let json = r#"{"kind":"memory","bytes":[1,2,3]}"#;
        let config: BaseSourceConfig = serde_json::from_str(json).unwrap();
        let source = config.open().await.unwrap();
        assert!(matches!(source, BaseSource::Memory(_)));
        assert_eq!(source.read_at(1, 2).await.unwrap(), vec![2, 3]);

        let json = r#"{"kind":"http","url":"http://127.0.0.1:1/disk.img"}"#;
        let config: BaseSourceConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config, BaseSourceConfig::Http { ref headers, .. } if headers.is_empty()));
    }
}
