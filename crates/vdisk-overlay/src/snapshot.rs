//! Snapshot descriptors and export/import of a disk's overlay.
//!
//! A snapshot is a summary of the overlay at a point in time. It does not fork block data:
//! writes issued after [`OverlayStore::create_snapshot`] are visible to later reads.
//!
//! # Bundle file format
//!
//! [`ExportBundle::write_to`] produces (all integers little endian):
//!
//! ```text
//! magic      8 bytes  "VDOVBNDL"
//! version    u32
//! meta_len   u32      followed by `meta_len` bytes of JSON (SnapshotDescriptor)
//! block_size u32
//! count      u64      followed by `count` records of [index u64][block_size bytes]
//! sha256     32 bytes over everything above
//! ```

use std::collections::BTreeSet;
use std::io::{Read, Write};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::block::ensure_block_len;
use crate::db::OverlayDb;
use crate::util::unix_millis;
use crate::{DiskError, OverlayStore, Result};

const BUNDLE_MAGIC: [u8; 8] = *b"VDOVBNDL";
const BUNDLE_VERSION: u32 = 1;
const MAX_META_LEN: u32 = 1024 * 1024;
const MAX_BUNDLE_BLOCK_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDescriptor {
    pub id: String,
    pub vm_id: String,
    pub disk_id: String,
    pub created_at_ms: u64,
    pub block_size: usize,
    pub block_count: u64,
    pub total_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A snapshot descriptor plus every overlay block, for transfer between stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportBundle {
    pub metadata: SnapshotDescriptor,
    /// `(block index, block bytes)`, ascending by index.
    pub blocks: Vec<(u64, Vec<u8>)>,
}

impl ExportBundle {
    pub fn write_to<W: Write>(&self, mut w: W) -> Result<()> {
        let block_size: u32 = self
            .metadata
            .block_size
            .try_into()
            .ok()
            .filter(|&size: &u32| size as usize <= MAX_BUNDLE_BLOCK_SIZE)
            .ok_or(DiskError::InvalidConfig("block size does not fit the bundle format"))?;
        let meta = serde_json::to_vec(&self.metadata)?;

        let mut hasher = Sha256::new();
        let mut emit = |bytes: &[u8]| -> Result<()> {
            hasher.update(bytes);
            w.write_all(bytes)?;
            Ok(())
        };

        emit(&BUNDLE_MAGIC)?;
        emit(&BUNDLE_VERSION.to_le_bytes())?;
        emit(&(meta.len() as u32).to_le_bytes())?;
        emit(&meta)?;
        emit(&block_size.to_le_bytes())?;
        emit(&(self.blocks.len() as u64).to_le_bytes())?;
        for (index, data) in &self.blocks {
            ensure_block_len(data, self.metadata.block_size)?;
            emit(&index.to_le_bytes())?;
            emit(data)?;
        }

        let digest = hasher.finalize();
        w.write_all(&digest)?;
        w.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(r: R) -> Result<Self> {
        let mut r = HashingReader {
            inner: r,
            hasher: Sha256::new(),
        };

        let magic: [u8; 8] = r.read_array()?;
        if magic != BUNDLE_MAGIC {
            return Err(DiskError::Corrupt("not an overlay bundle"));
        }
        if u32::from_le_bytes(r.read_array()?) != BUNDLE_VERSION {
            return Err(DiskError::Corrupt("unsupported overlay bundle version"));
        }
        let meta_len = u32::from_le_bytes(r.read_array()?);
        if meta_len > MAX_META_LEN {
            return Err(DiskError::Corrupt("bundle metadata too large"));
        }
        let meta = r.read_vec(meta_len as usize)?;
        let metadata: SnapshotDescriptor = serde_json::from_slice(&meta)?;

        let block_size = u32::from_le_bytes(r.read_array()?) as usize;
        if block_size > MAX_BUNDLE_BLOCK_SIZE {
            return Err(DiskError::Corrupt("bundle block size too large"));
        }
        if block_size == 0 || block_size != metadata.block_size {
            return Err(DiskError::Corrupt("bundle block size mismatch"));
        }
        let count = u64::from_le_bytes(r.read_array()?);
        if count != metadata.block_count {
            return Err(DiskError::Corrupt("bundle block count mismatch"));
        }

        let mut blocks = Vec::new();
        for _ in 0..count {
            let index = u64::from_le_bytes(r.read_array()?);
            let data = r.read_vec(block_size)?;
            blocks.push((index, data));
        }

        let expected = r.hasher.finalize();
        let mut actual = [0u8; 32];
        r.inner.read_exact(&mut actual).map_err(short_read)?;
        if actual[..] != expected[..] {
            return Err(DiskError::Corrupt("bundle checksum mismatch"));
        }
        Ok(Self { metadata, blocks })
    }
}

struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf).map_err(short_read)?;
        self.hasher.update(&*buf);
        Ok(())
    }

    /// Read `len` bytes, growing the buffer only as data actually arrives.
    fn read_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut self.inner).take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            return Err(DiskError::Corrupt("truncated overlay bundle"));
        }
        self.hasher.update(&buf);
        Ok(buf)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.read_exact(&mut buf)?;
        Ok(buf)
    }
}

fn short_read(err: std::io::Error) -> DiskError {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        DiskError::Corrupt("truncated overlay bundle")
    } else {
        err.into()
    }
}

fn unique_snapshot_id(base: String, taken: &BTreeSet<String>) -> String {
    let mut id = base.clone();
    let mut n = 1u64;
    while taken.contains(&id) {
        id = format!("{base}-{n}");
        n += 1;
    }
    id
}

impl<D: OverlayDb> OverlayStore<D> {
    /// Flush, then record and return a summary of the overlay.
    ///
    /// Ids are `<vmId>-<diskId>-<createdAtMs>`, with a `-<n>` suffix when that id is already
    /// recorded for this disk.
    pub async fn create_snapshot(&self, description: Option<String>) -> Result<SnapshotDescriptor> {
        let _flush = self.lock_flush().await;
        let db = self.ready_db()?;
        self.flush_locked(&db).await?;
        let block_count = self.modified_blocks().await?.len() as u64;
        let created_at_ms = unix_millis();
        let identity = self.identity();
        let block_size = self.config().block_size;
        let taken: BTreeSet<String> = db
            .list_snapshots(identity)
            .await?
            .into_iter()
            .map(|d| d.id)
            .collect();
        let descriptor = SnapshotDescriptor {
            id: unique_snapshot_id(
                format!(
                    "{}-{}-{created_at_ms}",
                    identity.vm_id(),
                    identity.disk_id()
                ),
                &taken,
            ),
            vm_id: identity.vm_id().to_string(),
            disk_id: identity.disk_id().to_string(),
            created_at_ms,
            block_size,
            block_count,
            total_bytes: block_count.saturating_mul(block_size as u64),
            description,
        };
        db.put_snapshot(&descriptor).await?;
        Ok(descriptor)
    }

    /// Snapshot descriptors recorded for this disk, oldest first.
    pub async fn list_snapshots(&self) -> Result<Vec<SnapshotDescriptor>> {
        self.ready_db()?.list_snapshots(self.identity()).await
    }

    /// Materialize every overlay block of this disk.
    ///
    /// Memory use is proportional to the number of modified blocks times the block size.
    pub async fn export(&self) -> Result<ExportBundle> {
        let mut metadata = self.create_snapshot(None).await?;
        let entries = self.ready_db()?.scan_disk(self.identity()).await?;
        let blocks: Vec<(u64, Vec<u8>)> = entries
            .into_iter()
            .map(|e| (e.key.block_index, e.data))
            .collect();
        // Writes racing the export may have changed the count since the descriptor was taken.
        metadata.block_count = blocks.len() as u64;
        metadata.total_bytes = metadata
            .block_count
            .saturating_mul(metadata.block_size as u64);
        tracing::info!(
            disk = %self.identity(),
            blocks = blocks.len(),
            "exported overlay"
        );
        Ok(ExportBundle { metadata, blocks })
    }

    /// Replace this disk's overlay with the contents of `bundle`.
    ///
    /// The bundle is validated before anything is touched; the replacement itself is one
    /// durable-store transaction, so on failure the previous overlay survives intact.
    pub async fn import(&self, bundle: ExportBundle) -> Result<()> {
        if bundle.metadata.block_size != self.config().block_size {
            return Err(DiskError::InvalidConfig(
                "bundle block size does not match this disk",
            ));
        }
        let blocks = bundle.blocks.len();
        self.replace_all(bundle.blocks).await?;
        tracing::info!(
            disk = %self.identity(),
            source_vm = %bundle.metadata.vm_id,
            source_disk = %bundle.metadata.disk_id,
            blocks,
            "imported overlay"
        );
        Ok(())
    }
}
