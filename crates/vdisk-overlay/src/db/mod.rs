//! Durable, transactional key-value stores for overlay blocks.
//!
//! Entries are keyed by [`BlockKey`] (`"<vmId>:<diskId>:<blockIndex>"`) and can be enumerated by
//! `(vm_id, disk_id)` or by `vm_id` alone. Snapshot descriptors live in a separate metadata
//! table.
//!
//! One store instance is meant to be shared by every overlay in the process (see
//! [`FsOverlayDb::shared`]). Mutating operations are serialized inside each store so a bulk
//! deletion can never interleave with a flush commit.

mod fs;
mod mem;

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::key::{validate_id, BlockKey, DiskIdentity};
use crate::snapshot::SnapshotDescriptor;
use crate::Result;

pub use fs::FsOverlayDb;
pub use mem::MemOverlayDb;

/// A persisted overlay block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockEntry {
    pub key: BlockKey,
    pub data: Vec<u8>,
    /// Commit time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

/// Block records committed together by [`OverlayDb::commit`].
///
/// A successful commit makes every record visible. A failed commit may leave an unspecified
/// subset visible (see [`FsOverlayDb`] for when that can happen); since every record is a full
/// block put, retrying the same or a newer batch converges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    entries: Vec<BlockEntry>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, entry: BlockEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[BlockEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BlockEntry> {
        self.entries
    }
}

#[async_trait]
pub trait OverlayDb: Send + Sync {
    async fn get(&self, key: &BlockKey) -> Result<Option<BlockEntry>>;

    /// Batched lookup for one disk, performed as a single read transaction.
    ///
    /// The result only contains indices that have an entry.
    async fn get_many(
        &self,
        disk: &DiskIdentity,
        indices: &[u64],
    ) -> Result<BTreeMap<u64, Vec<u8>>>;

    /// Sorted block indices stored for `disk`.
    async fn list_indices(&self, disk: &DiskIdentity) -> Result<Vec<u64>>;

    /// Every entry stored for `disk`, ordered by block index.
    async fn scan_disk(&self, disk: &DiskIdentity) -> Result<Vec<BlockEntry>>;

    /// Disk ids that have at least one block stored under `vm_id`.
    async fn list_disks(&self, vm_id: &str) -> Result<Vec<String>>;

    /// VM ids that have any overlay data, sorted.
    async fn list_vms(&self) -> Result<Vec<String>>;

    async fn commit(&self, batch: WriteBatch) -> Result<()>;

    /// Delete every block entry for `disk`. Other disks are untouched.
    async fn delete_disk(&self, disk: &DiskIdentity) -> Result<()>;

    /// Delete every block entry and snapshot descriptor for `vm_id`, across all its disks.
    async fn delete_vm(&self, vm_id: &str) -> Result<()>;

    /// Atomically replace the contents of `disk` with `entries`.
    ///
    /// If this fails, the previous contents are left in place.
    async fn replace_disk(&self, disk: &DiskIdentity, entries: Vec<BlockEntry>) -> Result<()>;

    async fn put_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<()>;

    /// Snapshot descriptors for `disk`, oldest first.
    async fn list_snapshots(&self, disk: &DiskIdentity) -> Result<Vec<SnapshotDescriptor>>;
}

/// Delete all overlay data belonging to `vm_id`.
///
/// Runs directly against the durable store. Any live [`crate::OverlayStore`] for that VM should be
/// closed (or at least idle) first, otherwise a later flush will re-create its blocks.
pub async fn delete_vm_overlays<D: OverlayDb + ?Sized>(db: &D, vm_id: &str) -> Result<()> {
    validate_id("vm id", vm_id)?;
    db.delete_vm(vm_id).await?;
    tracing::info!(vm_id, "deleted all overlay data for vm");
    Ok(())
}

/// VM ids that currently have overlay data in `db`.
pub async fn list_vms_with_overlays<D: OverlayDb + ?Sized>(db: &D) -> Result<Vec<String>> {
    db.list_vms().await
}
