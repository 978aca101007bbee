use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{BlockEntry, OverlayDb, WriteBatch};
use crate::key::{BlockKey, DiskIdentity};
use crate::snapshot::SnapshotDescriptor;
use crate::{DiskError, Result};

#[derive(Default)]
struct Tables {
    /// Keyed by the persisted string form of [`BlockKey`].
    blocks: BTreeMap<String, BlockEntry>,
    /// Keyed by `(vm_id, disk_id)`, then snapshot id.
    snapshots: BTreeMap<(String, String), BTreeMap<String, SnapshotDescriptor>>,
}

/// In-process [`OverlayDb`].
///
/// Every operation takes one lock over both tables, which makes each call a transaction. Commit
/// failures can be injected to exercise error paths of callers.
#[derive(Default)]
pub struct MemOverlayDb {
    tables: Mutex<Tables>,
    fail_commits: AtomicBool,
    commits: AtomicU64,
}

impl MemOverlayDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent mutating transactions fail with an I/O error (until reset).
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    /// Number of successfully applied mutating transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    pub async fn entry_count(&self) -> usize {
        self.tables.lock().await.blocks.len()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(DiskError::Io("injected commit failure".to_string()));
        }
        Ok(())
    }

    fn committed(&self) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }
}

fn disk_entries<'a>(
    tables: &'a Tables,
    disk: &DiskIdentity,
) -> impl Iterator<Item = &'a BlockEntry> + 'a {
    let prefix = disk.key_prefix();
    tables
        .blocks
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .filter_map(|(raw, entry)| match BlockKey::parse(raw) {
            Some(_) => Some(entry),
            None => {
                tracing::warn!(key = %raw, "skipping malformed overlay key");
                None
            }
        })
}

#[async_trait]
impl OverlayDb for MemOverlayDb {
    async fn get(&self, key: &BlockKey) -> Result<Option<BlockEntry>> {
        let tables = self.tables.lock().await;
        Ok(tables.blocks.get(&key.to_string()).cloned())
    }

    async fn get_many(
        &self,
        disk: &DiskIdentity,
        indices: &[u64],
    ) -> Result<BTreeMap<u64, Vec<u8>>> {
        let tables = self.tables.lock().await;
        let mut out = BTreeMap::new();
        for &index in indices {
            if let Some(entry) = tables.blocks.get(&disk.key(index).to_string()) {
                out.insert(index, entry.data.clone());
            }
        }
        Ok(out)
    }

    async fn list_indices(&self, disk: &DiskIdentity) -> Result<Vec<u64>> {
        let tables = self.tables.lock().await;
        let mut indices: Vec<u64> = disk_entries(&tables, disk)
            .map(|e| e.key.block_index)
            .collect();
        // String keys order "10" before "2".
        indices.sort_unstable();
        Ok(indices)
    }

    async fn scan_disk(&self, disk: &DiskIdentity) -> Result<Vec<BlockEntry>> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<BlockEntry> = disk_entries(&tables, disk).cloned().collect();
        entries.sort_by_key(|e| e.key.block_index);
        Ok(entries)
    }

    async fn list_disks(&self, vm_id: &str) -> Result<Vec<String>> {
        let tables = self.tables.lock().await;
        let disks: BTreeSet<String> = tables
            .blocks
            .keys()
            .filter_map(|raw| BlockKey::parse(raw))
            .filter(|key| key.vm_id == vm_id)
            .map(|key| key.disk_id)
            .collect();
        Ok(disks.into_iter().collect())
    }

    async fn list_vms(&self) -> Result<Vec<String>> {
        let tables = self.tables.lock().await;
        let vms: BTreeSet<String> = tables
            .blocks
            .keys()
            .filter_map(|raw| BlockKey::parse(raw))
            .map(|key| key.vm_id)
            .collect();
        Ok(vms.into_iter().collect())
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.check_writable()?;
        for entry in batch.into_entries() {
            tables.blocks.insert(entry.key.to_string(), entry);
        }
        self.committed();
        Ok(())
    }

    async fn delete_disk(&self, disk: &DiskIdentity) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.check_writable()?;
        let prefix = disk.key_prefix();
        tables.blocks.retain(|k, _| !k.starts_with(&prefix));
        self.committed();
        Ok(())
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.check_writable()?;
        tables
            .blocks
            .retain(|k, _| BlockKey::parse(k).is_none_or(|key| key.vm_id != vm_id));
        tables.snapshots.retain(|(vm, _), _| vm != vm_id);
        self.committed();
        Ok(())
    }

    async fn replace_disk(&self, disk: &DiskIdentity, entries: Vec<BlockEntry>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.check_writable()?;
        if entries.iter().any(|e| !e.key.belongs_to(disk)) {
            return Err(DiskError::InvalidIdentity(format!(
                "replacement entries must all belong to {disk}"
            )));
        }
        let prefix = disk.key_prefix();
        tables.blocks.retain(|k, _| !k.starts_with(&prefix));
        for entry in entries {
            tables.blocks.insert(entry.key.to_string(), entry);
        }
        self.committed();
        Ok(())
    }

    async fn put_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<()> {
        let mut tables = self.tables.lock().await;
        self.check_writable()?;
        tables
            .snapshots
            .entry((descriptor.vm_id.clone(), descriptor.disk_id.clone()))
            .or_default()
            .insert(descriptor.id.clone(), descriptor.clone());
        self.committed();
        Ok(())
    }

    async fn list_snapshots(&self, disk: &DiskIdentity) -> Result<Vec<SnapshotDescriptor>> {
        let tables = self.tables.lock().await;
        let mut out: Vec<SnapshotDescriptor> = tables
            .snapshots
            .get(&(disk.vm_id().to_string(), disk.disk_id().to_string()))
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();
        out.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        Ok(out)
    }
}
