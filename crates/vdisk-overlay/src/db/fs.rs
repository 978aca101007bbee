use std::collections::{BTreeMap, HashMap};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use super::{BlockEntry, OverlayDb, WriteBatch};
use crate::key::{BlockKey, DiskIdentity};
use crate::snapshot::SnapshotDescriptor;
use crate::{DiskError, Result};

const BLOCKS_DIR: &str = "blocks";
const SNAPSHOTS_DIR: &str = "snapshots";
const STAGING_DIR: &str = "staging";
const BLOCK_EXT: &str = "blk";
const SNAPSHOT_EXT: &str = "json";
const COMMIT_JOURNAL: &str = "commit.json";
const SWAP_JOURNAL: &str = "swap.json";

const ENTRY_MAGIC: [u8; 4] = *b"VDBK";
const ENTRY_VERSION: u32 = 1;
const ENTRY_HEADER_LEN: usize = 20;

type Registry = Mutex<HashMap<PathBuf, Weak<FsOverlayDb>>>;

static SHARED: OnceLock<Registry> = OnceLock::new();

// Held across lookup, open and insert so a root is only ever opened once.
static OPENING: OnceLock<tokio::sync::Mutex<()>> = OnceLock::new();

fn registry() -> &'static Registry {
    SHARED.get_or_init(|| Mutex::new(HashMap::new()))
}

fn opening_lock() -> &'static tokio::sync::Mutex<()> {
    OPENING.get_or_init(|| tokio::sync::Mutex::new(()))
}

/// Written into a commit's staging directory once every record is synced. From then on the
/// commit is rolled forward rather than discarded.
#[derive(Debug, Serialize, Deserialize)]
struct CommitJournal {
    records: Vec<StagedRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StagedRecord {
    file: String,
    vm_id: String,
    disk_id: String,
    index: u64,
}

/// Names the disk whose directory a replacement is about to swap.
#[derive(Debug, Serialize, Deserialize)]
struct SwapJournal {
    vm_id: String,
    disk_id: String,
}

/// Directory-backed [`OverlayDb`].
///
/// # Layout
///
/// ```text
/// <root>/blocks/<hex vm id>/<hex disk id>/<block index>.blk
/// <root>/snapshots/<hex vm id>/<hex disk id>/<hex snapshot id>.json
/// <root>/staging/<txn>/...
/// ```
///
/// Ids are hex encoded so arbitrary strings are safe as path components. Each `.blk` file holds a
/// 20-byte header (`VDBK`, version, commit timestamp, payload length; little endian) followed by
/// the block bytes.
///
/// A commit first writes and syncs every record under `staging/`, then writes a journal naming
/// them, then renames them into place one by one. A failure before the journal exists leaves the
/// visible store untouched. A failure (or crash) during the renames can leave part of the batch
/// visible; the journal is kept and the remaining records are rolled forward before the next
/// mutation, or on the next open.
///
/// Disk replacement stages a complete directory, journals the target disk and swaps the
/// directories with two renames. If the swap cannot finish and the previous directory cannot be
/// put back, it stays under `staging/` and is restored by the same recovery pass.
///
/// Mutations are serialized by a store-wide lock; batched reads share it so they observe either
/// all or none of a commit. Open at most one instance per root in a process, normally through
/// [`FsOverlayDb::shared`].
#[derive(Debug)]
pub struct FsOverlayDb {
    root: PathBuf,
    lock: RwLock<()>,
    closed: AtomicBool,
    txn_seq: AtomicU64,
    // Set when a transaction left a journal behind that must be recovered.
    needs_recovery: AtomicBool,
}

impl FsOverlayDb {
    /// Open (creating if needed) a store rooted at `root`.
    ///
    /// Journaled transactions left by an interrupted process are recovered; any other staging
    /// data is discarded.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(BLOCKS_DIR)).await?;
        fs::create_dir_all(root.join(SNAPSHOTS_DIR)).await?;
        fs::create_dir_all(root.join(STAGING_DIR)).await?;
        let db = Self {
            root,
            lock: RwLock::new(()),
            closed: AtomicBool::new(false),
            txn_seq: AtomicU64::new(0),
            needs_recovery: AtomicBool::new(false),
        };
        db.recover_staging().await?;
        tracing::debug!(root = %db.root.display(), "opened overlay store");
        Ok(db)
    }

    /// Process-wide shared instance for `root`.
    ///
    /// Returns the live instance if one exists, otherwise opens a new one. The instance stays
    /// alive while any `Arc` to it does.
    pub async fn shared(root: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let root = normalize_root(root.into());
        let _opening = opening_lock().lock().await;
        if let Some(db) = lookup_shared(&root)? {
            return Ok(db);
        }

        let opened = Arc::new(Self::open(root.clone()).await?);
        registry()
            .lock()
            .map_err(|_| DiskError::Io("poisoned lock".to_string()))?
            .insert(root, Arc::downgrade(&opened));
        Ok(opened)
    }

    /// Close and unregister the shared instance for `root`.
    ///
    /// Outstanding handles fail with [`DiskError::Uninitialized`] afterwards. Returns whether a
    /// live instance was found.
    pub fn shutdown_shared(root: impl Into<PathBuf>) -> Result<bool> {
        let root = normalize_root(root.into());
        let removed = registry()
            .lock()
            .map_err(|_| DiskError::Io("poisoned lock".to_string()))?
            .remove(&root);
        match removed.and_then(|weak| weak.upgrade()) {
            Some(db) => {
                db.close();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DiskError::Uninitialized);
        }
        Ok(())
    }

    fn vm_dir(&self, vm_id: &str) -> PathBuf {
        self.root.join(BLOCKS_DIR).join(encode_component(vm_id))
    }

    fn disk_dir(&self, disk: &DiskIdentity) -> PathBuf {
        self.vm_dir(disk.vm_id())
            .join(encode_component(disk.disk_id()))
    }

    fn block_path(&self, key: &BlockKey) -> PathBuf {
        self.record_path(&key.vm_id, &key.disk_id, key.block_index)
    }

    fn record_path(&self, vm_id: &str, disk_id: &str, index: u64) -> PathBuf {
        self.root
            .join(BLOCKS_DIR)
            .join(encode_component(vm_id))
            .join(encode_component(disk_id))
            .join(format!("{index}.{BLOCK_EXT}"))
    }

    fn snapshot_dir(&self, vm_id: &str, disk_id: &str) -> PathBuf {
        self.root
            .join(SNAPSHOTS_DIR)
            .join(encode_component(vm_id))
            .join(encode_component(disk_id))
    }

    /// Start a mutating transaction. Callers hold the write lock.
    async fn begin_txn(&self) -> Result<PathBuf> {
        if self.needs_recovery.load(Ordering::SeqCst) {
            self.recover_staging().await?;
        }
        let seq = self.txn_seq.fetch_add(1, Ordering::Relaxed);
        let dir = self.root.join(STAGING_DIR).join(format!("txn-{seq}"));
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }

    async fn read_entry(&self, key: &BlockKey) -> Result<Option<BlockEntry>> {
        let raw = match fs::read(self.block_path(key)).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let (timestamp_ms, data) = decode_entry(&raw)?;
        Ok(Some(BlockEntry {
            key: key.clone(),
            data,
            timestamp_ms,
        }))
    }

    async fn indices_in(&self, disk: &DiskIdentity) -> Result<Vec<u64>> {
        let prefix = disk.key_prefix();
        let mut indices: Vec<u64> = list_dir_names(&self.disk_dir(disk))
            .await?
            .into_iter()
            .filter_map(|name| {
                let stem = name.strip_suffix(&format!(".{BLOCK_EXT}"))?;
                match BlockKey::parse(&format!("{prefix}{stem}")) {
                    Some(key) => Some(key.block_index),
                    None => {
                        tracing::warn!(file = %name, %disk, "skipping unexpected file in overlay store");
                        None
                    }
                }
            })
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    async fn disks_in(&self, vm_id: &str) -> Result<Vec<String>> {
        let mut disks = Vec::new();
        for name in list_dir_names(&self.vm_dir(vm_id)).await? {
            let Some(disk_id) = decode_component(&name) else {
                tracing::warn!(dir = %name, "skipping undecodable disk directory");
                continue;
            };
            let Ok(disk) = DiskIdentity::new(vm_id, disk_id.clone()) else {
                continue;
            };
            if !self.indices_in(&disk).await?.is_empty() {
                disks.push(disk_id);
            }
        }
        disks.sort();
        Ok(disks)
    }

    /// Move `path` into the transaction directory (atomically hiding it), then delete it.
    async fn retire(&self, txn: &Path, path: &Path, label: &str) -> Result<()> {
        let target = txn.join(label);
        match fs::rename(path, &target).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
        remove_dir_if_exists(&target).await
    }

    /// Remove a finished transaction directory unless it was kept for recovery.
    async fn finish_txn(&self, txn: &Path) {
        if self.needs_recovery.load(Ordering::SeqCst) {
            return;
        }
        if let Err(err) = remove_dir_if_exists(txn).await {
            tracing::warn!(txn = %txn.display(), error = %err, "failed to remove staging directory");
        }
    }

    async fn stage_and_apply(&self, txn: &Path, batch: WriteBatch) -> Result<()> {
        let mut journal = CommitJournal {
            records: Vec::with_capacity(batch.len()),
        };
        for (i, entry) in batch.entries().iter().enumerate() {
            let file = format!("{i}.tmp");
            write_synced(&txn.join(&file), &encode_entry(entry)?).await?;
            journal.records.push(StagedRecord {
                file,
                vm_id: entry.key.vm_id.clone(),
                disk_id: entry.key.disk_id.clone(),
                index: entry.key.block_index,
            });
        }
        write_journal(txn, COMMIT_JOURNAL, &journal).await?;

        if let Err(err) = self.apply_journal(txn, &journal).await {
            self.needs_recovery.store(true, Ordering::SeqCst);
            tracing::error!(
                txn = %txn.display(),
                error = %err,
                "commit interrupted after journaling; remaining records will be rolled forward"
            );
            return Err(err);
        }
        Ok(())
    }

    /// Rename every staged record that is still present into place.
    async fn apply_journal(&self, txn: &Path, journal: &CommitJournal) -> Result<()> {
        for record in &journal.records {
            let staged = txn.join(&record.file);
            if !fs::try_exists(&staged).await? {
                continue;
            }
            let dest = self.record_path(&record.vm_id, &record.disk_id, record.index);
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&staged, &dest).await?;
        }
        Ok(())
    }

    async fn stage_and_swap(
        &self,
        txn: &Path,
        disk: &DiskIdentity,
        entries: Vec<BlockEntry>,
    ) -> Result<()> {
        let fresh = txn.join("new");
        fs::create_dir_all(&fresh).await?;
        for entry in &entries {
            let path = fresh.join(format!("{}.{BLOCK_EXT}", entry.key.block_index));
            write_synced(&path, &encode_entry(entry)?).await?;
        }
        write_journal(
            txn,
            SWAP_JOURNAL,
            &SwapJournal {
                vm_id: disk.vm_id().to_string(),
                disk_id: disk.disk_id().to_string(),
            },
        )
        .await?;

        let live = self.disk_dir(disk);
        let old = txn.join("old");
        let had_old = match fs::rename(&live, &old).await {
            Ok(()) => true,
            Err(err) if err.kind() == ErrorKind::NotFound => false,
            Err(err) => return Err(err.into()),
        };
        let swapped = match fs::create_dir_all(self.vm_dir(disk.vm_id())).await {
            Ok(()) => fs::rename(&fresh, &live).await,
            Err(err) => Err(err),
        };
        if let Err(err) = swapped {
            if had_old {
                if let Err(rollback) = fs::rename(&old, &live).await {
                    self.needs_recovery.store(true, Ordering::SeqCst);
                    tracing::error!(
                        %disk,
                        txn = %txn.display(),
                        error = %rollback,
                        "could not put previous overlay back; kept in staging for recovery"
                    );
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Finish or undo every journaled transaction under `staging/`, oldest first, then empty it.
    async fn recover_staging(&self) -> Result<()> {
        let staging = self.root.join(STAGING_DIR);
        let mut names = list_dir_names(&staging).await?;
        names.sort_by_key(|name| txn_seq_of(name));
        for name in names {
            let txn = staging.join(&name);
            if let Some(journal) = read_journal::<CommitJournal>(&txn, COMMIT_JOURNAL).await? {
                self.apply_journal(&txn, &journal).await?;
                tracing::info!(
                    txn = %name,
                    records = journal.records.len(),
                    "rolled forward interrupted commit"
                );
            } else if let Some(swap) = read_journal::<SwapJournal>(&txn, SWAP_JOURNAL).await? {
                self.restore_swapped_out(&txn, &swap).await?;
            }
            remove_dir_if_exists(&txn).await?;
        }
        self.needs_recovery.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Put a disk directory back if a replacement moved it aside but never installed the new one.
    async fn restore_swapped_out(&self, txn: &Path, swap: &SwapJournal) -> Result<()> {
        let old = txn.join("old");
        if !fs::try_exists(&old).await? {
            return Ok(());
        }
        let disk = DiskIdentity::new(swap.vm_id.clone(), swap.disk_id.clone())?;
        let live = self.disk_dir(&disk);
        if fs::try_exists(&live).await? {
            // The swap completed; `old` is just garbage.
            return Ok(());
        }
        fs::create_dir_all(self.vm_dir(disk.vm_id())).await?;
        fs::rename(&old, &live).await?;
        tracing::warn!(%disk, "restored overlay left behind by an interrupted import");
        Ok(())
    }
}

#[async_trait]
impl OverlayDb for FsOverlayDb {
    async fn get(&self, key: &BlockKey) -> Result<Option<BlockEntry>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        self.read_entry(key).await
    }

    async fn get_many(
        &self,
        disk: &DiskIdentity,
        indices: &[u64],
    ) -> Result<BTreeMap<u64, Vec<u8>>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        let mut out = BTreeMap::new();
        for &index in indices {
            if let Some(entry) = self.read_entry(&disk.key(index)).await? {
                out.insert(index, entry.data);
            }
        }
        Ok(out)
    }

    async fn list_indices(&self, disk: &DiskIdentity) -> Result<Vec<u64>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        self.indices_in(disk).await
    }

    async fn scan_disk(&self, disk: &DiskIdentity) -> Result<Vec<BlockEntry>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        let mut out = Vec::new();
        for index in self.indices_in(disk).await? {
            if let Some(entry) = self.read_entry(&disk.key(index)).await? {
                out.push(entry);
            }
        }
        Ok(out)
    }

    async fn list_disks(&self, vm_id: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        self.disks_in(vm_id).await
    }

    async fn list_vms(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        let mut vms = Vec::new();
        for name in list_dir_names(&self.root.join(BLOCKS_DIR)).await? {
            let Some(vm_id) = decode_component(&name) else {
                tracing::warn!(dir = %name, "skipping undecodable vm directory");
                continue;
            };
            if !self.disks_in(&vm_id).await?.is_empty() {
                vms.push(vm_id);
            }
        }
        vms.sort();
        Ok(vms)
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        self.ensure_open()?;
        if batch.is_empty() {
            return Ok(());
        }
        let _guard = self.lock.write().await;
        let txn = self.begin_txn().await?;
        let result = self.stage_and_apply(&txn, batch).await;
        self.finish_txn(&txn).await;
        result
    }

    async fn delete_disk(&self, disk: &DiskIdentity) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write().await;
        let txn = self.begin_txn().await?;
        let result = self.retire(&txn, &self.disk_dir(disk), "disk").await;
        self.finish_txn(&txn).await;
        // Drop the vm directory once its last disk is gone; fails harmlessly otherwise.
        let _ = fs::remove_dir(self.vm_dir(disk.vm_id())).await;
        result
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write().await;
        let txn = self.begin_txn().await?;
        let snapshots = self.root.join(SNAPSHOTS_DIR).join(encode_component(vm_id));
        let mut result = self.retire(&txn, &self.vm_dir(vm_id), "blocks").await;
        if result.is_ok() {
            result = self.retire(&txn, &snapshots, "snapshots").await;
        }
        self.finish_txn(&txn).await;
        result
    }

    async fn replace_disk(&self, disk: &DiskIdentity, entries: Vec<BlockEntry>) -> Result<()> {
        self.ensure_open()?;
        if entries.iter().any(|e| !e.key.belongs_to(disk)) {
            return Err(DiskError::InvalidIdentity(format!(
                "replacement entries must all belong to {disk}"
            )));
        }
        let _guard = self.lock.write().await;
        let txn = self.begin_txn().await?;
        let result = self.stage_and_swap(&txn, disk, entries).await;
        self.finish_txn(&txn).await;
        result
    }

    async fn put_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<()> {
        self.ensure_open()?;
        let _guard = self.lock.write().await;
        let dir = self.snapshot_dir(&descriptor.vm_id, &descriptor.disk_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(format!(
            "{}.{SNAPSHOT_EXT}",
            encode_component(&descriptor.id)
        ));
        let raw = serde_json::to_vec(descriptor)?;
        let tmp = path.with_extension("json.tmp");
        write_synced(&tmp, &raw).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn list_snapshots(&self, disk: &DiskIdentity) -> Result<Vec<SnapshotDescriptor>> {
        self.ensure_open()?;
        let _guard = self.lock.read().await;
        let dir = self.snapshot_dir(disk.vm_id(), disk.disk_id());
        let mut out = Vec::new();
        for name in list_dir_names(&dir).await? {
            if !name.ends_with(&format!(".{SNAPSHOT_EXT}")) {
                continue;
            }
            let raw = fs::read(dir.join(&name)).await?;
            match serde_json::from_slice::<SnapshotDescriptor>(&raw) {
                Ok(desc) => out.push(desc),
                Err(err) => {
                    tracing::warn!(file = %name, error = %err, "skipping corrupt snapshot descriptor");
                }
            }
        }
        out.sort_by(|a, b| (a.created_at_ms, &a.id).cmp(&(b.created_at_ms, &b.id)));
        Ok(out)
    }
}

fn normalize_root(root: PathBuf) -> PathBuf {
    std::path::absolute(&root).unwrap_or(root)
}

fn lookup_shared(root: &Path) -> Result<Option<Arc<FsOverlayDb>>> {
    let shared = registry()
        .lock()
        .map_err(|_| DiskError::Io("poisoned lock".to_string()))?;
    Ok(shared
        .get(root)
        .and_then(Weak::upgrade)
        .filter(|db| !db.is_closed()))
}

fn encode_component(id: &str) -> String {
    hex::encode(id.as_bytes())
}

fn decode_component(name: &str) -> Option<String> {
    hex::decode(name)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
}

fn encode_entry(entry: &BlockEntry) -> Result<Vec<u8>> {
    let len: u32 = entry
        .data
        .len()
        .try_into()
        .map_err(|_| DiskError::InvalidConfig("block larger than 4 GiB"))?;
    let mut out = Vec::with_capacity(ENTRY_HEADER_LEN + entry.data.len());
    out.extend_from_slice(&ENTRY_MAGIC);
    out.extend_from_slice(&ENTRY_VERSION.to_le_bytes());
    out.extend_from_slice(&entry.timestamp_ms.to_le_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&entry.data);
    Ok(out)
}

fn decode_entry(raw: &[u8]) -> Result<(u64, Vec<u8>)> {
    if raw.len() < ENTRY_HEADER_LEN {
        return Err(DiskError::Corrupt("block entry shorter than header"));
    }
    if raw[0..4] != ENTRY_MAGIC {
        return Err(DiskError::Corrupt("bad block entry magic"));
    }
    let version = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    if version != ENTRY_VERSION {
        return Err(DiskError::Corrupt("unsupported block entry version"));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&raw[8..16]);
    let len = u32::from_le_bytes([raw[16], raw[17], raw[18], raw[19]]) as usize;
    let data = &raw[ENTRY_HEADER_LEN..];
    if data.len() != len {
        return Err(DiskError::Corrupt("block entry length mismatch"));
    }
    Ok((u64::from_le_bytes(ts), data.to_vec()))
}

async fn write_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

async fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut rd = match fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err.into()),
    };
    let mut names = Vec::new();
    while let Some(entry) = rd.next_entry().await? {
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

async fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn txn_seq_of(name: &str) -> u64 {
    name.strip_prefix("txn-")
        .and_then(|seq| seq.parse().ok())
        .unwrap_or(u64::MAX)
}

/// Write a journal atomically: a present journal file is always complete.
async fn write_journal<T: Serialize>(txn: &Path, name: &str, journal: &T) -> Result<()> {
    let path = txn.join(name);
    let tmp = path.with_extension("json.tmp");
    write_synced(&tmp, &serde_json::to_vec(journal)?).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn read_journal<T: for<'de> Deserialize<'de>>(txn: &Path, name: &str) -> Result<Option<T>> {
    match fs::read(txn.join(name)).await {
        Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
