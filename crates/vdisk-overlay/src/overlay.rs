use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use async_trait::async_trait;

use crate::block::{ensure_block_len, BlockDevice, BlockStats};
use crate::db::{BlockEntry, OverlayDb, WriteBatch};
use crate::key::DiskIdentity;
use crate::ranges::{coalesce_ranges, BlockRange};
use crate::util::unix_millis;
use crate::{DiskError, OverlayConfig, Result};

type BlockMap = BTreeMap<u64, Vec<u8>>;

#[derive(Default)]
pub struct OverlayTelemetry {
    pub buffer_hits: AtomicU64,
    pub durable_hits: AtomicU64,
    pub misses: AtomicU64,
    pub flushes: AtomicU64,
    pub blocks_flushed: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayTelemetrySnapshot {
    pub buffer_hits: u64,
    pub durable_hits: u64,
    pub misses: u64,
    pub flushes: u64,
    pub blocks_flushed: u64,
}

impl OverlayTelemetry {
    pub fn snapshot(&self) -> OverlayTelemetrySnapshot {
        OverlayTelemetrySnapshot {
            buffer_hits: self.buffer_hits.load(Ordering::Relaxed),
            durable_hits: self.durable_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            blocks_flushed: self.blocks_flushed.load(Ordering::Relaxed),
        }
    }
}

enum DbSlot<D> {
    Pending(Arc<D>),
    Ready(Arc<D>),
    Closed,
}

#[derive(Default)]
struct BufferState {
    /// Writes not yet handed to a flush.
    buffer: BlockMap,
    /// Buffer contents currently being committed. Reads consult it between `buffer` and the
    /// durable store.
    in_flight: Option<Arc<BlockMap>>,
    /// Every index written since creation or the last clear; never shrunk by a flush.
    dirty: BTreeSet<u64>,
    /// Set by `close` before its final drain; writes are refused from then on.
    closing: bool,
}

/// Durable, buffered store of the modified blocks of one disk.
///
/// Writes land in an in-memory buffer that is committed to the durable store in one transaction
/// once it holds `flush_threshold` blocks (or on [`OverlayStore::flush`]). Reads check the buffer
/// first, then any flush in progress, then the durable store; a miss is `Ok(None)`.
///
/// The store must be [`init`](OverlayStore::init)ialized before use and is unusable after
/// [`close`](OverlayStore::close). Running two stores for the same disk identity at once is not
/// supported and can lose writes.
pub struct OverlayStore<D> {
    identity: DiskIdentity,
    config: OverlayConfig,
    db: Mutex<DbSlot<D>>,
    state: Mutex<BufferState>,
    // Serializes flush/clear/import so commits reach the durable store in buffer order.
    flush_lock: tokio::sync::Mutex<()>,
    telemetry: OverlayTelemetry,
}

impl<D: OverlayDb> OverlayStore<D> {
    /// Create an uninitialized store. No I/O happens until [`OverlayStore::init`].
    pub fn new(db: Arc<D>, identity: DiskIdentity, config: OverlayConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            identity,
            config,
            db: Mutex::new(DbSlot::Pending(db)),
            state: Mutex::new(BufferState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
            telemetry: OverlayTelemetry::default(),
        })
    }

    /// Create and initialize in one step.
    pub async fn open(db: Arc<D>, identity: DiskIdentity, config: OverlayConfig) -> Result<Self> {
        let store = Self::new(db, identity, config)?;
        store.init().await?;
        Ok(store)
    }

    /// Load the indices already persisted for this disk and mark the store ready.
    ///
    /// Calling this on a ready store is a no-op; on a closed store it fails.
    pub async fn init(&self) -> Result<()> {
        let db = match &*self.lock_db()? {
            DbSlot::Pending(db) => db.clone(),
            DbSlot::Ready(_) => return Ok(()),
            DbSlot::Closed => return Err(DiskError::Uninitialized),
        };
        let persisted = db.list_indices(&self.identity).await?;
        self.lock_state()?.dirty.extend(persisted);
        let mut slot = self.lock_db()?;
        if let DbSlot::Pending(db) = &*slot {
            *slot = DbSlot::Ready(db.clone());
        }
        tracing::debug!(disk = %self.identity, "overlay store initialized");
        Ok(())
    }

    pub fn identity(&self) -> &DiskIdentity {
        &self.identity
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn telemetry(&self) -> &OverlayTelemetry {
        &self.telemetry
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.lock_db().as_deref(), Ok(DbSlot::Ready(_)))
    }

    /// Number of writes currently held in memory (excluding a flush in progress).
    pub fn buffered_len(&self) -> Result<usize> {
        Ok(self.lock_state()?.buffer.len())
    }

    /// Number of indices written since creation/last clear, buffered or flushed.
    pub fn dirty_len(&self) -> Result<usize> {
        Ok(self.lock_state()?.dirty.len())
    }

    fn lock_db(&self) -> Result<MutexGuard<'_, DbSlot<D>>> {
        self.db
            .lock()
            .map_err(|_| DiskError::Io("poisoned lock".to_string()))
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, BufferState>> {
        self.state
            .lock()
            .map_err(|_| DiskError::Io("poisoned lock".to_string()))
    }

    pub(crate) fn ready_db(&self) -> Result<Arc<D>> {
        match &*self.lock_db()? {
            DbSlot::Ready(db) => Ok(db.clone()),
            DbSlot::Pending(_) | DbSlot::Closed => Err(DiskError::Uninitialized),
        }
    }

    /// Look a block up in memory only: buffer first, then a flush in progress.
    fn lookup_memory(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let state = self.lock_state()?;
        if let Some(data) = state.buffer.get(&index) {
            return Ok(Some(data.clone()));
        }
        Ok(state
            .in_flight
            .as_ref()
            .and_then(|pending| pending.get(&index).cloned()))
    }

    fn memory_indices(&self) -> Result<BTreeSet<u64>> {
        let state = self.lock_state()?;
        let mut out: BTreeSet<u64> = state.buffer.keys().copied().collect();
        if let Some(pending) = &state.in_flight {
            out.extend(pending.keys().copied());
        }
        Ok(out)
    }

    pub async fn read_block(&self, index: u64) -> Result<Option<Vec<u8>>> {
        let db = self.ready_db()?;
        if let Some(data) = self.lookup_memory(index)? {
            self.telemetry.buffer_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(data));
        }
        match db.get(&self.identity.key(index)).await? {
            Some(entry) => {
                self.telemetry.durable_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry.data))
            }
            None => {
                self.telemetry.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    pub async fn read_blocks(&self, indices: &[u64]) -> Result<BlockMap> {
        let db = self.ready_db()?;
        let mut out = BlockMap::new();
        let mut remaining = Vec::new();
        {
            let state = self.lock_state()?;
            for &index in indices {
                if out.contains_key(&index) {
                    continue;
                }
                let hit = state.buffer.get(&index).or_else(|| {
                    state
                        .in_flight
                        .as_ref()
                        .and_then(|pending| pending.get(&index))
                });
                match hit {
                    Some(data) => {
                        out.insert(index, data.clone());
                    }
                    None => remaining.push(index),
                }
            }
        }
        remaining.sort_unstable();
        remaining.dedup();
        self.telemetry
            .buffer_hits
            .fetch_add(out.len() as u64, Ordering::Relaxed);

        if !remaining.is_empty() {
            let durable = db.get_many(&self.identity, &remaining).await?;
            self.telemetry
                .durable_hits
                .fetch_add(durable.len() as u64, Ordering::Relaxed);
            self.telemetry
                .misses
                .fetch_add((remaining.len() - durable.len()) as u64, Ordering::Relaxed);
            for (index, data) in durable {
                // A write that landed while we were reading is newer than the durable copy.
                out.entry(index).or_insert(data);
            }
        }
        Ok(out)
    }

    pub async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        ensure_block_len(data, self.config.block_size)?;
        self.ready_db()?;
        let should_flush = {
            let mut state = self.lock_state()?;
            if state.closing {
                return Err(DiskError::Uninitialized);
            }
            state.buffer.insert(index, data.to_vec());
            state.dirty.insert(index);
            state.buffer.len() >= self.config.flush_threshold
        };
        if should_flush {
            let _flush = self.flush_lock.lock().await;
            // Another flush (or close) may have drained the buffer while we waited.
            if self.buffered_len()? >= self.config.flush_threshold {
                self.flush_locked(&self.ready_db()?).await?;
            }
        }
        Ok(())
    }

    /// Commit every buffered write to the durable store in one transaction.
    ///
    /// The buffer is swapped out before the commit starts, so writes issued meanwhile accumulate
    /// in a fresh buffer. If the commit fails, the swapped-out writes are merged back (newer
    /// writes win) and the error is returned. Flushing an empty buffer does nothing.
    pub async fn flush(&self) -> Result<()> {
        let _flush = self.flush_lock.lock().await;
        let db = self.ready_db()?;
        self.flush_locked(&db).await
    }

    /// Serialize with flushes, clears, imports and close.
    pub(crate) async fn lock_flush(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.flush_lock.lock().await
    }

    /// Body of [`OverlayStore::flush`]; the caller holds `flush_lock`.
    pub(crate) async fn flush_locked(&self, db: &Arc<D>) -> Result<()> {
        let pending = {
            let mut state = self.lock_state()?;
            if state.buffer.is_empty() {
                return Ok(());
            }
            let pending = Arc::new(mem::take(&mut state.buffer));
            state.in_flight = Some(pending.clone());
            pending
        };
        let guard = InFlightGuard {
            state: &self.state,
            pending: Some(pending.clone()),
        };

        let started = Instant::now();
        let timestamp_ms = unix_millis();
        let mut batch = WriteBatch::new();
        for (&index, data) in pending.iter() {
            batch.put(BlockEntry {
                key: self.identity.key(index),
                data: data.clone(),
                timestamp_ms,
            });
        }

        match db.commit(batch).await {
            Ok(()) => {
                guard.complete();
                self.telemetry.flushes.fetch_add(1, Ordering::Relaxed);
                self.telemetry
                    .blocks_flushed
                    .fetch_add(pending.len() as u64, Ordering::Relaxed);
                tracing::debug!(
                    disk = %self.identity,
                    blocks = pending.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "flushed overlay buffer"
                );
                Ok(())
            }
            Err(err) => {
                tracing::warn!(
                    disk = %self.identity,
                    blocks = pending.len(),
                    error = %err,
                    "overlay flush failed; writes kept in buffer"
                );
                drop(guard);
                Err(err)
            }
        }
    }

    pub async fn has_block(&self, index: u64) -> Result<bool> {
        let db = self.ready_db()?;
        if self.lookup_memory(index)?.is_some() {
            return Ok(true);
        }
        Ok(db.get(&self.identity.key(index)).await?.is_some())
    }

    /// Sorted union of buffered and durable block indices.
    pub async fn modified_blocks(&self) -> Result<Vec<u64>> {
        let db = self.ready_db()?;
        let durable = db.list_indices(&self.identity).await?;
        let mut all = self.memory_indices()?;
        all.extend(durable);
        Ok(all.into_iter().collect())
    }

    pub async fn modified_ranges(&self) -> Result<Vec<BlockRange>> {
        Ok(coalesce_ranges(&self.modified_blocks().await?))
    }

    /// Discard buffered writes and delete every durable block of this disk.
    pub async fn clear(&self) -> Result<()> {
        let _flush = self.flush_lock.lock().await;
        let db = self.ready_db()?;
        db.delete_disk(&self.identity).await?;
        {
            let mut state = self.lock_state()?;
            state.buffer.clear();
            state.dirty.clear();
        }
        tracing::info!(disk = %self.identity, "cleared overlay");
        Ok(())
    }

    /// Flush pending writes and release the durable store handle.
    ///
    /// Writes are refused with [`DiskError::Uninitialized`] as soon as closing starts, so every
    /// write that returned `Ok` is committed. If the final flush fails the store stays open and
    /// accepts writes again.
    pub async fn close(&self) -> Result<()> {
        let _flush = self.flush_lock.lock().await;
        let db = self.ready_db()?;
        self.lock_state()?.closing = true;
        if let Err(err) = self.drain(&db).await {
            self.lock_state()?.closing = false;
            return Err(err);
        }
        *self.lock_db()? = DbSlot::Closed;
        tracing::debug!(disk = %self.identity, "overlay store closed");
        Ok(())
    }

    async fn drain(&self, db: &Arc<D>) -> Result<()> {
        while self.buffered_len()? > 0 {
            self.flush_locked(db).await?;
        }
        Ok(())
    }

    /// Replace all buffered and durable state with `blocks`, bypassing the buffer.
    pub(crate) async fn replace_all(&self, blocks: Vec<(u64, Vec<u8>)>) -> Result<()> {
        for (_, data) in &blocks {
            ensure_block_len(data, self.config.block_size)?;
        }
        let _flush = self.flush_lock.lock().await;
        let db = self.ready_db()?;
        let timestamp_ms = unix_millis();
        let indices: BTreeSet<u64> = blocks.iter().map(|(index, _)| *index).collect();
        let entries = blocks
            .into_iter()
            .map(|(index, data)| BlockEntry {
                key: self.identity.key(index),
                data,
                timestamp_ms,
            })
            .collect();
        db.replace_disk(&self.identity, entries).await?;
        let mut state = self.lock_state()?;
        state.buffer.clear();
        state.dirty = indices;
        Ok(())
    }
}

/// Clears (or on drop without completion, restores) the in-flight flush buffer.
struct InFlightGuard<'a> {
    state: &'a Mutex<BufferState>,
    pending: Option<Arc<BlockMap>>,
}

impl InFlightGuard<'_> {
    fn complete(mut self) {
        self.pending = None;
        if let Ok(mut state) = self.state.lock() {
            state.in_flight = None;
        }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.in_flight = None;
        let restored = Arc::try_unwrap(pending).unwrap_or_else(|shared| (*shared).clone());
        for (index, data) in restored {
            state.buffer.entry(index).or_insert(data);
        }
    }
}

#[async_trait]
impl<D: OverlayDb> BlockDevice for OverlayStore<D> {
    fn block_size(&self) -> usize {
        self.config.block_size
    }

    async fn read_block(&self, index: u64) -> Result<Option<Vec<u8>>> {
        OverlayStore::read_block(self, index).await
    }

    async fn read_blocks(&self, indices: &[u64]) -> Result<BlockMap> {
        OverlayStore::read_blocks(self, indices).await
    }

    async fn write_block(&self, index: u64, data: &[u8]) -> Result<()> {
        OverlayStore::write_block(self, index, data).await
    }

    async fn stats(&self) -> Result<BlockStats> {
        let count = self.modified_blocks().await?.len() as u64;
        Ok(BlockStats::for_blocks(count, self.config.block_size))
    }
}
