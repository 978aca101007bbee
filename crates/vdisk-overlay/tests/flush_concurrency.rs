use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Notify;
use vdisk_overlay::{
    BlockEntry, BlockKey, DiskError, DiskIdentity, MemOverlayDb, OverlayConfig, OverlayDb,
    OverlayStore, Result, SnapshotDescriptor, WriteBatch,
};

const BS: usize = 8;

/// Wraps [`MemOverlayDb`] so a commit can be held open until the test releases it.
#[derive(Default)]
struct GatedDb {
    inner: MemOverlayDb,
    gated: AtomicBool,
    entered: Notify,
    release: Notify,
}

impl GatedDb {
    fn hold_commits(&self, hold: bool) {
        self.gated.store(hold, Ordering::SeqCst);
    }
}

#[async_trait]
impl OverlayDb for GatedDb {
    async fn get(&self, key: &BlockKey) -> Result<Option<BlockEntry>> {
        self.inner.get(key).await
    }

    async fn get_many(
        &self,
        disk: &DiskIdentity,
        indices: &[u64],
    ) -> Result<BTreeMap<u64, Vec<u8>>> {
        self.inner.get_many(disk, indices).await
    }

    async fn list_indices(&self, disk: &DiskIdentity) -> Result<Vec<u64>> {
        self.inner.list_indices(disk).await
    }

    async fn scan_disk(&self, disk: &DiskIdentity) -> Result<Vec<BlockEntry>> {
        self.inner.scan_disk(disk).await
    }

    async fn list_disks(&self, vm_id: &str) -> Result<Vec<String>> {
        self.inner.list_disks(vm_id).await
    }

    async fn list_vms(&self) -> Result<Vec<String>> {
        self.inner.list_vms().await
    }

    async fn commit(&self, batch: WriteBatch) -> Result<()> {
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.commit(batch).await
    }

    async fn delete_disk(&self, disk: &DiskIdentity) -> Result<()> {
        self.inner.delete_disk(disk).await
    }

    async fn delete_vm(&self, vm_id: &str) -> Result<()> {
        self.inner.delete_vm(vm_id).await
    }

    async fn replace_disk(&self, disk: &DiskIdentity, entries: Vec<BlockEntry>) -> Result<()> {
        self.inner.replace_disk(disk, entries).await
    }

    async fn put_snapshot(&self, descriptor: &SnapshotDescriptor) -> Result<()> {
        self.inner.put_snapshot(descriptor).await
    }

    async fn list_snapshots(&self, disk: &DiskIdentity) -> Result<Vec<SnapshotDescriptor>> {
        self.inner.list_snapshots(disk).await
    }
}

fn disk() -> DiskIdentity {
    DiskIdentity::new("vm", "d").unwrap()
}

async fn open(db: &Arc<GatedDb>) -> OverlayStore<GatedDb> {
    OverlayStore::open(
        db.clone(),
        disk(),
        OverlayConfig::default()
            .with_block_size(BS)
            .with_flush_threshold(100),
    )
    .await
    .unwrap()
}

async fn durable(db: &GatedDb, index: u64) -> Option<Vec<u8>> {
    db.get(&disk().key(index)).await.unwrap().map(|e| e.data)
}

#[tokio::test]
async fn writes_during_a_flush_are_readable_and_kept() {
    let db = Arc::new(GatedDb::default());
    let store = open(&db).await;
    store.write_block(1, &[1; BS]).await.unwrap();
    db.hold_commits(true);

    let during = async {
        db.entered.notified().await;
        // The block being committed is still served from memory.
        assert_eq!(store.read_block(1).await.unwrap(), Some(vec![1; BS]));
        assert!(store.has_block(1).await.unwrap());
        store.write_block(2, &[2; BS]).await.unwrap();
        store.write_block(1, &[9; BS]).await.unwrap();
        assert_eq!(store.read_block(1).await.unwrap(), Some(vec![9; BS]));
        assert_eq!(store.modified_blocks().await.unwrap(), vec![1, 2]);
        db.release.notify_one();
    };
    let (flushed, ()) = tokio::join!(store.flush(), during);
    flushed.unwrap();
    db.hold_commits(false);

    assert_eq!(durable(&db, 1).await, Some(vec![1; BS]));
    assert_eq!(store.buffered_len().unwrap(), 2);
    assert_eq!(store.read_block(1).await.unwrap(), Some(vec![9; BS]));

    store.flush().await.unwrap();
    assert_eq!(durable(&db, 1).await, Some(vec![9; BS]));
    assert_eq!(durable(&db, 2).await, Some(vec![2; BS]));
}

#[tokio::test]
async fn failed_flush_keeps_newer_writes_issued_meanwhile() {
    let db = Arc::new(GatedDb::default());
    let store = open(&db).await;
    store.write_block(1, &[1; BS]).await.unwrap();
    store.write_block(3, &[3; BS]).await.unwrap();
    db.hold_commits(true);

    let during = async {
        db.entered.notified().await;
        store.write_block(1, &[9; BS]).await.unwrap();
        db.inner.set_fail_commits(true);
        db.release.notify_one();
    };
    let (flushed, ()) = tokio::join!(store.flush(), during);
    assert!(flushed.is_err());
    db.hold_commits(false);
    db.inner.set_fail_commits(false);

    assert_eq!(store.buffered_len().unwrap(), 2);
    assert_eq!(store.read_block(1).await.unwrap(), Some(vec![9; BS]));
    assert_eq!(store.read_block(3).await.unwrap(), Some(vec![3; BS]));

    store.flush().await.unwrap();
    assert_eq!(durable(&db, 1).await, Some(vec![9; BS]));
    assert_eq!(durable(&db, 3).await, Some(vec![3; BS]));
}

#[tokio::test]
async fn dropped_flush_puts_its_writes_back() {
    let db = Arc::new(GatedDb::default());
    let store = open(&db).await;
    store.write_block(4, &[4; BS]).await.unwrap();
    db.hold_commits(true);

    tokio::select! {
        biased;
        _ = store.flush() => panic!("commit should still be held"),
        _ = db.entered.notified() => {}
    }
    db.hold_commits(false);

    assert_eq!(store.buffered_len().unwrap(), 1);
    assert_eq!(durable(&db, 4).await, None);
    store.flush().await.unwrap();
    assert_eq!(durable(&db, 4).await, Some(vec![4; BS]));
}

#[tokio::test]
async fn write_issued_while_closing_is_refused() {
    let db = Arc::new(GatedDb::default());
    let store = open(&db).await;
    store.write_block(0, &[7; BS]).await.unwrap();
    db.hold_commits(true);

    let during = async {
        db.entered.notified().await;
        let written = store.write_block(1, &[2; BS]).await;
        db.release.notify_one();
        written
    };
    let (closed, written) = tokio::join!(store.close(), during);
    closed.unwrap();
    db.hold_commits(false);

    assert!(matches!(written, Err(DiskError::Uninitialized)));
    assert_eq!(durable(&db, 0).await, Some(vec![7; BS]));
    assert_eq!(durable(&db, 1).await, None);
    assert!(matches!(
        store.write_block(2, &[1; BS]).await,
        Err(DiskError::Uninitialized)
    ));
}

#[tokio::test]
async fn threshold_write_queued_behind_close_is_persisted() {
    let db = Arc::new(GatedDb::default());
    let store = OverlayStore::open(
        db.clone(),
        disk(),
        OverlayConfig::default()
            .with_block_size(BS)
            .with_flush_threshold(2),
    )
    .await
    .unwrap();
    store.write_block(0, &[1; BS]).await.unwrap();
    db.hold_commits(true);

    let during = async {
        db.entered.notified().await;
        tokio::join!(
            // Queues on the flush lock first.
            store.close(),
            async {
                tokio::task::yield_now().await;
                store.write_block(1, &[2; BS]).await?;
                // Reaches the threshold and queues behind close.
                store.write_block(2, &[3; BS]).await
            },
            async {
                while store.buffered_len().unwrap() < 2 {
                    tokio::task::yield_now().await;
                }
                db.hold_commits(false);
                db.release.notify_one();
            }
        )
    };
    let (flushed, (closed, written, ())) = tokio::join!(store.flush(), during);
    flushed.unwrap();
    closed.unwrap();
    written.unwrap();

    assert_eq!(durable(&db, 0).await, Some(vec![1; BS]));
    assert_eq!(durable(&db, 1).await, Some(vec![2; BS]));
    assert_eq!(durable(&db, 2).await, Some(vec![3; BS]));
    assert!(!store.is_ready());
}

#[tokio::test]
async fn failed_close_leaves_the_store_usable() {
    let db = Arc::new(GatedDb::default());
    let store = open(&db).await;
    store.write_block(5, &[5; BS]).await.unwrap();

    db.inner.set_fail_commits(true);
    assert!(store.close().await.is_err());
    db.inner.set_fail_commits(false);

    store.write_block(6, &[6; BS]).await.unwrap();
    store.close().await.unwrap();
    assert_eq!(durable(&db, 5).await, Some(vec![5; BS]));
    assert_eq!(durable(&db, 6).await, Some(vec![6; BS]));
}
