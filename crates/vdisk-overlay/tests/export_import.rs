use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::sync::Arc;

use tempfile::tempdir;
use vdisk_overlay::{
    DiskError, DiskIdentity, ExportBundle, FsOverlayDb, MemOverlayDb, OverlayConfig, OverlayDb,
    OverlayStore,
};

const BS: usize = 64;

fn config() -> OverlayConfig {
    OverlayConfig::default().with_block_size(BS)
}

fn disk(vm: &str, disk: &str) -> DiskIdentity {
    DiskIdentity::new(vm, disk).unwrap()
}

fn patterned(index: u64) -> Vec<u8> {
    (0..BS).map(|i| (i as u64 * 3 + index) as u8).collect()
}

async fn populated_source(db: Arc<FsOverlayDb>) -> OverlayStore<FsOverlayDb> {
    let store = OverlayStore::open(db, disk("vm-src", "root"), config())
        .await
        .unwrap();
    for index in [0, 1, 5, 6, 7, 300] {
        store.write_block(index, &patterned(index)).await.unwrap();
    }
    store
}

#[tokio::test]
async fn export_then_import_reproduces_the_overlay() {
    let dir = tempdir().unwrap();
    let src_db = Arc::new(FsOverlayDb::open(dir.path().join("src")).await.unwrap());
    let source = populated_source(src_db).await;

    let bundle = source.export().await.unwrap();
    assert_eq!(source.buffered_len().unwrap(), 0, "export flushes first");
    assert_eq!(bundle.metadata.block_count, 6);
    assert_eq!(bundle.metadata.vm_id, "vm-src");

    let path = dir.path().join("root.vdbundle");
    bundle
        .write_to(BufWriter::new(File::create(&path).unwrap()))
        .unwrap();
    let loaded = ExportBundle::read_from(BufReader::new(File::open(&path).unwrap())).unwrap();
    assert_eq!(loaded, bundle);

    let dst_db = Arc::new(FsOverlayDb::open(dir.path().join("dst")).await.unwrap());
    let target = OverlayStore::open(dst_db.clone(), disk("vm-clone", "root"), config())
        .await
        .unwrap();
    target.import(loaded).await.unwrap();

    let expected = source.modified_blocks().await.unwrap();
    assert_eq!(target.modified_blocks().await.unwrap(), expected);
    let src_blocks = source.read_blocks(&expected).await.unwrap();
    let dst_blocks = target.read_blocks(&expected).await.unwrap();
    assert_eq!(src_blocks, dst_blocks);
    assert_eq!(
        dst_db.list_indices(target.identity()).await.unwrap(),
        expected
    );
}

#[tokio::test]
async fn import_discards_every_prior_block() {
    let db = Arc::new(MemOverlayDb::new());
    let store = OverlayStore::open(db.clone(), disk("vm", "d"), config())
        .await
        .unwrap();
    store.write_block(9, &patterned(9)).await.unwrap();
    store.flush().await.unwrap();
    store.write_block(10, &patterned(10)).await.unwrap();

    let donor = OverlayStore::open(db.clone(), disk("vm", "donor"), config())
        .await
        .unwrap();
    donor.write_block(2, &patterned(2)).await.unwrap();
    let bundle = donor.export().await.unwrap();

    store.import(bundle).await.unwrap();
    assert_eq!(store.modified_blocks().await.unwrap(), vec![2]);
    assert_eq!(store.read_block(9).await.unwrap(), None);
    assert_eq!(store.read_block(10).await.unwrap(), None);
    assert_eq!(store.buffered_len().unwrap(), 0);
    assert_eq!(store.dirty_len().unwrap(), 1);
}

#[tokio::test]
async fn invalid_bundles_leave_the_target_untouched() {
    let db = Arc::new(MemOverlayDb::new());
    let store = OverlayStore::open(db.clone(), disk("vm", "d"), config())
        .await
        .unwrap();
    store.write_block(1, &patterned(1)).await.unwrap();
    store.flush().await.unwrap();
    let good = store.export().await.unwrap();

    let mut short_block = good.clone();
    short_block.blocks[0].1.truncate(BS - 1);
    assert!(matches!(
        store.import(short_block).await.unwrap_err(),
        DiskError::InvalidBlockLength { .. }
    ));

    let mut wrong_size = good.clone();
    wrong_size.metadata.block_size = BS * 2;
    assert!(matches!(
        store.import(wrong_size).await.unwrap_err(),
        DiskError::InvalidConfig(_)
    ));

    db.set_fail_commits(true);
    assert!(store.import(good).await.is_err());
    db.set_fail_commits(false);

    assert_eq!(store.modified_blocks().await.unwrap(), vec![1]);
    assert_eq!(store.read_block(1).await.unwrap(), Some(patterned(1)));
}

#[tokio::test]
async fn corrupt_bundle_files_are_rejected() {
    let db = Arc::new(MemOverlayDb::new());
    let store = OverlayStore::open(db, disk("vm", "d"), config())
        .await
        .unwrap();
    store.write_block(4, &patterned(4)).await.unwrap();
    let mut raw = Vec::new();
    store.export().await.unwrap().write_to(&mut raw).unwrap();

    let mut wrong_magic = raw.clone();
    wrong_magic[0] = b'X';
    assert!(matches!(
        ExportBundle::read_from(wrong_magic.as_slice()).unwrap_err(),
        DiskError::Corrupt("not an overlay bundle")
    ));

    let truncated = &raw[..raw.len() / 2];
    assert!(matches!(
        ExportBundle::read_from(truncated).unwrap_err(),
        DiskError::Corrupt(_)
    ));
}

#[tokio::test]
async fn snapshot_is_a_summary_not_a_fork() {
    let db = Arc::new(MemOverlayDb::new());
    let store = OverlayStore::open(db, disk("vm", "d"), config())
        .await
        .unwrap();
    store.write_block(0, &patterned(0)).await.unwrap();
    let snapshot = store.create_snapshot(Some("before upgrade".into())).await.unwrap();
    assert_eq!(snapshot.block_count, 1);
    assert!(snapshot.id.starts_with("vm-d-"));
    assert_eq!(snapshot.description.as_deref(), Some("before upgrade"));

    store.write_block(0, &patterned(1)).await.unwrap();
    assert_eq!(store.read_block(0).await.unwrap(), Some(patterned(1)));
}
