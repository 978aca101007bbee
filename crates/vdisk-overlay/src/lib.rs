//! Block storage for virtual machine disks: an immutable base image plus a sparse, persisted
//! overlay of modified blocks.
//!
//! A VM sees one logical disk through the [`BlockDevice`] contract. This crate provides:
//!
//! - [`OverlayStore`]: buffered writes, threshold flushes and dirty tracking over a durable store
//! - [`OverlayDb`]: the durable store interface, with [`MemOverlayDb`] and [`FsOverlayDb`]
//! - [`CowBlockDevice`]: overlay-first reads that fall back to a read-only [`BaseImage`]
//! - [`BaseSource`]: local file, HTTP range and in-memory base images
//! - snapshots and [`ExportBundle`] for backup and cloning of a disk's overlay
//!
//! Overlay blocks are keyed by `"<vmId>:<diskId>:<blockIndex>"` (see [`BlockKey`]).

mod base;
mod block;
mod config;
mod cow;
mod db;
mod error;
mod key;
mod overlay;
mod ranges;
mod snapshot;
mod util;

pub use base::{
    BaseImage, BaseSource, BaseSourceConfig, FileBaseImage, HttpRangeImage, MemBaseImage,
};
pub use block::{split_into_blocks, BlockDevice, BlockStats, DEFAULT_BLOCK_SIZE};
pub use config::{OverlayConfig, DEFAULT_FLUSH_THRESHOLD};
pub use cow::{BlockSource, CowBlockDevice};
pub use db::{
    delete_vm_overlays, list_vms_with_overlays, BlockEntry, FsOverlayDb, MemOverlayDb,
    OverlayDb, WriteBatch,
};
pub use error::{DiskError, Result};
pub use key::{BlockKey, DiskIdentity, MAX_ID_LEN};
pub use overlay::{OverlayStore, OverlayTelemetry, OverlayTelemetrySnapshot};
pub use ranges::{coalesce_ranges, BlockRange};
pub use snapshot::{ExportBundle, SnapshotDescriptor};

#[cfg(test)]
mod proptests;
