use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{DiskError, Result};

const KEY_SEPARATOR: char = ':';
pub const MAX_ID_LEN: usize = 256;

/// Identity of one virtual disk: `(vm_id, disk_id)`.
///
/// Both ids are opaque, but must be non-empty and must not contain `:` so that persisted
/// [`BlockKey`]s always split back into exactly three segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskIdentity {
    vm_id: String,
    disk_id: String,
}

impl DiskIdentity {
    pub fn new(vm_id: impl Into<String>, disk_id: impl Into<String>) -> Result<Self> {
        let vm_id = vm_id.into();
        let disk_id = disk_id.into();
        validate_id("vm id", &vm_id)?;
        validate_id("disk id", &disk_id)?;
        Ok(Self { vm_id, disk_id })
    }

    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    pub fn disk_id(&self) -> &str {
        &self.disk_id
    }

    pub fn key(&self, block_index: u64) -> BlockKey {
        BlockKey {
            vm_id: self.vm_id.clone(),
            disk_id: self.disk_id.clone(),
            block_index,
        }
    }

    /// String prefix shared by every [`BlockKey`] of this disk.
    pub fn key_prefix(&self) -> String {
        format!("{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}", self.vm_id, self.disk_id)
    }
}

impl fmt::Display for DiskIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vm_id, self.disk_id)
    }
}

pub(crate) fn validate_id(what: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(DiskError::InvalidIdentity(format!("{what} must not be empty")));
    }
    if id.len() > MAX_ID_LEN {
        return Err(DiskError::InvalidIdentity(format!(
            "{what} is longer than {MAX_ID_LEN} bytes"
        )));
    }
    if id.contains(KEY_SEPARATOR) {
        return Err(DiskError::InvalidIdentity(format!(
            "{what} must not contain '{KEY_SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Composite key of one overlay entry, persisted as `"<vmId>:<diskId>:<blockIndex>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockKey {
    pub vm_id: String,
    pub disk_id: String,
    pub block_index: u64,
}

impl BlockKey {
    /// Parse a persisted key.
    ///
    /// Returns `None` for anything that is not exactly three non-empty `:`-separated segments
    /// with a decimal block index; storage scans use this to skip foreign entries.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split(KEY_SEPARATOR);
        let vm_id = parts.next()?;
        let disk_id = parts.next()?;
        let index = parts.next()?;
        if parts.next().is_some() || vm_id.is_empty() || disk_id.is_empty() {
            return None;
        }
        if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self {
            vm_id: vm_id.to_string(),
            disk_id: disk_id.to_string(),
            block_index: index.parse().ok()?,
        })
    }

    pub fn identity(&self) -> Result<DiskIdentity> {
        DiskIdentity::new(self.vm_id.clone(), self.disk_id.clone())
    }

    pub fn belongs_to(&self, disk: &DiskIdentity) -> bool {
        self.vm_id == disk.vm_id() && self.disk_id == disk.disk_id()
    }
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{KEY_SEPARATOR}{}{KEY_SEPARATOR}{}",
            self.vm_id, self.disk_id, self.block_index
        )
    }
}
