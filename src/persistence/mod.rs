//! Durable layouts and vault persistence.
//!
//! Three LUNs back a node: the change-detection record (validity records
//! and the owner change table), the tag LUN and the vault LUN. All block
//! I/O goes through [`IoEngine`]; bulk dump/load uses pooled transfer
//! buffers and a bounded in-flight wait.

mod cdr;
pub mod checksum;
mod io;
mod layout;
mod lun;
mod vault;

pub use cdr::{ChangeDetectionRecord, CdrStatus, Image, ImageSet, ValidityRecords, arbitrate};
pub use io::{BulkTransfer, InFlight, IoCallback, IoEngine, IoJob, IoOp};
pub use layout::{
    BLOCKS_PER_BUFFER, CDR_MAGIC, CHANGE_TABLE_BLOCKS, CdrArea, Extent, LAYOUT_VERSION, Layout,
    RegionHeader, TAG_MAGIC, VAULT_MAGIC,
};
pub use lun::{
    BACKEND_BLOCK, BLOCK_PAYLOAD, BLOCK_TRAILER, BlockDevice, FileLun, MemoryLun, TransferBuffer,
    TransferPool,
};
pub use vault::{DumpSummary, Vault, VaultSnapshot};

use std::sync::Arc;

/// The three LUNs a node persists to.
#[derive(Clone)]
pub struct LunSet {
    /// Change-detection record LUN.
    pub cdr: Arc<dyn BlockDevice>,
    /// Tag LUN.
    pub tags: Arc<dyn BlockDevice>,
    /// Vault LUN.
    pub vault: Arc<dyn BlockDevice>,
}

impl LunSet {
    /// In-memory LUNs sized for `layout`.
    pub fn in_memory(layout: &Layout) -> Self {
        Self {
            cdr: Arc::new(MemoryLun::new(layout.cdr_blocks())),
            tags: Arc::new(MemoryLun::new(layout.tag_blocks())),
            vault: Arc::new(MemoryLun::new(layout.vault_blocks())),
        }
    }

    /// File-backed LUNs in `dir`, created and sized for `layout` if absent.
    pub fn in_dir(dir: impl AsRef<std::path::Path>, layout: &Layout) -> crate::error::Result<Self> {
        let dir = dir.as_ref();
        let open = |name: &str, blocks: u64| -> crate::error::Result<Arc<dyn BlockDevice>> {
            let path = dir.join(name);
            let lun = if path.exists() {
                FileLun::open(&path)?
            } else {
                FileLun::create(&path, blocks)?
            };
            Ok(Arc::new(lun))
        };
        Ok(Self {
            cdr: open("cdr.lun", layout.cdr_blocks())?,
            tags: open("tags.lun", layout.tag_blocks())?,
            vault: open("vault.lun", layout.vault_blocks())?,
        })
    }
}

impl std::fmt::Debug for LunSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LunSet")
            .field("cdr_blocks", &self.cdr.block_count())
            .field("tag_blocks", &self.tags.block_count())
            .field("vault_blocks", &self.vault.block_count())
            .finish()
    }
}
