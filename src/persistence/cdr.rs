//! Change-detection record (CDR).
//!
//! The CDR LUN holds a header, three validity records (this node, peer,
//! vault) and the owner change table. A missing or mismatched header means
//! the LUN was never initialized: it is re-stamped and reported as
//! [`CdrStatus::NotYetValid`], never as an error.

use super::io::IoEngine;
use super::layout::{CDR_MAGIC, CdrArea, Layout, RegionHeader};
use super::lun::{BLOCK_PAYLOAD, BlockDevice, TransferBuffer};
use crate::error::Result;
use crate::ident::OWNER_ID_BITS;
use crate::memory::AtomicBitmap;
use bitflags::bitflags;
use std::sync::Arc;

bitflags! {
    /// Images that may hold the authoritative buffer population.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct ImageSet: u8 {
        /// This node's persistent memory.
        const THIS_NODE = 1 << 0;
        /// The peer's memory.
        const PEER = 1 << 1;
        /// The on-disk vault.
        const VAULT = 1 << 2;
    }
}

/// Which validity record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Image {
    /// This node.
    ThisNode,
    /// The peer.
    Peer,
    /// The vault.
    Vault,
}

impl Image {
    fn area(self) -> CdrArea {
        match self {
            Image::ThisNode => CdrArea::ThisNode,
            Image::Peer => CdrArea::Peer,
            Image::Vault => CdrArea::Vault,
        }
    }
}

/// Whether the CDR held a valid header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdrStatus {
    /// Header matched.
    Valid,
    /// Header was missing or stale and has been re-stamped.
    NotYetValid,
}

/// Generation numbers of the three images.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ValidityRecords {
    /// This node.
    pub this_node: u64,
    /// The peer.
    pub peer: u64,
    /// The vault.
    pub vault: u64,
}

impl ValidityRecords {
    /// Highest generation across all three.
    pub fn max(&self) -> u64 {
        self.this_node.max(self.peer).max(self.vault)
    }
}

/// Pick the authoritative images: those with the strictly highest
/// generation, ties included. This node's memory only counts if it
/// actually survived the restart. Empty when nothing was ever valid.
pub fn arbitrate(records: &ValidityRecords, memory_persisted: bool) -> ImageSet {
    let candidates = [
        (ImageSet::THIS_NODE, memory_persisted.then_some(records.this_node)),
        (ImageSet::PEER, Some(records.peer)),
        (ImageSet::VAULT, Some(records.vault)),
    ];
    let best = candidates
        .iter()
        .filter_map(|(_, g)| *g)
        .max()
        .unwrap_or(0);
    if best == 0 {
        return ImageSet::empty();
    }
    candidates
        .iter()
        .filter(|(_, g)| *g == Some(best))
        .fold(ImageSet::empty(), |acc, (image, _)| acc | *image)
}

/// Access to the CDR LUN.
pub struct ChangeDetectionRecord {
    device: Arc<dyn BlockDevice>,
    layout: Layout,
    io: Arc<IoEngine>,
}

impl ChangeDetectionRecord {
    /// CDR over `device`.
    pub fn new(device: Arc<dyn BlockDevice>, layout: Layout, io: Arc<IoEngine>) -> Self {
        Self { device, layout, io }
    }

    /// Verify the header, re-stamping it (and zeroing the validity records)
    /// if it does not match.
    pub fn check_header(&self) -> Result<CdrStatus> {
        let expected = RegionHeader::new(CDR_MAGIC, 0);
        let at = self.layout.cdr(CdrArea::Header).lba;
        let found = self
            .io
            .read(&self.device, at, 1)
            .and_then(|block| RegionHeader::from_block(&block));
        match found {
            Ok(header) if header.matches(&expected) => return Ok(CdrStatus::Valid),
            Ok(header) => tracing::warn!(
                magic = ?header.magic,
                version = header.version,
                "CDR header mismatch, re-stamping"
            ),
            Err(e) => tracing::warn!(error = %e, "CDR header unreadable, re-stamping"),
        }
        for image in [Image::ThisNode, Image::Peer, Image::Vault] {
            self.write_generation(image, 0)?;
        }
        self.io.write(&self.device, at, expected.to_block().to_vec())?;
        Ok(CdrStatus::NotYetValid)
    }

    /// Read one validity record.
    pub fn read_generation(&self, image: Image) -> Result<u64> {
        let at = self.layout.cdr(image.area()).lba;
        let block = self.io.read(&self.device, at, 1)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&block[..8]);
        Ok(u64::from_le_bytes(raw))
    }

    /// Persist one validity record.
    pub fn write_generation(&self, image: Image, generation: u64) -> Result<()> {
        let at = self.layout.cdr(image.area()).lba;
        let mut block = vec![0u8; BLOCK_PAYLOAD];
        block[..8].copy_from_slice(&generation.to_le_bytes());
        self.io.write(&self.device, at, block)
    }

    /// All three records.
    pub fn read_validity(&self) -> Result<ValidityRecords> {
        Ok(ValidityRecords {
            this_node: self.read_generation(Image::ThisNode)?,
            peer: self.read_generation(Image::Peer)?,
            vault: self.read_generation(Image::Vault)?,
        })
    }

    /// Persist the owner change table.
    pub fn store_change_table(&self, table: &AtomicBitmap) -> Result<()> {
        let extent = self.layout.cdr(CdrArea::ChangeTable);
        let bytes = table.to_bytes();
        let bulk = self.io.bulk();
        let step = self.io.max_blocks().max(1) * BLOCK_PAYLOAD;
        for (i, chunk) in bytes.chunks(step).enumerate() {
            let lba = extent.lba + (i * self.io.max_blocks().max(1)) as u64;
            bulk.write(&self.device, lba, TransferBuffer::detached(chunk.to_vec()))?;
        }
        bulk.wait()
    }

    /// Load the owner change table.
    pub fn load_change_table(&self) -> Result<AtomicBitmap> {
        let extent = self.layout.cdr(CdrArea::ChangeTable);
        let bytes = self.io.read(&self.device, extent.lba, extent.blocks)?;
        Ok(AtomicBitmap::from_bytes(1 << OWNER_ID_BITS, &bytes))
    }
}

impl std::fmt::Debug for ChangeDetectionRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetectionRecord")
            .field("blocks", &self.layout.cdr_blocks())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PersistenceConfig;
    use crate::persistence::lun::MemoryLun;

    fn cdr() -> (ChangeDetectionRecord, Arc<MemoryLun>) {
        let layout = Layout::new(4);
        let lun = Arc::new(MemoryLun::new(layout.cdr_blocks()));
        let io = Arc::new(IoEngine::start(&PersistenceConfig::default()).unwrap());
        let device: Arc<dyn BlockDevice> = lun.clone();
        (ChangeDetectionRecord::new(device, layout, io), lun)
    }

    #[test]
    fn test_arbitration_single_winner() {
        let r = ValidityRecords {
            this_node: 5,
            peer: 3,
            vault: 3,
        };
        assert_eq!(arbitrate(&r, true), ImageSet::THIS_NODE);
    }

    #[test]
    fn test_arbitration_tie() {
        let r = ValidityRecords {
            this_node: 5,
            peer: 5,
            vault: 3,
        };
        assert_eq!(arbitrate(&r, true), ImageSet::THIS_NODE | ImageSet::PEER);
    }

    #[test]
    fn test_arbitration_ignores_lost_memory() {
        let r = ValidityRecords {
            this_node: 5,
            peer: 3,
            vault: 4,
        };
        assert_eq!(arbitrate(&r, false), ImageSet::VAULT);
        assert!(arbitrate(&ValidityRecords::default(), true).is_empty());
    }

    #[test]
    fn test_fresh_lun_not_yet_valid_then_valid() {
        let (cdr, _) = cdr();
        assert_eq!(cdr.check_header().unwrap(), CdrStatus::NotYetValid);
        assert_eq!(cdr.check_header().unwrap(), CdrStatus::Valid);
        assert_eq!(cdr.read_validity().unwrap(), ValidityRecords::default());
    }

    #[test]
    fn test_generation_round_trip() {
        let (cdr, _) = cdr();
        cdr.check_header().unwrap();
        cdr.write_generation(Image::Vault, 42).unwrap();
        cdr.write_generation(Image::Peer, 7).unwrap();
        let r = cdr.read_validity().unwrap();
        assert_eq!(r.vault, 42);
        assert_eq!(r.peer, 7);
        assert_eq!(r.this_node, 0);
    }

    #[test]
    fn test_corrupt_header_restamped() {
        let (cdr, lun) = cdr();
        cdr.check_header().unwrap();
        cdr.write_generation(Image::ThisNode, 9).unwrap();
        lun.corrupt(0);
        assert_eq!(cdr.check_header().unwrap(), CdrStatus::NotYetValid);
        assert_eq!(cdr.read_generation(Image::ThisNode).unwrap(), 0);
    }

    #[test]
    fn test_change_table_round_trip() {
        let (cdr, _) = cdr();
        let table = AtomicBitmap::new(1 << OWNER_ID_BITS);
        table.set(3);
        table.set((1 << OWNER_ID_BITS) - 1);
        cdr.store_change_table(&table).unwrap();
        let back = cdr.load_change_table().unwrap();
        assert!(back.is_set(3));
        assert!(back.is_set((1 << OWNER_ID_BITS) - 1));
        assert_eq!(back.count_set(), 2);
    }
}
