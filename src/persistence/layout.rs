//! Durable layout of the three LUNs.
//!
//! Offsets come from a static region table and are computed once when the
//! [`Layout`] is built:
//!
//! | LUN | Contents |
//! |-----|----------|
//! | CDR | header, validity records (this node, peer, vault), owner change table |
//! | Tags | header, one block per tag |
//! | Vault | header, 64 blocks per buffer |

use super::lun::BLOCK_PAYLOAD;
use crate::config::BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::ident::OWNER_ID_BITS;
use bytes::{Buf, BufMut};

/// CDR header magic.
pub const CDR_MAGIC: [u8; 8] = *b"CMS-CDR1";

/// Tag LUN header magic.
pub const TAG_MAGIC: [u8; 8] = *b"CMS-TAG1";

/// Vault LUN header magic.
pub const VAULT_MAGIC: [u8; 8] = *b"CMS-VLT1";

/// On-disk format version shared by all three headers.
pub const LAYOUT_VERSION: u64 = 1;

/// Blocks holding one buffer in the vault.
pub const BLOCKS_PER_BUFFER: usize = BUFFER_SIZE / BLOCK_PAYLOAD;

/// Blocks holding the owner change table (one bit per owner id).
pub const CHANGE_TABLE_BLOCKS: usize = (1usize << OWNER_ID_BITS) / 8 / BLOCK_PAYLOAD;

/// Sub-regions of the CDR LUN, in on-disk order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CdrArea {
    /// Magic and version.
    Header,
    /// This node's generation.
    ThisNode,
    /// Last generation advertised by the peer.
    Peer,
    /// Generation of the vault image.
    Vault,
    /// Owner clean/dirty bitmap.
    ChangeTable,
}

/// Static CDR table: area and its size in blocks.
const CDR_TABLE: [(CdrArea, usize); 5] = [
    (CdrArea::Header, 1),
    (CdrArea::ThisNode, 1),
    (CdrArea::Peer, 1),
    (CdrArea::Vault, 1),
    (CdrArea::ChangeTable, CHANGE_TABLE_BLOCKS),
];

/// Start and length of one area, in blocks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    /// First block.
    pub lba: u64,
    /// Block count.
    pub blocks: usize,
}

/// Computed block addresses of every region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    buffer_count: usize,
    cdr: [Extent; CDR_TABLE.len()],
}

impl Layout {
    /// Layout for `buffer_count` buffers/tags.
    pub fn new(buffer_count: usize) -> Self {
        let mut cdr = [Extent { lba: 0, blocks: 0 }; CDR_TABLE.len()];
        let mut lba = 0u64;
        for (slot, (_, blocks)) in cdr.iter_mut().zip(CDR_TABLE) {
            *slot = Extent { lba, blocks };
            lba += blocks as u64;
        }
        Self { buffer_count, cdr }
    }

    /// Buffers covered.
    #[inline]
    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    /// Extent of a CDR area.
    pub fn cdr(&self, area: CdrArea) -> Extent {
        let pos = CDR_TABLE
            .iter()
            .position(|(a, _)| *a == area)
            .unwrap_or(0);
        self.cdr[pos]
    }

    /// Blocks the CDR LUN needs.
    pub fn cdr_blocks(&self) -> u64 {
        self.cdr.iter().map(|e| e.blocks as u64).sum()
    }

    /// Block of a tag's record.
    #[inline]
    pub fn tag_lba(&self, index: u32) -> u64 {
        1 + u64::from(index)
    }

    /// Blocks the tag LUN needs.
    pub fn tag_blocks(&self) -> u64 {
        1 + self.buffer_count as u64
    }

    /// First block of a buffer's vault copy.
    #[inline]
    pub fn vault_lba(&self, index: u32) -> u64 {
        1 + u64::from(index) * BLOCKS_PER_BUFFER as u64
    }

    /// Blocks the vault LUN needs.
    pub fn vault_blocks(&self) -> u64 {
        1 + (self.buffer_count * BLOCKS_PER_BUFFER) as u64
    }
}

/// Magic and version stamped at block 0 of a LUN. The tag and vault
/// headers also carry the unit count they were formatted for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionHeader {
    /// Region magic.
    pub magic: [u8; 8],
    /// Format version.
    pub version: u64,
    /// Tags or buffers covered (zero for the CDR).
    pub units: u64,
}

impl RegionHeader {
    /// Header for a region.
    pub fn new(magic: [u8; 8], units: u64) -> Self {
        Self {
            magic,
            version: LAYOUT_VERSION,
            units,
        }
    }

    /// Encode into one block payload.
    pub fn to_block(&self) -> [u8; BLOCK_PAYLOAD] {
        let mut block = [0u8; BLOCK_PAYLOAD];
        let mut out = &mut block[..];
        out.put_slice(&self.magic);
        out.put_u64_le(self.version);
        out.put_u64_le(self.units);
        block
    }

    /// Decode from a block payload.
    pub fn from_block(mut block: &[u8]) -> Result<Self> {
        if block.len() < 24 {
            return Err(Error::CorruptDurableState("short region header".into()));
        }
        let mut magic = [0u8; 8];
        block.copy_to_slice(&mut magic);
        let version = block.get_u64_le();
        let units = block.get_u64_le();
        Ok(Self {
            magic,
            version,
            units,
        })
    }

    /// Whether this header matches `expected` in magic and version.
    pub fn matches(&self, expected: &RegionHeader) -> bool {
        self.magic == expected.magic && self.version == expected.version
    }
}
