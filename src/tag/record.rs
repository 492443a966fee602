//! Cluster tags: per-buffer metadata and its packed durable form.

use crate::config::{BUFFER_SIZE, SECTOR_SIZE, SECTORS_PER_BUFFER};
use crate::error::{Error, Result};
use crate::ident::{AllocationId, NodeId, OwnerId};
use crate::memory::CarvedPair;
use bytes::{Buf, BufMut};
use std::fmt;

// ============================================================================
// Sector masks
// ============================================================================

/// One bit per 512-byte sector of a 32 KiB buffer.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SectorMask(u64);

impl SectorMask {
    /// No sectors.
    pub const EMPTY: SectorMask = SectorMask(0);
    /// Every sector of the buffer.
    pub const FULL: SectorMask = SectorMask(u64::MAX);

    /// Wrap raw bits.
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// Sectors touched by `len` bytes at byte `offset` within one buffer.
    ///
    /// The range is clamped to the buffer.
    pub fn covering(offset: u64, len: u64) -> Self {
        let end = (offset + len).min(BUFFER_SIZE as u64);
        if len == 0 || offset >= end {
            return Self::EMPTY;
        }
        let first = (offset / SECTOR_SIZE as u64) as u32;
        let last = ((end - 1) / SECTOR_SIZE as u64) as u32;
        let count = last - first + 1;
        if count as usize >= SECTORS_PER_BUFFER {
            return Self::FULL;
        }
        Self(((1u64 << count) - 1) << first)
    }

    /// Union.
    #[inline]
    pub fn union(self, other: SectorMask) -> Self {
        Self(self.0 | other.0)
    }

    /// Sectors in `self` but not in `other`.
    #[inline]
    pub fn minus(self, other: SectorMask) -> Self {
        Self(self.0 & !other.0)
    }

    /// Whether no sector is set.
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every sector is set.
    #[inline]
    pub fn is_full(self) -> bool {
        self.0 == u64::MAX
    }

    /// Number of set sectors.
    #[inline]
    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

impl fmt::Debug for SectorMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SectorMask({:#018x})", self.0)
    }
}

// ============================================================================
// Client lock
// ============================================================================

/// Client-visible advisory lock on a tag.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ClientLock {
    /// Unlocked.
    #[default]
    None,
    /// Held shared by this many holders.
    Shared(u32),
    /// Held exclusive.
    Exclusive,
}

impl ClientLock {
    /// Durable one-byte encoding; the shared holder count is not persisted.
    pub fn as_byte(self) -> u8 {
        match self {
            ClientLock::None => 0,
            ClientLock::Shared(_) => 1,
            ClientLock::Exclusive => 2,
        }
    }
}

// ============================================================================
// Durable tag record
// ============================================================================

/// Packed size of a [`TagRecord`].
pub const TAG_RECORD_LEN: usize = 4 + 8 + 8 + 8 + 4 + 4 + 1 + 1 + 1;

/// The durable form of a tag.
///
/// Field order and widths are fixed; integers are little-endian:
///
/// | bytes | field |
/// |-------|-------|
/// | 0..4 | owner id (low 20 bits) |
/// | 4..12 | buffer id |
/// | 12..20 | valid sector mask |
/// | 20..28 | dirty sector mask |
/// | 28..32 | buffer checksum |
/// | 32..36 | tag index |
/// | 36 | owning node flag |
/// | 37 | structural lock |
/// | 38 | client lock |
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TagRecord {
    /// Allocation the tag belongs to; [`AllocationId::NONE`] when free.
    pub id: AllocationId,
    /// Sectors holding committed data.
    pub valid: SectorMask,
    /// Sectors not yet written back.
    pub dirty: SectorMask,
    /// Checksum of buffer contents.
    pub checksum: u32,
    /// Tag index, equal to the buffer index.
    pub index: u32,
    /// Node that owns the tag.
    pub node: NodeId,
    /// Structural lock byte.
    pub struct_lock: u8,
    /// Client lock byte (0 none, 1 shared, 2 exclusive).
    pub client_lock: u8,
}

impl TagRecord {
    /// Record for a free tag.
    pub fn free(index: u32, node: NodeId) -> Self {
        Self {
            id: AllocationId::NONE,
            valid: SectorMask::EMPTY,
            dirty: SectorMask::EMPTY,
            checksum: 0,
            index,
            node,
            struct_lock: 0,
            client_lock: 0,
        }
    }

    /// Whether the record describes an allocated tag.
    #[inline]
    pub fn is_allocated(&self) -> bool {
        !self.id.is_none()
    }

    /// Pack into `out`, which must hold at least [`TAG_RECORD_LEN`] bytes.
    pub fn encode(&self, mut out: &mut [u8]) {
        out.put_u32_le(self.id.owner.raw());
        out.put_u64_le(self.id.buffer);
        out.put_u64_le(self.valid.bits());
        out.put_u64_le(self.dirty.bits());
        out.put_u32_le(self.checksum);
        out.put_u32_le(self.index);
        out.put_u8(self.node.as_flag());
        out.put_u8(self.struct_lock);
        out.put_u8(self.client_lock);
    }

    /// Packed bytes.
    pub fn to_bytes(&self) -> [u8; TAG_RECORD_LEN] {
        let mut out = [0u8; TAG_RECORD_LEN];
        self.encode(&mut out);
        out
    }

    /// Unpack a record.
    ///
    /// # Errors
    ///
    /// `CorruptDurableState` if the input is short or the owner id does not
    /// fit the 20-bit field.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < TAG_RECORD_LEN {
            return Err(Error::CorruptDurableState(format!(
                "tag record is {} bytes, need {TAG_RECORD_LEN}",
                buf.len()
            )));
        }
        let owner = OwnerId::from_raw(buf.get_u32_le())
            .map_err(|e| Error::CorruptDurableState(e.to_string()))?;
        let buffer = buf.get_u64_le();
        let valid = SectorMask(buf.get_u64_le());
        let dirty = SectorMask(buf.get_u64_le());
        let checksum = buf.get_u32_le();
        let index = buf.get_u32_le();
        let node = NodeId::from_flag(buf.get_u8());
        let struct_lock = buf.get_u8();
        let client_lock = buf.get_u8();

        let id = if owner.is_none() {
            AllocationId::NONE
        } else {
            AllocationId::new(owner, buffer)
        };
        Ok(Self {
            id,
            valid,
            dirty,
            checksum,
            index,
            node,
            struct_lock,
            client_lock,
        })
    }
}

// ============================================================================
// In-memory tag
// ============================================================================

/// Which container a tag currently lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TagHome {
    /// On the free list.
    Free,
    /// In the hash directory.
    Directory,
    /// Reserved by a tracker, between the two.
    Reserved,
}

/// Metadata for one persistent buffer.
#[derive(Clone, Debug)]
pub struct ClusterTag {
    pub(crate) index: u32,
    pub(crate) id: AllocationId,
    pub(crate) valid: SectorMask,
    pub(crate) dirty: SectorMask,
    pub(crate) checksum: u32,
    pub(crate) node: NodeId,
    pub(crate) struct_locked: bool,
    pub(crate) client_lock: ClientLock,
    /// Bytes of the owning request carried by this tag.
    pub(crate) byte_len: u64,
    pub(crate) placement: CarvedPair,
    pub(crate) home: TagHome,
    pub(crate) hash_next: Option<u32>,
}

impl ClusterTag {
    pub(crate) fn new(index: u32, node: NodeId, placement: CarvedPair) -> Self {
        Self {
            index,
            id: AllocationId::NONE,
            valid: SectorMask::EMPTY,
            dirty: SectorMask::EMPTY,
            checksum: 0,
            node,
            struct_locked: false,
            client_lock: ClientLock::None,
            byte_len: 0,
            placement,
            home: TagHome::Free,
            hash_next: None,
        }
    }

    /// Tag index.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Allocation identifier.
    #[inline]
    pub fn id(&self) -> AllocationId {
        self.id
    }

    /// Valid sectors.
    #[inline]
    pub fn valid(&self) -> SectorMask {
        self.valid
    }

    /// Dirty sectors.
    #[inline]
    pub fn dirty(&self) -> SectorMask {
        self.dirty
    }

    /// Buffer checksum.
    #[inline]
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Owning node.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Client lock state.
    #[inline]
    pub fn client_lock(&self) -> ClientLock {
        self.client_lock
    }

    /// Bytes of the allocation this tag accounts for.
    #[inline]
    pub fn byte_len(&self) -> u64 {
        self.byte_len
    }

    /// Physical placement of tag slot and buffer.
    #[inline]
    pub fn placement(&self) -> CarvedPair {
        self.placement
    }

    /// Current container.
    #[inline]
    pub fn home(&self) -> TagHome {
        self.home
    }

    /// Durable snapshot.
    pub fn record(&self) -> TagRecord {
        TagRecord {
            id: self.id,
            valid: self.valid,
            dirty: self.dirty,
            checksum: self.checksum,
            index: self.index,
            node: self.node,
            struct_lock: u8::from(self.struct_locked),
            client_lock: self.client_lock.as_byte(),
        }
    }

    /// Take a shared lock.
    ///
    /// # Errors
    ///
    /// `LockConflict` while held exclusive.
    pub fn lock_shared(&mut self) -> Result<()> {
        self.client_lock = match self.client_lock {
            ClientLock::None => ClientLock::Shared(1),
            ClientLock::Shared(n) => ClientLock::Shared(n + 1),
            ClientLock::Exclusive => return Err(Error::LockConflict { tag: self.index }),
        };
        Ok(())
    }

    /// Take the exclusive lock.
    ///
    /// # Errors
    ///
    /// `LockConflict` while shared holders exist; `InvalidLockState` if
    /// already exclusive, since the lock is not reentrant.
    pub fn lock_exclusive(&mut self) -> Result<()> {
        match self.client_lock {
            ClientLock::None => {
                self.client_lock = ClientLock::Exclusive;
                Ok(())
            }
            ClientLock::Shared(_) => Err(Error::LockConflict { tag: self.index }),
            ClientLock::Exclusive => Err(Error::InvalidLockState {
                tag: self.index,
                detail: "exclusive lock already held",
            }),
        }
    }

    /// Drop one shared hold.
    pub fn unlock_shared(&mut self) -> Result<()> {
        self.client_lock = match self.client_lock {
            ClientLock::Shared(1) => ClientLock::None,
            ClientLock::Shared(n) => ClientLock::Shared(n - 1),
            _ => {
                return Err(Error::InvalidLockState {
                    tag: self.index,
                    detail: "shared lock not held",
                });
            }
        };
        Ok(())
    }

    /// Drop the exclusive lock.
    pub fn unlock_exclusive(&mut self) -> Result<()> {
        if self.client_lock != ClientLock::Exclusive {
            return Err(Error::InvalidLockState {
                tag: self.index,
                detail: "exclusive lock not held",
            });
        }
        self.client_lock = ClientLock::None;
        Ok(())
    }

    /// Reset to the free state. Placement and index are kept.
    pub(crate) fn reset(&mut self) {
        self.id = AllocationId::NONE;
        self.valid = SectorMask::EMPTY;
        self.dirty = SectorMask::EMPTY;
        self.checksum = 0;
        self.struct_locked = false;
        self.client_lock = ClientLock::None;
        self.byte_len = 0;
        self.hash_next = None;
    }

    /// Take contents from a reloaded record. Locks are not restored since no
    /// holder survives a restart.
    pub(crate) fn restore(&mut self, record: &TagRecord) {
        self.id = record.id;
        self.valid = record.valid;
        self.dirty = record.dirty;
        self.checksum = record.checksum;
        self.node = record.node;
        self.struct_locked = false;
        self.client_lock = ClientLock::None;
        self.byte_len = if record.is_allocated() { BUFFER_SIZE as u64 } else { 0 };
        self.hash_next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::ClientId;

    fn sample_tag() -> ClusterTag {
        ClusterTag::new(
            7,
            NodeId::A,
            CarvedPair {
                tag_address: 0x1000,
                buffer_address: 0x8000,
            },
        )
    }

    #[test]
    fn test_sector_mask_covering() {
        assert_eq!(SectorMask::covering(0, 512).bits(), 1);
        assert_eq!(SectorMask::covering(511, 2).bits(), 0b11);
        assert_eq!(SectorMask::covering(1024, 1024).bits(), 0b1100);
        assert!(SectorMask::covering(0, BUFFER_SIZE as u64).is_full());
        assert!(SectorMask::covering(0, 0).is_empty());
        assert_eq!(SectorMask::covering(BUFFER_SIZE as u64 - 1, 100).bits(), 1 << 63);
    }

    #[test]
    fn test_record_layout() {
        let owner = OwnerId::create(ClientId::RAID, 3).unwrap();
        let record = TagRecord {
            id: AllocationId::new(owner, 0x1122_3344_5566_7788),
            valid: SectorMask::FULL,
            dirty: SectorMask::from_bits(0xF0),
            checksum: 0xDEAD_BEEF,
            index: 9,
            node: NodeId::B,
            struct_lock: 1,
            client_lock: 2,
        };
        let bytes = record.to_bytes();
        assert_eq!(bytes.len(), 39);
        assert_eq!(&bytes[0..4], &owner.raw().to_le_bytes());
        assert_eq!(&bytes[28..32], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(bytes[36], 1);
        assert_eq!(bytes[38], 2);
        assert_eq!(TagRecord::decode(&bytes).unwrap(), record);
    }

    #[test]
    fn test_record_zero_owner_is_free() {
        let mut bytes = [0u8; TAG_RECORD_LEN];
        bytes[4] = 0x55; // stray buffer id
        let record = TagRecord::decode(&bytes).unwrap();
        assert!(!record.is_allocated());
        assert_eq!(record.id, AllocationId::NONE);
    }

    #[test]
    fn test_record_rejects_wide_owner() {
        let mut bytes = [0u8; TAG_RECORD_LEN];
        bytes[0..4].copy_from_slice(&(1u32 << 20).to_le_bytes());
        assert!(matches!(
            TagRecord::decode(&bytes),
            Err(Error::CorruptDurableState(_))
        ));
        assert!(TagRecord::decode(&bytes[..10]).is_err());
    }

    #[test]
    fn test_shared_and_exclusive_exclude() {
        let mut tag = sample_tag();
        tag.lock_shared().unwrap();
        tag.lock_shared().unwrap();
        assert!(matches!(tag.lock_exclusive(), Err(Error::LockConflict { tag: 7 })));

        tag.unlock_shared().unwrap();
        tag.unlock_shared().unwrap();
        assert_eq!(tag.client_lock(), ClientLock::None);

        tag.lock_exclusive().unwrap();
        assert!(matches!(tag.lock_shared(), Err(Error::LockConflict { .. })));
    }

    #[test]
    fn test_exclusive_not_reentrant() {
        let mut tag = sample_tag();
        tag.lock_exclusive().unwrap();
        assert!(matches!(
            tag.lock_exclusive(),
            Err(Error::InvalidLockState { .. })
        ));
        tag.unlock_exclusive().unwrap();
        assert!(tag.unlock_exclusive().is_err());
        assert!(tag.unlock_shared().is_err());
    }
}
