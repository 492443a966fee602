//! Tag directory: hash-indexed allocated tags plus a LIFO free pool.
//!
//! Every tag lives in exactly one container. Free tags sit on the free
//! stack; allocated tags hang off a hash bucket chain keyed by their
//! allocation id. Tags reserved by a tracker sit briefly in neither, marked
//! [`TagHome::Reserved`], until the tracker completes and inserts them.
//!
//! Chains are intrusive: each tag stores the index of the next tag in its
//! bucket, so no per-insert allocation happens.
//!
//! The directory also owns the persistent memory backing: tag slots and
//! buffers are read and written through the segment at the carved
//! addresses.

use super::record::{ClientLock, ClusterTag, SectorMask, TAG_RECORD_LEN, TagHome, TagRecord};
use crate::config::BUFFER_SIZE;
use crate::error::{Error, Result};
use crate::ident::{AllocationId, NodeId, OwnerId};
use crate::memory::{MemoryCarving, PersistentSegment};
use crate::persistence::checksum::buffer_checksum;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Hash-indexed tag directory with a free pool.
pub struct TagDirectory {
    tags: Vec<ClusterTag>,
    buckets: Vec<Option<u32>>,
    free: Vec<u32>,
    segment: Arc<PersistentSegment>,
    carving: MemoryCarving,
    node: NodeId,
}

impl TagDirectory {
    /// Build a directory over a carving with every tag free.
    ///
    /// Tag slots in persistent memory are not touched; call
    /// [`TagDirectory::format`] or [`TagDirectory::load_from_memory`] next.
    pub fn new(carving: MemoryCarving, segment: Arc<PersistentSegment>, node: NodeId) -> Self {
        let tags: Vec<ClusterTag> = carving
            .pairs()
            .iter()
            .enumerate()
            .map(|(i, pair)| ClusterTag::new(i as u32, node, *pair))
            .collect();
        let buckets = vec![None; tags.len().max(1).next_power_of_two()];
        // Reverse so the lowest index pops first.
        let free = (0..tags.len() as u32).rev().collect();

        Self {
            tags,
            buckets,
            free,
            segment,
            carving,
            node,
        }
    }

    /// Node the directory belongs to.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Carving behind the directory.
    pub fn carving(&self) -> &MemoryCarving {
        &self.carving
    }

    /// Total tag count.
    #[inline]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether there are no tags.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Tags on the free list.
    #[inline]
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Tags in the hash directory.
    pub fn allocated_count(&self) -> usize {
        self.tags
            .iter()
            .filter(|t| t.home == TagHome::Directory)
            .count()
    }

    /// Borrow a tag.
    pub fn tag(&self, index: u32) -> Option<&ClusterTag> {
        self.tags.get(index as usize)
    }

    pub(crate) fn tag_mut(&mut self, index: u32) -> Option<&mut ClusterTag> {
        self.tags.get_mut(index as usize)
    }

    /// Iterate over every tag in index order.
    pub fn tags(&self) -> impl Iterator<Item = &ClusterTag> {
        self.tags.iter()
    }

    // ========================================================================
    // Free pool
    // ========================================================================

    /// Pop the most recently freed tag.
    pub fn pop_free(&mut self) -> Option<u32> {
        let index = self.free.pop()?;
        self.tags[index as usize].home = TagHome::Reserved;
        Some(index)
    }

    /// Return a reserved tag to the free pool.
    pub fn push_free(&mut self, index: u32) {
        let tag = &mut self.tags[index as usize];
        debug_assert_eq!(tag.home, TagHome::Reserved, "tag {index} pushed twice");
        tag.reset();
        tag.home = TagHome::Free;
        self.free.push(index);
    }

    /// Reserve `count` free tags whose buffers are physically adjacent.
    ///
    /// Returns the run in ascending index order, or `None` if no such run is
    /// free right now.
    pub fn take_contiguous(&mut self, count: usize) -> Option<Vec<u32>> {
        if count == 0 || count > self.free.len() {
            return None;
        }

        let mut run_start = 0u32;
        let mut run_len = 0usize;
        for i in 0..self.tags.len() as u32 {
            let extends = run_len > 0 && self.carving.buffers_adjacent(i - 1);
            if self.tags[i as usize].home != TagHome::Free {
                run_len = 0;
                continue;
            }
            if extends {
                run_len += 1;
            } else {
                run_start = i;
                run_len = 1;
            }
            if run_len == count {
                let run: Vec<u32> = (run_start..run_start + count as u32).collect();
                self.free.retain(|idx| !run.contains(idx));
                for idx in &run {
                    self.tags[*idx as usize].home = TagHome::Reserved;
                }
                return Some(run);
            }
        }
        None
    }

    // ========================================================================
    // Hash directory
    // ========================================================================

    /// Bucket for an allocation id.
    ///
    /// Owner and buffer id are combined and the high half is folded down so
    /// both spaces affect the low bits used for the bucket.
    pub fn hash(&self, id: &AllocationId) -> usize {
        let mut h = id.buffer ^ (u64::from(id.owner.raw()) << 40) ^ u64::from(id.owner.raw());
        h ^= h >> 32;
        h ^= h >> 16;
        (h as usize) & (self.buckets.len() - 1)
    }

    /// Link a reserved tag into its bucket chain.
    pub fn insert(&mut self, index: u32) {
        let id = self.tags[index as usize].id;
        debug_assert!(!id.is_none(), "inserting tag {index} without an id");
        let bucket = self.hash(&id);
        let tag = &mut self.tags[index as usize];
        tag.hash_next = self.buckets[bucket];
        tag.home = TagHome::Directory;
        self.buckets[bucket] = Some(index);
    }

    /// Unlink the first tag carrying `id` from its chain.
    ///
    /// The tag is left reserved; callers push it to the free pool.
    pub fn delete(&mut self, id: &AllocationId) -> Result<u32> {
        let bucket = self.hash(id);
        let mut prev: Option<u32> = None;
        let mut cursor = self.buckets[bucket];

        while let Some(index) = cursor {
            let next = self.tags[index as usize].hash_next;
            if self.tags[index as usize].id == *id {
                match prev {
                    Some(p) => self.tags[p as usize].hash_next = next,
                    None => self.buckets[bucket] = next,
                }
                let tag = &mut self.tags[index as usize];
                tag.hash_next = None;
                tag.home = TagHome::Reserved;
                return Ok(index);
            }
            prev = cursor;
            cursor = next;
        }
        Err(Error::NotFound(format!("allocation {id}")))
    }

    /// Every tag carrying `id`, ascending by index.
    pub fn lookup(&self, id: &AllocationId) -> Vec<u32> {
        let mut found = Vec::new();
        let mut cursor = self.buckets[self.hash(id)];
        while let Some(index) = cursor {
            let tag = &self.tags[index as usize];
            if tag.id == *id {
                found.push(index);
            }
            cursor = tag.hash_next;
        }
        found.sort_unstable();
        found
    }

    /// Whether any tag carries `id`.
    pub fn contains(&self, id: &AllocationId) -> bool {
        let mut cursor = self.buckets[self.hash(id)];
        while let Some(index) = cursor {
            let tag = &self.tags[index as usize];
            if tag.id == *id {
                return true;
            }
            cursor = tag.hash_next;
        }
        false
    }

    /// Allocations of one owner keyed by their lowest tag index.
    pub fn owner_allocations(&self, owner: OwnerId) -> BTreeMap<u32, AllocationId> {
        let mut first: BTreeMap<AllocationId, u32> = BTreeMap::new();
        for tag in &self.tags {
            if tag.home == TagHome::Directory && tag.id.owner == owner {
                first.entry(tag.id).or_insert(tag.index);
            }
        }
        first.into_iter().map(|(id, idx)| (idx, id)).collect()
    }

    /// Every allocation in the directory with the bytes its tags carry.
    pub fn allocations(&self) -> BTreeMap<AllocationId, u64> {
        let mut out = BTreeMap::new();
        for tag in &self.tags {
            if tag.home == TagHome::Directory {
                *out.entry(tag.id).or_insert(0) += tag.byte_len;
            }
        }
        out
    }

    /// Check that every tag is in exactly one container.
    pub fn check_partition(&self) -> bool {
        let mut on_free = vec![false; self.tags.len()];
        for idx in &self.free {
            if std::mem::replace(&mut on_free[*idx as usize], true) {
                return false;
            }
        }
        let mut chained = vec![false; self.tags.len()];
        for head in &self.buckets {
            let mut cursor = *head;
            while let Some(idx) = cursor {
                if std::mem::replace(&mut chained[idx as usize], true) {
                    return false;
                }
                cursor = self.tags[idx as usize].hash_next;
            }
        }
        self.tags.iter().all(|t| {
            let i = t.index as usize;
            match t.home {
                TagHome::Free => on_free[i] && !chained[i] && t.id.is_none(),
                TagHome::Directory => chained[i] && !on_free[i] && !t.id.is_none(),
                TagHome::Reserved => !chained[i] && !on_free[i],
            }
        })
    }

    // ========================================================================
    // Tag lifecycle
    // ========================================================================

    /// Stamp a reserved tag for a new allocation and link it in.
    ///
    /// The buffer is zeroed, no sector is valid, every sector is dirty, and
    /// both locks are taken exclusive on behalf of the allocating client.
    pub fn prepare(&mut self, index: u32, id: AllocationId, byte_len: u64) -> Result<()> {
        let address = self.tags[index as usize].placement.buffer_address;
        self.segment.fill(address, BUFFER_SIZE, 0)?;
        let checksum = self
            .segment
            .with_slice(address, BUFFER_SIZE, buffer_checksum)?;

        let tag = &mut self.tags[index as usize];
        tag.id = id;
        tag.node = self.node;
        tag.struct_locked = true;
        tag.client_lock = ClientLock::Exclusive;
        tag.valid = SectorMask::EMPTY;
        tag.dirty = SectorMask::FULL;
        tag.checksum = checksum;
        tag.byte_len = byte_len;
        self.insert(index);
        self.persist_tag(index)
    }

    /// Unlink and free every tag of `id`. Returns the freed indices.
    pub fn release(&mut self, id: &AllocationId) -> Result<Vec<u32>> {
        let mut freed = Vec::new();
        while let Ok(index) = self.delete(id) {
            self.push_free(index);
            self.persist_tag(index)?;
            freed.push(index);
        }
        if freed.is_empty() {
            return Err(Error::NotFound(format!("allocation {id}")));
        }
        freed.sort_unstable();
        Ok(freed)
    }

    /// Copy `data` into a tag's buffer at `offset`, update masks and checksum.
    pub fn commit(&mut self, index: u32, offset: u64, data: &[u8]) -> Result<()> {
        if offset
            .checked_add(data.len() as u64)
            .is_none_or(|end| end > BUFFER_SIZE as u64)
        {
            return Err(Error::InvalidArgument(format!(
                "commit {offset}+{} exceeds buffer",
                data.len()
            )));
        }
        let address = self.tags[index as usize].placement.buffer_address;
        self.segment.write(address + offset, data)?;
        let checksum = self
            .segment
            .with_slice(address, BUFFER_SIZE, buffer_checksum)?;

        let covered = SectorMask::covering(offset, data.len() as u64);
        let tag = &mut self.tags[index as usize];
        tag.valid = tag.valid.union(covered);
        tag.dirty = tag.dirty.minus(covered);
        tag.checksum = checksum;
        self.persist_tag(index)
    }

    /// Read from a tag's buffer.
    pub fn read_buffer(&self, index: u32, offset: u64, out: &mut [u8]) -> Result<()> {
        if offset
            .checked_add(out.len() as u64)
            .is_none_or(|end| end > BUFFER_SIZE as u64)
        {
            return Err(Error::InvalidArgument("read exceeds buffer".into()));
        }
        let address = self.tags[index as usize].placement.buffer_address;
        self.segment.read(address + offset, out)
    }

    /// Copy a whole buffer out.
    pub fn buffer_contents(&self, index: u32) -> Result<Vec<u8>> {
        let mut out = vec![0u8; BUFFER_SIZE];
        self.read_buffer(index, 0, &mut out)?;
        Ok(out)
    }

    /// Overwrite a whole buffer (reload path).
    pub fn load_buffer(&mut self, index: u32, data: &[u8]) -> Result<()> {
        let address = self.tags[index as usize].placement.buffer_address;
        self.segment.write(address, &data[..data.len().min(BUFFER_SIZE)])
    }

    /// Write a tag's durable record into its slot in persistent memory.
    pub fn persist_tag(&self, index: u32) -> Result<()> {
        let tag = &self.tags[index as usize];
        self.segment
            .write(tag.placement.tag_address, &tag.record().to_bytes())
    }

    /// Zero every tag slot and clear the directory.
    pub fn format(&mut self) -> Result<()> {
        self.clear();
        for i in 0..self.tags.len() as u32 {
            self.persist_tag(i)?;
        }
        Ok(())
    }

    /// Snapshot of every tag's durable record.
    pub fn records(&self) -> Vec<TagRecord> {
        self.tags.iter().map(ClusterTag::record).collect()
    }

    /// Rebuild the directory from the tag slots in persistent memory.
    ///
    /// Returns the number of allocated tags found.
    pub fn load_from_memory(&mut self) -> Result<usize> {
        let mut records = Vec::with_capacity(self.tags.len());
        for tag in &self.tags {
            let mut raw = [0u8; TAG_RECORD_LEN];
            self.segment.read(tag.placement.tag_address, &mut raw)?;
            let mut record = TagRecord::decode(&raw)?;
            record.index = tag.index;
            records.push(record);
        }
        self.rebuild(&records)
    }

    /// Rebuild the directory from reloaded records.
    ///
    /// Records are matched to tags by position. Allocated records go into the
    /// hash directory; the rest go to the free pool.
    pub fn rebuild(&mut self, records: &[TagRecord]) -> Result<usize> {
        if records.len() > self.tags.len() {
            return Err(Error::CorruptDurableState(format!(
                "{} tag records for {} tags",
                records.len(),
                self.tags.len()
            )));
        }
        self.clear();
        let mut allocated = 0;
        for (i, record) in records.iter().enumerate() {
            if !record.is_allocated() {
                continue;
            }
            let index = i as u32;
            self.free.retain(|idx| *idx != index);
            self.tags[i].restore(record);
            self.tags[i].home = TagHome::Reserved;
            self.insert(index);
            self.persist_tag(index)?;
            allocated += 1;
        }
        tracing::debug!(allocated, total = self.tags.len(), "tag directory rebuilt");
        Ok(allocated)
    }

    fn clear(&mut self) {
        for tag in &mut self.tags {
            tag.reset();
            tag.home = TagHome::Free;
        }
        self.buckets.iter_mut().for_each(|b| *b = None);
        self.free = (0..self.tags.len() as u32).rev().collect();
    }
}

impl std::fmt::Debug for TagDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TagDirectory")
            .field("tags", &self.tags.len())
            .field("free", &self.free.len())
            .field("buckets", &self.buckets.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::ClientId;
    use crate::memory::{CarveMode, SgElement, carve, required_bytes};

    fn directory(count: usize) -> TagDirectory {
        let sg = [SgElement::new(0x100_0000, required_bytes(count))];
        let segment = Arc::new(PersistentSegment::new(&sg).unwrap());
        let carving = carve(&sg, count, CarveMode::Strict).unwrap();
        let mut dir = TagDirectory::new(carving, segment, NodeId::A);
        dir.format().unwrap();
        dir
    }

    fn id(portion: u32, buffer: u64) -> AllocationId {
        AllocationId::new(OwnerId::create(ClientId::RAID, portion).unwrap(), buffer)
    }

    #[test]
    fn test_free_pool_is_lifo() {
        let mut dir = directory(4);
        let a = dir.pop_free().unwrap();
        let b = dir.pop_free().unwrap();
        assert_eq!((a, b), (0, 1));
        dir.push_free(b);
        assert_eq!(dir.pop_free(), Some(b));
        assert!(dir.check_partition());
    }

    #[test]
    fn test_prepare_and_release() {
        let mut dir = directory(4);
        let index = dir.pop_free().unwrap();
        dir.prepare(index, id(1, 10), 1000).unwrap();

        let tag = dir.tag(index).unwrap();
        assert_eq!(tag.home(), TagHome::Directory);
        assert!(tag.valid().is_empty());
        assert!(tag.dirty().is_full());
        assert_eq!(tag.client_lock(), ClientLock::Exclusive);
        assert_eq!(tag.checksum(), buffer_checksum(&[0u8; BUFFER_SIZE]));
        assert_eq!(dir.lookup(&id(1, 10)), vec![index]);
        assert!(dir.check_partition());

        assert_eq!(dir.release(&id(1, 10)).unwrap(), vec![index]);
        assert!(!dir.contains(&id(1, 10)));
        assert_eq!(dir.free_count(), 4);
        assert!(dir.check_partition());
    }

    #[test]
    fn test_delete_missing() {
        let mut dir = directory(2);
        assert!(matches!(dir.delete(&id(1, 1)), Err(Error::NotFound(_))));
        assert!(dir.release(&id(1, 1)).is_err());
    }

    #[test]
    fn test_chain_collisions() {
        // One bucket: every id shares a chain.
        let mut dir = directory(1);
        assert_eq!(dir.buckets.len(), 1);
        let t = dir.pop_free().unwrap();
        dir.prepare(t, id(1, 1), 1).unwrap();

        // Force a second entry into the same chain by hand.
        let placement = dir.tags[0].placement;
        dir.tags.push(ClusterTag::new(1, NodeId::A, placement));
        dir.tags[1].id = id(2, 2);
        dir.tags[1].home = TagHome::Reserved;
        dir.insert(1);

        assert_eq!(dir.lookup(&id(1, 1)), vec![0]);
        assert_eq!(dir.lookup(&id(2, 2)), vec![1]);
        assert_eq!(dir.delete(&id(1, 1)).unwrap(), 0);
        assert_eq!(dir.lookup(&id(2, 2)), vec![1]);
    }

    #[test]
    fn test_take_contiguous() {
        let mut dir = directory(6);
        let hole = dir.pop_free().unwrap(); // tag 0
        let _ = dir.pop_free().unwrap(); // tag 1
        dir.push_free(hole);

        let run = dir.take_contiguous(3).unwrap();
        assert_eq!(run, vec![2, 3, 4]);
        assert!(dir.take_contiguous(3).is_none());
        assert_eq!(dir.free_count(), 2);
    }

    #[test]
    fn test_commit_updates_masks() {
        let mut dir = directory(1);
        let t = dir.pop_free().unwrap();
        dir.prepare(t, id(1, 5), 4096).unwrap();
        dir.commit(t, 512, &[0xAB; 1024]).unwrap();

        let tag = dir.tag(t).unwrap();
        assert_eq!(tag.valid().bits(), 0b110);
        assert_eq!(tag.dirty().bits(), !0b110);
        let contents = dir.buffer_contents(t).unwrap();
        assert_eq!(tag.checksum(), buffer_checksum(&contents));
        assert!(dir.commit(t, BUFFER_SIZE as u64 - 1, &[0; 2]).is_err());
    }

    #[test]
    fn test_offsets_near_u64_max_rejected() {
        let mut dir = directory(1);
        let t = dir.pop_free().unwrap();
        dir.prepare(t, id(1, 6), 64).unwrap();
        assert!(matches!(
            dir.commit(t, u64::MAX, &[1; 4]),
            Err(Error::InvalidArgument(_))
        ));
        let mut out = [0u8; 4];
        assert!(matches!(
            dir.read_buffer(t, u64::MAX - 1, &mut out),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_load_from_memory() {
        let mut dir = directory(3);
        let t = dir.pop_free().unwrap();
        dir.prepare(t, id(4, 44), 100).unwrap();
        dir.commit(t, 0, b"persisted").unwrap();
        let before = dir.tag(t).unwrap().record();

        let loaded = dir.load_from_memory().unwrap();
        assert_eq!(loaded, 1);
        let after = dir.tag(t).unwrap().record();
        assert_eq!(after.id, before.id);
        assert_eq!(after.valid, before.valid);
        assert_eq!(after.checksum, before.checksum);
        assert_eq!(dir.free_count(), 2);
        assert!(dir.check_partition());
    }
}
