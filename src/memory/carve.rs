//! Carving persistent memory into buffer + tag pairs.
//!
//! The carver walks the scatter list of persistent memory first-fit. It
//! reserves one node-record block, then repeatedly takes a buffer from the
//! *front* of a range (forward-aligned to the buffer size) and a tag slot
//! from the *back* of the same range (backward-aligned to a cache line):
//!
//! ```text
//! range:  ┌────────┬────────┬────────┬───────────── ─ ─ ──┬───┬───┬───┐
//!         │ buf 0  │ buf 1  │ buf 2  │       unused         │t2 │t1 │t0 │
//!         └────────┴────────┴────────┴───────────── ─ ─ ──┴───┴───┴───┘
//!         start →                                              ← end
//! ```
//!
//! Each allocation advances the chosen range's boundaries, so consecutive
//! buffers carved from one range are physically adjacent.

use super::SgElement;
use crate::config::BUFFER_SIZE;
use crate::error::{Error, Result};

/// Bytes reserved for one tag in persistent memory (one cache line).
pub const TAG_SLOT_SIZE: u64 = 64;

/// Cache line alignment for tag slots.
pub const CACHE_LINE: u64 = 64;

/// Bytes reserved for the persisted node record.
pub const NODE_RECORD_SIZE: u64 = 4096;

/// Whether a short carve is fatal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CarveMode {
    /// Initialization: fewer buffers than requested is an error.
    Strict,
    /// Reload: take what fits.
    BestEffort,
}

/// Physical placement of one tag and its buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CarvedPair {
    /// Address of the tag slot.
    pub tag_address: u64,
    /// Address of the buffer.
    pub buffer_address: u64,
}

/// Result of carving one node's persistent memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryCarving {
    scatter_list: Vec<SgElement>,
    node_record: u64,
    pairs: Vec<CarvedPair>,
    requested: usize,
}

impl MemoryCarving {
    /// Address of the node record block.
    pub fn node_record_address(&self) -> u64 {
        self.node_record
    }

    /// Carved pairs; the position in this slice is the tag index.
    pub fn pairs(&self) -> &[CarvedPair] {
        &self.pairs
    }

    /// Pair for one tag index.
    pub fn pair(&self, index: u32) -> Option<&CarvedPair> {
        self.pairs.get(index as usize)
    }

    /// Number of pairs produced.
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    /// Whether no pair was produced.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Number of pairs asked for.
    pub fn requested(&self) -> usize {
        self.requested
    }

    /// Scatter list the carving was computed from.
    pub fn scatter_list(&self) -> &[SgElement] {
        &self.scatter_list
    }

    /// Whether buffers `a` and `a + 1` are physically adjacent.
    pub fn buffers_adjacent(&self, a: u32) -> bool {
        match (self.pair(a), self.pair(a + 1)) {
            (Some(x), Some(y)) => y.buffer_address == x.buffer_address + BUFFER_SIZE as u64,
            _ => false,
        }
    }
}

/// Bytes of persistent memory needed to carve `buffer_count` pairs from one
/// range whose base is buffer-aligned.
pub fn required_bytes(buffer_count: usize) -> u64 {
    // Node record is rounded up to a buffer boundary so the first buffer
    // stays aligned.
    let record = align_up(NODE_RECORD_SIZE, BUFFER_SIZE as u64);
    record + buffer_count as u64 * (BUFFER_SIZE as u64 + TAG_SLOT_SIZE)
}

/// Carve `count` buffer/tag pairs out of the scatter list.
///
/// # Errors
///
/// `InsufficientResources` if no range can hold the node record, or (in
/// [`CarveMode::Strict`]) if fewer than `count` pairs fit.
pub fn carve(sg: &[SgElement], count: usize, mode: CarveMode) -> Result<MemoryCarving> {
    let mut cursors: Vec<Cursor> = sg
        .iter()
        .map(|e| Cursor {
            start: e.address,
            end: e.end(),
        })
        .collect();

    let node_record = cursors
        .iter_mut()
        .find_map(|c| c.take_front(NODE_RECORD_SIZE, NODE_RECORD_SIZE))
        .ok_or_else(|| {
            Error::InsufficientResources("no range can hold the node record".into())
        })?;

    let mut pairs = Vec::with_capacity(count);
    while pairs.len() < count {
        let Some(pair) = cursors.iter_mut().find_map(Cursor::take_pair) else {
            break;
        };
        pairs.push(pair);
    }

    tracing::debug!(
        requested = count,
        carved = pairs.len(),
        ranges = sg.len(),
        node_record = format_args!("{node_record:#x}"),
        "carved persistent memory"
    );

    if pairs.len() < count {
        match mode {
            CarveMode::Strict => {
                return Err(Error::InsufficientResources(format!(
                    "carved {} of {} buffers",
                    pairs.len(),
                    count
                )));
            }
            CarveMode::BestEffort => {
                tracing::warn!(
                    requested = count,
                    carved = pairs.len(),
                    "best-effort carve came up short"
                );
            }
        }
    }

    Ok(MemoryCarving {
        scatter_list: sg.to_vec(),
        node_record,
        pairs,
        requested: count,
    })
}

/// Remaining window of one scatter-list entry.
#[derive(Clone, Copy, Debug)]
struct Cursor {
    start: u64,
    end: u64,
}

impl Cursor {
    /// Take `size` bytes from the front, forward-aligned.
    fn take_front(&mut self, size: u64, align: u64) -> Option<u64> {
        let base = align_up(self.start, align);
        let end = base.checked_add(size)?;
        if end > self.end {
            return None;
        }
        self.start = end;
        Some(base)
    }

    /// Take a buffer from the front and a tag slot from the back.
    fn take_pair(&mut self) -> Option<CarvedPair> {
        let buffer_address = align_up(self.start, BUFFER_SIZE as u64);
        let buffer_end = buffer_address.checked_add(BUFFER_SIZE as u64)?;
        let tag_address = align_down(self.end.checked_sub(TAG_SLOT_SIZE)?, CACHE_LINE);
        if buffer_end > tag_address {
            return None;
        }
        self.start = buffer_end;
        self.end = tag_address;
        Some(CarvedPair {
            tag_address,
            buffer_address,
        })
    }
}

#[inline]
fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[inline]
fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = BUFFER_SIZE as u64;

    #[test]
    fn test_carve_single_range() {
        let sg = [SgElement::new(0x100_0000, required_bytes(4))];
        let carving = carve(&sg, 4, CarveMode::Strict).unwrap();

        assert_eq!(carving.len(), 4);
        assert_eq!(carving.node_record_address(), 0x100_0000);
        for (i, pair) in carving.pairs().iter().enumerate() {
            assert_eq!(pair.buffer_address % BS, 0);
            assert_eq!(pair.tag_address % CACHE_LINE, 0);
            assert!(pair.buffer_address + BS <= pair.tag_address);
            if i > 0 {
                assert!(carving.buffers_adjacent(i as u32 - 1));
            }
        }
        // Tags come off the end, newest lowest.
        assert_eq!(carving.pairs()[0].tag_address, 0x100_0000 + required_bytes(4) - TAG_SLOT_SIZE);
        assert!(carving.pairs()[1].tag_address < carving.pairs()[0].tag_address);
    }

    #[test]
    fn test_carve_first_fit_across_ranges() {
        // First range fits the record and one pair, second fits the rest.
        let first = SgElement::new(0, BS + BS + TAG_SLOT_SIZE);
        let second = SgElement::new(0x10_0000, 3 * (BS + TAG_SLOT_SIZE) + BS);
        let carving = carve(&[first, second], 4, CarveMode::Strict).unwrap();

        assert_eq!(carving.pairs()[0].buffer_address, BS);
        assert!(second.contains(carving.pairs()[1].buffer_address, BS));
        assert!(!carving.buffers_adjacent(0));
        assert!(carving.buffers_adjacent(1));
    }

    #[test]
    fn test_carve_strict_shortfall() {
        let sg = [SgElement::new(0, required_bytes(2))];
        let err = carve(&sg, 3, CarveMode::Strict).unwrap_err();
        assert!(matches!(err, Error::InsufficientResources(_)));
    }

    #[test]
    fn test_carve_best_effort_shortfall() {
        let sg = [SgElement::new(0, required_bytes(2))];
        let carving = carve(&sg, 3, CarveMode::BestEffort).unwrap();
        assert_eq!(carving.len(), 2);
        assert_eq!(carving.requested(), 3);
    }

    #[test]
    fn test_carve_no_room_for_record() {
        let sg = [SgElement::new(0, 100)];
        assert!(carve(&sg, 0, CarveMode::BestEffort).is_err());
    }

    #[test]
    fn test_carve_unaligned_base() {
        let sg = [SgElement::new(0x1234, required_bytes(2) + 2 * BS)];
        let carving = carve(&sg, 2, CarveMode::Strict).unwrap();
        assert_eq!(carving.node_record_address() % NODE_RECORD_SIZE, 0);
        assert!(carving.pairs().iter().all(|p| p.buffer_address % BS == 0));
    }
}
