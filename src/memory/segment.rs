//! Persistent memory segment addressed by physical scatter list.
//!
//! The segment is the locally-addressable persistent memory handed to the
//! service at boot: a list of physically contiguous ranges. Everything the
//! service stores in persistent memory (node record, tags, buffers) is read
//! and written through physical addresses inside those ranges.
//!
//! Surviving a reboot is modelled by keeping the same `Arc<PersistentSegment>`
//! alive across service instances; [`PersistentSegment::scrub`] models a boot
//! where memory was not preserved.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::fmt;

/// One physically contiguous range of memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SgElement {
    /// Physical base address.
    pub address: u64,
    /// Length in bytes.
    pub len: u64,
}

impl SgElement {
    /// Create a scatter-list element.
    pub const fn new(address: u64, len: u64) -> Self {
        Self { address, len }
    }

    /// Exclusive end address.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.address + self.len
    }

    /// Whether `[address, address + len)` lies inside this element.
    #[inline]
    pub const fn contains(&self, address: u64, len: u64) -> bool {
        address >= self.address && address + len <= self.end()
    }
}

/// A range of zero-initialized memory bound to a physical address.
struct BackedRange {
    element: SgElement,
    data: Mutex<Box<[u8]>>,
}

/// Persistent memory made of one or more physical ranges.
///
/// # Example
///
/// ```rust
/// use clustermem::memory::{PersistentSegment, SgElement};
///
/// let segment = PersistentSegment::new(&[SgElement::new(0x10_0000, 4096)]).unwrap();
/// segment.write(0x10_0010, b"hello").unwrap();
///
/// let mut out = [0u8; 5];
/// segment.read(0x10_0010, &mut out).unwrap();
/// assert_eq!(&out, b"hello");
/// ```
pub struct PersistentSegment {
    ranges: Vec<BackedRange>,
}

impl PersistentSegment {
    /// Allocate zeroed backing for each range of the scatter list.
    ///
    /// # Errors
    ///
    /// Returns an error if the list is empty, holds an empty range, or
    /// ranges overlap.
    pub fn new(sg: &[SgElement]) -> Result<Self> {
        if sg.is_empty() {
            return Err(Error::InvalidArgument("scatter list is empty".into()));
        }

        let mut sorted: Vec<SgElement> = sg.to_vec();
        sorted.sort_by_key(|e| e.address);
        for pair in sorted.windows(2) {
            if pair[0].end() > pair[1].address {
                return Err(Error::InvalidArgument(format!(
                    "ranges {:#x}+{:#x} and {:#x}+{:#x} overlap",
                    pair[0].address, pair[0].len, pair[1].address, pair[1].len
                )));
            }
        }

        let mut ranges = Vec::with_capacity(sg.len());
        for element in sg {
            if element.len == 0 {
                return Err(Error::InvalidArgument("zero-length range".into()));
            }
            let len = usize::try_from(element.len)
                .map_err(|_| Error::InvalidArgument("range too large".into()))?;
            ranges.push(BackedRange {
                element: *element,
                data: Mutex::new(vec![0u8; len].into_boxed_slice()),
            });
        }

        Ok(Self { ranges })
    }

    /// The scatter list this segment was built from, in caller order.
    pub fn scatter_list(&self) -> Vec<SgElement> {
        self.ranges.iter().map(|r| r.element).collect()
    }

    /// Total bytes across all ranges.
    pub fn total_len(&self) -> u64 {
        self.ranges.iter().map(|r| r.element.len).sum()
    }

    /// Copy bytes out of persistent memory.
    pub fn read(&self, address: u64, out: &mut [u8]) -> Result<()> {
        let (range, offset) = self.locate(address, out.len())?;
        let data = range.data.lock();
        out.copy_from_slice(&data[offset..offset + out.len()]);
        Ok(())
    }

    /// Copy bytes into persistent memory.
    pub fn write(&self, address: u64, bytes: &[u8]) -> Result<()> {
        let (range, offset) = self.locate(address, bytes.len())?;
        let mut data = range.data.lock();
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Fill `len` bytes starting at `address` with `value`.
    pub fn fill(&self, address: u64, len: usize, value: u8) -> Result<()> {
        let (range, offset) = self.locate(address, len)?;
        let mut data = range.data.lock();
        data[offset..offset + len].fill(value);
        Ok(())
    }

    /// Run `f` over a borrowed view of `len` bytes at `address`.
    pub fn with_slice<R>(&self, address: u64, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (range, offset) = self.locate(address, len)?;
        let data = range.data.lock();
        Ok(f(&data[offset..offset + len]))
    }

    /// Zero every range, as if memory was lost across a reboot.
    pub fn scrub(&self) {
        for range in &self.ranges {
            range.data.lock().fill(0);
        }
    }

    fn locate(&self, address: u64, len: usize) -> Result<(&BackedRange, usize)> {
        let len64 = len as u64;
        self.ranges
            .iter()
            .find(|r| r.element.contains(address, len64))
            .map(|r| (r, (address - r.element.address) as usize))
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "access {address:#x}+{len:#x} is outside persistent memory"
                ))
            })
    }
}

impl fmt::Debug for PersistentSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistentSegment")
            .field("ranges", &self.scatter_list())
            .field("total_len", &self.total_len())
            .finish()
    }
}
