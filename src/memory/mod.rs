//! Persistent memory for the cluster memory service.
//!
//! This module owns the raw persistent memory a node was handed at boot and
//! the way it is partitioned into tag + buffer pairs.
//!
//! # Architecture
//!
//! - [`PersistentSegment`]: the physical ranges, addressed by physical address
//! - [`carve`]: first-fit partitioning into a node record plus N pairs
//! - [`PeerMemoryMap`]: local pairs joined with the peer's equivalent pairs
//! - [`AtomicBitmap`]: lock-free bit set used for the owner clean/dirty table
//!
//! # Example
//!
//! ```rust,ignore
//! use clustermem::memory::{carve, required_bytes, CarveMode, PersistentSegment, SgElement};
//!
//! let sg = [SgElement::new(0x100_0000, required_bytes(16))];
//! let segment = PersistentSegment::new(&sg)?;
//! let carving = carve(&sg, 16, CarveMode::Strict)?;
//! assert_eq!(carving.len(), 16);
//! ```

mod bitmap;
mod carve;
mod peer_map;
mod segment;

pub use bitmap::AtomicBitmap;
pub use carve::{
    CACHE_LINE, CarveMode, CarvedPair, MemoryCarving, NODE_RECORD_SIZE, TAG_SLOT_SIZE, carve,
    required_bytes,
};
pub use peer_map::{PeerMapping, PeerMemoryMap};
pub use segment::{PersistentSegment, SgElement};
