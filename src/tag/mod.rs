//! Cluster tags and the tag directory.
//!
//! A tag is the metadata half of a carved tag/buffer pair. The directory
//! indexes allocated tags by allocation id and keeps free tags on a LIFO
//! stack.

mod directory;
mod record;

pub use directory::TagDirectory;
pub use record::{ClientLock, ClusterTag, SectorMask, TAG_RECORD_LEN, TagHome, TagRecord};
