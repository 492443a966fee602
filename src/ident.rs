//! Client, owner and allocation identifiers.
//!
//! An owner identifier is a 20-bit field. The low 6 bits carry the id of the
//! client the owner belongs to; the remaining 14 bits are the owner's own
//! portion:
//!
//! ```text
//!  19                     6 5        0
//! ┌────────────────────────┬──────────┐
//! │   owner portion (14)   │client (6)│
//! └────────────────────────┴──────────┘
//! ```

use crate::error::{Error, Result};
use std::fmt;

/// Width of the owner identifier field.
pub const OWNER_ID_BITS: u32 = 20;

/// Bits reserved for the client id inside an owner identifier.
pub const CLIENT_ID_BITS: u32 = 6;

/// Number of addressable client ids (including the reserved id 0).
pub const MAX_CLIENTS: usize = 1 << CLIENT_ID_BITS;

/// Largest owner portion that fits next to a client id.
pub const MAX_OWNER_PORTION: u32 = (1 << (OWNER_ID_BITS - CLIENT_ID_BITS)) - 1;

const CLIENT_MASK: u32 = (1 << CLIENT_ID_BITS) - 1;
const OWNER_MASK: u32 = (1 << OWNER_ID_BITS) - 1;

/// A small enumerated client id. Id 0 is reserved as "invalid".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u8);

impl ClientId {
    /// Reserved, never registrable.
    pub const INVALID: ClientId = ClientId(0);
    /// RAID engine client.
    pub const RAID: ClientId = ClientId(1);
    /// Metadata service client.
    pub const METADATA: ClientId = ClientId(2);
    /// Write cache client.
    pub const CACHE: ClientId = ClientId(3);
    /// Test harness client.
    pub const TEST: ClientId = ClientId(4);

    /// Build a client id, rejecting 0 and values beyond the 6-bit field.
    pub fn new(raw: u8) -> Result<Self> {
        if raw == 0 || u32::from(raw) > CLIENT_MASK {
            return Err(Error::invalid_id(format!("client id {raw} out of range")));
        }
        Ok(Self(raw))
    }

    /// The raw id.
    #[inline]
    pub fn raw(self) -> u8 {
        self.0
    }

    /// Index into per-client tables.
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is the reserved invalid id.
    #[inline]
    pub fn is_invalid(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "client#{}", self.0)
    }
}

/// A 20-bit owner identifier embedding its client id in the low bits.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u32);

impl OwnerId {
    /// The all-zero owner id, used by free tags.
    pub const NONE: OwnerId = OwnerId(0);

    /// Compose an owner id from a client id and an owner portion.
    pub fn create(client: ClientId, portion: u32) -> Result<Self> {
        if portion > MAX_OWNER_PORTION {
            return Err(Error::invalid_id(format!(
                "owner portion {portion:#x} exceeds {MAX_OWNER_PORTION:#x}"
            )));
        }
        Ok(Self((portion << CLIENT_ID_BITS) | u32::from(client.raw())))
    }

    /// Interpret a raw 20-bit value. Fails if the value does not fit the field.
    pub fn from_raw(raw: u32) -> Result<Self> {
        if raw & !OWNER_MASK != 0 {
            return Err(Error::invalid_id(format!(
                "owner id {raw:#x} exceeds {OWNER_ID_BITS}-bit space"
            )));
        }
        Ok(Self(raw))
    }

    /// The raw 20-bit value.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Client id encoded in the low bits. May be [`ClientId::INVALID`].
    #[inline]
    pub fn client_id(self) -> ClientId {
        ClientId((self.0 & CLIENT_MASK) as u8)
    }

    /// The owner's distinct portion (everything above the client bits).
    #[inline]
    pub fn non_client_portion(self) -> u32 {
        self.0 >> CLIENT_ID_BITS
    }

    /// Whether this is the all-zero id.
    #[inline]
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{:05x}", self.0)
    }
}

/// Caller-chosen buffer id, unique among an owner's outstanding allocations.
pub type BufferId = u64;

/// `{owner_id, buffer_id}` pair naming one allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AllocationId {
    /// Owning owner (and through it, the client).
    pub owner: OwnerId,
    /// Caller-supplied buffer id.
    pub buffer: BufferId,
}

impl AllocationId {
    /// The id carried by free tags.
    pub const NONE: AllocationId = AllocationId {
        owner: OwnerId::NONE,
        buffer: 0,
    };

    /// Create an allocation id.
    pub fn new(owner: OwnerId, buffer: BufferId) -> Self {
        Self { owner, buffer }
    }

    /// Client encoded in the owner id.
    #[inline]
    pub fn client_id(&self) -> ClientId {
        self.owner.client_id()
    }

    /// Whether this id names nothing (free tag).
    #[inline]
    pub fn is_none(&self) -> bool {
        self.owner.is_none()
    }
}

impl fmt::Display for AllocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{:#x}", self.owner, self.buffer)
    }
}

/// Which of the two storage processors a node is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeId {
    /// Storage processor A.
    A,
    /// Storage processor B.
    B,
}

impl NodeId {
    /// The other node.
    pub fn peer(self) -> NodeId {
        match self {
            NodeId::A => NodeId::B,
            NodeId::B => NodeId::A,
        }
    }

    /// One-byte owning-node flag stored in tags.
    pub fn as_flag(self) -> u8 {
        match self {
            NodeId::A => 0,
            NodeId::B => 1,
        }
    }

    /// Decode the owning-node flag.
    pub fn from_flag(flag: u8) -> NodeId {
        if flag == 0 { NodeId::A } else { NodeId::B }
    }

    /// Short name for logs.
    pub fn name(self) -> &'static str {
        match self {
            NodeId::A => "A",
            NodeId::B => "B",
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
