//! # clustermem
//!
//! A clustered persistent-memory buffer allocator.
//!
//! Two storage controller nodes each own a region of battery-backed memory.
//! The region is carved into fixed 32 KiB buffers, each described by a
//! cluster tag. Clients (RAID, metadata, cache, ...) allocate, commit, lock
//! and free buffers through a quota-aware admission engine. Every change is
//! mirrored to the peer node, and the whole population can be dumped to and
//! reloaded from an on-disk vault across power loss.
//!
//! ## Features
//!
//! - **Quota admission**: per-client reservations and limits, per-owner
//!   limits, FIFO waiting with abort
//! - **Locking**: exclusive and shared client locks per allocation
//! - **Peer replication**: tag and data updates mirrored to the partner node
//! - **Vault**: bulk dump and load with checksummed 520-byte blocks
//! - **Lifecycle**: an event-driven node state machine with bounded history
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use clustermem::prelude::*;
//!
//! let service = ClusterMemoryService::start(config, collaborators)?;
//! service.wait_until_running(Duration::from_secs(5))?;
//!
//! service.register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))?;
//! let owner = OwnerId::create(ClientId::RAID, 1)?;
//! service.register_owner(owner, OwnerRegistration::default())?;
//!
//! service.submit(
//!     BufferRequest::alloc(AllocationId::new(owner, 1), 64 * 1024)
//!         .on_complete(|outcome| assert!(outcome.is_ok())),
//! )?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod collab;
pub mod config;
pub mod control;
pub mod dispatch;
pub mod error;
pub mod ident;
pub mod lifecycle;
pub mod memory;
pub mod observability;
pub mod persistence;
pub mod policy;
pub mod request;
pub mod service;
pub mod tag;
pub mod tracker;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::collab::{
        ChannelPeerLink, LocalPersistenceController, PeerLink, PeerMessage,
        PersistenceController,
    };
    pub use crate::config::{ServiceConfig, ServiceConfigBuilder};
    pub use crate::control::{BufferApi, ControlRequest, ControlResponse, DirectCallTable};
    pub use crate::error::{Error, Result};
    pub use crate::ident::{AllocationId, BufferId, ClientId, NodeId, OwnerId};
    pub use crate::lifecycle::{EventKind, NodeState};
    pub use crate::memory::{PersistentSegment, SgElement, required_bytes};
    pub use crate::persistence::{Layout, LunSet};
    pub use crate::policy::{ClientRegistration, OwnerRegistration, PolicyKind};
    pub use crate::request::{BufferRequest, Opcode, RequestOutcome, RequestStatus};
    pub use crate::service::{ClusterMemoryService, Collaborators};
}

pub use error::{Error, Result};
