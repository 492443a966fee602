//! Owner registrations and per-owner accounting.

use super::RequestKey;
use crate::ident::OwnerId;
use std::collections::VecDeque;

/// Static registration of an owner.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnerRegistration {
    /// Bytes guaranteed to the owner within its client's share.
    pub reservation: u64,
    /// Upper bound on the owner's bytes, if any. Enforced for clients with
    /// the explicit policy.
    pub limit: Option<u64>,
    /// Relative weight among the client's owners.
    pub shares: u32,
}

impl OwnerRegistration {
    /// Registration with a byte limit.
    pub fn with_limit(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

pub(crate) struct OwnerEntry {
    pub(crate) registration: OwnerRegistration,
    pub(crate) bytes_allocated: u64,
    pub(crate) allocation_count: u64,
    pub(crate) queue: VecDeque<RequestKey>,
}

impl OwnerEntry {
    pub(crate) fn new(registration: OwnerRegistration) -> Self {
        Self {
            registration,
            bytes_allocated: 0,
            allocation_count: 0,
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn usage(&self, owner: OwnerId) -> OwnerUsage {
        OwnerUsage {
            owner,
            bytes_allocated: self.bytes_allocated,
            allocation_count: self.allocation_count,
            queued: self.queue.len(),
        }
    }
}

/// Snapshot of an owner's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OwnerUsage {
    /// Owner id.
    pub owner: OwnerId,
    /// Bytes admitted and not yet freed.
    pub bytes_allocated: u64,
    /// Outstanding allocations.
    pub allocation_count: u64,
    /// Requests on the owner wait queue.
    pub queued: usize,
}
