//! Buffer requests and their outcomes.
//!
//! A [`BufferRequest`] is the one message type every buffer operation is
//! expressed in. Requests are asynchronous: the outcome is delivered to the
//! request's completion callback, which may run on any thread.

use crate::config::BUFFER_SIZE;
use crate::error::Error;
use crate::ident::AllocationId;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Buffer operation codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Allocate `ceil(size / 32 KiB)` buffers.
    Alloc,
    /// Allocate one run of physically adjacent buffers.
    ContiguousAlloc,
    /// Copy data into an allocation and mark it valid.
    Commit,
    /// Free one allocation.
    Free,
    /// Free every allocation of the request's owner.
    FreeAll,
    /// Abort an earlier request by ticket.
    Abort,
    /// Take the exclusive client lock on every buffer of an allocation.
    GetExclusiveLock,
    /// Take a shared client lock on every buffer of an allocation.
    GetSharedLock,
    /// Release the exclusive client lock.
    ReleaseExclusiveLock,
    /// Release one shared client lock.
    ReleaseSharedLock,
    /// First allocation of an owner.
    GetFirst,
    /// Allocation after the request's id, within the same owner.
    GetNext,
}

impl Opcode {
    /// Whether the opcode goes through quota admission.
    #[inline]
    pub fn is_allocation(self) -> bool {
        matches!(self, Opcode::Alloc | Opcode::ContiguousAlloc)
    }

    /// Short name for logs and spans.
    pub fn name(self) -> &'static str {
        match self {
            Opcode::Alloc => "alloc",
            Opcode::ContiguousAlloc => "contiguous_alloc",
            Opcode::Commit => "commit",
            Opcode::Free => "free",
            Opcode::FreeAll => "free_all",
            Opcode::Abort => "abort",
            Opcode::GetExclusiveLock => "get_exclusive_lock",
            Opcode::GetSharedLock => "get_shared_lock",
            Opcode::ReleaseExclusiveLock => "release_exclusive_lock",
            Opcode::ReleaseSharedLock => "release_shared_lock",
            Opcode::GetFirst => "get_first",
            Opcode::GetNext => "get_next",
        }
    }
}

/// Handle naming a submitted request, used to abort it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestTicket(u64);

impl RequestTicket {
    /// Allocate a process-unique ticket.
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw value.
    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

/// Per-request result status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestStatus {
    /// Completed.
    Ok,
    /// Aborted before completion.
    Aborted,
    /// No such allocation (or no further allocation when iterating).
    NotFound,
    /// A conflicting client lock is held.
    LockConflict,
    /// Lock release without a hold, or exclusive re-acquire.
    InvalidLockState,
    /// Identifier rejected.
    InvalidIdentifier,
    /// The request can never be satisfied by this node's memory.
    InsufficientResources,
    /// Offset, length or size out of range.
    InvalidArgument,
}

impl RequestStatus {
    /// Status that reports `error` to a completion callback.
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::NotFound(_) => RequestStatus::NotFound,
            Error::LockConflict { .. } => RequestStatus::LockConflict,
            Error::InvalidLockState { .. } => RequestStatus::InvalidLockState,
            Error::InvalidIdentifier(_) => RequestStatus::InvalidIdentifier,
            Error::InsufficientResources(_) => RequestStatus::InsufficientResources,
            _ => RequestStatus::InvalidArgument,
        }
    }
}

/// One buffer of an allocation, as reported to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferInfo {
    /// Tag index.
    pub tag: u32,
    /// Local physical address of the buffer.
    pub address: u64,
    /// Peer physical address, if the peer map is known.
    pub peer_address: Option<u64>,
    /// Bytes of the allocation carried by this buffer.
    pub len: u64,
}

/// Result delivered to a completion callback.
#[derive(Clone, Debug)]
pub struct RequestOutcome {
    /// Ticket of the completed request.
    pub ticket: RequestTicket,
    /// Opcode of the completed request.
    pub opcode: Opcode,
    /// Result status.
    pub status: RequestStatus,
    /// Allocation the outcome refers to. For iteration, the allocation found.
    pub id: AllocationId,
    /// Buffers of the allocation, ascending by tag index.
    pub buffers: Vec<BufferInfo>,
    /// Caller context echoed back.
    pub context: u64,
}

impl RequestOutcome {
    /// Whether the request succeeded.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.status == RequestStatus::Ok
    }
}

/// Completion callback.
pub type Completion = Box<dyn FnOnce(RequestOutcome) + Send + 'static>;

/// A buffer operation.
///
/// # Example
///
/// ```rust,ignore
/// use clustermem::request::BufferRequest;
///
/// let req = BufferRequest::alloc(id, 64 * 1024).on_complete(|outcome| {
///     assert!(outcome.is_ok());
/// });
/// ```
pub struct BufferRequest {
    /// Operation.
    pub opcode: Opcode,
    /// Allocation the request targets.
    pub id: AllocationId,
    /// Requested bytes (allocation).
    pub size: u64,
    /// Byte offset within the allocation (commit).
    pub offset: u64,
    /// Caller memory (commit), gathered in order.
    pub sg: Vec<Bytes>,
    /// Request to abort (abort).
    pub target: Option<RequestTicket>,
    /// Opaque caller context echoed in the outcome.
    pub context: u64,
    pub(crate) ticket: RequestTicket,
    completion: Option<Completion>,
}

impl BufferRequest {
    /// Request with the given opcode and id; other fields zeroed.
    pub fn new(opcode: Opcode, id: AllocationId) -> Self {
        Self {
            opcode,
            id,
            size: 0,
            offset: 0,
            sg: Vec::new(),
            target: None,
            context: 0,
            ticket: RequestTicket::next(),
            completion: None,
        }
    }

    /// Allocate `size` bytes.
    pub fn alloc(id: AllocationId, size: u64) -> Self {
        Self {
            size,
            ..Self::new(Opcode::Alloc, id)
        }
    }

    /// Allocate `size` bytes in physically adjacent buffers.
    pub fn contiguous_alloc(id: AllocationId, size: u64) -> Self {
        Self {
            size,
            ..Self::new(Opcode::ContiguousAlloc, id)
        }
    }

    /// Commit `data` at `offset` within the allocation.
    pub fn commit(id: AllocationId, offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            sg: vec![data.into()],
            ..Self::new(Opcode::Commit, id)
        }
    }

    /// Free an allocation.
    pub fn free(id: AllocationId) -> Self {
        Self::new(Opcode::Free, id)
    }

    /// Abort an earlier request.
    pub fn abort(id: AllocationId, target: RequestTicket) -> Self {
        Self {
            target: Some(target),
            ..Self::new(Opcode::Abort, id)
        }
    }

    /// Attach a completion callback.
    pub fn on_complete(mut self, f: impl FnOnce(RequestOutcome) + Send + 'static) -> Self {
        self.completion = Some(Box::new(f));
        self
    }

    /// Attach caller context.
    pub fn with_context(mut self, context: u64) -> Self {
        self.context = context;
        self
    }

    /// This request's ticket.
    #[inline]
    pub fn ticket(&self) -> RequestTicket {
        self.ticket
    }

    /// Buffers needed for the requested size.
    #[inline]
    pub fn buffer_units(&self) -> usize {
        (self.size.div_ceil(BUFFER_SIZE as u64) as usize).max(1)
    }

    /// Total bytes of caller memory.
    pub fn sg_len(&self) -> u64 {
        self.sg.iter().map(|b| b.len() as u64).sum()
    }

    /// Deliver an outcome and consume the request.
    pub(crate) fn complete(self, status: RequestStatus, id: AllocationId, buffers: Vec<BufferInfo>) {
        let outcome = RequestOutcome {
            ticket: self.ticket,
            opcode: self.opcode,
            status,
            id,
            buffers,
            context: self.context,
        };
        if let Some(f) = self.completion {
            f(outcome);
        }
    }

    /// Split into the callback and an outcome to hand it later.
    pub(crate) fn into_completion(
        self,
        status: RequestStatus,
        id: AllocationId,
        buffers: Vec<BufferInfo>,
    ) -> PendingCompletion {
        PendingCompletion {
            callback: self.completion,
            outcome: RequestOutcome {
                ticket: self.ticket,
                opcode: self.opcode,
                status,
                id,
                buffers,
                context: self.context,
            },
        }
    }
}

impl fmt::Debug for BufferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferRequest")
            .field("ticket", &self.ticket)
            .field("opcode", &self.opcode)
            .field("id", &self.id)
            .field("size", &self.size)
            .field("offset", &self.offset)
            .field("sg_len", &self.sg_len())
            .finish()
    }
}

/// An outcome waiting to be delivered once locks are dropped.
pub(crate) struct PendingCompletion {
    callback: Option<Completion>,
    outcome: RequestOutcome,
}

impl PendingCompletion {
    /// Run the callback.
    pub(crate) fn deliver(self) {
        if let Some(f) = self.callback {
            f(self.outcome);
        }
    }
}

/// Deliver a batch of outcomes.
pub(crate) fn deliver_all(completions: Vec<PendingCompletion>) {
    for c in completions {
        c.deliver();
    }
}
