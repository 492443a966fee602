//! Fixed pool of per-request buffer trackers.
//!
//! A tracker carries one admitted allocation request while tags are being
//! reserved for it. The pool has a fixed size; requests that arrive while
//! every tracker is busy wait on a pool-wide FIFO list and are retried when
//! a tracker returns.
//!
//! Trackers are addressed by generation-checked [`TrackerKey`]s, so a key
//! kept across a release can never resolve to the tracker's next user.

use crate::ident::AllocationId;
use crate::request::{BufferRequest, RequestTicket};
use slotmap::{SlotMap, new_key_type};
use std::collections::VecDeque;

new_key_type! {
    /// Handle to an active tracker.
    pub struct TrackerKey;
}

/// State of one in-flight allocation.
#[derive(Debug)]
pub struct Tracker {
    request: BufferRequest,
    units_needed: usize,
    contiguous: bool,
    tags: Vec<u32>,
}

impl Tracker {
    fn new(request: BufferRequest) -> Self {
        let contiguous = request.opcode == crate::request::Opcode::ContiguousAlloc;
        let units_needed = request.buffer_units();
        Self {
            request,
            units_needed,
            contiguous,
            tags: Vec::with_capacity(units_needed),
        }
    }

    /// The originating request.
    pub fn request(&self) -> &BufferRequest {
        &self.request
    }

    /// Buffers still to reserve.
    #[inline]
    pub fn units_needed(&self) -> usize {
        self.units_needed
    }

    /// Whether the buffers must be physically adjacent.
    #[inline]
    pub fn is_contiguous(&self) -> bool {
        self.contiguous
    }

    /// Tags reserved so far.
    pub fn tags(&self) -> &[u32] {
        &self.tags
    }

    /// Whether every needed tag is reserved.
    #[inline]
    pub fn is_satisfied(&self) -> bool {
        self.units_needed == 0
    }

    /// Record a reserved tag.
    ///
    /// Contiguous trackers keep their tags ascending by index; the others
    /// just stack them.
    pub fn push_tag(&mut self, index: u32) {
        if self.contiguous {
            let pos = self.tags.partition_point(|t| *t < index);
            self.tags.insert(pos, index);
        } else {
            self.tags.push(index);
        }
        self.units_needed = self.units_needed.saturating_sub(1);
    }

    /// Take the next reserved tag back off the tracker.
    ///
    /// Contiguous trackers yield ascending; the others yield most recent
    /// first.
    pub fn pop_tag(&mut self) -> Option<u32> {
        if self.contiguous {
            (!self.tags.is_empty()).then(|| self.tags.remove(0))
        } else {
            self.tags.pop()
        }
    }

    /// Dismantle into the request and its reserved tags.
    pub fn into_parts(self) -> (BufferRequest, Vec<u32>) {
        (self.request, self.tags)
    }
}

/// Where a request sits inside the pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackerSlot {
    /// Holding a tracker.
    Active(TrackerKey),
    /// Waiting for a tracker.
    Waiting,
}

/// Fixed-capacity tracker pool with active and wait lists.
#[derive(Debug)]
pub struct TrackerPool {
    capacity: usize,
    trackers: SlotMap<TrackerKey, Tracker>,
    active: VecDeque<TrackerKey>,
    waiting: VecDeque<BufferRequest>,
}

impl TrackerPool {
    /// Pool of `capacity` trackers.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            trackers: SlotMap::with_capacity_and_key(capacity),
            active: VecDeque::with_capacity(capacity),
            waiting: VecDeque::new(),
        }
    }

    /// Pool size.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Trackers not in use.
    #[inline]
    pub fn available(&self) -> usize {
        self.capacity - self.trackers.len()
    }

    /// Trackers in use.
    #[inline]
    pub fn active_len(&self) -> usize {
        self.trackers.len()
    }

    /// Requests waiting for a tracker.
    #[inline]
    pub fn waiting_len(&self) -> usize {
        self.waiting.len()
    }

    /// Give the request a tracker, or queue it on the wait list.
    ///
    /// A request never overtakes one already waiting, even if a tracker is
    /// free at the moment.
    pub fn allocate(&mut self, request: BufferRequest) -> TrackerSlot {
        if self.trackers.len() >= self.capacity || !self.waiting.is_empty() {
            tracing::debug!(ticket = %request.ticket(), "no tracker for request, it waits");
            self.waiting.push_back(request);
            return TrackerSlot::Waiting;
        }
        TrackerSlot::Active(self.activate(request))
    }

    /// Move the oldest waiting request onto a free tracker, if both exist.
    pub fn promote_waiting(&mut self) -> Option<TrackerKey> {
        if self.trackers.len() >= self.capacity {
            return None;
        }
        let request = self.waiting.pop_front()?;
        Some(self.activate(request))
    }

    fn activate(&mut self, request: BufferRequest) -> TrackerKey {
        let key = self.trackers.insert(Tracker::new(request));
        self.active.push_back(key);
        key
    }

    /// Borrow an active tracker.
    pub fn get(&self, key: TrackerKey) -> Option<&Tracker> {
        self.trackers.get(key)
    }

    /// Mutably borrow an active tracker.
    pub fn get_mut(&mut self, key: TrackerKey) -> Option<&mut Tracker> {
        self.trackers.get_mut(key)
    }

    /// Return a tracker to the pool.
    pub fn release(&mut self, key: TrackerKey) -> Option<Tracker> {
        let tracker = self.trackers.remove(key)?;
        self.active.retain(|k| *k != key);
        Some(tracker)
    }

    /// Active trackers in arrival order.
    pub fn active_keys(&self) -> Vec<TrackerKey> {
        self.active.iter().copied().collect()
    }

    /// Locate a request by ticket.
    pub fn find_ticket(&self, ticket: RequestTicket) -> Option<TrackerSlot> {
        if let Some(key) = self
            .active
            .iter()
            .find(|k| self.trackers[**k].request.ticket() == ticket)
        {
            return Some(TrackerSlot::Active(*key));
        }
        self.waiting
            .iter()
            .any(|r| r.ticket() == ticket)
            .then_some(TrackerSlot::Waiting)
    }

    /// The request behind a ticket, active or waiting.
    pub fn request(&self, ticket: RequestTicket) -> Option<&BufferRequest> {
        self.active
            .iter()
            .map(|k| &self.trackers[*k].request)
            .chain(self.waiting.iter())
            .find(|r| r.ticket() == ticket)
    }

    /// Locate a request by allocation id.
    pub fn find_id(&self, id: &AllocationId) -> Option<RequestTicket> {
        self.active
            .iter()
            .map(|k| &self.trackers[*k].request)
            .chain(self.waiting.iter())
            .find(|r| r.id == *id)
            .map(BufferRequest::ticket)
    }

    /// Remove a request from the wait list.
    pub fn remove_waiting(&mut self, ticket: RequestTicket) -> Option<BufferRequest> {
        let pos = self.waiting.iter().position(|r| r.ticket() == ticket)?;
        self.waiting.remove(pos)
    }

    /// Drain every request, active or waiting. Reserved tags are returned
    /// alongside so the caller can free them.
    pub fn drain(&mut self) -> Vec<(BufferRequest, Vec<u32>)> {
        let mut out: Vec<(BufferRequest, Vec<u32>)> = self
            .active
            .drain(..)
            .filter_map(|k| self.trackers.remove(k))
            .map(Tracker::into_parts)
            .collect();
        out.extend(self.waiting.drain(..).map(|r| (r, Vec::new())));
        out
    }
}
