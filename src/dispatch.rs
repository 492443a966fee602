//! Buffer operations dispatcher.
//!
//! Routes every buffer request to the admission engine, the tracker pool
//! and the tag directory. Allocations go through admission first and then
//! through a tracker that reserves tags; all other opcodes act on the
//! directory directly.
//!
//! Work happens under one dispatch lock. Anything that calls back out
//! (completion callbacks, peer messages, the dirty hook, admitting requests
//! unblocked by a free) is collected while the lock is held and run after
//! it is dropped.

use crate::config::BUFFER_SIZE;
use crate::collab::{PeerMessage, Replicator};
use crate::error::{Error, Result};
use crate::ident::{AllocationId, OwnerId};
use crate::memory::{AtomicBitmap, PeerMemoryMap, SgElement};
use crate::observability;
use crate::policy::{Admission, AdmissionEngine, QueueKind};
use crate::request::{
    BufferInfo, BufferRequest, Opcode, PendingCompletion, RequestStatus, RequestTicket,
    deliver_all,
};
use crate::tag::{ClientLock, TagDirectory, TagHome};
use crate::tracker::{TrackerKey, TrackerPool, TrackerSlot};
use parking_lot::Mutex;
use std::sync::{Arc, OnceLock};

/// What happened to a submitted request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Submission {
    /// Finished; the completion callback has run.
    Completed(RequestTicket),
    /// Waiting on a quota queue.
    Queued {
        /// Request ticket.
        ticket: RequestTicket,
        /// Queue it waits on.
        queue: QueueKind,
    },
    /// Admitted, waiting for a tracker or free tags.
    Pending(RequestTicket),
}

impl Submission {
    /// Ticket of the submitted request.
    pub fn ticket(&self) -> RequestTicket {
        match *self {
            Submission::Completed(t) | Submission::Pending(t) => t,
            Submission::Queued { ticket, .. } => ticket,
        }
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DispatchStats {
    /// Tags in the directory.
    pub total_tags: usize,
    /// Tags on the free list.
    pub free_tags: usize,
    /// Tags in the hash directory.
    pub allocated_tags: usize,
    /// Trackers not in use.
    pub trackers_available: usize,
    /// Requests waiting for a tracker.
    pub trackers_waiting: usize,
}

struct DispatchState {
    directory: TagDirectory,
    trackers: TrackerPool,
    peer_map: PeerMemoryMap,
}

#[derive(Default)]
struct Effects {
    completions: Vec<PendingCompletion>,
    messages: Vec<PeerMessage>,
    released: Vec<AllocationId>,
    dirtied: bool,
}

type DirtyHook = Box<dyn Fn() + Send + Sync>;

/// Routes buffer requests.
pub struct Dispatcher {
    engine: Arc<AdmissionEngine>,
    state: Mutex<DispatchState>,
    replicator: Arc<Replicator>,
    change_table: Arc<AtomicBitmap>,
    dirty_hook: OnceLock<DirtyHook>,
}

impl Dispatcher {
    /// Dispatcher over a directory and a tracker pool.
    pub fn new(
        engine: Arc<AdmissionEngine>,
        directory: TagDirectory,
        trackers: TrackerPool,
        replicator: Arc<Replicator>,
        change_table: Arc<AtomicBitmap>,
    ) -> Self {
        let peer_map = PeerMemoryMap::new(directory.carving().clone());
        Self {
            engine,
            state: Mutex::new(DispatchState {
                directory,
                trackers,
                peer_map,
            }),
            replicator,
            change_table,
            dirty_hook: OnceLock::new(),
        }
    }

    /// Install the callback run after any mutation of buffer state.
    /// Only the first call takes effect.
    pub fn set_dirty_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        let _ = self.dirty_hook.set(Box::new(hook));
    }

    /// The admission engine.
    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    /// Owner clean/dirty table.
    pub fn change_table(&self) -> &Arc<AtomicBitmap> {
        &self.change_table
    }

    /// Submit a request.
    ///
    /// # Errors
    ///
    /// Identifier and argument errors are returned synchronously and the
    /// completion callback is dropped without running. Every other outcome
    /// reaches the callback.
    pub fn submit(&self, request: BufferRequest) -> Result<Submission> {
        let _span = observability::span_request(request.opcode.name(), request.ticket().raw()).entered();
        self.engine.validate(&request.id)?;

        if request.opcode.is_allocation() {
            return match self.engine.admit(request)? {
                Admission::Queued { ticket, queue } => Ok(Submission::Queued { ticket, queue }),
                Admission::Admitted(request) => Ok(self.start_allocation(request)),
            };
        }

        let ticket = request.ticket();
        let mut fx = Effects::default();
        {
            let mut st = self.state.lock();
            match request.opcode {
                Opcode::Commit => self.commit(&mut st, request, &mut fx),
                Opcode::Free => self.free(&mut st, request, &mut fx),
                Opcode::FreeAll => self.free_all(&mut st, request, &mut fx),
                Opcode::Abort => self.abort(&mut st, request, &mut fx),
                Opcode::GetExclusiveLock
                | Opcode::GetSharedLock
                | Opcode::ReleaseExclusiveLock
                | Opcode::ReleaseSharedLock => self.lock_op(&mut st, request, &mut fx),
                Opcode::GetFirst | Opcode::GetNext => self.iterate(&st, request, &mut fx),
                Opcode::Alloc | Opcode::ContiguousAlloc => unreachable!("handled above"),
            }
            record_gauges(&st);
        }
        self.flush(fx);
        Ok(Submission::Completed(ticket))
    }

    /// Copy out of an allocation. Every buffer read must be locked.
    pub fn read(&self, id: &AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        let st = self.state.lock();
        let tags = st.directory.lookup(id);
        if tags.is_empty() {
            return Err(Error::NotFound(format!("allocation {id}")));
        }
        let total = tags.len() as u64 * BUFFER_SIZE as u64;
        if offset
            .checked_add(out.len() as u64)
            .is_none_or(|end| end > total)
        {
            return Err(Error::InvalidArgument(format!(
                "read {offset}+{} beyond {total}",
                out.len()
            )));
        }
        for_each_span(&tags, offset, out.len(), |tag, tag_off, range| {
            let locked = st
                .directory
                .tag(tag)
                .is_some_and(|t| t.client_lock() != ClientLock::None);
            if !locked {
                return Err(Error::InvalidLockState {
                    tag,
                    detail: "read without a lock",
                });
            }
            st.directory.read_buffer(tag, tag_off, &mut out[range])
        })
    }

    /// Attach the peer's memory map.
    pub fn receive_peer_memory_map(&self, sg: &[SgElement]) -> Result<()> {
        self.state.lock().peer_map.receive_peer_memory_map(sg)
    }

    /// Forget the peer's memory map.
    pub fn clear_peer_memory_map(&self) {
        self.state.lock().peer_map.clear_peer();
    }

    /// Whether the peer map is attached.
    pub fn has_peer_map(&self) -> bool {
        self.state.lock().peer_map.has_peer()
    }

    /// Run `f` with exclusive access to the directory.
    pub fn with_directory<R>(&self, f: impl FnOnce(&mut TagDirectory) -> R) -> R {
        f(&mut self.state.lock().directory)
    }

    /// Counters.
    pub fn stats(&self) -> DispatchStats {
        let st = self.state.lock();
        DispatchStats {
            total_tags: st.directory.len(),
            free_tags: st.directory.free_count(),
            allocated_tags: st.directory.allocated_count(),
            trackers_available: st.trackers.available(),
            trackers_waiting: st.trackers.waiting_len(),
        }
    }

    /// Abort everything queued or in flight (shutdown).
    pub fn abort_all(&self) {
        let mut fx = Effects::default();
        for request in self.engine.drain_queued() {
            let id = request.id;
            fx.completions
                .push(request.into_completion(RequestStatus::Aborted, id, Vec::new()));
        }
        {
            let mut st = self.state.lock();
            for (request, tags) in st.trackers.drain() {
                for t in tags {
                    st.directory.push_free(t);
                }
                let id = request.id;
                fx.released.push(id);
                fx.completions
                    .push(request.into_completion(RequestStatus::Aborted, id, Vec::new()));
            }
        }
        // Nothing may be admitted on the way out.
        for id in std::mem::take(&mut fx.released) {
            if let Ok(unblocked) = self.engine.release(&id) {
                for r in unblocked {
                    let rid = r.id;
                    let _ = self.engine.release(&rid);
                    fx.completions
                        .push(r.into_completion(RequestStatus::Aborted, rid, Vec::new()));
                }
            }
        }
        self.flush(fx);
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    fn start_allocation(&self, request: BufferRequest) -> Submission {
        let ticket = request.ticket();
        let mut fx = Effects::default();
        let completed = {
            let mut st = self.state.lock();
            let completed = self.place(&mut st, request, &mut fx);
            record_gauges(&st);
            completed
        };
        self.flush(fx);
        if completed {
            Submission::Completed(ticket)
        } else {
            Submission::Pending(ticket)
        }
    }

    /// Hand an admitted request to the tracker pool. Returns whether it
    /// finished immediately.
    fn place(&self, st: &mut DispatchState, request: BufferRequest, fx: &mut Effects) -> bool {
        if request.buffer_units() > st.directory.len() {
            let id = request.id;
            tracing::warn!(%id, units = request.buffer_units(), "allocation larger than all memory");
            fx.released.push(id);
            fx.completions.push(request.into_completion(
                RequestStatus::InsufficientResources,
                id,
                Vec::new(),
            ));
            return true;
        }
        match st.trackers.allocate(request) {
            TrackerSlot::Waiting => false,
            TrackerSlot::Active(key) => self.fill(st, key, fx),
        }
    }

    /// Reserve tags for a tracker; finish it once satisfied.
    fn fill(&self, st: &mut DispatchState, key: TrackerKey, fx: &mut Effects) -> bool {
        let DispatchState {
            directory,
            trackers,
            ..
        } = st;
        let Some(tracker) = trackers.get_mut(key) else {
            return false;
        };
        if tracker.is_contiguous() {
            if tracker.tags().is_empty() {
                if let Some(run) = directory.take_contiguous(tracker.units_needed()) {
                    for t in run {
                        tracker.push_tag(t);
                    }
                }
            }
        } else {
            while !tracker.is_satisfied() {
                let Some(t) = directory.pop_free() else { break };
                tracker.push_tag(t);
            }
        }
        if !tracker.is_satisfied() {
            return false;
        }
        self.finish(st, key, fx);
        true
    }

    /// Stamp a satisfied tracker's tags and complete its request.
    fn finish(&self, st: &mut DispatchState, key: TrackerKey, fx: &mut Effects) {
        let Some(mut tracker) = st.trackers.release(key) else {
            return;
        };
        let mut tags = Vec::with_capacity(tracker.tags().len());
        while let Some(t) = tracker.pop_tag() {
            tags.push(t);
        }
        tags.sort_unstable();
        let (request, _) = tracker.into_parts();
        let id = request.id;

        let mut remaining = request.size;
        let mut failure = None;
        for (n, t) in tags.iter().enumerate() {
            let share = if n + 1 == tags.len() {
                remaining
            } else {
                remaining.min(BUFFER_SIZE as u64)
            };
            remaining -= share;
            if let Err(e) = st.directory.prepare(*t, id, share) {
                failure = Some(e);
                break;
            }
        }

        if let Some(e) = failure {
            tracing::error!(%id, error = %e, "failed to stamp tags");
            let _ = st.directory.release(&id);
            for t in &tags {
                if st
                    .directory
                    .tag(*t)
                    .is_some_and(|tag| tag.home() == TagHome::Reserved)
                {
                    st.directory.push_free(*t);
                }
            }
            fx.released.push(id);
            fx.completions
                .push(request.into_completion(RequestStatus::from_error(&e), id, Vec::new()));
            return;
        }

        for t in &tags {
            if let Some(tag) = st.directory.tag(*t) {
                fx.messages.push(PeerMessage::TagUpdate {
                    record: tag.record(),
                    data: None,
                });
            }
        }
        self.mark_dirty(id.owner, fx);
        tracing::debug!(%id, buffers = tags.len(), "allocation complete");
        let buffers = buffer_infos(st, &tags);
        fx.completions
            .push(request.into_completion(RequestStatus::Ok, id, buffers));

        // A tracker just came free.
        self.promote_waiters(st, fx);
    }

    /// Hand free trackers to requests on the wait list, oldest first.
    fn promote_waiters(&self, st: &mut DispatchState, fx: &mut Effects) {
        while let Some(next) = st.trackers.promote_waiting() {
            self.fill(st, next, fx);
        }
    }

    /// Give freed tags to waiting trackers, oldest first, then fill any
    /// tracker that came free.
    fn retry_trackers(&self, st: &mut DispatchState, fx: &mut Effects) {
        for key in st.trackers.active_keys() {
            if st.directory.free_count() == 0 {
                break;
            }
            self.fill(st, key, fx);
        }
        self.promote_waiters(st, fx);
    }

    // ========================================================================
    // Other opcodes
    // ========================================================================

    fn commit(&self, st: &mut DispatchState, request: BufferRequest, fx: &mut Effects) {
        let id = request.id;
        let tags = st.directory.lookup(&id);
        if tags.is_empty() {
            fx.completions
                .push(request.into_completion(RequestStatus::NotFound, id, Vec::new()));
            return;
        }
        let total = tags.len() as u64 * BUFFER_SIZE as u64;
        let len = request.sg_len();
        if request
            .offset
            .checked_add(len)
            .is_none_or(|end| end > total)
        {
            fx.completions
                .push(request.into_completion(RequestStatus::InvalidArgument, id, Vec::new()));
            return;
        }
        if let Some(t) = tags.iter().find(|t| {
            st.directory
                .tag(**t)
                .is_some_and(|tag| tag.client_lock() != ClientLock::Exclusive)
        }) {
            tracing::debug!(%id, tag = t, "commit without exclusive lock");
            fx.completions
                .push(request.into_completion(RequestStatus::InvalidLockState, id, Vec::new()));
            return;
        }

        let data: Vec<u8> = request.sg.iter().flat_map(|b| b.iter().copied()).collect();
        let mut touched = Vec::new();
        let result = for_each_span(&tags, request.offset, data.len(), |tag, tag_off, range| {
            touched.push(tag);
            st.directory.commit(tag, tag_off, &data[range])
        });
        if let Err(e) = result {
            fx.completions
                .push(request.into_completion(RequestStatus::from_error(&e), id, Vec::new()));
            return;
        }

        for t in &tags {
            if let Some(tag) = st.directory.tag_mut(*t) {
                tag.struct_locked = false;
                let _ = tag.unlock_exclusive();
            }
            let _ = st.directory.persist_tag(*t);
            if let Some(tag) = st.directory.tag(*t) {
                let data = touched
                    .contains(t)
                    .then(|| st.directory.buffer_contents(*t).ok().map(bytes::Bytes::from))
                    .flatten();
                fx.messages.push(PeerMessage::TagUpdate {
                    record: tag.record(),
                    data,
                });
            }
        }
        self.mark_dirty(id.owner, fx);
        let buffers = buffer_infos(st, &tags);
        fx.completions
            .push(request.into_completion(RequestStatus::Ok, id, buffers));
    }

    fn free(&self, st: &mut DispatchState, request: BufferRequest, fx: &mut Effects) {
        let id = request.id;
        match self.free_one(st, &id, fx) {
            Ok(()) => fx
                .completions
                .push(request.into_completion(RequestStatus::Ok, id, Vec::new())),
            Err(e) => fx
                .completions
                .push(request.into_completion(RequestStatus::from_error(&e), id, Vec::new())),
        }
        self.retry_trackers(st, fx);
    }

    fn free_one(&self, st: &mut DispatchState, id: &AllocationId, fx: &mut Effects) -> Result<()> {
        match st.directory.release(id) {
            Ok(freed) => {
                let node = st.directory.node();
                fx.messages
                    .extend(freed.iter().map(|index| PeerMessage::TagFree { node, index: *index }));
                fx.released.push(*id);
                self.mark_dirty(id.owner, fx);
                observability::record_freed(id.client_id().raw());
                tracing::debug!(%id, buffers = freed.len(), "allocation freed");
                Ok(())
            }
            Err(e) => {
                // Freeing an allocation still waiting for tags cancels it.
                let Some(ticket) = st.trackers.find_id(id) else {
                    return Err(e);
                };
                self.cancel_tracked(st, ticket, fx);
                Ok(())
            }
        }
    }

    fn free_all(&self, st: &mut DispatchState, request: BufferRequest, fx: &mut Effects) {
        let owner: OwnerId = request.id.owner;
        let ids: Vec<AllocationId> = st.directory.owner_allocations(owner).into_values().collect();
        for id in &ids {
            if let Err(e) = self.free_one(st, id, fx) {
                tracing::warn!(%id, error = %e, "free-all skipped allocation");
            }
        }
        tracing::debug!(%owner, freed = ids.len(), "owner allocations freed");
        let id = request.id;
        fx.completions
            .push(request.into_completion(RequestStatus::Ok, id, Vec::new()));
        self.retry_trackers(st, fx);
    }

    fn abort(&self, st: &mut DispatchState, request: BufferRequest, fx: &mut Effects) {
        let id = request.id;
        let Some(target) = request.target else {
            fx.completions
                .push(request.into_completion(RequestStatus::InvalidArgument, id, Vec::new()));
            return;
        };

        // Only the requester's own client may cancel it.
        let client = id.client_id();
        let status = if let Some(queued) = self.engine.abort(target, client) {
            observability::record_aborted(queued.id.client_id().raw());
            let qid = queued.id;
            fx.completions
                .push(queued.into_completion(RequestStatus::Aborted, qid, Vec::new()));
            RequestStatus::Ok
        } else if st
            .trackers
            .request(target)
            .is_some_and(|r| r.id.client_id() == client)
            && self.cancel_tracked(st, target, fx)
        {
            self.retry_trackers(st, fx);
            RequestStatus::Ok
        } else {
            RequestStatus::NotFound
        };
        fx.completions.push(request.into_completion(status, id, Vec::new()));
    }

    /// Cancel a request held by the tracker pool. Returns whether one was
    /// found.
    fn cancel_tracked(&self, st: &mut DispatchState, ticket: RequestTicket, fx: &mut Effects) -> bool {
        let (request, tags) = match st.trackers.find_ticket(ticket) {
            Some(TrackerSlot::Waiting) => match st.trackers.remove_waiting(ticket) {
                Some(r) => (r, Vec::new()),
                None => return false,
            },
            Some(TrackerSlot::Active(key)) => match st.trackers.release(key) {
                Some(t) => t.into_parts(),
                None => return false,
            },
            None => return false,
        };
        for t in tags {
            st.directory.push_free(t);
        }
        let id = request.id;
        observability::record_aborted(id.client_id().raw());
        tracing::debug!(%id, %ticket, "in-flight allocation aborted");
        fx.released.push(id);
        fx.completions
            .push(request.into_completion(RequestStatus::Aborted, id, Vec::new()));
        true
    }

    fn lock_op(&self, st: &mut DispatchState, request: BufferRequest, fx: &mut Effects) {
        let id = request.id;
        let tags = st.directory.lookup(&id);
        if tags.is_empty() {
            fx.completions
                .push(request.into_completion(RequestStatus::NotFound, id, Vec::new()));
            return;
        }

        let opcode = request.opcode;
        let mut done: Vec<u32> = Vec::with_capacity(tags.len());
        let mut failure = None;
        for t in &tags {
            let Some(tag) = st.directory.tag_mut(*t) else { continue };
            let result = match opcode {
                Opcode::GetExclusiveLock => tag.lock_exclusive(),
                Opcode::GetSharedLock => tag.lock_shared(),
                Opcode::ReleaseExclusiveLock => tag.unlock_exclusive(),
                _ => tag.unlock_shared(),
            };
            match result {
                Ok(()) => done.push(*t),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            // All or nothing: put back what was already changed.
            for t in done {
                if let Some(tag) = st.directory.tag_mut(t) {
                    let _ = match opcode {
                        Opcode::GetExclusiveLock => tag.unlock_exclusive(),
                        Opcode::GetSharedLock => tag.unlock_shared(),
                        Opcode::ReleaseExclusiveLock => tag.lock_exclusive(),
                        _ => tag.lock_shared(),
                    };
                }
            }
            fx.completions
                .push(request.into_completion(RequestStatus::from_error(&e), id, Vec::new()));
            return;
        }

        for t in &tags {
            let _ = st.directory.persist_tag(*t);
        }
        let buffers = buffer_infos(st, &tags);
        fx.completions
            .push(request.into_completion(RequestStatus::Ok, id, buffers));
    }

    fn iterate(&self, st: &DispatchState, request: BufferRequest, fx: &mut Effects) {
        let allocations = st.directory.owner_allocations(request.id.owner);
        let found = match request.opcode {
            Opcode::GetFirst => allocations.values().next().copied(),
            _ => {
                let current = allocations
                    .iter()
                    .find(|(_, id)| **id == request.id)
                    .map(|(first, _)| *first);
                current.and_then(|first| {
                    allocations
                        .range(first + 1..)
                        .next()
                        .map(|(_, id)| *id)
                })
            }
        };
        match found {
            Some(id) => {
                let tags = st.directory.lookup(&id);
                let buffers = buffer_infos(st, &tags);
                fx.completions
                    .push(request.into_completion(RequestStatus::Ok, id, buffers));
            }
            None => {
                let id = request.id;
                fx.completions
                    .push(request.into_completion(RequestStatus::NotFound, id, Vec::new()));
            }
        }
    }

    // ========================================================================
    // Effects
    // ========================================================================

    fn mark_dirty(&self, owner: OwnerId, fx: &mut Effects) {
        self.change_table.set(owner.raw() as usize);
        fx.dirtied = true;
    }

    /// Run collected effects, then admit whatever the released allocations
    /// unblocked.
    fn flush(&self, mut fx: Effects) {
        loop {
            deliver_all(std::mem::take(&mut fx.completions));
            self.replicator.send_all(fx.messages.drain(..));
            if std::mem::take(&mut fx.dirtied) {
                if let Some(hook) = self.dirty_hook.get() {
                    hook();
                }
            }

            let released = std::mem::take(&mut fx.released);
            if released.is_empty() {
                return;
            }
            let mut unblocked = Vec::new();
            for id in released {
                match self.engine.release(&id) {
                    Ok(admitted) => unblocked.extend(admitted),
                    Err(e) => tracing::warn!(%id, error = %e, "release without accounting"),
                }
            }
            if unblocked.is_empty() {
                continue;
            }
            let mut st = self.state.lock();
            for request in unblocked {
                self.place(&mut st, request, &mut fx);
            }
            record_gauges(&st);
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("stats", &self.stats())
            .finish()
    }
}

fn record_gauges(st: &DispatchState) {
    observability::record_free_tags(st.directory.free_count());
    observability::record_trackers_available(st.trackers.available());
}

fn buffer_infos(st: &DispatchState, tags: &[u32]) -> Vec<BufferInfo> {
    tags.iter()
        .filter_map(|t| {
            let tag = st.directory.tag(*t)?;
            let peer_address = st
                .peer_map
                .mapping(*t)
                .and_then(|m| m.remote)
                .map(|r| r.buffer_address);
            Some(BufferInfo {
                tag: *t,
                address: tag.placement().buffer_address,
                peer_address,
                len: tag.byte_len(),
            })
        })
        .collect()
}

/// Walk `len` bytes starting at allocation `offset` across `tags`, calling
/// `f(tag, offset_in_tag, range_in_caller_buffer)` per touched buffer.
fn for_each_span(
    tags: &[u32],
    offset: u64,
    len: usize,
    mut f: impl FnMut(u32, u64, std::ops::Range<usize>) -> Result<()>,
) -> Result<()> {
    let bs = BUFFER_SIZE as u64;
    let mut done = 0usize;
    while done < len {
        let pos = offset + done as u64;
        let Some(tag) = tags.get((pos / bs) as usize) else {
            return Err(Error::InvalidArgument("span beyond allocation".into()));
        };
        let tag_off = pos % bs;
        let chunk = ((bs - tag_off) as usize).min(len - done);
        f(*tag, tag_off, done..done + chunk)?;
        done += chunk;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::{ClientId, NodeId};
    use crate::memory::{CarveMode, PersistentSegment, carve, required_bytes};
    use crate::policy::{ClientRegistration, OwnerRegistration, PolicyKind};
    use crate::request::RequestOutcome;
    use std::sync::mpsc;

    fn dispatcher(buffers: usize, trackers: usize) -> (Dispatcher, OwnerId) {
        let sg = [SgElement::new(0x100_0000, required_bytes(buffers))];
        let segment = Arc::new(PersistentSegment::new(&sg).unwrap());
        let carving = carve(&sg, buffers, CarveMode::Strict).unwrap();
        let mut directory = TagDirectory::new(carving, segment, NodeId::A);
        directory.format().unwrap();

        let engine = Arc::new(AdmissionEngine::new((buffers * BUFFER_SIZE) as u64));
        engine
            .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
            .unwrap();
        let owner = OwnerId::create(ClientId::RAID, 1).unwrap();
        engine
            .register_owner(ClientId::RAID, owner, OwnerRegistration::default())
            .unwrap();

        let d = Dispatcher::new(
            engine,
            directory,
            TrackerPool::new(trackers),
            Arc::new(Replicator::new(None)),
            Arc::new(AtomicBitmap::new(1 << 20)),
        );
        (d, owner)
    }

    fn run(d: &Dispatcher, req: BufferRequest) -> RequestOutcome {
        let (tx, rx) = mpsc::channel();
        let sub = d
            .submit(req.on_complete(move |o| tx.send(o).unwrap()))
            .unwrap();
        assert!(matches!(sub, Submission::Completed(_)));
        rx.recv().unwrap()
    }

    #[test]
    fn test_alloc_commit_free() {
        let (d, owner) = dispatcher(4, 4);
        let id = AllocationId::new(owner, 1);
        let size = BUFFER_SIZE as u64 + 100;

        let out = run(&d, BufferRequest::alloc(id, size));
        assert!(out.is_ok());
        assert_eq!(out.buffers.len(), 2);
        assert_eq!(out.buffers.iter().map(|b| b.len).sum::<u64>(), size);

        let payload = vec![0x5Au8; 1000];
        let commit = BufferRequest::commit(id, BUFFER_SIZE as u64 - 500, payload.clone());
        assert!(run(&d, commit).is_ok());

        run(&d, BufferRequest::new(Opcode::GetSharedLock, id));
        let mut back = vec![0u8; 1000];
        d.read(&id, BUFFER_SIZE as u64 - 500, &mut back).unwrap();
        assert_eq!(back, payload);
        run(&d, BufferRequest::new(Opcode::ReleaseSharedLock, id));

        assert!(run(&d, BufferRequest::free(id)).is_ok());
        assert_eq!(d.stats().free_tags, 4);
        assert_eq!(d.engine().total_allocated(), 0);
        assert!(d.change_table().is_set(owner.raw() as usize));
    }

    #[test]
    fn test_commit_requires_exclusive() {
        let (d, owner) = dispatcher(2, 2);
        let id = AllocationId::new(owner, 1);
        run(&d, BufferRequest::alloc(id, 10));
        assert!(run(&d, BufferRequest::commit(id, 0, vec![1u8; 10])).is_ok());
        // Lock was released by the first commit.
        let out = run(&d, BufferRequest::commit(id, 0, vec![2u8; 10]));
        assert_eq!(out.status, RequestStatus::InvalidLockState);
    }

    #[test]
    fn test_lock_exclusion() {
        let (d, owner) = dispatcher(2, 2);
        let id = AllocationId::new(owner, 1);
        run(&d, BufferRequest::alloc(id, 10));
        run(&d, BufferRequest::commit(id, 0, vec![1u8; 10]));

        assert!(run(&d, BufferRequest::new(Opcode::GetSharedLock, id)).is_ok());
        let out = run(&d, BufferRequest::new(Opcode::GetExclusiveLock, id));
        assert_eq!(out.status, RequestStatus::LockConflict);
        run(&d, BufferRequest::new(Opcode::ReleaseSharedLock, id));

        assert!(run(&d, BufferRequest::new(Opcode::GetExclusiveLock, id)).is_ok());
        let out = run(&d, BufferRequest::new(Opcode::GetExclusiveLock, id));
        assert_eq!(out.status, RequestStatus::InvalidLockState);
    }

    #[test]
    fn test_waits_for_tags_then_completes() {
        let (d, owner) = dispatcher(2, 4);
        let a = AllocationId::new(owner, 1);
        let b = AllocationId::new(owner, 2);
        run(&d, BufferRequest::alloc(a, 2 * BUFFER_SIZE as u64));

        // Quota is full in bytes too, so b queues on the client queue.
        let (tx, rx) = mpsc::channel();
        let sub = d
            .submit(BufferRequest::alloc(b, 10).on_complete(move |o| tx.send(o).unwrap()))
            .unwrap();
        assert!(matches!(sub, Submission::Queued { .. }));

        run(&d, BufferRequest::free(a));
        let out = rx.recv().unwrap();
        assert!(out.is_ok());
        assert_eq!(out.id, b);
    }

    #[test]
    fn test_abort_pending_tracker() {
        // Small allocations exhaust tags before bytes.
        let (d, owner) = dispatcher(1, 4);
        let a = AllocationId::new(owner, 1);
        let b = AllocationId::new(owner, 2);
        run(&d, BufferRequest::alloc(a, 10));

        let (tx, rx) = mpsc::channel();
        let sub = d
            .submit(BufferRequest::alloc(b, 10).on_complete(move |o| tx.send(o).unwrap()))
            .unwrap();
        let Submission::Pending(ticket) = sub else {
            panic!("expected pending, got {sub:?}")
        };

        let out = run(&d, BufferRequest::abort(b, ticket));
        assert!(out.is_ok());
        assert_eq!(rx.recv().unwrap().status, RequestStatus::Aborted);
        assert_eq!(d.engine().allocation_size(&b), None);
    }

    #[test]
    fn test_aborted_tracker_passes_to_waiter() {
        let (d, owner) = dispatcher(1, 1);
        let a = AllocationId::new(owner, 1);
        let b = AllocationId::new(owner, 2);
        let c = AllocationId::new(owner, 3);
        run(&d, BufferRequest::alloc(a, 10));

        // b holds the only tracker waiting for tags; c waits for a tracker.
        let (b_tx, b_rx) = mpsc::channel();
        let Submission::Pending(b_ticket) = d
            .submit(BufferRequest::alloc(b, 10).on_complete(move |o| b_tx.send(o).unwrap()))
            .unwrap()
        else {
            panic!("b should be pending")
        };
        let (c_tx, c_rx) = mpsc::channel();
        let sub = d
            .submit(BufferRequest::alloc(c, 10).on_complete(move |o| c_tx.send(o).unwrap()))
            .unwrap();
        assert!(matches!(sub, Submission::Pending(_)));
        assert_eq!(d.stats().trackers_waiting, 1);

        assert!(run(&d, BufferRequest::abort(b, b_ticket)).is_ok());
        assert_eq!(b_rx.recv().unwrap().status, RequestStatus::Aborted);
        assert_eq!(d.stats().trackers_waiting, 0);
        assert_eq!(d.stats().trackers_available, 0);

        assert!(run(&d, BufferRequest::free(a)).is_ok());
        let out = c_rx.try_recv().unwrap();
        assert!(out.is_ok());
        assert_eq!(out.id, c);
        assert_eq!(d.stats().trackers_available, 1);
        assert!(d.engine().is_conserved());
    }

    #[test]
    fn test_abort_scoped_to_queued_client() {
        let (d, raid) = dispatcher(4, 4);
        d.engine()
            .register_client(
                ClientRegistration::new(ClientId::METADATA, PolicyKind::Explicit).limit(10),
            )
            .unwrap();
        let meta = OwnerId::create(ClientId::METADATA, 1).unwrap();
        d.engine()
            .register_owner(ClientId::METADATA, meta, OwnerRegistration::default())
            .unwrap();
        run(&d, BufferRequest::alloc(AllocationId::new(meta, 1), 10));

        let (tx, rx) = mpsc::channel();
        let sub = d
            .submit(
                BufferRequest::alloc(AllocationId::new(meta, 2), 10)
                    .on_complete(move |o| tx.send(o).unwrap()),
            )
            .unwrap();
        let Submission::Queued { ticket, .. } = sub else {
            panic!("expected queueing, got {sub:?}")
        };

        let foreign = run(&d, BufferRequest::abort(AllocationId::new(raid, 99), ticket));
        assert_eq!(foreign.status, RequestStatus::NotFound);
        assert!(d.engine().is_queued(ticket));
        assert!(rx.try_recv().is_err());

        let own = run(&d, BufferRequest::abort(AllocationId::new(meta, 2), ticket));
        assert!(own.is_ok());
        assert_eq!(rx.recv().unwrap().status, RequestStatus::Aborted);
    }

    #[test]
    fn test_abort_scoped_to_tracked_client() {
        let (d, raid) = dispatcher(1, 4);
        run(&d, BufferRequest::alloc(AllocationId::new(raid, 1), 10));
        let (tx, rx) = mpsc::channel();
        let Submission::Pending(ticket) = d
            .submit(
                BufferRequest::alloc(AllocationId::new(raid, 2), 10)
                    .on_complete(move |o| tx.send(o).unwrap()),
            )
            .unwrap()
        else {
            panic!("expected pending")
        };

        d.engine()
            .register_client(ClientRegistration::new(ClientId::METADATA, PolicyKind::Simple))
            .unwrap();
        let meta = OwnerId::create(ClientId::METADATA, 1).unwrap();
        d.engine()
            .register_owner(ClientId::METADATA, meta, OwnerRegistration::default())
            .unwrap();

        let foreign = run(&d, BufferRequest::abort(AllocationId::new(meta, 1), ticket));
        assert_eq!(foreign.status, RequestStatus::NotFound);
        assert_eq!(d.stats().trackers_available, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_offset_overflow_rejected() {
        let (d, owner) = dispatcher(1, 1);
        let id = AllocationId::new(owner, 1);
        run(&d, BufferRequest::alloc(id, 10));

        let out = run(&d, BufferRequest::commit(id, u64::MAX, vec![1u8; 4]));
        assert_eq!(out.status, RequestStatus::InvalidArgument);
        let mut back = [0u8; 4];
        assert!(matches!(
            d.read(&id, u64::MAX, &mut back),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_allocation_tags_ascend_by_index() {
        let (d, owner) = dispatcher(4, 4);
        for buffer in 1..=3 {
            run(&d, BufferRequest::alloc(AllocationId::new(owner, buffer), 1));
        }
        run(&d, BufferRequest::free(AllocationId::new(owner, 1)));
        run(&d, BufferRequest::free(AllocationId::new(owner, 3)));

        // The free list now pops 2, 0, 3; offsets still follow tag index.
        let size = 2 * BUFFER_SIZE as u64 + 100;
        let out = run(&d, BufferRequest::alloc(AllocationId::new(owner, 4), size));
        let tags: Vec<u32> = out.buffers.iter().map(|b| b.tag).collect();
        assert_eq!(tags, vec![0, 2, 3]);
        let lens: Vec<u64> = out.buffers.iter().map(|b| b.len).collect();
        assert_eq!(lens, vec![BUFFER_SIZE as u64, BUFFER_SIZE as u64, 100]);
    }

    #[test]
    fn test_iteration_order() {
        let (d, owner) = dispatcher(4, 4);
        for buffer in [30, 10, 20] {
            run(&d, BufferRequest::alloc(AllocationId::new(owner, buffer), 1));
        }
        let first = run(&d, BufferRequest::new(Opcode::GetFirst, AllocationId::new(owner, 0)));
        assert_eq!(first.id.buffer, 30);
        let second = run(&d, BufferRequest::new(Opcode::GetNext, first.id));
        assert_eq!(second.id.buffer, 10);
        let third = run(&d, BufferRequest::new(Opcode::GetNext, second.id));
        assert_eq!(third.id.buffer, 20);
        let end = run(&d, BufferRequest::new(Opcode::GetNext, third.id));
        assert_eq!(end.status, RequestStatus::NotFound);
    }

    #[test]
    fn test_contiguous_alloc() {
        let (d, owner) = dispatcher(4, 4);
        run(&d, BufferRequest::alloc(AllocationId::new(owner, 1), 1));
        let out = run(
            &d,
            BufferRequest::contiguous_alloc(AllocationId::new(owner, 2), 3 * BUFFER_SIZE as u64),
        );
        assert!(out.is_ok());
        let tags: Vec<u32> = out.buffers.iter().map(|b| b.tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        for pair in out.buffers.windows(2) {
            assert_eq!(pair[1].address, pair[0].address + BUFFER_SIZE as u64);
        }
    }

    #[test]
    fn test_free_all() {
        let (d, owner) = dispatcher(4, 4);
        for buffer in 1..=3 {
            run(&d, BufferRequest::alloc(AllocationId::new(owner, buffer), 1));
        }
        assert!(run(&d, BufferRequest::new(Opcode::FreeAll, AllocationId::new(owner, 0))).is_ok());
        assert_eq!(d.stats().allocated_tags, 0);
        assert!(d.engine().is_conserved());
    }

    #[test]
    fn test_unregistered_rejected_synchronously() {
        let (d, _) = dispatcher(1, 1);
        let stranger = AllocationId::new(OwnerId::create(ClientId::CACHE, 1).unwrap(), 1);
        assert!(matches!(
            d.submit(BufferRequest::free(stranger)),
            Err(Error::InvalidIdentifier(_))
        ));
    }
}
