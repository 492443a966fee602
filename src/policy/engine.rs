//! Admission engine: client and owner quotas with FIFO wait queues.
//!
//! Every allocation request passes two checks before it may reserve memory:
//!
//! 1. **Owner check** (explicit-policy clients only): the owner's bytes plus
//!    the request must stay within the owner's limit, if it has one.
//! 2. **Client check**: the request passes outright if it fits the client's
//!    unused reservation. Otherwise it must fit the unreserved headroom
//!    (capacity minus everything allocated minus every other client's
//!    unused reservation) and the client's limit, if it has one.
//!
//! A request failing the owner check waits on the owner queue; one failing
//! the client check waits on the client queue. When memory is released the
//! owner queues are scanned first, moving admissible heads down to their
//! client queue, then the client queues are scanned, admitting heads. Each
//! scan stops at the first head that still does not fit, so a request is
//! never overtaken by one that arrived after it.
//!
//! All tables live behind one lock held only for the decision and the
//! counter update. Admitted requests are returned to the caller, which
//! dispatches them after the lock is dropped.

use super::client::{ClientEntry, ClientEvent, ClientRegistration, ClientUsage, EventCallback, PolicyKind};
use super::owner::{OwnerEntry, OwnerRegistration, OwnerUsage};
use super::RequestKey;
use crate::error::{Error, Result};
use crate::ident::{AllocationId, BufferId, ClientId, MAX_CLIENTS, OwnerId};
use crate::observability;
use crate::request::{BufferRequest, RequestTicket};
use parking_lot::Mutex;
use slotmap::SlotMap;
use std::collections::{BTreeMap, HashMap};

/// Which wait queue a request sits on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueKind {
    /// Blocked by the owner limit.
    Owner,
    /// Blocked by the client quota.
    Client,
}

impl QueueKind {
    fn label(self) -> &'static str {
        match self {
            QueueKind::Owner => "owner",
            QueueKind::Client => "client",
        }
    }
}

/// Result of submitting an allocation for admission.
#[derive(Debug)]
pub enum Admission {
    /// Accounted; dispatch it.
    Admitted(BufferRequest),
    /// Waiting on a quota queue.
    Queued {
        /// Ticket of the queued request.
        ticket: RequestTicket,
        /// Queue it waits on.
        queue: QueueKind,
    },
}

struct Pending {
    request: BufferRequest,
    queue: QueueKind,
}

struct Tables {
    total_allocated: u64,
    clients: Vec<Option<ClientEntry>>,
    owners: BTreeMap<OwnerId, OwnerEntry>,
    pending: SlotMap<RequestKey, Pending>,
    tickets: HashMap<RequestTicket, RequestKey>,
    allocations: HashMap<AllocationId, u64>,
    orphans: BTreeMap<OwnerId, Vec<(BufferId, u64)>>,
}

/// Client/owner quota bookkeeping and request admission.
pub struct AdmissionEngine {
    capacity: u64,
    tables: Mutex<Tables>,
}

impl AdmissionEngine {
    /// Engine policing `capacity` bytes of buffer memory.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            tables: Mutex::new(Tables {
                total_allocated: 0,
                clients: (0..MAX_CLIENTS).map(|_| None).collect(),
                owners: BTreeMap::new(),
                pending: SlotMap::with_key(),
                tickets: HashMap::new(),
                allocations: HashMap::new(),
                orphans: BTreeMap::new(),
            }),
        }
    }

    /// Bytes of memory policed.
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes admitted across all clients.
    pub fn total_allocated(&self) -> u64 {
        self.tables.lock().total_allocated
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a client.
    ///
    /// # Errors
    ///
    /// `InvalidIdentifier` for the reserved id, `AlreadyRegistered` for a
    /// duplicate, `InsufficientResources` if the reservations of all clients
    /// would exceed capacity.
    pub fn register_client(&self, registration: ClientRegistration) -> Result<()> {
        let client = registration.client;
        if client.is_invalid() {
            return Err(Error::invalid_id("client id 0 is reserved"));
        }
        let mut t = self.tables.lock();
        if t.clients[client.index()].is_some() {
            return Err(Error::AlreadyRegistered(client.to_string()));
        }
        let reserved: u64 = t
            .clients
            .iter()
            .flatten()
            .map(|c| c.registration.reservation)
            .sum();
        if reserved + registration.reservation > self.capacity {
            return Err(Error::InsufficientResources(format!(
                "{client} reservation of {} bytes exceeds remaining {}",
                registration.reservation,
                self.capacity - reserved
            )));
        }
        tracing::info!(
            %client,
            policy = ?registration.policy,
            reservation = registration.reservation,
            limit = ?registration.limit,
            "client registered"
        );
        t.clients[client.index()] = Some(ClientEntry::new(registration));
        Ok(())
    }

    /// Unregister a client with no owners, allocations or queued requests.
    pub fn unregister_client(&self, client: ClientId) -> Result<()> {
        let mut t = self.tables.lock();
        let entry = t
            .clients
            .get(client.index())
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::invalid_id(format!("{client} not registered")))?;
        if entry.allocation_count > 0 {
            return Err(Error::not_empty(
                client.to_string(),
                format!("{} allocations outstanding", entry.allocation_count),
            ));
        }
        if !entry.queue.is_empty() {
            return Err(Error::not_empty(
                client.to_string(),
                format!("{} requests queued", entry.queue.len()),
            ));
        }
        if entry.owner_count > 0 {
            return Err(Error::not_empty(
                client.to_string(),
                format!("{} owners registered", entry.owner_count),
            ));
        }
        t.clients[client.index()] = None;
        tracing::info!(%client, "client unregistered");
        Ok(())
    }

    /// Register an owner under `client`.
    ///
    /// Allocations reloaded for this owner after a restart are charged to it
    /// now.
    ///
    /// # Errors
    ///
    /// `InvalidIdentifier` if the client is not registered or the owner id
    /// does not encode it; `AlreadyRegistered` for a duplicate.
    pub fn register_owner(
        &self,
        client: ClientId,
        owner: OwnerId,
        registration: OwnerRegistration,
    ) -> Result<()> {
        if owner.client_id() != client {
            return Err(Error::invalid_id(format!(
                "{owner} encodes {}, not {client}",
                owner.client_id()
            )));
        }
        let mut t = self.tables.lock();
        if t.client(client).is_none() {
            return Err(Error::invalid_id(format!("{client} not registered")));
        }
        if t.owners.contains_key(&owner) {
            return Err(Error::AlreadyRegistered(owner.to_string()));
        }

        let mut entry = OwnerEntry::new(registration);
        let adopted = t.orphans.remove(&owner).unwrap_or_default();
        let adopted_bytes: u64 = adopted.iter().map(|(_, b)| *b).sum();
        for (buffer, bytes) in &adopted {
            t.allocations.insert(AllocationId::new(owner, *buffer), *bytes);
        }
        entry.bytes_allocated = adopted_bytes;
        entry.allocation_count = adopted.len() as u64;
        t.owners.insert(owner, entry);

        if let Some(c) = t.client_mut(client) {
            c.owner_count += 1;
            c.bytes_allocated += adopted_bytes;
            c.allocation_count += adopted.len() as u64;
        }
        tracing::debug!(%owner, adopted = adopted.len(), "owner registered");
        Ok(())
    }

    /// Unregister an owner with no allocations or queued requests.
    pub fn unregister_owner(&self, owner: OwnerId) -> Result<()> {
        let mut t = self.tables.lock();
        let entry = t
            .owners
            .get(&owner)
            .ok_or_else(|| Error::invalid_id(format!("{owner} not registered")))?;
        if entry.allocation_count > 0 {
            return Err(Error::not_empty(
                owner.to_string(),
                format!("{} allocations outstanding", entry.allocation_count),
            ));
        }
        let queued_in_client = t.queued_in_client(owner, 0).1;
        if !entry.queue.is_empty() || queued_in_client > 0 {
            return Err(Error::not_empty(owner.to_string(), "requests queued"));
        }
        t.owners.remove(&owner);
        if let Some(c) = t.client_mut(owner.client_id()) {
            c.owner_count -= 1;
        }
        tracing::debug!(%owner, "owner unregistered");
        Ok(())
    }

    // ========================================================================
    // Admission
    // ========================================================================

    /// Check that an identifier names a registered client and owner that
    /// agree.
    pub fn validate(&self, id: &AllocationId) -> Result<()> {
        self.tables.lock().resolve(id)
    }

    /// Submit an allocation request for admission.
    ///
    /// # Errors
    ///
    /// `InvalidIdentifier` for unregistered or mismatched ids or a buffer id
    /// already in use; `InvalidArgument` for a size of zero or larger than
    /// capacity. Quota pressure is not an error: the request is queued.
    pub fn admit(&self, request: BufferRequest) -> Result<Admission> {
        let id = request.id;
        let size = request.size;
        if size == 0 || size > self.capacity {
            return Err(Error::InvalidArgument(format!(
                "allocation of {size} bytes outside 1..={}",
                self.capacity
            )));
        }

        let mut t = self.tables.lock();
        t.resolve(&id)?;
        if t.allocations.contains_key(&id)
            || t.pending.values().any(|p| p.request.id == id)
        {
            return Err(Error::invalid_id(format!("buffer id of {id} already in use")));
        }

        let client = id.client_id();
        let owner_blocked = {
            let owner_entry = &t.owners[&id.owner];
            let extra = t.queued_in_client(id.owner, 0).0;
            !owner_entry.queue.is_empty() || !t.owner_check(&id, extra, size)
        };
        let queue = if owner_blocked {
            Some(QueueKind::Owner)
        } else {
            let client_queued = t.client(client).is_some_and(|c| !c.queue.is_empty());
            (client_queued || !t.client_check(client, size, self.capacity))
                .then_some(QueueKind::Client)
        };

        match queue {
            Some(queue) => {
                let ticket = request.ticket();
                tracing::debug!(%id, size, queue = queue.label(), "allocation queued");
                observability::record_queued(client.raw(), queue.label());
                t.enqueue(request, queue);
                Ok(Admission::Queued { ticket, queue })
            }
            None => {
                t.account(&id, size);
                Ok(Admission::Admitted(request))
            }
        }
    }

    /// Undo the accounting of a freed allocation and admit whatever now fits.
    ///
    /// # Errors
    ///
    /// `NotFound` if the allocation was never admitted.
    pub fn release(&self, id: &AllocationId) -> Result<Vec<BufferRequest>> {
        let mut t = self.tables.lock();
        let size = t
            .allocations
            .remove(id)
            .ok_or_else(|| Error::NotFound(format!("allocation {id}")))?;
        t.total_allocated -= size;
        if let Some(c) = t.client_mut(id.client_id()) {
            c.bytes_allocated -= size;
            c.allocation_count -= 1;
        }
        if let Some(o) = t.owners.get_mut(&id.owner) {
            o.bytes_allocated -= size;
            o.allocation_count -= 1;
        }
        observability::record_bytes_allocated(t.total_allocated);
        Ok(t.process_queues(self.capacity))
    }

    /// Remove a queued request of `client`. Returns `None` if no request of
    /// that client is queued under the ticket.
    pub fn abort(&self, ticket: RequestTicket, client: ClientId) -> Option<BufferRequest> {
        let mut t = self.tables.lock();
        let key = *t.tickets.get(&ticket)?;
        if t.pending.get(key)?.request.id.client_id() != client {
            return None;
        }
        t.tickets.remove(&ticket);
        let pending = t.pending.remove(key)?;
        let id = pending.request.id;
        match pending.queue {
            QueueKind::Owner => {
                if let Some(o) = t.owners.get_mut(&id.owner) {
                    o.queue.retain(|k| *k != key);
                }
            }
            QueueKind::Client => {
                if let Some(c) = t.client_mut(id.client_id()) {
                    c.queue.retain(|k| *k != key);
                }
            }
        }
        tracing::debug!(%id, %ticket, "queued request aborted");
        Some(pending.request)
    }

    /// Whether a request with this ticket is queued.
    pub fn is_queued(&self, ticket: RequestTicket) -> bool {
        self.tables.lock().tickets.contains_key(&ticket)
    }

    /// Remove every queued request (shutdown).
    pub fn drain_queued(&self) -> Vec<BufferRequest> {
        let mut t = self.tables.lock();
        for c in t.clients.iter_mut().flatten() {
            c.queue.clear();
        }
        for o in t.owners.values_mut() {
            o.queue.clear();
        }
        t.tickets.clear();
        let keys: Vec<RequestKey> = t.pending.keys().collect();
        keys.into_iter()
            .filter_map(|k| t.pending.remove(k))
            .map(|p| p.request)
            .collect()
    }

    /// Account allocations found in the directory after a reload.
    ///
    /// Allocations of registered owners are charged immediately; the rest
    /// are charged when their owner registers.
    pub fn adopt_reloaded(&self, allocations: impl IntoIterator<Item = (AllocationId, u64)>) {
        let mut t = self.tables.lock();
        let mut adopted = 0usize;
        for (id, bytes) in allocations {
            if t.allocations.contains_key(&id) {
                continue;
            }
            adopted += 1;
            if t.owners.contains_key(&id.owner) && t.client(id.client_id()).is_some() {
                t.account(&id, bytes);
            } else {
                t.total_allocated += bytes;
                t.orphans.entry(id.owner).or_default().push((id.buffer, bytes));
            }
        }
        tracing::info!(adopted, "reloaded allocations adopted");
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Counters of one client.
    pub fn client_usage(&self, client: ClientId) -> Option<ClientUsage> {
        self.tables.lock().client(client).map(ClientEntry::usage)
    }

    /// Counters of one owner.
    pub fn owner_usage(&self, owner: OwnerId) -> Option<OwnerUsage> {
        self.tables.lock().owners.get(&owner).map(|o| o.usage(owner))
    }

    /// Registered clients.
    pub fn clients(&self) -> Vec<ClientId> {
        self.tables
            .lock()
            .clients
            .iter()
            .flatten()
            .map(|c| c.registration.client)
            .collect()
    }

    /// Bytes of an admitted allocation.
    pub fn allocation_size(&self, id: &AllocationId) -> Option<u64> {
        self.tables.lock().allocations.get(id).copied()
    }

    /// Whether each client's bytes equal the sum of its owners' bytes.
    pub fn is_conserved(&self) -> bool {
        let t = self.tables.lock();
        t.clients.iter().flatten().all(|c| {
            let client = c.registration.client;
            let owners: u64 = t
                .owners
                .iter()
                .filter(|(id, _)| id.client_id() == client)
                .map(|(_, o)| o.bytes_allocated)
                .sum();
            let allocations: u64 = t
                .allocations
                .iter()
                .filter(|(id, _)| id.client_id() == client)
                .map(|(_, b)| *b)
                .sum();
            c.bytes_allocated == owners && owners == allocations
        })
    }

    /// Deliver an event to every client with a callback.
    ///
    /// Callbacks run after the table lock is dropped.
    pub fn notify_clients(&self, event: ClientEvent) {
        let callbacks: Vec<EventCallback> = self
            .tables
            .lock()
            .clients
            .iter()
            .flatten()
            .filter_map(|c| c.registration.events.clone())
            .collect();
        for cb in callbacks {
            cb(event);
        }
    }
}

impl std::fmt::Debug for AdmissionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let t = self.tables.lock();
        f.debug_struct("AdmissionEngine")
            .field("capacity", &self.capacity)
            .field("total_allocated", &t.total_allocated)
            .field("clients", &t.clients.iter().flatten().count())
            .field("owners", &t.owners.len())
            .field("pending", &t.pending.len())
            .finish()
    }
}

impl Tables {
    fn client(&self, client: ClientId) -> Option<&ClientEntry> {
        self.clients.get(client.index()).and_then(Option::as_ref)
    }

    fn client_mut(&mut self, client: ClientId) -> Option<&mut ClientEntry> {
        self.clients.get_mut(client.index()).and_then(Option::as_mut)
    }

    fn resolve(&self, id: &AllocationId) -> Result<()> {
        let client = id.client_id();
        if client.is_invalid() || self.client(client).is_none() {
            return Err(Error::invalid_id(format!("{id}: {client} not registered")));
        }
        if !self.owners.contains_key(&id.owner) {
            return Err(Error::invalid_id(format!("{id}: owner not registered")));
        }
        Ok(())
    }

    /// Bytes and count of `owner`'s requests sitting on its client queue,
    /// starting from `base` bytes.
    fn queued_in_client(&self, owner: OwnerId, base: u64) -> (u64, usize) {
        let Some(client) = self.client(owner.client_id()) else {
            return (base, 0);
        };
        client
            .queue
            .iter()
            .filter_map(|k| self.pending.get(*k))
            .filter(|p| p.request.id.owner == owner)
            .fold((base, 0), |(bytes, n), p| (bytes + p.request.size, n + 1))
    }

    fn owner_check(&self, id: &AllocationId, extra: u64, size: u64) -> bool {
        let Some(client) = self.client(id.client_id()) else {
            return false;
        };
        if client.registration.policy != PolicyKind::Explicit {
            return true;
        }
        let Some(owner) = self.owners.get(&id.owner) else {
            return false;
        };
        owner
            .registration
            .limit
            .is_none_or(|limit| owner.bytes_allocated + extra + size <= limit)
    }

    fn client_check(&self, client: ClientId, size: u64, capacity: u64) -> bool {
        let Some(entry) = self.client(client) else {
            return false;
        };
        let policy = entry.registration.policy;
        if policy != PolicyKind::None
            && entry.bytes_allocated + size <= entry.registration.reservation
        {
            return true;
        }

        let others_unused: u64 = self
            .clients
            .iter()
            .flatten()
            .filter(|c| c.registration.client != client)
            .map(ClientEntry::unused_reservation)
            .sum();
        let headroom = capacity
            .saturating_sub(self.total_allocated)
            .saturating_sub(others_unused);
        if size > headroom {
            return false;
        }
        policy == PolicyKind::None
            || entry
                .registration
                .limit
                .is_none_or(|limit| entry.bytes_allocated + size <= limit)
    }

    fn account(&mut self, id: &AllocationId, size: u64) {
        self.total_allocated += size;
        if let Some(c) = self.client_mut(id.client_id()) {
            c.bytes_allocated += size;
            c.allocation_count += 1;
        }
        if let Some(o) = self.owners.get_mut(&id.owner) {
            o.bytes_allocated += size;
            o.allocation_count += 1;
        }
        self.allocations.insert(*id, size);
        observability::record_admitted(id.client_id().raw(), size);
        observability::record_bytes_allocated(self.total_allocated);
    }

    fn enqueue(&mut self, request: BufferRequest, queue: QueueKind) {
        let id = request.id;
        let ticket = request.ticket();
        let key = self.pending.insert(Pending { request, queue });
        self.tickets.insert(ticket, key);
        match queue {
            QueueKind::Owner => {
                if let Some(o) = self.owners.get_mut(&id.owner) {
                    o.queue.push_back(key);
                }
            }
            QueueKind::Client => {
                if let Some(c) = self.client_mut(id.client_id()) {
                    c.queue.push_back(key);
                }
            }
        }
    }

    fn head_request(&self, key: RequestKey) -> Option<(AllocationId, u64)> {
        self.pending
            .get(key)
            .map(|p| (p.request.id, p.request.size))
    }

    /// Move admissible owner-queue heads down, then admit client-queue heads,
    /// until neither scan makes progress.
    fn process_queues(&mut self, capacity: u64) -> Vec<BufferRequest> {
        let mut admitted = Vec::new();
        loop {
            let mut progressed = false;

            let blocked_owners: Vec<OwnerId> = self
                .owners
                .iter()
                .filter(|(_, o)| !o.queue.is_empty())
                .map(|(id, _)| *id)
                .collect();
            for owner in blocked_owners {
                while let Some(key) = self.owners.get(&owner).and_then(|o| o.queue.front().copied()) {
                    let Some((id, size)) = self.head_request(key) else {
                        break;
                    };
                    let extra = self.queued_in_client(owner, 0).0;
                    if !self.owner_check(&id, extra, size) {
                        break;
                    }
                    if let Some(o) = self.owners.get_mut(&owner) {
                        o.queue.pop_front();
                    }
                    if let Some(p) = self.pending.get_mut(key) {
                        p.queue = QueueKind::Client;
                    }
                    if let Some(c) = self.client_mut(owner.client_id()) {
                        c.queue.push_back(key);
                    }
                    progressed = true;
                }
            }

            for index in 1..self.clients.len() {
                while let Some(key) = self.clients[index].as_ref().and_then(|c| c.queue.front().copied()) {
                    let Some((id, size)) = self.head_request(key) else {
                        break;
                    };
                    if !self.owner_check(&id, 0, size)
                        || !self.client_check(id.client_id(), size, capacity)
                    {
                        break;
                    }
                    if let Some(c) = self.clients[index].as_mut() {
                        c.queue.pop_front();
                    }
                    let Some(pending) = self.pending.remove(key) else {
                        break;
                    };
                    self.tickets.remove(&pending.request.ticket());
                    self.account(&id, size);
                    tracing::debug!(%id, size, "queued allocation admitted");
                    admitted.push(pending.request);
                    progressed = true;
                }
            }

            if !progressed {
                return admitted;
            }
        }
    }
}
