//! Control surface and the direct call table.
//!
//! The control surface is a plain request/response boundary: a transport
//! (out of scope here) decodes a [`ControlRequest`], hands it to
//! [`ClusterMemoryService::control`] and encodes the [`ControlResponse`].
//!
//! Privileged in-process callers skip that boundary entirely. They ask for
//! a [`DirectCallTable`], a capability scoped to one client that exposes
//! every buffer operation through the [`BufferApi`] trait.
//!
//! # Example
//!
//! ```rust,ignore
//! use clustermem::control::{BufferApi, ControlRequest, ControlResponse};
//!
//! let ControlResponse::DirectCallTable(table) =
//!     service.control(ControlRequest::GetDirectCallTable { client: ClientId::RAID })?
//! else {
//!     unreachable!();
//! };
//! table.register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))?;
//! table.alloc(id, 64 * 1024, Box::new(|outcome| assert!(outcome.is_ok())))?;
//! ```

use crate::dispatch::Submission;
use crate::error::{Error, Result};
use crate::ident::{AllocationId, ClientId, OwnerId};
use crate::lifecycle::HistoryEntry;
use crate::policy::{ClientRegistration, OwnerRegistration};
use crate::request::{BufferRequest, Completion, Opcode, RequestTicket};
use crate::service::{ClusterMemoryService, Core, PersistenceStatus, ServiceInfo};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;

// ============================================================================
// Control surface
// ============================================================================

/// Requests accepted by the control surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlRequest {
    /// Node summary.
    GetServiceInfo,
    /// Durability summary.
    GetPersistenceStatus,
    /// Turn one client's memory-persistence request on or off.
    RequestPersistence {
        /// Requesting client.
        client: ClientId,
        /// On or off.
        enable: bool,
    },
    /// Turn one client's unsafe-to-remove request on or off.
    RequestUnsafeToRemove {
        /// Requesting client.
        client: ClientId,
        /// On or off.
        enable: bool,
    },
    /// Lifecycle dispatch history.
    GetLifecycleHistory,
    /// Capability table for one client.
    GetDirectCallTable {
        /// Client the table is scoped to.
        client: ClientId,
    },
}

/// Responses from the control surface, one per request kind.
#[derive(Debug)]
pub enum ControlResponse {
    /// Reply to `GetServiceInfo`.
    ServiceInfo(ServiceInfo),
    /// Reply to `GetPersistenceStatus`.
    PersistenceStatus(PersistenceStatus),
    /// Reply to the request-on/off opcodes.
    Ack,
    /// Reply to `GetLifecycleHistory`, oldest first.
    LifecycleHistory(Vec<HistoryEntry>),
    /// Reply to `GetDirectCallTable`.
    DirectCallTable(DirectCallTable),
}

impl ClusterMemoryService {
    /// Handle one control request.
    pub fn control(&self, request: ControlRequest) -> Result<ControlResponse> {
        tracing::debug!(node = %self.node(), ?request, "control request");
        Ok(match request {
            ControlRequest::GetServiceInfo => ControlResponse::ServiceInfo(self.service_info()),
            ControlRequest::GetPersistenceStatus => {
                ControlResponse::PersistenceStatus(self.persistence_status()?)
            }
            ControlRequest::RequestPersistence { client, enable } => {
                self.request_persistence(client, enable)?;
                ControlResponse::Ack
            }
            ControlRequest::RequestUnsafeToRemove { client, enable } => {
                self.request_unsafe_to_remove(client, enable)?;
                ControlResponse::Ack
            }
            ControlRequest::GetLifecycleHistory => {
                ControlResponse::LifecycleHistory(self.history())
            }
            ControlRequest::GetDirectCallTable { client } => {
                ControlResponse::DirectCallTable(self.direct_call_table(client)?)
            }
        })
    }

    /// Capability table scoped to `client`.
    ///
    /// # Errors
    ///
    /// `InvalidIdentifier` for the reserved invalid client id.
    pub fn direct_call_table(&self, client: ClientId) -> Result<DirectCallTable> {
        if client.is_invalid() {
            return Err(Error::InvalidIdentifier(format!("{client} is reserved")));
        }
        Ok(DirectCallTable {
            core: Arc::clone(self.core()),
            client,
        })
    }
}

// ============================================================================
// Buffer API
// ============================================================================

/// Registration and buffer operations.
///
/// Implementors provide the six required methods; every buffer opcode has a
/// provided method that builds the request and submits it.
pub trait BufferApi: Send + Sync {
    /// Register a client.
    fn register_client(&self, registration: ClientRegistration) -> Result<()>;

    /// Unregister a client.
    fn unregister_client(&self, client: ClientId) -> Result<()>;

    /// Register an owner under the client it encodes.
    fn register_owner(&self, owner: OwnerId, registration: OwnerRegistration) -> Result<()>;

    /// Unregister an owner.
    fn unregister_owner(&self, owner: OwnerId) -> Result<()>;

    /// Submit a prepared request.
    fn submit(&self, request: BufferRequest) -> Result<Submission>;

    /// Copy out of a locked allocation.
    fn read(&self, id: &AllocationId, offset: u64, out: &mut [u8]) -> Result<()>;

    /// Allocate `size` bytes.
    fn alloc(&self, id: AllocationId, size: u64, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::alloc(id, size).on_complete(done))
    }

    /// Allocate `size` bytes in physically adjacent buffers.
    fn contiguous_alloc(&self, id: AllocationId, size: u64, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::contiguous_alloc(id, size).on_complete(done))
    }

    /// Copy `data` in at `offset` and mark it valid.
    fn commit(
        &self,
        id: AllocationId,
        offset: u64,
        data: Bytes,
        done: Completion,
    ) -> Result<Submission> {
        self.submit(BufferRequest::commit(id, offset, data).on_complete(done))
    }

    /// Free one allocation.
    fn free(&self, id: AllocationId, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::free(id).on_complete(done))
    }

    /// Free every allocation of an owner.
    fn free_all(&self, owner: OwnerId, done: Completion) -> Result<Submission> {
        self.submit(owner_request(Opcode::FreeAll, owner).on_complete(done))
    }

    /// Abort an earlier request. `id` must belong to the same client.
    fn abort(&self, id: AllocationId, target: RequestTicket, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::abort(id, target).on_complete(done))
    }

    /// Take the exclusive lock.
    fn get_exclusive_lock(&self, id: AllocationId, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::new(Opcode::GetExclusiveLock, id).on_complete(done))
    }

    /// Take a shared lock.
    fn get_shared_lock(&self, id: AllocationId, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::new(Opcode::GetSharedLock, id).on_complete(done))
    }

    /// Release the exclusive lock.
    fn release_exclusive_lock(&self, id: AllocationId, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::new(Opcode::ReleaseExclusiveLock, id).on_complete(done))
    }

    /// Release one shared lock.
    fn release_shared_lock(&self, id: AllocationId, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::new(Opcode::ReleaseSharedLock, id).on_complete(done))
    }

    /// First allocation of an owner.
    fn get_first(&self, owner: OwnerId, done: Completion) -> Result<Submission> {
        self.submit(owner_request(Opcode::GetFirst, owner).on_complete(done))
    }

    /// Allocation after `id` within its owner.
    fn get_next(&self, id: AllocationId, done: Completion) -> Result<Submission> {
        self.submit(BufferRequest::new(Opcode::GetNext, id).on_complete(done))
    }
}

fn owner_request(opcode: Opcode, owner: OwnerId) -> BufferRequest {
    BufferRequest::new(opcode, AllocationId::new(owner, 0))
}

impl BufferApi for ClusterMemoryService {
    fn register_client(&self, registration: ClientRegistration) -> Result<()> {
        ClusterMemoryService::register_client(self, registration)
    }

    fn unregister_client(&self, client: ClientId) -> Result<()> {
        ClusterMemoryService::unregister_client(self, client)
    }

    fn register_owner(&self, owner: OwnerId, registration: OwnerRegistration) -> Result<()> {
        ClusterMemoryService::register_owner(self, owner, registration)
    }

    fn unregister_owner(&self, owner: OwnerId) -> Result<()> {
        ClusterMemoryService::unregister_owner(self, owner)
    }

    fn submit(&self, request: BufferRequest) -> Result<Submission> {
        ClusterMemoryService::submit(self, request)
    }

    fn read(&self, id: &AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        ClusterMemoryService::read(self, id, offset, out)
    }
}

// ============================================================================
// Direct call table
// ============================================================================

/// Buffer API scoped to one client. Identifiers of any other client are
/// rejected with `InvalidIdentifier` before reaching the engine.
#[derive(Clone)]
pub struct DirectCallTable {
    core: Arc<Core>,
    client: ClientId,
}

impl DirectCallTable {
    /// Client this table acts for.
    #[inline]
    pub fn client(&self) -> ClientId {
        self.client
    }

    fn check(&self, client: ClientId) -> Result<()> {
        if client != self.client {
            return Err(Error::InvalidIdentifier(format!(
                "table for {} used with {client}",
                self.client
            )));
        }
        Ok(())
    }
}

impl BufferApi for DirectCallTable {
    fn register_client(&self, registration: ClientRegistration) -> Result<()> {
        self.check(registration.client)?;
        self.core.engine().register_client(registration)
    }

    fn unregister_client(&self, client: ClientId) -> Result<()> {
        self.check(client)?;
        self.core.engine().unregister_client(client)
    }

    fn register_owner(&self, owner: OwnerId, registration: OwnerRegistration) -> Result<()> {
        self.check(owner.client_id())?;
        self.core
            .engine()
            .register_owner(self.client, owner, registration)
    }

    fn unregister_owner(&self, owner: OwnerId) -> Result<()> {
        self.check(owner.client_id())?;
        self.core.engine().unregister_owner(owner)
    }

    fn submit(&self, request: BufferRequest) -> Result<Submission> {
        self.check(request.id.client_id())?;
        self.core.submit(request)
    }

    fn read(&self, id: &AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        self.check(id.client_id())?;
        self.core.read(id, offset, out)
    }
}

impl fmt::Debug for DirectCallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectCallTable")
            .field("client", &self.client)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::LocalPersistenceController;
    use crate::config::ServiceConfig;
    use crate::lifecycle::{EventKind, NodeState, Phase};
    use crate::memory::{PersistentSegment, SgElement, required_bytes};
    use crate::persistence::{Layout, LunSet};
    use crate::policy::PolicyKind;
    use crate::request::{RequestOutcome, RequestStatus};
    use crate::service::Collaborators;
    use std::time::Duration;

    fn service() -> ClusterMemoryService {
        let sg = [SgElement::new(0x4000_0000, required_bytes(4))];
        let collaborators = Collaborators {
            segment: Arc::new(PersistentSegment::new(&sg).unwrap()),
            luns: LunSet::in_memory(&Layout::new(4)),
            peer_link: None,
            controller: Arc::new(LocalPersistenceController::new(false)),
            peer_alive: false,
        };
        let config = ServiceConfig::builder().buffer_count(4).build().unwrap();
        let service = ClusterMemoryService::start(config, collaborators).unwrap();
        service.wait_until_running(Duration::from_secs(5)).unwrap();
        service
    }

    fn capture() -> (Completion, kanal::Receiver<RequestOutcome>) {
        let (tx, rx) = kanal::unbounded();
        (
            Box::new(move |o| {
                let _ = tx.send(o);
            }),
            rx,
        )
    }

    fn table(service: &ClusterMemoryService, client: ClientId) -> DirectCallTable {
        match service
            .control(ControlRequest::GetDirectCallTable { client })
            .unwrap()
        {
            ControlResponse::DirectCallTable(t) => t,
            other => panic!("unexpected response {other:?}"),
        }
    }

    #[test]
    fn test_table_is_scoped_to_client() {
        let service = service();
        let raid = table(&service, ClientId::RAID);
        assert_eq!(raid.client(), ClientId::RAID);

        let err = raid
            .register_client(ClientRegistration::new(ClientId::CACHE, PolicyKind::Simple))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidIdentifier(_)));

        raid.register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
            .unwrap();
        let other = OwnerId::create(ClientId::CACHE, 1).unwrap();
        let (done, _) = capture();
        assert!(matches!(
            raid.alloc(AllocationId::new(other, 1), 10, done),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(service.direct_call_table(ClientId::INVALID).is_err());
    }

    #[test]
    fn test_table_runs_buffer_opcodes() {
        let service = service();
        let raid = table(&service, ClientId::RAID);
        raid.register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
            .unwrap();
        let owner = OwnerId::create(ClientId::RAID, 7).unwrap();
        raid.register_owner(owner, OwnerRegistration::default())
            .unwrap();
        let id = AllocationId::new(owner, 1);

        let (done, rx) = capture();
        raid.alloc(id, 4096, done).unwrap();
        assert!(rx.recv().unwrap().is_ok());

        let (done, rx) = capture();
        raid.commit(id, 0, Bytes::from_static(b"direct"), done).unwrap();
        assert!(rx.recv().unwrap().is_ok());

        let (done, rx) = capture();
        raid.get_shared_lock(id, done).unwrap();
        assert!(rx.recv().unwrap().is_ok());
        let mut out = [0u8; 6];
        raid.read(&id, 0, &mut out).unwrap();
        assert_eq!(&out, b"direct");
        let (done, rx) = capture();
        raid.release_shared_lock(id, done).unwrap();
        assert!(rx.recv().unwrap().is_ok());

        let (done, rx) = capture();
        raid.get_first(owner, done).unwrap();
        let first = rx.recv().unwrap();
        assert_eq!(first.id, id);
        let (done, rx) = capture();
        raid.get_next(id, done).unwrap();
        assert_eq!(rx.recv().unwrap().status, RequestStatus::NotFound);

        let (done, rx) = capture();
        raid.free_all(owner, done).unwrap();
        assert!(rx.recv().unwrap().is_ok());
        raid.unregister_owner(owner).unwrap();
        raid.unregister_client(ClientId::RAID).unwrap();
    }

    #[test]
    fn test_table_cannot_abort_other_clients_requests() {
        let service = service();
        let meta = table(&service, ClientId::METADATA);
        meta.register_client(
            ClientRegistration::new(ClientId::METADATA, PolicyKind::Explicit).limit(10),
        )
        .unwrap();
        let meta_owner = OwnerId::create(ClientId::METADATA, 1).unwrap();
        meta.register_owner(meta_owner, OwnerRegistration::default())
            .unwrap();
        let (done, rx) = capture();
        meta.alloc(AllocationId::new(meta_owner, 1), 10, done).unwrap();
        assert!(rx.recv().unwrap().is_ok());
        let (done, queued_rx) = capture();
        let queued = meta
            .alloc(AllocationId::new(meta_owner, 2), 10, done)
            .unwrap();
        assert!(matches!(queued, Submission::Queued { .. }));

        let raid = table(&service, ClientId::RAID);
        raid.register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
            .unwrap();
        let raid_owner = OwnerId::create(ClientId::RAID, 1).unwrap();
        raid.register_owner(raid_owner, OwnerRegistration::default())
            .unwrap();
        let (done, rx) = capture();
        raid.abort(AllocationId::new(raid_owner, 99), queued.ticket(), done)
            .unwrap();
        assert_eq!(rx.recv().unwrap().status, RequestStatus::NotFound);
        assert!(queued_rx.try_recv().unwrap().is_none());

        let (done, rx) = capture();
        meta.abort(AllocationId::new(meta_owner, 2), queued.ticket(), done)
            .unwrap();
        assert!(rx.recv().unwrap().is_ok());
        assert_eq!(queued_rx.recv().unwrap().status, RequestStatus::Aborted);
    }

    #[test]
    fn test_control_info_and_history() {
        let service = service();
        let ControlResponse::ServiceInfo(info) =
            service.control(ControlRequest::GetServiceInfo).unwrap()
        else {
            panic!("expected service info");
        };
        assert_eq!(info.state, NodeState::Clean);
        assert_eq!(info.buffer_count, 4);

        let ControlResponse::LifecycleHistory(history) =
            service.control(ControlRequest::GetLifecycleHistory).unwrap()
        else {
            panic!("expected history");
        };
        assert_eq!(history[0].event, EventKind::Startup);
        assert_eq!(history[0].phase, Phase::Before);
        assert_eq!(history[0].state, NodeState::Unknown);

        assert!(matches!(
            service.control(ControlRequest::RequestUnsafeToRemove {
                client: ClientId::RAID,
                enable: true
            }),
            Err(Error::InvalidIdentifier(_))
        ));
    }
}
