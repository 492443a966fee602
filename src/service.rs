//! The per-node cluster memory service.
//!
//! [`ClusterMemoryService`] wires every component of one node together:
//!
//! ```text
//!   clients ──► DirectCallTable / control ──► Dispatcher ──► TagDirectory
//!                                                │               │
//!                                          AdmissionEngine   PersistentSegment
//!                                                │
//!   hardware / peer events ──► LifecycleMachine ─┴─► Vault / CDR ──► LUNs
//! ```
//!
//! The lifecycle worker owns the durable side: it picks the authoritative
//! image at boot, runs clean passes and the emergency dump, and keeps the
//! generation numbers in the change-detection record current. Buffer
//! requests are only accepted while the node is running.
//!
//! # Example
//!
//! ```rust,ignore
//! use clustermem::prelude::*;
//!
//! let service = ClusterMemoryService::start(config, collaborators)?;
//! service.wait_until_running(Duration::from_secs(5))?;
//! service.register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))?;
//! ```

use crate::collab::{
    MirrorAction, PeerLink, PeerMessage, PeerTagMirror, PersistedNodeRecord,
    PersistenceController, Replicator,
};
use crate::config::{BUFFER_SIZE, ServiceConfig};
use crate::dispatch::{DispatchStats, Dispatcher, Submission};
use crate::error::{Error, Result};
use crate::ident::{AllocationId, ClientId, NodeId, OWNER_ID_BITS, OwnerId};
use crate::lifecycle::{
    Event, EventKind, HistoryEntry, LifecycleActions, LifecycleHandle, LifecycleMachine,
    NodeState, SubStates,
};
use crate::memory::{AtomicBitmap, CarveMode, PersistentSegment, carve};
use crate::observability;
use crate::persistence::{
    ChangeDetectionRecord, CdrStatus, Image, ImageSet, InFlight, IoEngine, Layout, LunSet,
    TransferPool, ValidityRecords, Vault, VaultSnapshot, arbitrate,
};
use crate::policy::{
    AdmissionEngine, ClientEvent, ClientRegistration, ClientUsage, OwnerRegistration, OwnerUsage,
};
use crate::request::BufferRequest;
use crate::tag::{TagDirectory, TagRecord};
use crate::tracker::TrackerPool;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Everything outside this crate a node talks to.
pub struct Collaborators {
    /// Persistent memory handed to the node.
    pub segment: Arc<PersistentSegment>,
    /// CDR, tag and vault LUNs.
    pub luns: LunSet,
    /// Transport to the peer node, if there is one.
    pub peer_link: Option<Arc<dyn PeerLink>>,
    /// Firmware persistence control.
    pub controller: Arc<dyn PersistenceController>,
    /// Whether the peer is known to be alive at boot.
    pub peer_alive: bool,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("segment", &self.segment)
            .field("luns", &self.luns)
            .field("peer_link", &self.peer_link.is_some())
            .field("peer_alive", &self.peer_alive)
            .finish()
    }
}

/// Node-level summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    /// This node.
    pub node: NodeId,
    /// Lifecycle state.
    pub state: NodeState,
    /// Carved buffers.
    pub buffer_count: usize,
    /// Bytes per buffer.
    pub buffer_size: usize,
    /// Bytes clients may be admitted for.
    pub capacity: u64,
    /// Bytes currently admitted.
    pub allocated_bytes: u64,
    /// Tags on the free list.
    pub free_tags: usize,
    /// Whether the peer is alive.
    pub peer_alive: bool,
    /// Whether the peer memory map is attached.
    pub peer_mapped: bool,
    /// Current generation of this node's image.
    pub generation: u64,
    /// Registered clients.
    pub clients: Vec<ClientId>,
}

/// Durability summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PersistenceStatus {
    /// Whether memory survived the last reboot.
    pub memory_persisted: bool,
    /// Clients asking for memory persistence, one bit per client id.
    pub persistence_mask: u64,
    /// Clients asking for the unsafe-to-remove indicator.
    pub unsafe_to_remove_mask: u64,
    /// Generation numbers on disk.
    pub validity: ValidityRecords,
}

// ============================================================================
// Core
// ============================================================================

/// How the boot-time load ended.
struct Loaded {
    dirty: bool,
    sync_from_peer: bool,
}

/// State shared by the service front end and the lifecycle worker.
pub(crate) struct Core {
    node: NodeId,
    config: ServiceConfig,
    segment: Arc<PersistentSegment>,
    node_record_address: u64,
    buffer_count: usize,
    dispatcher: Dispatcher,
    io: Arc<IoEngine>,
    vault: Vault,
    cdr: ChangeDetectionRecord,
    replicator: Arc<Replicator>,
    mirror: Mutex<PeerTagMirror>,
    controller: Arc<dyn PersistenceController>,
    node_record: Mutex<PersistedNodeRecord>,
    memory_persisted: AtomicBool,
    generation: AtomicU64,
    in_flight: InFlight,
    lifecycle: OnceLock<LifecycleHandle>,
}

impl Core {
    fn state(&self) -> NodeState {
        self.lifecycle
            .get()
            .map_or(NodeState::Unknown, LifecycleHandle::state)
    }

    fn post(&self, event: impl Into<Event>) {
        if let Some(handle) = self.lifecycle.get() {
            if let Err(e) = handle.post(event) {
                tracing::warn!(node = %self.node, error = %e, "lifecycle event dropped");
            }
        }
    }

    pub(crate) fn engine(&self) -> &Arc<AdmissionEngine> {
        self.dispatcher.engine()
    }

    pub(crate) fn submit(&self, request: BufferRequest) -> Result<Submission> {
        // Counted before the state check so quiesce sees it.
        self.in_flight.begin();
        let state = self.state();
        let result = if state.accepts_buffer_ops() {
            self.dispatcher.submit(request)
        } else {
            Err(Error::NotReady(format!("node {} is {state}", self.node)))
        };
        self.in_flight.complete(Ok(()));
        result
    }

    pub(crate) fn read(&self, id: &AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        let state = self.state();
        if !state.accepts_buffer_ops() {
            return Err(Error::NotReady(format!("node {} is {state}", self.node)));
        }
        self.dispatcher.read(id, offset, out)
    }

    fn update_node_record(&self, f: impl FnOnce(&mut PersistedNodeRecord)) -> Result<()> {
        let mut record = self.node_record.lock();
        f(&mut record);
        record.store(&self.segment, self.node_record_address)?;
        self.controller.request_persistence(record.any_persistence());
        self.controller
            .set_unsafe_to_remove(record.any_unsafe_to_remove());
        Ok(())
    }

    pub(crate) fn request_persistence(&self, client: ClientId, enable: bool) -> Result<()> {
        self.require_client(client)?;
        self.update_node_record(|r| r.set_persistence(client, enable))?;
        tracing::info!(%client, enable, "persistence request updated");
        Ok(())
    }

    pub(crate) fn request_unsafe_to_remove(&self, client: ClientId, enable: bool) -> Result<()> {
        self.require_client(client)?;
        self.update_node_record(|r| r.set_unsafe_to_remove(client, enable))?;
        tracing::info!(%client, enable, "unsafe-to-remove request updated");
        Ok(())
    }

    fn require_client(&self, client: ClientId) -> Result<()> {
        self.engine()
            .client_usage(client)
            .map(|_| ())
            .ok_or_else(|| Error::InvalidIdentifier(format!("{client} not registered")))
    }

    pub(crate) fn service_info(&self) -> ServiceInfo {
        let stats = self.dispatcher.stats();
        ServiceInfo {
            node: self.node,
            state: self.state(),
            buffer_count: self.buffer_count,
            buffer_size: BUFFER_SIZE,
            capacity: self.engine().capacity(),
            allocated_bytes: self.engine().total_allocated(),
            free_tags: stats.free_tags,
            peer_alive: self.replicator.peer_alive(),
            peer_mapped: self.dispatcher.has_peer_map(),
            generation: self.generation.load(Ordering::Acquire),
            clients: self.engine().clients(),
        }
    }

    pub(crate) fn persistence_status(&self) -> Result<PersistenceStatus> {
        let record = *self.node_record.lock();
        Ok(PersistenceStatus {
            memory_persisted: self.memory_persisted.load(Ordering::Acquire),
            persistence_mask: record.persist_mask(),
            unsafe_to_remove_mask: record.unsafe_mask(),
            validity: self.cdr.read_validity()?,
        })
    }

    pub(crate) fn history(&self) -> Vec<HistoryEntry> {
        self.lifecycle
            .get()
            .map(LifecycleHandle::history)
            .unwrap_or_default()
    }

    // ========================================================================
    // Peer messages
    // ========================================================================

    fn receive_peer_message(&self, message: PeerMessage) -> Result<()> {
        let action = self.mirror.lock().apply(message);
        match action {
            MirrorAction::None => Ok(()),
            MirrorAction::MemoryMap(sg) => {
                self.dispatcher.receive_peer_memory_map(&sg)?;
                tracing::info!(node = %self.node, ranges = sg.len(), "peer memory map attached");
                Ok(())
            }
            MirrorAction::SyncRequested => {
                let messages = self.mirror.lock().sync_messages();
                tracing::info!(node = %self.node, tags = messages.len() - 1, "returning peer tags");
                for m in messages {
                    self.replicator.send_always(m);
                }
                Ok(())
            }
            MirrorAction::SyncCompleted => {
                if self.state() != NodeState::PeerSync {
                    tracing::debug!(node = %self.node, "sync data outside peer sync, ignored");
                    self.mirror.lock().take_returned();
                    return Ok(());
                }
                match self.finish_peer_sync() {
                    Ok(count) => {
                        tracing::info!(node = %self.node, count, "peer sync complete");
                        self.post(Event::peer_synced(true));
                    }
                    Err(e) => {
                        tracing::error!(node = %self.node, error = %e, "peer sync failed");
                        self.post(EventKind::VaultLoadHardFail);
                    }
                }
                Ok(())
            }
        }
    }

    /// Rebuild the directory from the tags the peer handed back.
    fn finish_peer_sync(&self) -> Result<usize> {
        let returned = self.mirror.lock().take_returned();
        let count = self.dispatcher.with_directory(|dir| -> Result<usize> {
            let mut records: Vec<TagRecord> = (0..dir.len() as u32)
                .map(|i| TagRecord::free(i, self.node))
                .collect();
            for entry in &returned {
                match records.get_mut(entry.record.index as usize) {
                    Some(slot) => *slot = entry.record,
                    None => tracing::warn!(index = entry.record.index, "returned tag out of range"),
                }
            }
            let count = dir.rebuild(&records)?;
            let zero = vec![0u8; BUFFER_SIZE];
            for entry in &returned {
                if (entry.record.index as usize) < dir.len() {
                    let data = entry.data.as_deref().unwrap_or(&zero);
                    dir.load_buffer(entry.record.index, data)?;
                }
            }
            Ok(count)
        })?;
        self.adopt_directory();
        Ok(count)
    }

    /// Every allocated tag with its contents, for a peer that just came up.
    fn population_messages(&self) -> Vec<PeerMessage> {
        self.dispatcher.with_directory(|dir| {
            dir.tags()
                .filter(|t| !t.id().is_none())
                .map(|t| PeerMessage::TagUpdate {
                    record: t.record(),
                    data: dir.buffer_contents(t.index()).ok().map(Bytes::from),
                })
                .collect()
        })
    }

    // ========================================================================
    // Durable state
    // ========================================================================

    fn adopt_directory(&self) {
        let allocations = self.dispatcher.with_directory(|d| d.allocations());
        self.engine().adopt_reloaded(allocations);
    }

    fn load_node_record(&self, persisted: bool) -> Result<()> {
        let record =
            PersistedNodeRecord::load_or_init(&self.segment, self.node_record_address, persisted)?;
        self.controller.request_persistence(record.any_persistence());
        self.controller
            .set_unsafe_to_remove(record.any_unsafe_to_remove());
        *self.node_record.lock() = record;
        Ok(())
    }

    /// Empty every image and start over at `generation`.
    fn format_fresh(&self, generation: u64) -> Result<()> {
        self.dispatcher.with_directory(|d| d.format())?;
        self.vault.format(self.node)?;
        self.dispatcher.change_table().clear_all();
        self.cdr.store_change_table(self.dispatcher.change_table())?;
        self.cdr.write_generation(Image::ThisNode, generation)?;
        self.cdr.write_generation(Image::Vault, generation)?;
        self.cdr.write_generation(Image::Peer, 0)?;
        self.generation.store(generation, Ordering::Release);
        tracing::info!(node = %self.node, generation, "images formatted");
        Ok(())
    }

    fn restore_change_table(&self) -> Result<()> {
        let stored = self.cdr.load_change_table()?;
        let table = self.dispatcher.change_table();
        for owner in 0..stored.capacity() {
            if stored.is_set(owner) {
                table.set(owner);
            }
        }
        Ok(())
    }

    /// Pick the authoritative image and load the directory from it.
    fn load_image(&self) -> Result<Loaded> {
        let persisted = self.controller.memory_persisted();
        self.memory_persisted.store(persisted, Ordering::Release);
        if !persisted {
            self.segment.scrub();
        }
        self.load_node_record(persisted)?;

        if self.cdr.check_header()? == CdrStatus::NotYetValid {
            tracing::info!(node = %self.node, "change-detection record not yet valid, starting empty");
            self.format_fresh(1)?;
            return Ok(Loaded {
                dirty: false,
                sync_from_peer: false,
            });
        }
        if !self.vault.check_headers()? {
            tracing::warn!(node = %self.node, "vault headers missing, vault image discarded");
            self.vault.format(self.node)?;
            self.cdr.write_generation(Image::Vault, 0)?;
        }

        let records = self.cdr.read_validity()?;
        let authority = arbitrate(&records, persisted);
        tracing::info!(
            node = %self.node,
            this_node = records.this_node,
            peer = records.peer,
            vault = records.vault,
            persisted,
            authority = ?authority,
            "image arbitration"
        );
        if authority.is_empty() {
            self.format_fresh(1)?;
            return Ok(Loaded {
                dirty: false,
                sync_from_peer: false,
            });
        }
        self.generation.store(records.max(), Ordering::Release);

        let loaded = if authority.contains(ImageSet::THIS_NODE) {
            let allocated = self.dispatcher.with_directory(|d| d.load_from_memory())?;
            tracing::info!(node = %self.node, allocated, "loaded from persistent memory");
            Loaded {
                dirty: !authority.contains(ImageSet::VAULT),
                sync_from_peer: false,
            }
        } else if authority.contains(ImageSet::VAULT) {
            self.dispatcher.with_directory(|d| self.vault.load(d))?;
            self.cdr.write_generation(Image::ThisNode, records.vault)?;
            Loaded {
                dirty: false,
                sync_from_peer: false,
            }
        } else {
            // Only the peer holds the newest image.
            self.dispatcher.with_directory(|d| d.format())?;
            Loaded {
                dirty: true,
                sync_from_peer: true,
            }
        };
        self.restore_change_table()?;
        self.adopt_directory();
        Ok(loaded)
    }

    fn bump_generation(&self) {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Err(e) = self.cdr.write_generation(Image::ThisNode, generation) {
            tracing::error!(node = %self.node, error = %e, "failed to persist generation");
        }
        if self.replicator.peer_alive() {
            if let Err(e) = self.cdr.write_generation(Image::Peer, generation) {
                tracing::error!(node = %self.node, error = %e, "failed to persist peer generation");
            }
        }
        self.replicator.send(PeerMessage::Generation { generation });
        tracing::debug!(node = %self.node, generation, "generation advanced");
    }

    /// Write the directory to the vault. Returns whether a persistence
    /// handshake is still owed.
    fn clean(&self) -> Result<bool> {
        let table = self.dispatcher.change_table();
        // Owners dirtied after the snapshot set their bit again.
        let (snapshot, cleared) = self.dispatcher.with_directory(|d| -> Result<_> {
            let snapshot = VaultSnapshot::capture(d)?;
            let cleared = table.to_bytes();
            table.clear_all();
            Ok((snapshot, cleared))
        })?;
        if let Err(e) = self.vault.dump(&snapshot) {
            let restored = AtomicBitmap::from_bytes(table.capacity(), &cleared);
            for owner in (0..restored.capacity()).filter(|o| restored.is_set(*o)) {
                table.set(owner);
            }
            return Err(e);
        }
        let generation = self.generation.load(Ordering::Acquire);
        self.cdr.write_generation(Image::Vault, generation)?;
        self.cdr.store_change_table(table)?;
        Ok(self.node_record.lock().any_persistence())
    }

    fn dump(&self) -> Result<()> {
        self.cdr.store_change_table(self.dispatcher.change_table())?;
        let snapshot = self.dispatcher.with_directory(|d| VaultSnapshot::capture(d))?;
        self.vault.dump(&snapshot)?;
        let generation = self.generation.load(Ordering::Acquire);
        self.cdr.write_generation(Image::Vault, generation)
    }
}

impl LifecycleActions for Core {
    fn begin_vault_load(&self, lifecycle: &LifecycleHandle) {
        let event = match self.load_image() {
            Ok(loaded) => Event::vault_loaded(loaded.dirty, loaded.sync_from_peer),
            Err(e @ (Error::CorruptDurableState(_) | Error::ChecksumMismatch { .. })) => {
                tracing::warn!(node = %self.node, error = %e, "durable image unusable, starting empty");
                let next = self.generation.load(Ordering::Acquire) + 1;
                match self.format_fresh(next) {
                    Ok(()) => {
                        self.adopt_directory();
                        Event::new(EventKind::VaultLoadSoftFail)
                    }
                    Err(e) => {
                        tracing::error!(node = %self.node, error = %e, "format after failed load");
                        Event::new(EventKind::VaultLoadHardFail)
                    }
                }
            }
            Err(e) => {
                observability::trace_vault_error("load", &e);
                Event::new(EventKind::VaultLoadHardFail)
            }
        };
        let _ = lifecycle.post(event);
    }

    fn begin_peer_sync(&self, _lifecycle: &LifecycleHandle) {
        tracing::info!(node = %self.node, "requesting image from peer");
        self.replicator.send_always(PeerMessage::SyncRequest);
    }

    fn begin_clean(&self, lifecycle: &LifecycleHandle) {
        match self.clean() {
            Ok(persist_pending) => {
                let _ = lifecycle.post(Event::cleaned(persist_pending));
                if persist_pending && self.controller.request_persistence(true) {
                    let _ = lifecycle.post(EventKind::PersistAcknowledged);
                }
            }
            Err(e) => {
                tracing::error!(node = %self.node, error = %e, "clean pass failed");
                let _ = lifecycle.post(EventKind::CleanFailed);
            }
        }
    }

    fn begin_quiesce(&self, lifecycle: &LifecycleHandle) {
        // Nothing queued can make progress once submissions are refused.
        self.dispatcher.abort_all();
        if let Err(e) = self.in_flight.wait(self.config.lifecycle.quiesce_timeout) {
            tracing::warn!(node = %self.node, error = %e, "quiesce did not drain");
        }
        let _ = lifecycle.post(EventKind::QuiesceComplete);
    }

    fn begin_dump(&self, lifecycle: &LifecycleHandle) {
        let event = match self.dump() {
            Ok(()) => EventKind::DumpComplete,
            Err(e) => {
                observability::trace_vault_error("dump", &e);
                EventKind::DumpFailed
            }
        };
        let _ = lifecycle.post(event);
    }

    fn peer_changed(&self, alive: bool) {
        self.replicator.set_peer_alive(alive);
        if alive {
            let sg = self
                .dispatcher
                .with_directory(|d| d.carving().scatter_list().to_vec());
            self.replicator.send(PeerMessage::MemoryMap { sg });
            let generation = self.generation.load(Ordering::Acquire);
            self.replicator.send(PeerMessage::Generation { generation });
            self.replicator.send_all(self.population_messages());
            if generation > 0 {
                if let Err(e) = self.cdr.write_generation(Image::Peer, generation) {
                    tracing::error!(node = %self.node, error = %e, "failed to persist peer generation");
                }
            }
        } else {
            self.dispatcher.clear_peer_memory_map();
        }
        tracing::info!(node = %self.node, alive, "peer liveness changed");
        self.engine().notify_clients(ClientEvent::PeerChanged { alive });
    }

    fn state_changed(&self, from: NodeState, to: NodeState) {
        if to == NodeState::Dirty {
            self.bump_generation();
        }
        self.engine()
            .notify_clients(ClientEvent::StateChanged { from, to });
    }
}

// ============================================================================
// Service
// ============================================================================

/// One node of the cluster memory service.
pub struct ClusterMemoryService {
    core: Arc<Core>,
    lifecycle: LifecycleMachine,
    stopped: AtomicBool,
}

impl ClusterMemoryService {
    /// Carve memory, start the I/O engine and the lifecycle worker, and kick
    /// off the boot-time load.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` for a bad configuration or undersized LUNs;
    /// `InsufficientResources` if strict carving comes up short.
    pub fn start(config: ServiceConfig, collaborators: Collaborators) -> Result<Self> {
        config
            .validate()
            .map_err(|e| Error::InvalidArgument(e.to_string()))?;
        observability::init_metrics();
        let node = config.node;
        let _span = observability::span_service(node.name()).entered();

        let Collaborators {
            segment,
            luns,
            peer_link,
            controller,
            peer_alive,
        } = collaborators;

        let mode = if config.memory.best_effort {
            CarveMode::BestEffort
        } else {
            CarveMode::Strict
        };
        let carving = carve(&segment.scatter_list(), config.memory.buffer_count, mode)?;
        let buffer_count = carving.len();
        let node_record_address = carving.node_record_address();
        let layout = Layout::new(buffer_count);
        check_lun("cdr", luns.cdr.block_count(), layout.cdr_blocks())?;
        check_lun("tag", luns.tags.block_count(), layout.tag_blocks())?;
        check_lun("vault", luns.vault.block_count(), layout.vault_blocks())?;

        let io = Arc::new(IoEngine::start(&config.persistence)?);
        let transfers = TransferPool::new(
            config.persistence.transfer_buffers,
            config.persistence.transfer_bytes,
        );
        let vault = Vault::new(
            luns.tags,
            luns.vault,
            layout.clone(),
            Arc::clone(&io),
            transfers,
        );
        let cdr = ChangeDetectionRecord::new(luns.cdr, layout, Arc::clone(&io));

        let engine = Arc::new(AdmissionEngine::new(
            buffer_count as u64 * BUFFER_SIZE as u64,
        ));
        let replicator = Arc::new(Replicator::new(peer_link));
        let directory = TagDirectory::new(carving, Arc::clone(&segment), node);
        let dispatcher = Dispatcher::new(
            engine,
            directory,
            TrackerPool::new(config.policy.tracker_pool_size),
            Arc::clone(&replicator),
            Arc::new(AtomicBitmap::new(1 << OWNER_ID_BITS)),
        );

        let core = Arc::new(Core {
            node,
            config: config.clone(),
            segment,
            node_record_address,
            buffer_count,
            dispatcher,
            io,
            vault,
            cdr,
            replicator,
            mirror: Mutex::new(PeerTagMirror::new(node)),
            controller,
            node_record: Mutex::new(PersistedNodeRecord::default()),
            memory_persisted: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            in_flight: InFlight::new(),
            lifecycle: OnceLock::new(),
        });

        let actions: Arc<dyn LifecycleActions> = core.clone();
        let lifecycle = LifecycleMachine::start(node, &config.lifecycle, actions)?;
        let handle = lifecycle.handle();
        let _ = core.lifecycle.set(handle.clone());
        core.dispatcher.set_dirty_hook(move || handle.mark_dirty());

        tracing::info!(%node, buffers = buffer_count, "cluster memory service starting");
        lifecycle.post(EventKind::Startup)?;
        if peer_alive {
            lifecycle.post(EventKind::PeerAlive)?;
        }
        lifecycle.post(EventKind::BeginVaultLoad)?;

        Ok(Self {
            core,
            lifecycle,
            stopped: AtomicBool::new(false),
        })
    }

    /// This node.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.core.node
    }

    /// Lifecycle state.
    pub fn state(&self) -> NodeState {
        self.lifecycle.state()
    }

    /// Lifecycle sub-states.
    pub fn sub_states(&self) -> SubStates {
        self.lifecycle.sub_states()
    }

    /// Lifecycle history, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.lifecycle.history()
    }

    /// Block until the node reaches `state`.
    pub fn wait_for_state(&self, state: NodeState, timeout: Duration) -> Result<()> {
        self.lifecycle.wait_for_state(state, timeout)
    }

    /// Block until the node accepts buffer requests, or has failed.
    ///
    /// # Errors
    ///
    /// `NotReady` if the node failed to come up; `Timeout` otherwise.
    pub fn wait_until_running(&self, timeout: Duration) -> Result<NodeState> {
        let state = self.lifecycle.handle().wait_until(
            |s| s.accepts_buffer_ops() || s == NodeState::Failed,
            timeout,
        )?;
        if state == NodeState::Failed {
            return Err(Error::NotReady(format!("node {} failed", self.node())));
        }
        Ok(state)
    }

    /// A handle to the lifecycle queue, for hardware and peer event sources.
    pub fn lifecycle(&self) -> LifecycleHandle {
        self.lifecycle.handle()
    }

    /// Post a lifecycle event.
    pub fn post_event(&self, event: impl Into<Event>) -> Result<()> {
        self.lifecycle.post(event)
    }

    /// Ask for a clean pass (dirty state written to the vault).
    pub fn request_clean(&self) -> Result<()> {
        self.lifecycle.post(EventKind::CleanRequest)
    }

    /// Report that the persistence controller acted on the last request.
    /// Moves a node waiting in `CleanPendingPersist` to `Clean`.
    pub fn acknowledge_persistence(&self) -> Result<()> {
        self.lifecycle.post(EventKind::PersistAcknowledged)
    }

    /// Register a client.
    pub fn register_client(&self, registration: ClientRegistration) -> Result<()> {
        self.core.engine().register_client(registration)
    }

    /// Unregister a client.
    pub fn unregister_client(&self, client: ClientId) -> Result<()> {
        self.core.engine().unregister_client(client)
    }

    /// Register an owner under its encoded client.
    pub fn register_owner(&self, owner: OwnerId, registration: OwnerRegistration) -> Result<()> {
        self.core
            .engine()
            .register_owner(owner.client_id(), owner, registration)
    }

    /// Unregister an owner.
    pub fn unregister_owner(&self, owner: OwnerId) -> Result<()> {
        self.core.engine().unregister_owner(owner)
    }

    /// Submit a buffer request.
    ///
    /// # Errors
    ///
    /// `NotReady` outside the running states; identifier errors from
    /// admission. Everything else reaches the completion callback.
    pub fn submit(&self, request: BufferRequest) -> Result<Submission> {
        self.core.submit(request)
    }

    /// Copy out of a locked allocation.
    pub fn read(&self, id: &AllocationId, offset: u64, out: &mut [u8]) -> Result<()> {
        self.core.read(id, offset, out)
    }

    /// Apply a message from the peer.
    ///
    /// # Errors
    ///
    /// `PeerLayoutMismatch` if the peer's memory map cannot mirror ours.
    pub fn receive_peer_message(&self, message: PeerMessage) -> Result<()> {
        self.core.receive_peer_message(message)
    }

    /// Record one client's wish for memory to persist across reboot.
    pub fn request_persistence(&self, client: ClientId, enable: bool) -> Result<()> {
        self.core.request_persistence(client, enable)
    }

    /// Record one client's wish for the unsafe-to-remove indicator.
    pub fn request_unsafe_to_remove(&self, client: ClientId, enable: bool) -> Result<()> {
        self.core.request_unsafe_to_remove(client, enable)
    }

    /// Durability summary.
    pub fn persistence_status(&self) -> Result<PersistenceStatus> {
        self.core.persistence_status()
    }

    /// Node summary.
    pub fn service_info(&self) -> ServiceInfo {
        self.core.service_info()
    }

    /// Dispatcher counters.
    pub fn stats(&self) -> DispatchStats {
        self.core.dispatcher.stats()
    }

    /// Counters of one client.
    pub fn client_usage(&self, client: ClientId) -> Option<ClientUsage> {
        self.core.engine().client_usage(client)
    }

    /// Counters of one owner.
    pub fn owner_usage(&self, owner: OwnerId) -> Option<OwnerUsage> {
        self.core.engine().owner_usage(owner)
    }

    /// Whether client, owner and allocation byte counts agree with each
    /// other and with the tag directory.
    pub fn is_conserved(&self) -> bool {
        let engine = self.core.engine();
        let indexed = self.core.dispatcher.with_directory(|d| d.allocations());
        let tables_agree = engine.is_conserved();
        let directory_agrees = indexed
            .iter()
            .all(|(id, bytes)| engine.allocation_size(id) == Some(*bytes));
        let partitioned = self.core.dispatcher.with_directory(|d| d.check_partition());
        tables_agree && directory_agrees && partitioned
    }

    pub(crate) fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Abort outstanding requests and stop every worker. Idempotent.
    pub fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!(node = %self.node(), "cluster memory service stopping");
        self.core.dispatcher.abort_all();
        self.lifecycle.shutdown();
        self.core.io.shutdown();
    }
}

impl Drop for ClusterMemoryService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ClusterMemoryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterMemoryService")
            .field("node", &self.core.node)
            .field("state", &self.state())
            .field("buffers", &self.core.buffer_count)
            .finish()
    }
}

fn check_lun(name: &str, have: u64, need: u64) -> Result<()> {
    if have < need {
        return Err(Error::InvalidArgument(format!(
            "{name} LUN holds {have} blocks, layout needs {need}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::LocalPersistenceController;
    use crate::ident::OwnerId;
    use crate::memory::{SgElement, required_bytes};
    use crate::policy::PolicyKind;
    use crate::request::RequestStatus;

    const WAIT: Duration = Duration::from_secs(5);

    fn collaborators(buffers: usize) -> Collaborators {
        let sg = [SgElement::new(0x1000_0000, required_bytes(buffers))];
        Collaborators {
            segment: Arc::new(PersistentSegment::new(&sg).unwrap()),
            luns: LunSet::in_memory(&Layout::new(buffers)),
            peer_link: None,
            controller: Arc::new(LocalPersistenceController::new(false)),
            peer_alive: false,
        }
    }

    fn config(buffers: usize) -> ServiceConfig {
        ServiceConfig::builder()
            .buffer_count(buffers)
            .build()
            .unwrap()
    }

    #[test]
    fn test_fresh_node_comes_up_clean() {
        let service = ClusterMemoryService::start(config(8), collaborators(8)).unwrap();
        assert_eq!(service.wait_until_running(WAIT).unwrap(), NodeState::Clean);
        let info = service.service_info();
        assert_eq!(info.buffer_count, 8);
        assert_eq!(info.free_tags, 8);
        assert_eq!(info.generation, 1);
        service.shutdown();
        service.shutdown();
    }

    #[test]
    fn test_undersized_lun_rejected() {
        let mut c = collaborators(8);
        c.luns = LunSet::in_memory(&Layout::new(2));
        let err = ClusterMemoryService::start(config(8), c).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_allocation_dirties_node() {
        let service = ClusterMemoryService::start(config(8), collaborators(8)).unwrap();
        service.wait_until_running(WAIT).unwrap();
        service
            .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
            .unwrap();
        let owner = OwnerId::create(ClientId::RAID, 1).unwrap();
        service
            .register_owner(owner, OwnerRegistration::default())
            .unwrap();

        let (tx, rx) = kanal::bounded(1);
        service
            .submit(BufferRequest::alloc(AllocationId::new(owner, 1), 100).on_complete(move |o| {
                let _ = tx.send(o.status);
            }))
            .unwrap();
        assert_eq!(rx.recv().unwrap(), RequestStatus::Ok);
        service.wait_for_state(NodeState::Dirty, WAIT).unwrap();
        assert!(service.is_conserved());

        // The clean pass is queued behind the dirty transition's bump.
        service.request_clean().unwrap();
        service.wait_for_state(NodeState::Clean, WAIT).unwrap();
        assert_eq!(service.service_info().generation, 2);
        let validity = service.persistence_status().unwrap().validity;
        assert_eq!(validity.this_node, 2);
        assert_eq!(validity.vault, 2);
    }

    #[test]
    fn test_persistence_request_requires_client() {
        let controller = Arc::new(LocalPersistenceController::new(false));
        let mut c = collaborators(4);
        c.controller = controller.clone();
        let service = ClusterMemoryService::start(config(4), c).unwrap();
        service.wait_until_running(WAIT).unwrap();

        assert!(matches!(
            service.request_persistence(ClientId::CACHE, true),
            Err(Error::InvalidIdentifier(_))
        ));
        service
            .register_client(ClientRegistration::new(ClientId::CACHE, PolicyKind::None))
            .unwrap();
        service.request_persistence(ClientId::CACHE, true).unwrap();
        assert!(controller.persistence_requested());
        let status = service.persistence_status().unwrap();
        assert_eq!(status.persistence_mask, 1 << ClientId::CACHE.raw());

        service.request_persistence(ClientId::CACHE, false).unwrap();
        assert!(!controller.persistence_requested());
    }

    #[test]
    fn test_clean_waits_for_persistence_acknowledgement() {
        let controller = Arc::new(LocalPersistenceController::new(false));
        controller.defer_acknowledgement(true);
        let mut c = collaborators(4);
        c.controller = controller.clone();
        let service = ClusterMemoryService::start(config(4), c).unwrap();
        service.wait_until_running(WAIT).unwrap();
        service
            .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
            .unwrap();
        service.request_persistence(ClientId::RAID, true).unwrap();
        let owner = OwnerId::create(ClientId::RAID, 1).unwrap();
        service
            .register_owner(owner, OwnerRegistration::default())
            .unwrap();
        service
            .submit(BufferRequest::alloc(AllocationId::new(owner, 1), 100))
            .unwrap();
        service.wait_for_state(NodeState::Dirty, WAIT).unwrap();

        service.request_clean().unwrap();
        service
            .wait_for_state(NodeState::CleanPendingPersist, WAIT)
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(service.state(), NodeState::CleanPendingPersist);
        assert!(controller.persistence_requested());

        service.acknowledge_persistence().unwrap();
        service.wait_for_state(NodeState::Clean, WAIT).unwrap();
    }
}
