//! Integration tests for restart recovery and peer synchronization.
//!
//! These tests verify that:
//! - A clean node reloads its population from file-backed vault LUNs
//! - A node whose memory persisted reloads from memory and comes up dirty
//! - A node that lost both memory and a current vault recovers from its peer
//! - Unsafe-to-remove and persistence requests survive in the node record
//! - Power loss without a peer dumps to the vault, and a failed or stalled
//!   dump leaves the node FAILED
//! - A corrupt vault image at boot starts the node empty at the next
//!   generation
//! - A stalled vault LUN does not hold up buffer requests during a clean pass

use clustermem::lifecycle::VaultState;
use clustermem::persistence::MemoryLun;
use clustermem::prelude::*;
use kanal::Receiver;
use std::sync::Arc;
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);
const BUFFERS: usize = 8;

fn config(node: NodeId) -> ServiceConfig {
    ServiceConfig::builder()
        .node(node)
        .buffer_count(BUFFERS)
        .build()
        .unwrap()
}

fn segment(base: u64) -> Arc<PersistentSegment> {
    let sg = [SgElement::new(base, required_bytes(BUFFERS))];
    Arc::new(PersistentSegment::new(&sg).unwrap())
}

fn collaborators(
    segment: Arc<PersistentSegment>,
    luns: LunSet,
    controller: Arc<LocalPersistenceController>,
) -> Collaborators {
    Collaborators {
        segment,
        luns,
        peer_link: None,
        controller,
        peer_alive: false,
    }
}

/// In-memory LUNs, keeping a handle on the vault LUN for fault injection.
fn luns_with_vault(layout: &Layout) -> (LunSet, Arc<MemoryLun>) {
    let vault = Arc::new(MemoryLun::new(layout.vault_blocks()));
    let luns = LunSet {
        cdr: Arc::new(MemoryLun::new(layout.cdr_blocks())),
        tags: Arc::new(MemoryLun::new(layout.tag_blocks())),
        vault: vault.clone(),
    };
    (luns, vault)
}

fn run(service: &ClusterMemoryService, request: BufferRequest) -> RequestOutcome {
    let (tx, rx) = kanal::unbounded();
    service
        .submit(request.on_complete(move |o| {
            let _ = tx.send(o);
        }))
        .unwrap();
    rx.recv_timeout(WAIT).unwrap()
}

fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(5));
    }
}

/// Register RAID owner 1 and store `payload` in allocation 1.
fn populate(service: &ClusterMemoryService, payload: &'static [u8]) -> AllocationId {
    service
        .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
        .unwrap();
    let owner = OwnerId::create(ClientId::RAID, 1).unwrap();
    service
        .register_owner(owner, OwnerRegistration::default())
        .unwrap();
    let id = AllocationId::new(owner, 1);
    assert!(run(service, BufferRequest::alloc(id, 4096)).is_ok());
    assert!(run(service, BufferRequest::commit(id, 0, payload)).is_ok());
    id
}

/// Re-register the owner of `id` and read `len` bytes back under a shared lock.
fn read_back(service: &ClusterMemoryService, id: AllocationId, len: usize) -> Vec<u8> {
    service
        .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
        .unwrap();
    service
        .register_owner(id.owner, OwnerRegistration::default())
        .unwrap();
    assert!(run(service, BufferRequest::new(Opcode::GetSharedLock, id)).is_ok());
    let mut out = vec![0u8; len];
    service.read(&id, 0, &mut out).unwrap();
    assert!(run(service, BufferRequest::new(Opcode::ReleaseSharedLock, id)).is_ok());
    out
}

fn pump(rx: &Receiver<PeerMessage>, service: &ClusterMemoryService) -> usize {
    let mut delivered = 0;
    while let Ok(Some(message)) = rx.try_recv() {
        service.receive_peer_message(message).unwrap();
        delivered += 1;
    }
    delivered
}

#[test]
fn test_clean_node_reloads_from_vault_files() {
    let dir = tempfile::tempdir().unwrap();
    let layout = Layout::new(BUFFERS);
    let controller = Arc::new(LocalPersistenceController::new(false));

    let id = {
        let luns = LunSet::in_dir(dir.path(), &layout).unwrap();
        let service = ClusterMemoryService::start(
            config(NodeId::A),
            collaborators(segment(0x1000_0000), luns, controller.clone()),
        )
        .unwrap();
        service.wait_until_running(WAIT).unwrap();
        let id = populate(&service, b"survives the vault");
        service.wait_for_state(NodeState::Dirty, WAIT).unwrap();
        service.request_clean().unwrap();
        service.wait_for_state(NodeState::Clean, WAIT).unwrap();
        service.shutdown();
        id
    };

    // Fresh memory, same files: only the vault holds the population.
    let luns = LunSet::in_dir(dir.path(), &layout).unwrap();
    let service = ClusterMemoryService::start(
        config(NodeId::A),
        collaborators(segment(0x1000_0000), luns, controller),
    )
    .unwrap();
    assert_eq!(service.wait_until_running(WAIT).unwrap(), NodeState::Clean);
    assert_eq!(service.stats().allocated_tags, 1);
    assert_eq!(read_back(&service, id, 18), b"survives the vault");
    let status = service.persistence_status().unwrap();
    assert_eq!(status.validity.this_node, status.validity.vault);
    assert!(service.is_conserved());
}

#[test]
fn test_persisted_memory_reload_comes_up_dirty() {
    let layout = Layout::new(BUFFERS);
    let luns = LunSet::in_memory(&layout);
    let memory = segment(0x2000_0000);
    let controller = Arc::new(LocalPersistenceController::new(false));

    let id = {
        let service = ClusterMemoryService::start(
            config(NodeId::B),
            collaborators(memory.clone(), luns.clone(), controller.clone()),
        )
        .unwrap();
        service.wait_until_running(WAIT).unwrap();
        let id = populate(&service, b"in memory only");
        wait_until(|| service.persistence_status().unwrap().validity.this_node == 2);
        service.shutdown();
        id
    };

    controller.set_memory_persisted(true);
    let service = ClusterMemoryService::start(
        config(NodeId::B),
        collaborators(memory, luns, controller),
    )
    .unwrap();
    // The vault still holds generation 1, so the memory image is newer.
    assert_eq!(service.wait_until_running(WAIT).unwrap(), NodeState::Dirty);
    assert_eq!(read_back(&service, id, 14), b"in memory only");

    service.request_clean().unwrap();
    service.wait_for_state(NodeState::Clean, WAIT).unwrap();
    let validity = service.persistence_status().unwrap().validity;
    assert_eq!(validity.this_node, 3);
    assert_eq!(validity.vault, 3);
}

#[test]
fn test_lost_memory_without_clean_vault_syncs_from_peer() {
    let (a_link, a_to_b) = ChannelPeerLink::pair();
    let (b_link, b_to_a) = ChannelPeerLink::pair();
    let a_luns = LunSet::in_memory(&Layout::new(BUFFERS));
    let a_controller = Arc::new(LocalPersistenceController::new(false));

    let start_a = || {
        let mut c = collaborators(segment(0x1000_0000), a_luns.clone(), a_controller.clone());
        c.peer_link = Some(Arc::new(a_link.clone()));
        c.peer_alive = true;
        ClusterMemoryService::start(config(NodeId::A), c).unwrap()
    };
    let b = {
        let mut c = collaborators(
            segment(0x2000_0000),
            LunSet::in_memory(&Layout::new(BUFFERS)),
            Arc::new(LocalPersistenceController::new(false)),
        );
        c.peer_link = Some(Arc::new(b_link));
        c.peer_alive = true;
        ClusterMemoryService::start(config(NodeId::B), c).unwrap()
    };
    b.wait_until_running(WAIT).unwrap();

    let id = {
        let a = start_a();
        a.wait_until_running(WAIT).unwrap();
        let id = populate(&a, b"mirrored to B");
        wait_until(|| a.persistence_status().unwrap().validity.peer == 2);
        pump(&b_to_a, &a);
        pump(&a_to_b, &b);
        a.shutdown();
        id
    };

    // A restarts with its memory gone and a generation-1 vault: only the
    // peer's mirror is current.
    let a = start_a();
    wait_until(|| {
        pump(&a_to_b, &b);
        pump(&b_to_a, &a);
        a.state().is_running()
    });
    assert_eq!(a.state(), NodeState::Dirty);
    assert_eq!(read_back(&a, id, 13), b"mirrored to B");
    assert!(a.is_conserved());

    a.shutdown();
    b.shutdown();
}

#[test]
fn test_node_record_survives_persisted_restart() {
    let layout = Layout::new(BUFFERS);
    let luns = LunSet::in_memory(&layout);
    let memory = segment(0x3000_0000);
    let controller = Arc::new(LocalPersistenceController::new(false));

    {
        let service = ClusterMemoryService::start(
            config(NodeId::A),
            collaborators(memory.clone(), luns.clone(), controller.clone()),
        )
        .unwrap();
        service.wait_until_running(WAIT).unwrap();
        service
            .register_client(ClientRegistration::new(ClientId::METADATA, PolicyKind::None))
            .unwrap();
        service
            .request_unsafe_to_remove(ClientId::METADATA, true)
            .unwrap();
        assert!(controller.unsafe_to_remove());
        service.shutdown();
    }

    controller.set_unsafe_to_remove(false);
    controller.set_memory_persisted(true);
    let service = ClusterMemoryService::start(
        config(NodeId::A),
        collaborators(memory, luns, controller.clone()),
    )
    .unwrap();
    service.wait_until_running(WAIT).unwrap();
    assert!(controller.unsafe_to_remove());
    let status = service.persistence_status().unwrap();
    assert!(status.memory_persisted);
    assert_eq!(status.unsafe_to_remove_mask, 1 << ClientId::METADATA.raw());
}

#[test]
fn test_shutdown_imminent_without_peer_dumps_to_vault() {
    let layout = Layout::new(BUFFERS);
    let (luns, _) = luns_with_vault(&layout);
    let controller = Arc::new(LocalPersistenceController::new(false));

    let id = {
        let service = ClusterMemoryService::start(
            config(NodeId::A),
            collaborators(segment(0x1000_0000), luns.clone(), controller.clone()),
        )
        .unwrap();
        service.wait_until_running(WAIT).unwrap();
        let id = populate(&service, b"dumped on power loss");
        service.wait_for_state(NodeState::Dirty, WAIT).unwrap();

        service.post_event(EventKind::ShutdownImminent).unwrap();
        service.wait_for_state(NodeState::Dumped, WAIT).unwrap();
        assert!(matches!(
            service.submit(BufferRequest::new(Opcode::GetFirst, id)),
            Err(Error::NotReady(_))
        ));
        let validity = service.persistence_status().unwrap().validity;
        assert_eq!(validity.vault, validity.this_node);
        service.shutdown();
        id
    };

    // Memory is gone; the dump is the newest image.
    let service = ClusterMemoryService::start(
        config(NodeId::A),
        collaborators(segment(0x1000_0000), luns, controller),
    )
    .unwrap();
    assert_eq!(service.wait_until_running(WAIT).unwrap(), NodeState::Clean);
    assert_eq!(read_back(&service, id, 20), b"dumped on power loss");
}

#[test]
fn test_dump_write_failure_fails_node() {
    let layout = Layout::new(BUFFERS);
    let (luns, vault) = luns_with_vault(&layout);
    let service = ClusterMemoryService::start(
        config(NodeId::A),
        collaborators(
            segment(0x1000_0000),
            luns,
            Arc::new(LocalPersistenceController::new(false)),
        ),
    )
    .unwrap();
    service.wait_until_running(WAIT).unwrap();
    populate(&service, b"never reaches the vault");
    service.wait_for_state(NodeState::Dirty, WAIT).unwrap();

    vault.fail_next_write();
    service.post_event(EventKind::ShutdownImminent).unwrap();
    service.wait_for_state(NodeState::Failed, WAIT).unwrap();
    let validity = service.persistence_status().unwrap().validity;
    assert!(validity.vault < validity.this_node);
}

#[test]
fn test_stalled_dump_times_out_to_failed() {
    let layout = Layout::new(BUFFERS);
    let (luns, vault) = luns_with_vault(&layout);
    let config = ServiceConfig::builder()
        .buffer_count(BUFFERS)
        .bulk_timeout(Duration::from_millis(200))
        .build()
        .unwrap();
    let service = ClusterMemoryService::start(
        config,
        collaborators(
            segment(0x1000_0000),
            luns,
            Arc::new(LocalPersistenceController::new(false)),
        ),
    )
    .unwrap();
    service.wait_until_running(WAIT).unwrap();
    populate(&service, b"stuck behind a slow lun");
    service.wait_for_state(NodeState::Dirty, WAIT).unwrap();

    vault.set_stall(Some(Duration::from_secs(1)));
    service.post_event(EventKind::ShutdownImminent).unwrap();
    service.wait_for_state(NodeState::Failed, WAIT).unwrap();
    vault.set_stall(None);
}

#[test]
fn test_corrupt_vault_buffer_starts_empty_at_next_generation() {
    let layout = Layout::new(BUFFERS);
    let (luns, vault) = luns_with_vault(&layout);
    let controller = Arc::new(LocalPersistenceController::new(false));

    {
        let service = ClusterMemoryService::start(
            config(NodeId::B),
            collaborators(segment(0x2000_0000), luns.clone(), controller.clone()),
        )
        .unwrap();
        service.wait_until_running(WAIT).unwrap();
        populate(&service, b"about to rot");
        service.wait_for_state(NodeState::Dirty, WAIT).unwrap();
        service.request_clean().unwrap();
        service.wait_for_state(NodeState::Clean, WAIT).unwrap();
        assert_eq!(service.persistence_status().unwrap().validity.vault, 2);
        service.shutdown();
    }

    // The allocation took tag 0; damage the first block of its buffer.
    vault.corrupt(layout.vault_lba(0));
    let service = ClusterMemoryService::start(
        config(NodeId::B),
        collaborators(segment(0x2000_0000), luns, controller),
    )
    .unwrap();
    assert_eq!(service.wait_until_running(WAIT).unwrap(), NodeState::Clean);
    assert_eq!(service.sub_states().vault, VaultState::SoftFail);
    assert_eq!(service.stats().allocated_tags, 0);
    let validity = service.persistence_status().unwrap().validity;
    assert_eq!(validity.this_node, 3);
    assert_eq!(validity.vault, 3);
    assert!(service.is_conserved());
}

#[test]
fn test_clean_pass_does_not_block_requests_on_vault_io() {
    let layout = Layout::new(BUFFERS);
    let (luns, vault) = luns_with_vault(&layout);
    let service = ClusterMemoryService::start(
        config(NodeId::A),
        collaborators(
            segment(0x1000_0000),
            luns,
            Arc::new(LocalPersistenceController::new(false)),
        ),
    )
    .unwrap();
    service.wait_until_running(WAIT).unwrap();
    let id = populate(&service, b"written while cleaning");
    service.wait_for_state(NodeState::Dirty, WAIT).unwrap();

    let stall = Duration::from_secs(1);
    vault.set_stall(Some(stall));
    service.request_clean().unwrap();
    service.wait_for_state(NodeState::Cleaning, WAIT).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    let started = Instant::now();
    let first = run(
        &service,
        BufferRequest::new(Opcode::GetFirst, AllocationId::new(id.owner, 0)),
    );
    assert!(first.is_ok());
    assert_eq!(first.id, id);
    assert!(started.elapsed() < stall / 2, "request waited on vault I/O");

    service.wait_for_state(NodeState::Clean, WAIT).unwrap();
    vault.set_stall(None);
    let validity = service.persistence_status().unwrap().validity;
    assert_eq!(validity.vault, validity.this_node);
}
