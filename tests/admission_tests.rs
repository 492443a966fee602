//! Integration tests for quota admission through a running service.
//!
//! These tests verify that:
//! - Owner wait queues release requests in arrival order
//! - Queued requests can be aborted and complete as aborted
//! - Client reservations and limits are enforced across owners
//! - Accounting stays conserved through alloc/free churn

use clustermem::prelude::*;
use clustermem::dispatch::Submission;
use clustermem::policy::QueueKind;
use kanal::Receiver;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn start(buffers: usize) -> ClusterMemoryService {
    let sg = [SgElement::new(0x1000_0000, required_bytes(buffers))];
    let collaborators = Collaborators {
        segment: Arc::new(PersistentSegment::new(&sg).unwrap()),
        luns: LunSet::in_memory(&Layout::new(buffers)),
        peer_link: None,
        controller: Arc::new(LocalPersistenceController::new(false)),
        peer_alive: false,
    };
    let config = ServiceConfig::builder()
        .buffer_count(buffers)
        .build()
        .unwrap();
    let service = ClusterMemoryService::start(config, collaborators).unwrap();
    service.wait_until_running(WAIT).unwrap();
    service
}

/// Submit and return the submission plus a receiver for the outcome.
fn submit(
    service: &ClusterMemoryService,
    request: BufferRequest,
) -> (Submission, Receiver<RequestOutcome>) {
    let (tx, rx) = kanal::unbounded();
    let submission = service
        .submit(request.on_complete(move |o| {
            let _ = tx.send(o);
        }))
        .unwrap();
    (submission, rx)
}

fn run(service: &ClusterMemoryService, request: BufferRequest) -> RequestOutcome {
    let (_, rx) = submit(service, request);
    rx.recv_timeout(WAIT).unwrap()
}

#[test]
fn test_owner_queue_releases_in_arrival_order() {
    let service = start(8);
    service
        .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Explicit))
        .unwrap();
    let owner = OwnerId::create(ClientId::RAID, 1).unwrap();
    service
        .register_owner(owner, OwnerRegistration::with_limit(120))
        .unwrap();

    let holder = AllocationId::new(owner, 1);
    assert!(run(&service, BufferRequest::alloc(holder, 100)).is_ok());

    let r1 = AllocationId::new(owner, 2);
    let r2 = AllocationId::new(owner, 3);
    let (s1, rx1) = submit(&service, BufferRequest::alloc(r1, 100));
    let (s2, rx2) = submit(&service, BufferRequest::alloc(r2, 50));
    assert!(matches!(
        s1,
        Submission::Queued {
            queue: QueueKind::Owner,
            ..
        }
    ));
    assert!(matches!(
        s2,
        Submission::Queued {
            queue: QueueKind::Owner,
            ..
        }
    ));
    assert_eq!(service.owner_usage(owner).unwrap().queued, 2);

    // Freeing the holder leaves room for R1 only; R2 must not jump ahead.
    assert!(run(&service, BufferRequest::free(holder)).is_ok());
    let first = rx1.recv_timeout(WAIT).unwrap();
    assert!(first.is_ok());
    assert_eq!(first.id, r1);
    assert!(rx2.try_recv().unwrap().is_none());
    assert_eq!(service.owner_usage(owner).unwrap().bytes_allocated, 100);

    assert!(run(&service, BufferRequest::free(r1)).is_ok());
    let second = rx2.recv_timeout(WAIT).unwrap();
    assert!(second.is_ok());
    assert_eq!(second.id, r2);
    assert!(service.is_conserved());
}

#[test]
fn test_abort_queued_request() {
    let service = start(4);
    service
        .register_client(ClientRegistration::new(ClientId::CACHE, PolicyKind::Explicit))
        .unwrap();
    let owner = OwnerId::create(ClientId::CACHE, 9).unwrap();
    service
        .register_owner(owner, OwnerRegistration::with_limit(1000))
        .unwrap();

    let holder = AllocationId::new(owner, 1);
    assert!(run(&service, BufferRequest::alloc(holder, 900)).is_ok());
    let waiting = AllocationId::new(owner, 2);
    let (queued, rx) = submit(&service, BufferRequest::alloc(waiting, 500));
    assert!(matches!(queued, Submission::Queued { .. }));

    let abort = run(&service, BufferRequest::abort(holder, queued.ticket()));
    assert!(abort.is_ok());
    assert_eq!(rx.recv_timeout(WAIT).unwrap().status, RequestStatus::Aborted);
    assert_eq!(service.owner_usage(owner).unwrap().queued, 0);

    // Aborting it again finds nothing.
    let again = run(&service, BufferRequest::abort(holder, queued.ticket()));
    assert_eq!(again.status, RequestStatus::NotFound);
}

#[test]
fn test_client_limit_spans_owners() {
    let service = start(8);
    service
        .register_client(
            ClientRegistration::new(ClientId::METADATA, PolicyKind::Explicit).limit(64 * 1024),
        )
        .unwrap();
    let a = OwnerId::create(ClientId::METADATA, 1).unwrap();
    let b = OwnerId::create(ClientId::METADATA, 2).unwrap();
    service.register_owner(a, OwnerRegistration::default()).unwrap();
    service.register_owner(b, OwnerRegistration::default()).unwrap();

    assert!(run(&service, BufferRequest::alloc(AllocationId::new(a, 1), 48 * 1024)).is_ok());
    let (blocked, rx) = submit(
        &service,
        BufferRequest::alloc(AllocationId::new(b, 1), 32 * 1024),
    );
    assert!(matches!(
        blocked,
        Submission::Queued {
            queue: QueueKind::Client,
            ..
        }
    ));
    assert_eq!(service.client_usage(ClientId::METADATA).unwrap().queued, 1);

    assert!(run(&service, BufferRequest::free(AllocationId::new(a, 1))).is_ok());
    assert!(rx.recv_timeout(WAIT).unwrap().is_ok());
    let usage = service.client_usage(ClientId::METADATA).unwrap();
    assert_eq!(usage.bytes_allocated, 32 * 1024);
    assert_eq!(usage.owner_count, 2);
}

#[test]
fn test_unregister_refused_while_allocated() {
    let service = start(4);
    service
        .register_client(ClientRegistration::new(ClientId::RAID, PolicyKind::Simple))
        .unwrap();
    let owner = OwnerId::create(ClientId::RAID, 3).unwrap();
    service
        .register_owner(owner, OwnerRegistration::default())
        .unwrap();
    let id = AllocationId::new(owner, 1);
    assert!(run(&service, BufferRequest::alloc(id, 10)).is_ok());

    assert!(service.unregister_owner(owner).is_err());
    assert!(service.unregister_client(ClientId::RAID).is_err());

    assert!(run(&service, BufferRequest::free(id)).is_ok());
    service.unregister_owner(owner).unwrap();
    service.unregister_client(ClientId::RAID).unwrap();
    assert!(service.client_usage(ClientId::RAID).is_none());
}
