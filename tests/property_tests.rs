//! Property tests for identifier encoding and allocation accounting.

use clustermem::ident::{CLIENT_ID_BITS, MAX_OWNER_PORTION, OWNER_ID_BITS};
use clustermem::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const BUFFER: u64 = 32 * 1024;
const BUFFERS: usize = 8;

proptest! {
    #[test]
    fn test_owner_id_keeps_client_and_portion(client in 1u8..64, portion in 0u32..=MAX_OWNER_PORTION) {
        let client = ClientId::new(client).unwrap();
        let owner = OwnerId::create(client, portion).unwrap();
        prop_assert_eq!(owner.client_id(), client);
        prop_assert_eq!(owner.non_client_portion(), portion);
        prop_assert!(owner.raw() < 1 << OWNER_ID_BITS);
        prop_assert_eq!(OwnerId::from_raw(owner.raw()).unwrap(), owner);
    }

    #[test]
    fn test_wide_owner_values_rejected(raw in (1u32 << OWNER_ID_BITS)..u32::MAX) {
        prop_assert!(OwnerId::from_raw(raw).is_err());
        let portion = raw >> CLIENT_ID_BITS;
        if portion > MAX_OWNER_PORTION {
            prop_assert!(OwnerId::create(ClientId::TEST, portion).is_err());
        }
    }
}

#[derive(Clone, Debug)]
enum Op {
    Alloc { owner: u32, buffer: u64, size: u64 },
    Free { owner: u32, buffer: u64 },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u32..4, 1u64..6, 1u64..=2 * BUFFER)
            .prop_map(|(owner, buffer, size)| Op::Alloc { owner, buffer, size }),
        (1u32..4, 1u64..6).prop_map(|(owner, buffer)| Op::Free { owner, buffer }),
    ]
}

fn start() -> ClusterMemoryService {
    let sg = [SgElement::new(0x1000_0000, required_bytes(BUFFERS))];
    let collaborators = Collaborators {
        segment: Arc::new(PersistentSegment::new(&sg).unwrap()),
        luns: LunSet::in_memory(&Layout::new(BUFFERS)),
        peer_link: None,
        controller: Arc::new(LocalPersistenceController::new(false)),
        peer_alive: false,
    };
    let config = ServiceConfig::builder()
        .buffer_count(BUFFERS)
        .build()
        .unwrap();
    let service = ClusterMemoryService::start(config, collaborators).unwrap();
    service.wait_until_running(Duration::from_secs(5)).unwrap();
    service
}

fn run(service: &ClusterMemoryService, request: BufferRequest) -> RequestOutcome {
    let (tx, rx) = kanal::unbounded();
    service
        .submit(request.on_complete(move |o| {
            let _ = tx.send(o);
        }))
        .unwrap();
    rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn test_accounting_conserved_under_churn(ops in prop::collection::vec(op(), 1..40)) {
        let service = start();
        service
            .register_client(ClientRegistration::new(ClientId::TEST, PolicyKind::Simple))
            .unwrap();
        for portion in 1..4 {
            let owner = OwnerId::create(ClientId::TEST, portion).unwrap();
            service.register_owner(owner, OwnerRegistration::default()).unwrap();
        }

        let mut live: BTreeMap<AllocationId, u64> = BTreeMap::new();
        for op in ops {
            match op {
                Op::Alloc { owner, buffer, size } => {
                    let id = AllocationId::new(OwnerId::create(ClientId::TEST, owner).unwrap(), buffer);
                    let used: u64 = live.values().map(|s| s.div_ceil(BUFFER)).sum();
                    if live.contains_key(&id) || used + size.div_ceil(BUFFER) > BUFFERS as u64 {
                        continue;
                    }
                    let outcome = run(&service, BufferRequest::alloc(id, size));
                    prop_assert!(outcome.is_ok());
                    live.insert(id, size);
                }
                Op::Free { owner, buffer } => {
                    let id = AllocationId::new(OwnerId::create(ClientId::TEST, owner).unwrap(), buffer);
                    let outcome = run(&service, BufferRequest::free(id));
                    prop_assert_eq!(outcome.is_ok(), live.remove(&id).is_some());
                }
            }
            prop_assert!(service.is_conserved());
        }

        let usage = service.client_usage(ClientId::TEST).unwrap();
        prop_assert_eq!(usage.bytes_allocated, live.values().sum::<u64>());
        prop_assert_eq!(usage.allocation_count, live.len() as u64);
        service.shutdown();
    }
}
