//! Client registrations and per-client accounting.

use super::RequestKey;
use crate::ident::ClientId;
use crate::lifecycle::NodeState;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// How a client's allocations are policed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PolicyKind {
    /// No client quota: only global headroom applies.
    None,
    /// Client reservation and limit apply.
    #[default]
    Simple,
    /// Client quota plus per-owner limits.
    Explicit,
}

/// Expected number of owners a client will register. Advisory.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExpectedOwners {
    /// Minimum.
    pub min: u32,
    /// Maximum.
    pub max: u32,
    /// Average.
    pub avg: u32,
}

/// Notifications pushed to registered clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientEvent {
    /// The node's lifecycle state changed.
    StateChanged {
        /// Previous state.
        from: NodeState,
        /// New state.
        to: NodeState,
    },
    /// The peer node came up or went away.
    PeerChanged {
        /// Whether the peer is alive now.
        alive: bool,
    },
}

/// Client event callback.
pub type EventCallback = Arc<dyn Fn(ClientEvent) + Send + Sync>;

/// Static registration of a client.
#[derive(Clone)]
pub struct ClientRegistration {
    /// Client id.
    pub client: ClientId,
    /// Policy applied to the client's allocations.
    pub policy: PolicyKind,
    /// Bytes guaranteed to the client.
    pub reservation: u64,
    /// Upper bound on the client's bytes, if any.
    pub limit: Option<u64>,
    /// Expected owner population.
    pub expected_owners: ExpectedOwners,
    /// Event callback.
    pub events: Option<EventCallback>,
}

impl ClientRegistration {
    /// Registration with the given policy and no reservation or limit.
    pub fn new(client: ClientId, policy: PolicyKind) -> Self {
        Self {
            client,
            policy,
            reservation: 0,
            limit: None,
            expected_owners: ExpectedOwners::default(),
            events: None,
        }
    }

    /// Set the reservation.
    pub fn reservation(mut self, bytes: u64) -> Self {
        self.reservation = bytes;
        self
    }

    /// Set the limit.
    pub fn limit(mut self, bytes: u64) -> Self {
        self.limit = Some(bytes);
        self
    }

    /// Set the expected owner population.
    pub fn expected_owners(mut self, min: u32, max: u32, avg: u32) -> Self {
        self.expected_owners = ExpectedOwners { min, max, avg };
        self
    }

    /// Set the event callback.
    pub fn on_event(mut self, f: impl Fn(ClientEvent) + Send + Sync + 'static) -> Self {
        self.events = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client", &self.client)
            .field("policy", &self.policy)
            .field("reservation", &self.reservation)
            .field("limit", &self.limit)
            .field("expected_owners", &self.expected_owners)
            .field("events", &self.events.is_some())
            .finish()
    }
}

/// Registration plus live counters.
pub(crate) struct ClientEntry {
    pub(crate) registration: ClientRegistration,
    pub(crate) bytes_allocated: u64,
    pub(crate) allocation_count: u64,
    pub(crate) owner_count: u32,
    pub(crate) queue: VecDeque<RequestKey>,
}

impl ClientEntry {
    pub(crate) fn new(registration: ClientRegistration) -> Self {
        Self {
            registration,
            bytes_allocated: 0,
            allocation_count: 0,
            owner_count: 0,
            queue: VecDeque::new(),
        }
    }

    /// Reserved bytes not yet used.
    #[inline]
    pub(crate) fn unused_reservation(&self) -> u64 {
        self.registration
            .reservation
            .saturating_sub(self.bytes_allocated)
    }

    pub(crate) fn usage(&self) -> ClientUsage {
        ClientUsage {
            client: self.registration.client,
            bytes_allocated: self.bytes_allocated,
            allocation_count: self.allocation_count,
            owner_count: self.owner_count,
            queued: self.queue.len(),
        }
    }
}

/// Snapshot of a client's counters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientUsage {
    /// Client id.
    pub client: ClientId,
    /// Bytes admitted and not yet freed.
    pub bytes_allocated: u64,
    /// Outstanding allocations.
    pub allocation_count: u64,
    /// Registered owners.
    pub owner_count: u32,
    /// Requests on the client wait queue.
    pub queued: usize,
}
