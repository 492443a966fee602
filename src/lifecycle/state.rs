//! Node states and the sub-states the lifecycle handlers consult.

use std::fmt;

/// Lifecycle state of one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum NodeState {
    /// Started, memory not yet loaded.
    Init,
    /// Buffers hold data not yet captured by the vault.
    Dirty,
    /// The vault image matches memory.
    Clean,
    /// Clean, waiting for the persistence controller to acknowledge.
    CleanPendingPersist,
    /// A clean pass is writing dirty state to the vault.
    Cleaning,
    /// Draining in-flight requests.
    Quiescing,
    /// No requests in flight.
    Quiesced,
    /// Loading the authoritative image.
    VaultLoad,
    /// Pulling the buffer population from the peer.
    PeerSync,
    /// Writing every buffer to the vault.
    Dumping,
    /// Vault dump finished.
    Dumped,
    /// Unrecoverable error.
    Failed,
    /// Before startup.
    #[default]
    Unknown,
}

impl NodeState {
    /// Every state, in declaration order.
    pub const ALL: [NodeState; 13] = [
        NodeState::Init,
        NodeState::Dirty,
        NodeState::Clean,
        NodeState::CleanPendingPersist,
        NodeState::Cleaning,
        NodeState::Quiescing,
        NodeState::Quiesced,
        NodeState::VaultLoad,
        NodeState::PeerSync,
        NodeState::Dumping,
        NodeState::Dumped,
        NodeState::Failed,
        NodeState::Unknown,
    ];

    /// Upper-case name used in logs and metrics labels.
    pub fn name(self) -> &'static str {
        match self {
            NodeState::Init => "INIT",
            NodeState::Dirty => "DIRTY",
            NodeState::Clean => "CLEAN",
            NodeState::CleanPendingPersist => "CLEAN_PENDING_PERSIST",
            NodeState::Cleaning => "CLEANING",
            NodeState::Quiescing => "QUIESCING",
            NodeState::Quiesced => "QUIESCED",
            NodeState::VaultLoad => "VAULT_LOAD",
            NodeState::PeerSync => "PEER_SYNC",
            NodeState::Dumping => "DUMPING",
            NodeState::Dumped => "DUMPED",
            NodeState::Failed => "FAILED",
            NodeState::Unknown => "UNKNOWN",
        }
    }

    /// Whether buffer operations are accepted in this state.
    #[inline]
    pub fn accepts_buffer_ops(self) -> bool {
        matches!(
            self,
            NodeState::Dirty
                | NodeState::Clean
                | NodeState::CleanPendingPersist
                | NodeState::Cleaning
        )
    }

    /// Running states that may be quiesced.
    #[inline]
    pub fn is_running(self) -> bool {
        self.accepts_buffer_ops()
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Health reported by the hardware monitor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HardwareState {
    /// Nothing reported.
    #[default]
    Ok,
    /// Running, but with reduced redundancy.
    Degraded,
    /// Power loss or equivalent; memory will not survive.
    ShutdownImminent,
}

/// What the node knows about its peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PeerState {
    /// No notification yet.
    #[default]
    Unknown,
    /// Peer is up.
    Alive,
    /// Peer is down.
    Dead,
}

/// Readiness of the on-disk vault.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum VaultState {
    /// No load attempted.
    #[default]
    NotReady,
    /// Loaded; the vault holds a usable image.
    Ready,
    /// Never initialized; started empty.
    SoftFail,
    /// Unreadable.
    HardFail,
}

/// Sub-states tracked alongside the node state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct SubStates {
    /// Hardware health.
    pub hardware: HardwareState,
    /// Peer liveness.
    pub peer: PeerState,
    /// Vault readiness.
    pub vault: VaultState,
    /// Whether clients run with write caching.
    pub write_cache: bool,
}

impl SubStates {
    /// Whether the running state should be dumped to the vault: power is
    /// going away and no peer holds a mirror.
    pub fn should_dump(&self) -> bool {
        self.hardware == HardwareState::ShutdownImminent && self.peer != PeerState::Alive
    }
}
