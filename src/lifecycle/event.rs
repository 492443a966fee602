//! Lifecycle events.

use std::fmt;

/// Kind of a lifecycle event. The discriminant indexes the handler table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventKind {
    /// Service started.
    Startup = 0,
    /// Begin loading the authoritative image.
    BeginVaultLoad,
    /// Load finished with a usable image.
    VaultLoadSuccess,
    /// No valid image; started empty.
    VaultLoadSoftFail,
    /// Load failed.
    VaultLoadHardFail,
    /// Peer finished sending its image.
    PeerSyncComplete,
    /// A buffer was allocated, committed or freed.
    MarkDirty,
    /// Write dirty state to the vault.
    CleanRequest,
    /// Clean pass finished.
    CleanComplete,
    /// Clean pass failed.
    CleanFailed,
    /// The persistence controller accepted a persistence request.
    PersistAcknowledged,
    /// Peer came up.
    PeerAlive,
    /// Peer went down.
    PeerDead,
    /// Hardware healthy again.
    HardwareOk,
    /// Hardware lost redundancy.
    HardwareDegraded,
    /// Power loss or equivalent.
    ShutdownImminent,
    /// Drain in-flight requests.
    Quiesce,
    /// Drain finished.
    QuiesceComplete,
    /// Resume from quiesce.
    Unquiesce,
    /// Dump every buffer to the vault.
    BeginDump,
    /// Dump finished.
    DumpComplete,
    /// Dump failed.
    DumpFailed,
    /// Clients enabled write caching.
    WriteCacheEnabled,
    /// Clients disabled write caching.
    WriteCacheDisabled,
    /// Stop the worker.
    Shutdown,
}

impl EventKind {
    /// Number of event kinds.
    pub const COUNT: usize = 25;

    /// Every kind, in discriminant order.
    pub const ALL: [EventKind; Self::COUNT] = [
        EventKind::Startup,
        EventKind::BeginVaultLoad,
        EventKind::VaultLoadSuccess,
        EventKind::VaultLoadSoftFail,
        EventKind::VaultLoadHardFail,
        EventKind::PeerSyncComplete,
        EventKind::MarkDirty,
        EventKind::CleanRequest,
        EventKind::CleanComplete,
        EventKind::CleanFailed,
        EventKind::PersistAcknowledged,
        EventKind::PeerAlive,
        EventKind::PeerDead,
        EventKind::HardwareOk,
        EventKind::HardwareDegraded,
        EventKind::ShutdownImminent,
        EventKind::Quiesce,
        EventKind::QuiesceComplete,
        EventKind::Unquiesce,
        EventKind::BeginDump,
        EventKind::DumpComplete,
        EventKind::DumpFailed,
        EventKind::WriteCacheEnabled,
        EventKind::WriteCacheDisabled,
        EventKind::Shutdown,
    ];

    /// Handler table index.
    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Name used in logs, spans and history dumps.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Startup => "startup",
            EventKind::BeginVaultLoad => "begin_vault_load",
            EventKind::VaultLoadSuccess => "vault_load_success",
            EventKind::VaultLoadSoftFail => "vault_load_soft_fail",
            EventKind::VaultLoadHardFail => "vault_load_hard_fail",
            EventKind::PeerSyncComplete => "peer_sync_complete",
            EventKind::MarkDirty => "mark_dirty",
            EventKind::CleanRequest => "clean_request",
            EventKind::CleanComplete => "clean_complete",
            EventKind::CleanFailed => "clean_failed",
            EventKind::PersistAcknowledged => "persist_acknowledged",
            EventKind::PeerAlive => "peer_alive",
            EventKind::PeerDead => "peer_dead",
            EventKind::HardwareOk => "hardware_ok",
            EventKind::HardwareDegraded => "hardware_degraded",
            EventKind::ShutdownImminent => "shutdown_imminent",
            EventKind::Quiesce => "quiesce",
            EventKind::QuiesceComplete => "quiesce_complete",
            EventKind::Unquiesce => "unquiesce",
            EventKind::BeginDump => "begin_dump",
            EventKind::DumpComplete => "dump_complete",
            EventKind::DumpFailed => "dump_failed",
            EventKind::WriteCacheEnabled => "write_cache_enabled",
            EventKind::WriteCacheDisabled => "write_cache_disabled",
            EventKind::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Extra data some events carry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum EventData {
    /// Nothing.
    #[default]
    None,
    /// Result of a successful load.
    Loaded {
        /// Reloaded buffers hold data not yet in the vault.
        dirty: bool,
        /// The peer holds an image at least as new as ours.
        sync_from_peer: bool,
    },
    /// Result of a peer sync.
    Synced {
        /// The synced population holds data not yet in the vault.
        dirty: bool,
    },
    /// Result of a clean pass.
    Cleaned {
        /// A persistence request is waiting for acknowledgement.
        persist_pending: bool,
    },
}

/// One entry on the lifecycle event queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// What happened.
    pub kind: EventKind,
    /// Payload.
    pub data: EventData,
}

impl Event {
    /// Event without payload.
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            data: EventData::None,
        }
    }

    /// Successful load.
    pub fn vault_loaded(dirty: bool, sync_from_peer: bool) -> Self {
        Self {
            kind: EventKind::VaultLoadSuccess,
            data: EventData::Loaded {
                dirty,
                sync_from_peer,
            },
        }
    }

    /// Peer sync finished.
    pub fn peer_synced(dirty: bool) -> Self {
        Self {
            kind: EventKind::PeerSyncComplete,
            data: EventData::Synced { dirty },
        }
    }

    /// Clean pass finished.
    pub fn cleaned(persist_pending: bool) -> Self {
        Self {
            kind: EventKind::CleanComplete,
            data: EventData::Cleaned { persist_pending },
        }
    }
}

impl From<EventKind> for Event {
    fn from(kind: EventKind) -> Self {
        Self::new(kind)
    }
}
