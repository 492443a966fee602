//! Fixed-depth ring of lifecycle dispatch records for postmortem use.

use super::event::EventKind;
use super::state::{HardwareState, NodeState, PeerState, SubStates, VaultState};
use std::collections::VecDeque;
use std::time::SystemTime;

/// Default number of records kept.
pub const DEFAULT_HISTORY_DEPTH: usize = 128;

/// Whether a record was taken before or after the handler ran.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Before the handler.
    Before,
    /// After the handler.
    After,
}

/// One dispatch record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// Before or after.
    pub phase: Phase,
    /// Event being dispatched.
    pub event: EventKind,
    /// Node state at record time.
    pub state: NodeState,
    /// Hardware sub-state.
    pub hardware: HardwareState,
    /// Peer sub-state.
    pub peer: PeerState,
    /// Vault sub-state.
    pub vault: VaultState,
    /// Write-cache flag.
    pub write_cache: bool,
    /// Wall-clock time of the record.
    pub timestamp: SystemTime,
}

impl HistoryEntry {
    pub(crate) fn capture(phase: Phase, event: EventKind, state: NodeState, sub: &SubStates) -> Self {
        Self {
            phase,
            event,
            state,
            hardware: sub.hardware,
            peer: sub.peer,
            vault: sub.vault,
            write_cache: sub.write_cache,
            timestamp: SystemTime::now(),
        }
    }
}

/// Circular history; the oldest record is overwritten when full.
#[derive(Debug)]
pub struct History {
    depth: usize,
    entries: VecDeque<HistoryEntry>,
}

impl History {
    /// History keeping `depth` records (at least one).
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            depth,
            entries: VecDeque::with_capacity(depth),
        }
    }

    /// Append a record.
    pub fn record(&mut self, entry: HistoryEntry) {
        if self.entries.len() == self.depth {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Records, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.iter().copied().collect()
    }

    /// Maximum records kept.
    #[inline]
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Records currently kept.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing was recorded.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for History {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}
