//! Node lifecycle state machine.
//!
//! One serialized event queue per node drives every state change. Handlers
//! live in a fixed table indexed by event kind; each dispatch is recorded
//! before and after in a circular history.

mod event;
mod history;
mod machine;
mod state;

pub use event::{Event, EventData, EventKind};
pub use history::{DEFAULT_HISTORY_DEPTH, History, HistoryEntry, Phase};
pub use machine::{LifecycleActions, LifecycleHandle, LifecycleMachine, NoActions};
pub use state::{HardwareState, NodeState, PeerState, SubStates, VaultState};
