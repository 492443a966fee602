//! The lifecycle worker.
//!
//! Events are posted onto one `kanal` queue and drained by a single worker
//! thread, strictly in arrival order. Each event is dispatched through a
//! fixed table indexed by [`EventKind`]; the handler may update sub-states
//! and the node state. Side effects the handler asks for (starting a load,
//! a dump, a clean pass) are run after the state lock is dropped, through
//! [`LifecycleActions`].
//!
//! # Example
//!
//! ```rust,ignore
//! use clustermem::lifecycle::{EventKind, LifecycleMachine, NoActions, NodeState};
//!
//! let machine = LifecycleMachine::start(NodeId::A, &LifecycleConfig::default(), Arc::new(NoActions))?;
//! machine.post(EventKind::Startup)?;
//! machine.wait_for_state(NodeState::Init, Duration::from_secs(1))?;
//! ```

use super::event::{Event, EventData, EventKind};
use super::history::{History, HistoryEntry, Phase};
use super::state::{HardwareState, NodeState, PeerState, SubStates, VaultState};
use crate::config::LifecycleConfig;
use crate::error::{Error, Result};
use crate::ident::NodeId;
use crate::observability;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Work the lifecycle asks the rest of the service to do.
///
/// Every method runs on the lifecycle worker with no lock held. Long work
/// should be handed off; results come back as posted events.
pub trait LifecycleActions: Send + Sync {
    /// Pick the authoritative image and load it. Post one of
    /// `VaultLoadSuccess`, `VaultLoadSoftFail` or `VaultLoadHardFail`.
    fn begin_vault_load(&self, _lifecycle: &LifecycleHandle) {}

    /// Pull the buffer population from the peer. Post `PeerSyncComplete`.
    fn begin_peer_sync(&self, _lifecycle: &LifecycleHandle) {}

    /// Write dirty state to the vault. Post `CleanComplete` or `CleanFailed`.
    fn begin_clean(&self, _lifecycle: &LifecycleHandle) {}

    /// Drain in-flight requests. Post `QuiesceComplete`.
    fn begin_quiesce(&self, _lifecycle: &LifecycleHandle) {}

    /// Dump every buffer. Post `DumpComplete` or `DumpFailed`.
    fn begin_dump(&self, _lifecycle: &LifecycleHandle) {}

    /// Peer liveness changed.
    fn peer_changed(&self, _alive: bool) {}

    /// The node state changed.
    fn state_changed(&self, _from: NodeState, _to: NodeState) {}
}

/// Actions that do nothing; events must be posted by hand.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoActions;

impl LifecycleActions for NoActions {}

// ============================================================================
// Shared state
// ============================================================================

struct Inner {
    state: NodeState,
    sub: SubStates,
    resume_to: Option<NodeState>,
    dump_pending: bool,
    history: History,
}

struct Shared {
    node: NodeId,
    inner: Mutex<Inner>,
    changed: Condvar,
}

/// Cloneable handle for posting events and observing state.
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: kanal::Sender<Event>,
    shared: Arc<Shared>,
}

impl LifecycleHandle {
    /// Node this machine runs for.
    #[inline]
    pub fn node(&self) -> NodeId {
        self.shared.node
    }

    /// Queue an event.
    ///
    /// # Errors
    ///
    /// `ChannelClosed` once the worker has stopped.
    pub fn post(&self, event: impl Into<Event>) -> Result<()> {
        self.tx
            .send(event.into())
            .map_err(|_| Error::ChannelClosed("lifecycle event queue"))
    }

    /// Post `MarkDirty` if the node is in a clean state. Cheap when already
    /// dirty.
    pub fn mark_dirty(&self) {
        let clean = matches!(
            self.state(),
            NodeState::Clean | NodeState::CleanPendingPersist | NodeState::Cleaning
        );
        if clean {
            let _ = self.post(EventKind::MarkDirty);
        }
    }

    /// Current node state.
    pub fn state(&self) -> NodeState {
        self.shared.inner.lock().state
    }

    /// Current sub-states.
    pub fn sub_states(&self) -> SubStates {
        self.shared.inner.lock().sub
    }

    /// History, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.shared.inner.lock().history.snapshot()
    }

    /// Block until the node reaches `target`.
    ///
    /// # Errors
    ///
    /// `Timeout` if it does not within `timeout`.
    pub fn wait_for_state(&self, target: NodeState, timeout: Duration) -> Result<()> {
        self.wait_until(|s| s == target, timeout).map(|_| ())
    }

    /// Block until `pred` holds for the node state; returns that state.
    pub fn wait_until(
        &self,
        mut pred: impl FnMut(NodeState) -> bool,
        timeout: Duration,
    ) -> Result<NodeState> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.shared.inner.lock();
        while !pred(inner.state) {
            if self.shared.changed.wait_until(&mut inner, deadline).timed_out() {
                if pred(inner.state) {
                    break;
                }
                return Err(Error::Timeout(timeout));
            }
        }
        Ok(inner.state)
    }
}

impl std::fmt::Debug for LifecycleHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleHandle")
            .field("node", &self.shared.node)
            .field("state", &self.state())
            .finish()
    }
}

// ============================================================================
// Machine
// ============================================================================

/// Owns the lifecycle worker thread.
pub struct LifecycleMachine {
    handle: LifecycleHandle,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LifecycleMachine {
    /// Spawn the worker. The machine starts in `UNKNOWN`; post `Startup`.
    pub fn start(
        node: NodeId,
        config: &LifecycleConfig,
        actions: Arc<dyn LifecycleActions>,
    ) -> Result<Self> {
        let (tx, rx) = kanal::unbounded();
        let shared = Arc::new(Shared {
            node,
            inner: Mutex::new(Inner {
                state: NodeState::Unknown,
                sub: SubStates::default(),
                resume_to: None,
                dump_pending: false,
                history: History::new(config.history_depth),
            }),
            changed: Condvar::new(),
        });
        let handle = LifecycleHandle { tx, shared };

        let worker_handle = handle.clone();
        let worker = std::thread::Builder::new()
            .name(format!("clustermem-lifecycle-{node}"))
            .spawn(move || run(rx, worker_handle, actions))?;

        Ok(Self {
            handle,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// A handle for posting events from elsewhere.
    pub fn handle(&self) -> LifecycleHandle {
        self.handle.clone()
    }

    /// Queue an event.
    pub fn post(&self, event: impl Into<Event>) -> Result<()> {
        self.handle.post(event)
    }

    /// Current node state.
    pub fn state(&self) -> NodeState {
        self.handle.state()
    }

    /// Current sub-states.
    pub fn sub_states(&self) -> SubStates {
        self.handle.sub_states()
    }

    /// History, oldest first.
    pub fn history(&self) -> Vec<HistoryEntry> {
        self.handle.history()
    }

    /// Block until the node reaches `target`.
    pub fn wait_for_state(&self, target: NodeState, timeout: Duration) -> Result<()> {
        self.handle.wait_for_state(target, timeout)
    }

    /// Stop the worker after it drains events queued so far. Idempotent.
    pub fn shutdown(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        let _ = self.handle.post(EventKind::Shutdown);
        if worker.join().is_err() {
            tracing::error!(node = %self.handle.node(), "lifecycle worker panicked");
        }
    }
}

impl Drop for LifecycleMachine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LifecycleMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleMachine")
            .field("handle", &self.handle)
            .finish()
    }
}

fn run(rx: kanal::Receiver<Event>, handle: LifecycleHandle, actions: Arc<dyn LifecycleActions>) {
    let node = handle.node();
    let _span = observability::span_service(node.name()).entered();
    tracing::debug!(%node, "lifecycle worker started");
    while let Ok(event) = rx.recv() {
        dispatch(&handle, event, actions.as_ref());
        if event.kind == EventKind::Shutdown {
            break;
        }
    }
    tracing::debug!(%node, "lifecycle worker stopped");
}

// ============================================================================
// Dispatch
// ============================================================================

enum Action {
    VaultLoad,
    PeerSync,
    Clean,
    Quiesce,
    Dump,
    PeerChanged(bool),
    StateChanged(NodeState, NodeState),
}

struct Dispatch<'a> {
    node: NodeId,
    event: EventKind,
    inner: &'a mut Inner,
    actions: Vec<Action>,
    follow_ups: Vec<Event>,
}

impl Dispatch<'_> {
    fn set_state(&mut self, to: NodeState) {
        let from = self.inner.state;
        if from == to {
            return;
        }
        self.inner.state = to;
        observability::trace_state_change(self.node.name(), self.event.name(), from.name(), to.name());
        observability::record_transition(from.name(), to.name());
        self.actions.push(Action::StateChanged(from, to));
    }

    fn ignore(&self) {
        tracing::debug!(
            node = %self.node,
            event = %self.event,
            state = %self.inner.state,
            "event ignored in this state"
        );
    }
}

type Handler = fn(&mut Dispatch<'_>, &Event);

/// Indexed by `EventKind::index`.
const HANDLERS: [Handler; EventKind::COUNT] = [
    on_startup,
    on_begin_vault_load,
    on_vault_load_success,
    on_vault_load_soft_fail,
    on_vault_load_hard_fail,
    on_peer_sync_complete,
    on_mark_dirty,
    on_clean_request,
    on_clean_complete,
    on_clean_failed,
    on_persist_acknowledged,
    on_peer_alive,
    on_peer_dead,
    on_hardware_ok,
    on_hardware_degraded,
    on_shutdown_imminent,
    on_quiesce,
    on_quiesce_complete,
    on_unquiesce,
    on_begin_dump,
    on_dump_complete,
    on_dump_failed,
    on_write_cache_enabled,
    on_write_cache_disabled,
    on_shutdown,
];

fn dispatch(handle: &LifecycleHandle, event: Event, actions: &dyn LifecycleActions) {
    let shared = &handle.shared;
    let _span = observability::span_lifecycle(shared.node.name(), event.kind.name()).entered();

    let (pending, follow_ups) = {
        let mut inner = shared.inner.lock();
        let before = HistoryEntry::capture(Phase::Before, event.kind, inner.state, &inner.sub);
        inner.history.record(before);

        let mut d = Dispatch {
            node: shared.node,
            event: event.kind,
            inner: &mut *inner,
            actions: Vec::new(),
            follow_ups: Vec::new(),
        };
        HANDLERS[event.kind.index()](&mut d, &event);
        let Dispatch {
            actions, follow_ups, ..
        } = d;

        let after = HistoryEntry::capture(Phase::After, event.kind, inner.state, &inner.sub);
        inner.history.record(after);
        (actions, follow_ups)
    };
    shared.changed.notify_all();

    for action in pending {
        match action {
            Action::VaultLoad => actions.begin_vault_load(handle),
            Action::PeerSync => actions.begin_peer_sync(handle),
            Action::Clean => actions.begin_clean(handle),
            Action::Quiesce => actions.begin_quiesce(handle),
            Action::Dump => actions.begin_dump(handle),
            Action::PeerChanged(alive) => actions.peer_changed(alive),
            Action::StateChanged(from, to) => actions.state_changed(from, to),
        }
    }
    for event in follow_ups {
        let _ = handle.post(event);
    }
}

fn on_startup(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Unknown => d.set_state(NodeState::Init),
        _ => d.ignore(),
    }
}

fn on_begin_vault_load(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Init => {
            d.set_state(NodeState::VaultLoad);
            d.actions.push(Action::VaultLoad);
        }
        _ => d.ignore(),
    }
}

fn on_vault_load_success(d: &mut Dispatch<'_>, event: &Event) {
    d.inner.sub.vault = VaultState::Ready;
    if d.inner.state != NodeState::VaultLoad {
        return d.ignore();
    }
    let (dirty, sync_from_peer) = match event.data {
        EventData::Loaded {
            dirty,
            sync_from_peer,
        } => (dirty, sync_from_peer),
        _ => (false, false),
    };
    if sync_from_peer && d.inner.sub.peer == PeerState::Alive {
        d.set_state(NodeState::PeerSync);
        d.actions.push(Action::PeerSync);
    } else if dirty {
        d.set_state(NodeState::Dirty);
    } else {
        d.set_state(NodeState::Clean);
    }
}

fn on_vault_load_soft_fail(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.vault = VaultState::SoftFail;
    match d.inner.state {
        NodeState::VaultLoad => d.set_state(NodeState::Clean),
        _ => d.ignore(),
    }
}

fn on_vault_load_hard_fail(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.vault = VaultState::HardFail;
    match d.inner.state {
        NodeState::VaultLoad | NodeState::PeerSync => d.set_state(NodeState::Failed),
        _ => d.ignore(),
    }
}

fn on_peer_sync_complete(d: &mut Dispatch<'_>, event: &Event) {
    if d.inner.state != NodeState::PeerSync {
        return d.ignore();
    }
    let dirty = matches!(event.data, EventData::Synced { dirty: true });
    d.set_state(if dirty {
        NodeState::Dirty
    } else {
        NodeState::Clean
    });
}

fn on_mark_dirty(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Clean | NodeState::CleanPendingPersist | NodeState::Cleaning => {
            d.set_state(NodeState::Dirty)
        }
        _ => {}
    }
}

fn on_clean_request(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Dirty => {
            d.set_state(NodeState::Cleaning);
            d.actions.push(Action::Clean);
        }
        _ => d.ignore(),
    }
}

fn on_clean_complete(d: &mut Dispatch<'_>, event: &Event) {
    if d.inner.state != NodeState::Cleaning {
        // Dirtied again while cleaning; stays dirty.
        return d.ignore();
    }
    let persist_pending = matches!(
        event.data,
        EventData::Cleaned {
            persist_pending: true
        }
    );
    d.set_state(if persist_pending {
        NodeState::CleanPendingPersist
    } else {
        NodeState::Clean
    });
}

fn on_clean_failed(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Cleaning => d.set_state(NodeState::Dirty),
        _ => d.ignore(),
    }
}

fn on_persist_acknowledged(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::CleanPendingPersist => d.set_state(NodeState::Clean),
        _ => d.ignore(),
    }
}

fn on_peer_alive(d: &mut Dispatch<'_>, _: &Event) {
    if d.inner.sub.peer != PeerState::Alive {
        d.inner.sub.peer = PeerState::Alive;
        d.actions.push(Action::PeerChanged(true));
    }
}

fn on_peer_dead(d: &mut Dispatch<'_>, _: &Event) {
    if d.inner.sub.peer != PeerState::Dead {
        d.inner.sub.peer = PeerState::Dead;
        d.actions.push(Action::PeerChanged(false));
    }
    if d.inner.state == NodeState::PeerSync {
        // Nothing more will arrive; keep what was loaded locally.
        d.set_state(NodeState::Dirty);
    }
    consider_dump(d);
}

fn on_hardware_ok(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.hardware = HardwareState::Ok;
}

fn on_hardware_degraded(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.hardware = HardwareState::Degraded;
}

fn on_shutdown_imminent(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.hardware = HardwareState::ShutdownImminent;
    consider_dump(d);
}

/// Queue quiesce-then-dump when power is going away with no peer mirror.
fn consider_dump(d: &mut Dispatch<'_>) {
    if !d.inner.sub.should_dump() || d.inner.dump_pending {
        return;
    }
    match d.inner.state {
        s if s.is_running() => {
            d.inner.dump_pending = true;
            d.follow_ups.push(Event::new(EventKind::Quiesce));
        }
        NodeState::Quiescing => d.inner.dump_pending = true,
        NodeState::Quiesced => {
            d.inner.dump_pending = true;
            d.follow_ups.push(Event::new(EventKind::BeginDump));
        }
        _ => {}
    }
}

fn on_quiesce(d: &mut Dispatch<'_>, _: &Event) {
    let state = d.inner.state;
    if !state.is_running() {
        return d.ignore();
    }
    d.inner.resume_to = Some(state);
    d.set_state(NodeState::Quiescing);
    d.actions.push(Action::Quiesce);
}

fn on_quiesce_complete(d: &mut Dispatch<'_>, _: &Event) {
    if d.inner.state != NodeState::Quiescing {
        return d.ignore();
    }
    d.set_state(NodeState::Quiesced);
    if d.inner.dump_pending {
        d.follow_ups.push(Event::new(EventKind::BeginDump));
    }
}

fn on_unquiesce(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Quiescing | NodeState::Quiesced => {
            let to = d.inner.resume_to.take().unwrap_or(NodeState::Dirty);
            d.inner.dump_pending = false;
            d.set_state(to);
        }
        _ => d.ignore(),
    }
}

fn on_begin_dump(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Quiesced => {
            d.set_state(NodeState::Dumping);
            d.actions.push(Action::Dump);
        }
        _ => d.ignore(),
    }
}

fn on_dump_complete(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Dumping => {
            d.inner.dump_pending = false;
            d.set_state(NodeState::Dumped);
        }
        _ => d.ignore(),
    }
}

fn on_dump_failed(d: &mut Dispatch<'_>, _: &Event) {
    match d.inner.state {
        NodeState::Dumping => {
            d.inner.dump_pending = false;
            d.set_state(NodeState::Failed);
        }
        _ => d.ignore(),
    }
}

fn on_write_cache_enabled(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.write_cache = true;
}

fn on_write_cache_disabled(d: &mut Dispatch<'_>, _: &Event) {
    d.inner.sub.write_cache = false;
}

fn on_shutdown(_: &mut Dispatch<'_>, _: &Event) {}
