//! External collaborators: the peer messaging link and the persistence
//! controller, plus the state this node keeps about each.
//!
//! Neither transport nor firmware access is implemented here. The service
//! talks to both through traits; [`ChannelPeerLink`] and
//! [`LocalPersistenceController`] are in-process implementations used for
//! wiring two nodes together in one process and for tests.

use crate::error::{Error, Result};
use crate::ident::{ClientId, NodeId};
use crate::memory::{PersistentSegment, SgElement};
use crate::tag::TagRecord;
use bytes::{Buf, BufMut, Bytes};
use kanal::{Receiver, Sender};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

// ============================================================================
// Peer messaging
// ============================================================================

/// Messages carried between the two nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerMessage {
    /// The sender's persistent memory scatter list.
    MemoryMap {
        /// Ranges, in the sender's carving order.
        sg: Vec<SgElement>,
    },
    /// A tag changed. Commits carry the buffer contents.
    TagUpdate {
        /// New tag state.
        record: TagRecord,
        /// Buffer contents, when they changed.
        data: Option<Bytes>,
    },
    /// A tag was freed.
    TagFree {
        /// Owning node of the freed tag.
        node: NodeId,
        /// Tag index.
        index: u32,
    },
    /// The sender's current image generation.
    Generation {
        /// Generation number.
        generation: u64,
    },
    /// Ask the receiver to send back everything it mirrors of the sender.
    SyncRequest,
    /// All mirrored tags were sent.
    SyncComplete {
        /// Number of tags sent.
        count: u32,
    },
}

/// Transport to the peer node.
pub trait PeerLink: Send + Sync {
    /// Queue a message for the peer. Must not block on the peer.
    fn send(&self, message: PeerMessage) -> Result<()>;
}

/// In-process [`PeerLink`] backed by a `kanal` channel.
///
/// The receiving end is drained by whoever hosts the peer service and fed
/// into its `receive_peer_message`.
#[derive(Clone)]
pub struct ChannelPeerLink {
    tx: Sender<PeerMessage>,
}

impl ChannelPeerLink {
    /// A link and the receiver its messages arrive on.
    pub fn pair() -> (Self, Receiver<PeerMessage>) {
        let (tx, rx) = kanal::unbounded();
        (Self { tx }, rx)
    }
}

impl PeerLink for ChannelPeerLink {
    fn send(&self, message: PeerMessage) -> Result<()> {
        self.tx
            .send(message)
            .map_err(|_| Error::ChannelClosed("peer link"))
    }
}

impl fmt::Debug for ChannelPeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelPeerLink")
            .field("disconnected", &self.tx.is_disconnected())
            .finish()
    }
}

/// Sends tag changes to the peer while it is alive.
pub struct Replicator {
    link: Option<Arc<dyn PeerLink>>,
    peer_alive: AtomicBool,
}

impl Replicator {
    /// Replicator over an optional link. The peer starts out dead.
    pub fn new(link: Option<Arc<dyn PeerLink>>) -> Self {
        Self {
            link,
            peer_alive: AtomicBool::new(false),
        }
    }

    /// Mark the peer alive or dead.
    pub fn set_peer_alive(&self, alive: bool) {
        self.peer_alive.store(alive, Ordering::Release);
    }

    /// Whether the peer is alive.
    #[inline]
    pub fn peer_alive(&self) -> bool {
        self.peer_alive.load(Ordering::Acquire)
    }

    /// Send if the peer is alive. Failures are logged, not returned: the
    /// peer will resynchronize from the vault or from us.
    pub fn send(&self, message: PeerMessage) {
        if !self.peer_alive() {
            return;
        }
        self.send_always(message);
    }

    /// Send regardless of peer liveness (handshake messages).
    pub fn send_always(&self, message: PeerMessage) {
        if let Some(link) = &self.link {
            if let Err(e) = link.send(message) {
                tracing::warn!(error = %e, "peer message dropped");
            }
        }
    }

    /// Send a batch.
    pub fn send_all(&self, messages: impl IntoIterator<Item = PeerMessage>) {
        for m in messages {
            self.send(m);
        }
    }
}

impl fmt::Debug for Replicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replicator")
            .field("linked", &self.link.is_some())
            .field("peer_alive", &self.peer_alive())
            .finish()
    }
}

/// One mirrored tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorEntry {
    /// Tag state.
    pub record: TagRecord,
    /// Last buffer contents received.
    pub data: Option<Bytes>,
}

/// What applying a message asks the service to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MirrorAction {
    /// Nothing.
    None,
    /// The peer advertised its memory map.
    MemoryMap(Vec<SgElement>),
    /// The peer wants our mirror of it.
    SyncRequested,
    /// The peer finished returning our tags.
    SyncCompleted,
}

/// This node's copy of the peer's tag population, plus the tags the peer
/// returned to us during a sync.
#[derive(Debug)]
pub struct PeerTagMirror {
    node: NodeId,
    peer: BTreeMap<u32, MirrorEntry>,
    returned: BTreeMap<u32, MirrorEntry>,
    peer_generation: u64,
}

impl PeerTagMirror {
    /// Empty mirror for `node`.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            peer: BTreeMap::new(),
            returned: BTreeMap::new(),
            peer_generation: 0,
        }
    }

    /// Apply one inbound message.
    pub fn apply(&mut self, message: PeerMessage) -> MirrorAction {
        match message {
            PeerMessage::MemoryMap { sg } => return MirrorAction::MemoryMap(sg),
            PeerMessage::TagUpdate { record, data } => {
                let target = if record.node == self.node {
                    &mut self.returned
                } else {
                    &mut self.peer
                };
                let entry = target.entry(record.index).or_insert(MirrorEntry {
                    record,
                    data: None,
                });
                entry.record = record;
                if data.is_some() {
                    entry.data = data;
                }
                if !record.is_allocated() {
                    target.remove(&record.index);
                }
            }
            PeerMessage::TagFree { node, index } => {
                if node == self.node {
                    self.returned.remove(&index);
                } else {
                    self.peer.remove(&index);
                }
            }
            PeerMessage::Generation { generation } => self.peer_generation = generation,
            PeerMessage::SyncRequest => return MirrorAction::SyncRequested,
            PeerMessage::SyncComplete { count } => {
                tracing::info!(count, received = self.returned.len(), "peer sync data received");
                return MirrorAction::SyncCompleted;
            }
        }
        MirrorAction::None
    }

    /// Messages that hand the peer back everything mirrored of it.
    pub fn sync_messages(&self) -> Vec<PeerMessage> {
        let mut out: Vec<PeerMessage> = self
            .peer
            .values()
            .map(|e| PeerMessage::TagUpdate {
                record: e.record,
                data: e.data.clone(),
            })
            .collect();
        out.push(PeerMessage::SyncComplete {
            count: self.peer.len() as u32,
        });
        out
    }

    /// Take the tags the peer returned.
    pub fn take_returned(&mut self) -> Vec<MirrorEntry> {
        std::mem::take(&mut self.returned).into_values().collect()
    }

    /// Number of mirrored peer tags.
    pub fn len(&self) -> usize {
        self.peer.len()
    }

    /// Whether nothing is mirrored.
    pub fn is_empty(&self) -> bool {
        self.peer.is_empty()
    }

    /// A mirrored peer tag.
    pub fn get(&self, index: u32) -> Option<&MirrorEntry> {
        self.peer.get(&index)
    }

    /// Last generation the peer advertised.
    pub fn peer_generation(&self) -> u64 {
        self.peer_generation
    }

    /// Drop everything (peer went away for good).
    pub fn clear(&mut self) {
        self.peer.clear();
        self.returned.clear();
    }
}

// ============================================================================
// Persistence controller
// ============================================================================

/// Firmware-side control over memory persistence across reboot.
pub trait PersistenceController: Send + Sync {
    /// Whether memory contents survived the last reboot.
    fn memory_persisted(&self) -> bool;
    /// Ask for memory to be (or not be) preserved across the next reboot.
    ///
    /// Returns whether the request took effect at once. When it did not,
    /// the host reports the acknowledgement later through
    /// `ClusterMemoryService::acknowledge_persistence`.
    fn request_persistence(&self, on: bool) -> bool;
    /// Light or clear the unsafe-to-remove indicator.
    fn set_unsafe_to_remove(&self, on: bool);
}

/// Controller whose answers are set by the host process.
#[derive(Debug, Default)]
pub struct LocalPersistenceController {
    persisted: AtomicBool,
    requested: AtomicBool,
    unsafe_lit: AtomicBool,
    deferred: AtomicBool,
}

impl LocalPersistenceController {
    /// Controller reporting `persisted` for the last reboot.
    pub fn new(persisted: bool) -> Self {
        Self {
            persisted: AtomicBool::new(persisted),
            ..Self::default()
        }
    }

    /// Change what the next boot will see.
    pub fn set_memory_persisted(&self, persisted: bool) {
        self.persisted.store(persisted, Ordering::SeqCst);
    }

    /// Leave persistence requests unacknowledged until the host calls
    /// `acknowledge_persistence` on the service.
    pub fn defer_acknowledgement(&self, defer: bool) {
        self.deferred.store(defer, Ordering::SeqCst);
    }

    /// Whether persistence is currently requested.
    pub fn persistence_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Whether the indicator is lit.
    pub fn unsafe_to_remove(&self) -> bool {
        self.unsafe_lit.load(Ordering::SeqCst)
    }
}

impl PersistenceController for LocalPersistenceController {
    fn memory_persisted(&self) -> bool {
        self.persisted.load(Ordering::SeqCst)
    }

    fn request_persistence(&self, on: bool) -> bool {
        self.requested.store(on, Ordering::SeqCst);
        !self.deferred.load(Ordering::SeqCst)
    }

    fn set_unsafe_to_remove(&self, on: bool) {
        self.unsafe_lit.store(on, Ordering::SeqCst);
    }
}

// ============================================================================
// Persisted node record
// ============================================================================

/// Signature of a valid node record.
pub const NODE_RECORD_SIGNATURE: [u8; 8] = *b"CMSNODE1";

const NODE_RECORD_LEN: usize = 8 + 8 + 8;

/// Durable per-node record kept in the carved node-record block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PersistedNodeRecord {
    unsafe_mask: u64,
    persist_mask: u64,
}

impl PersistedNodeRecord {
    /// Read the record, or `None` if the signature is missing.
    pub fn load(segment: &PersistentSegment, address: u64) -> Result<Option<Self>> {
        let mut raw = [0u8; NODE_RECORD_LEN];
        segment.read(address, &mut raw)?;
        if raw[..8] != NODE_RECORD_SIGNATURE {
            return Ok(None);
        }
        let mut buf = &raw[8..];
        Ok(Some(Self {
            unsafe_mask: buf.get_u64_le(),
            persist_mask: buf.get_u64_le(),
        }))
    }

    /// Load the record, reinitializing it when the signature is missing or
    /// memory did not actually persist.
    pub fn load_or_init(
        segment: &PersistentSegment,
        address: u64,
        memory_persisted: bool,
    ) -> Result<Self> {
        match Self::load(segment, address)? {
            Some(record) if memory_persisted => Ok(record),
            found => {
                if found.is_some() {
                    tracing::info!("node record present but memory was not persisted, reinitializing");
                } else {
                    tracing::warn!("node record signature missing, reinitializing");
                }
                let record = Self::default();
                record.store(segment, address)?;
                Ok(record)
            }
        }
    }

    /// Write the record.
    pub fn store(&self, segment: &PersistentSegment, address: u64) -> Result<()> {
        let mut raw = [0u8; NODE_RECORD_LEN];
        let mut buf = &mut raw[..];
        buf.put_slice(&NODE_RECORD_SIGNATURE);
        buf.put_u64_le(self.unsafe_mask);
        buf.put_u64_le(self.persist_mask);
        segment.write(address, &raw)
    }

    /// Record one client's unsafe-to-remove request.
    pub fn set_unsafe_to_remove(&mut self, client: ClientId, on: bool) {
        set_bit(&mut self.unsafe_mask, client, on);
    }

    /// Record one client's persistence request.
    pub fn set_persistence(&mut self, client: ClientId, on: bool) {
        set_bit(&mut self.persist_mask, client, on);
    }

    /// Whether any client wants the indicator lit.
    #[inline]
    pub fn any_unsafe_to_remove(&self) -> bool {
        self.unsafe_mask != 0
    }

    /// Whether any client wants memory persisted.
    #[inline]
    pub fn any_persistence(&self) -> bool {
        self.persist_mask != 0
    }

    /// Clients requesting the indicator.
    #[inline]
    pub fn unsafe_mask(&self) -> u64 {
        self.unsafe_mask
    }

    /// Clients requesting persistence.
    #[inline]
    pub fn persist_mask(&self) -> u64 {
        self.persist_mask
    }
}

fn set_bit(mask: &mut u64, client: ClientId, on: bool) {
    let bit = 1u64 << client.raw();
    if on {
        *mask |= bit;
    } else {
        *mask &= !bit;
    }
}
