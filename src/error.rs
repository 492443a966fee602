//! Error types for the cluster memory service.

use thiserror::Error;

/// Result type alias using the service's Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for cluster memory operations.
///
/// There is no quota variant: a request that does not fit its
/// quota is queued, not failed.
#[derive(Error, Debug)]
pub enum Error {
    /// Client or owner not registered, client/owner mismatch, or an
    /// identifier outside the encodable range.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// Register called for an id that is already registered.
    #[error("already registered: {0}")]
    AlreadyRegistered(String),

    /// Unregister called while allocations, queued requests or owners remain.
    #[error("cannot tear down {what}: {reason}")]
    NotEmpty {
        /// Which entity was being torn down.
        what: String,
        /// What is still outstanding.
        reason: String,
    },

    /// A fixed pool (trackers, tags, carved memory) could not satisfy a demand.
    #[error("insufficient resources: {0}")]
    InsufficientResources(String),

    /// The named allocation or request does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A client-visible lock could not be granted because of a conflicting holder.
    #[error("lock conflict on tag {tag}")]
    LockConflict {
        /// Index of the contended tag.
        tag: u32,
    },

    /// A lock release or re-acquire that does not match the current lock state.
    #[error("invalid lock state on tag {tag}: {detail}")]
    InvalidLockState {
        /// Index of the tag.
        tag: u32,
        /// What was wrong.
        detail: &'static str,
    },

    /// A bounded wait expired.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Durable metadata is missing or does not carry the expected signature.
    #[error("corrupt durable state: {0}")]
    CorruptDurableState(String),

    /// A block read back from a LUN failed its per-block checksum.
    #[error("checksum mismatch at lba {lba}")]
    ChecksumMismatch {
        /// Logical block address of the bad block.
        lba: u64,
    },

    /// The peer advertised a memory layout that does not mirror ours.
    #[error("peer memory layout mismatch: {0}")]
    PeerLayoutMismatch(String),

    /// The node is not in a lifecycle state that accepts this operation.
    #[error("node not ready: {0}")]
    NotReady(String),

    /// Caller-supplied argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An internal channel was closed (worker gone).
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for building an `InvalidIdentifier` error.
    pub(crate) fn invalid_id(msg: impl Into<String>) -> Self {
        Error::InvalidIdentifier(msg.into())
    }

    /// Shorthand for building a `NotEmpty` error.
    pub(crate) fn not_empty(what: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::NotEmpty {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error reports a bounded wait expiring.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}
