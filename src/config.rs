//! Service configuration.
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `CLUSTERMEM_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `CLUSTERMEM_NODE` | Node identity (`A`/`B`) | `A` |
//! | `CLUSTERMEM_BUFFER_COUNT` | Buffers to carve from persistent memory | 1024 |
//! | `CLUSTERMEM_TRACKER_POOL` | Buffer trackers in the pool | 1024 |
//! | `CLUSTERMEM_TRANSFER_BYTES` | Bulk transfer buffer size | 1048576 |
//! | `CLUSTERMEM_TRANSFER_BUFFERS` | Bulk transfer buffers in the pool | 6 |
//! | `CLUSTERMEM_IO_WORKERS` | I/O worker threads | 2 |
//! | `CLUSTERMEM_SINGLE_IO_TIMEOUT_MS` | Single-entry I/O bound | 10000 |
//! | `CLUSTERMEM_BULK_TIMEOUT_MS` | Vault dump/load bound | 30000 |
//! | `CLUSTERMEM_HISTORY_DEPTH` | Lifecycle history ring depth | 128 |
//!
//! # Example
//!
//! ```rust
//! use clustermem::config::ServiceConfig;
//!
//! let config = ServiceConfig::builder()
//!     .buffer_count(64)
//!     .io_workers(1)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.memory.buffer_count, 64);
//! ```

use crate::ident::NodeId;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Bytes in one persistent buffer.
pub const BUFFER_SIZE: usize = 32 * 1024;

/// Bytes in one sector of a buffer.
pub const SECTOR_SIZE: usize = 512;

/// Sectors per buffer (one bit each in the valid/dirty bitmaps).
pub const SECTORS_PER_BUFFER: usize = BUFFER_SIZE / SECTOR_SIZE;

/// Default number of pooled buffer trackers.
pub const DEFAULT_TRACKER_POOL_SIZE: usize = 1024;

/// Persistent-memory carving parameters.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// How many buffer+tag pairs to carve.
    pub buffer_count: usize,
    /// Accept fewer buffers than requested (reload path).
    pub best_effort: bool,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            buffer_count: 1024,
            best_effort: false,
        }
    }
}

/// Admission and tracker-pool parameters.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    /// Trackers in the pool.
    pub tracker_pool_size: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            tracker_pool_size: DEFAULT_TRACKER_POOL_SIZE,
        }
    }
}

/// Durable-layout I/O parameters.
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Size of one sequential transfer buffer.
    pub transfer_bytes: usize,
    /// Transfer buffers in the pool.
    pub transfer_buffers: usize,
    /// Largest multi-block single-entry transfer, in blocks.
    pub max_blocks_per_transaction: usize,
    /// I/O worker threads.
    pub io_workers: usize,
    /// Bound on one synchronous-style single-entry read/persist.
    pub single_io_timeout: Duration,
    /// Bound on a whole vault dump or load.
    pub bulk_timeout: Duration,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            transfer_bytes: 1024 * 1024,
            transfer_buffers: 6,
            max_blocks_per_transaction: 64,
            io_workers: 2,
            single_io_timeout: Duration::from_secs(10),
            bulk_timeout: Duration::from_secs(30),
        }
    }
}

/// Lifecycle state machine parameters.
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// Entries kept in the circular transition history.
    pub history_depth: usize,
    /// Bound on draining in-flight operations while quiescing.
    pub quiesce_timeout: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            history_depth: 128,
            quiesce_timeout: Duration::from_secs(20),
        }
    }
}

/// Complete service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Which storage processor this is.
    pub node: NodeId,
    /// Memory carving.
    pub memory: MemoryConfig,
    /// Admission engine and tracker pool.
    pub policy: PolicyConfig,
    /// Durable layout I/O.
    pub persistence: PersistenceConfig,
    /// Lifecycle machine.
    pub lifecycle: LifecycleConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            node: NodeId::A,
            memory: MemoryConfig::default(),
            policy: PolicyConfig::default(),
            persistence: PersistenceConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Create a builder starting from defaults.
    pub fn builder() -> ServiceConfigBuilder {
        ServiceConfigBuilder::new()
    }

    /// Load configuration from `CLUSTERMEM_*` environment variables.
    ///
    /// Missing or unparsable variables fall back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("CLUSTERMEM_NODE") {
            match val.trim() {
                "B" | "b" => config.node = NodeId::B,
                "A" | "a" => config.node = NodeId::A,
                other => tracing::warn!(value = other, "ignoring unknown CLUSTERMEM_NODE"),
            }
        }
        if let Some(n) = parse_env::<usize>("CLUSTERMEM_BUFFER_COUNT") {
            config.memory.buffer_count = n;
        }
        if let Some(n) = parse_env::<usize>("CLUSTERMEM_TRACKER_POOL") {
            config.policy.tracker_pool_size = n;
        }
        if let Some(n) = parse_env::<usize>("CLUSTERMEM_TRANSFER_BYTES") {
            config.persistence.transfer_bytes = n;
        }
        if let Some(n) = parse_env::<usize>("CLUSTERMEM_TRANSFER_BUFFERS") {
            config.persistence.transfer_buffers = n;
        }
        if let Some(n) = parse_env::<usize>("CLUSTERMEM_IO_WORKERS") {
            config.persistence.io_workers = n;
        }
        if let Some(d) = parse_env_duration_ms("CLUSTERMEM_SINGLE_IO_TIMEOUT_MS") {
            config.persistence.single_io_timeout = d;
        }
        if let Some(d) = parse_env_duration_ms("CLUSTERMEM_BULK_TIMEOUT_MS") {
            config.persistence.bulk_timeout = d;
        }
        if let Some(n) = parse_env::<usize>("CLUSTERMEM_HISTORY_DEPTH") {
            config.lifecycle.history_depth = n;
        }

        config
    }

    /// Check the configuration for values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.buffer_count == 0 {
            return Err(ConfigError::InvalidValue {
                field: "memory.buffer_count",
                reason: "must be > 0",
            });
        }
        if self.memory.buffer_count > u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "memory.buffer_count",
                reason: "must fit a 32-bit tag index",
            });
        }
        if self.policy.tracker_pool_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "policy.tracker_pool_size",
                reason: "must be > 0",
            });
        }
        if self.persistence.transfer_bytes < BUFFER_SIZE {
            return Err(ConfigError::InvalidValue {
                field: "persistence.transfer_bytes",
                reason: "must hold at least one buffer",
            });
        }
        if self.persistence.transfer_buffers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "persistence.transfer_buffers",
                reason: "must be > 0",
            });
        }
        if self.persistence.io_workers == 0 {
            return Err(ConfigError::InvalidValue {
                field: "persistence.io_workers",
                reason: "must be > 0",
            });
        }
        if self.persistence.max_blocks_per_transaction == 0 {
            return Err(ConfigError::InvalidValue {
                field: "persistence.max_blocks_per_transaction",
                reason: "must be > 0",
            });
        }
        if self.lifecycle.history_depth == 0 {
            return Err(ConfigError::InvalidValue {
                field: "lifecycle.history_depth",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Configuration validation error.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A field holds a value the service cannot use.
    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        /// Dotted field path.
        field: &'static str,
        /// Why it was rejected.
        reason: &'static str,
    },
}

/// Builder for [`ServiceConfig`].
#[derive(Debug, Clone, Default)]
pub struct ServiceConfigBuilder {
    config: ServiceConfig,
}

impl ServiceConfigBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the node identity.
    pub fn node(mut self, node: NodeId) -> Self {
        self.config.node = node;
        self
    }

    /// Set how many buffers to carve.
    pub fn buffer_count(mut self, n: usize) -> Self {
        self.config.memory.buffer_count = n;
        self
    }

    /// Accept a partial carve.
    pub fn best_effort_carving(mut self, enabled: bool) -> Self {
        self.config.memory.best_effort = enabled;
        self
    }

    /// Set the tracker pool size.
    pub fn tracker_pool_size(mut self, n: usize) -> Self {
        self.config.policy.tracker_pool_size = n;
        self
    }

    /// Set the bulk transfer buffer size.
    pub fn transfer_bytes(mut self, n: usize) -> Self {
        self.config.persistence.transfer_bytes = n;
        self
    }

    /// Set the number of I/O workers.
    pub fn io_workers(mut self, n: usize) -> Self {
        self.config.persistence.io_workers = n;
        self
    }

    /// Set the single-entry I/O bound.
    pub fn single_io_timeout(mut self, timeout: Duration) -> Self {
        self.config.persistence.single_io_timeout = timeout;
        self
    }

    /// Set the bulk dump/load bound.
    pub fn bulk_timeout(mut self, timeout: Duration) -> Self {
        self.config.persistence.bulk_timeout = timeout;
        self
    }

    /// Set the lifecycle history depth.
    pub fn history_depth(mut self, depth: usize) -> Self {
        self.config.lifecycle.history_depth = depth;
        self
    }

    /// Set the quiesce drain bound.
    pub fn quiesce_timeout(mut self, timeout: Duration) -> Self {
        self.config.lifecycle.quiesce_timeout = timeout;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<ServiceConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build without validation.
    pub fn build_unchecked(self) -> ServiceConfig {
        self.config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn parse_env_duration_ms(name: &str) -> Option<Duration> {
    parse_env::<u64>(name).map(Duration::from_millis)
}
