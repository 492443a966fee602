//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const REQUESTS_ADMITTED: &str = "clustermem_requests_admitted";
const REQUESTS_QUEUED: &str = "clustermem_requests_queued";
const REQUESTS_ABORTED: &str = "clustermem_requests_aborted";
const ALLOCATIONS_FREED: &str = "clustermem_allocations_freed";
const BYTES_ALLOCATED: &str = "clustermem_bytes_allocated";
const FREE_TAGS: &str = "clustermem_free_tags";
const TRACKERS_AVAILABLE: &str = "clustermem_trackers_available";
const LIFECYCLE_TRANSITIONS: &str = "clustermem_lifecycle_transitions";
const VAULT_DURATION_NS: &str = "clustermem_vault_duration_ns";
const VAULT_FAILURES: &str = "clustermem_vault_failures";

/// Initialize metrics descriptions.
///
/// Call this once at startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        REQUESTS_ADMITTED,
        Unit::Count,
        "Allocation requests admitted by the policy engine"
    );
    metrics::describe_counter!(
        REQUESTS_QUEUED,
        Unit::Count,
        "Allocation requests queued behind a client or owner quota"
    );
    metrics::describe_counter!(REQUESTS_ABORTED, Unit::Count, "Requests aborted by callers");
    metrics::describe_counter!(ALLOCATIONS_FREED, Unit::Count, "Allocations freed");
    metrics::describe_gauge!(
        BYTES_ALLOCATED,
        Unit::Bytes,
        "Bytes currently admitted across all clients"
    );
    metrics::describe_gauge!(FREE_TAGS, Unit::Count, "Tags on the free list");
    metrics::describe_gauge!(
        TRACKERS_AVAILABLE,
        Unit::Count,
        "Free trackers in the tracker pool"
    );
    metrics::describe_counter!(
        LIFECYCLE_TRANSITIONS,
        Unit::Count,
        "Node lifecycle state transitions"
    );
    metrics::describe_histogram!(
        VAULT_DURATION_NS,
        Unit::Nanoseconds,
        "Time to dump or load the vault"
    );
    metrics::describe_counter!(VAULT_FAILURES, Unit::Count, "Failed vault dumps and loads");
}

/// Record an admitted allocation.
#[inline]
pub fn record_admitted(client: u8, bytes: u64) {
    counter!(REQUESTS_ADMITTED, "client" => client.to_string()).increment(1);
    counter!("clustermem_bytes_admitted_total", "client" => client.to_string()).increment(bytes);
}

/// Record a request queued on a quota wait list.
#[inline]
pub fn record_queued(client: u8, queue: &'static str) {
    counter!(REQUESTS_QUEUED, "client" => client.to_string(), "queue" => queue).increment(1);
}

/// Record an aborted request.
#[inline]
pub fn record_aborted(client: u8) {
    counter!(REQUESTS_ABORTED, "client" => client.to_string()).increment(1);
}

/// Record a freed allocation.
#[inline]
pub fn record_freed(client: u8) {
    counter!(ALLOCATIONS_FREED, "client" => client.to_string()).increment(1);
}

/// Record total admitted bytes.
#[inline]
pub fn record_bytes_allocated(bytes: u64) {
    gauge!(BYTES_ALLOCATED).set(bytes as f64);
}

/// Record free tag count.
#[inline]
pub fn record_free_tags(free: usize) {
    gauge!(FREE_TAGS).set(free as f64);
}

/// Record available trackers.
#[inline]
pub fn record_trackers_available(available: usize) {
    gauge!(TRACKERS_AVAILABLE).set(available as f64);
}

/// Record a lifecycle transition.
#[inline]
pub fn record_transition(from: &'static str, to: &'static str) {
    counter!(LIFECYCLE_TRANSITIONS, "from" => from, "to" => to).increment(1);
}

/// Metrics for vault dump/load operations.
#[derive(Clone)]
pub struct VaultMetrics {
    operation: &'static str,
    duration: Histogram,
    failures: Counter,
}

impl VaultMetrics {
    /// Create a collector for one operation kind (`"dump"` or `"load"`).
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            duration: histogram!(VAULT_DURATION_NS, "operation" => operation),
            failures: counter!(VAULT_FAILURES, "operation" => operation),
        }
    }

    /// Record a completed operation.
    #[inline]
    pub fn record_time(&self, duration: Duration) {
        self.duration.record(duration.as_nanos() as f64);
    }

    /// Record a failed operation.
    #[inline]
    pub fn record_failure(&self) {
        self.failures.increment(1);
    }

    /// Start a timer and return a guard that records on drop.
    pub fn start_timer(&self) -> TimerGuard<'_> {
        TimerGuard {
            start: Instant::now(),
            metrics: self,
        }
    }

    /// Operation label.
    pub fn operation(&self) -> &'static str {
        self.operation
    }
}

/// Guard that records elapsed time when dropped.
pub struct TimerGuard<'a> {
    start: Instant,
    metrics: &'a VaultMetrics,
}

impl Drop for TimerGuard<'_> {
    fn drop(&mut self) {
        self.metrics.record_time(self.start.elapsed());
    }
}
