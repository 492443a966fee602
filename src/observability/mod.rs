//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters, gauges, and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `clustermem_requests_admitted` | Counter | Allocations admitted, by client |
//! | `clustermem_requests_queued` | Counter | Allocations queued, by client and queue |
//! | `clustermem_requests_aborted` | Counter | Requests aborted |
//! | `clustermem_allocations_freed` | Counter | Allocations freed |
//! | `clustermem_bytes_allocated` | Gauge | Bytes admitted across all clients |
//! | `clustermem_free_tags` | Gauge | Tags on the free list |
//! | `clustermem_trackers_available` | Gauge | Free trackers |
//! | `clustermem_lifecycle_transitions` | Counter | State transitions, by from/to |
//! | `clustermem_vault_duration_ns` | Histogram | Vault dump/load time |
//! | `clustermem_vault_failures` | Counter | Failed vault dumps/loads |
//!
//! ## Tracing
//!
//! Spans are emitted for the service instance, each lifecycle event
//! dispatch, and (opt-in) each buffer request.
//!
//! ## Example
//!
//! ```rust,ignore
//! use clustermem::observability::init_metrics;
//!
//! init_metrics();
//! // Install a metrics exporter to collect them.
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{
    TimerGuard, VaultMetrics, init_metrics, record_aborted, record_admitted,
    record_bytes_allocated, record_free_tags, record_freed, record_queued, record_trackers_available,
    record_transition,
};
pub use tracing_support::{
    TracingConfig, span_lifecycle, span_request, span_service, trace_state_change,
    trace_vault_error,
};
