//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Configuration for tracing behavior.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Whether to create a span around the service's lifetime.
    pub service_spans: bool,
    /// Whether to create spans for lifecycle event dispatch.
    pub lifecycle_spans: bool,
    /// Whether to create spans for individual buffer requests.
    pub request_spans: bool,
    /// Default span level.
    pub level: Level,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_spans: true,
            lifecycle_spans: true,
            request_spans: false, // One per request; expensive under load
            level: Level::INFO,
        }
    }
}

impl TracingConfig {
    /// Every span enabled.
    pub fn all() -> Self {
        Self {
            service_spans: true,
            lifecycle_spans: true,
            request_spans: true,
            level: Level::DEBUG,
        }
    }

    /// Disable all spans.
    pub fn none() -> Self {
        Self {
            service_spans: false,
            lifecycle_spans: false,
            request_spans: false,
            level: Level::INFO,
        }
    }
}

/// Span covering one node's service instance.
///
/// # Example
///
/// ```rust,ignore
/// use clustermem::observability::span_service;
///
/// let _guard = span_service("A").entered();
/// ```
#[inline]
pub fn span_service(node: &str) -> Span {
    span!(Level::INFO, "clustermem", node = %node)
}

/// Span covering the dispatch of one lifecycle event.
#[inline]
pub fn span_lifecycle(node: &str, event: &str) -> Span {
    span!(Level::DEBUG, "lifecycle", node = %node, event = %event)
}

/// Span covering one buffer request.
#[inline]
pub fn span_request(opcode: &str, ticket: u64) -> Span {
    span!(Level::TRACE, "request", opcode = %opcode, ticket = ticket)
}

/// Log a lifecycle state change.
#[inline]
pub fn trace_state_change(node: &str, event: &str, from: &str, to: &str) {
    tracing::info!(
        node = %node,
        event = %event,
        from = %from,
        to = %to,
        "lifecycle state changed"
    );
}

/// Log a persistence failure.
#[inline]
pub fn trace_vault_error(operation: &str, error: &dyn std::error::Error) {
    tracing::error!(operation = %operation, error = %error, "vault operation failed");
}
