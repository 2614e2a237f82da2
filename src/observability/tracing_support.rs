//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

/// Which spans the scheduler opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// Open a span per scheduler call.
    pub container_spans: bool,
    /// Open a span per worker invocation.
    pub worker_spans: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            container_spans: true,
            worker_spans: true,
        }
    }
}

impl TracingConfig {
    /// No spans at all, for tight benchmark loops.
    pub fn quiet() -> Self {
        Self {
            container_spans: false,
            worker_spans: false,
        }
    }
}

/// Create a span for one scheduler call.
///
/// # Example
///
/// ```rust
/// use conduit::observability::span_container;
///
/// let span = span_container("rx-chain");
/// let _guard = span.enter();
/// ```
#[inline]
pub fn span_container(name: &str) -> Span {
    span!(Level::INFO, "container", name = %name)
}

/// Create a span for one worker invocation.
#[inline]
pub fn span_worker(container: &str, worker: &str) -> Span {
    span!(Level::DEBUG, "worker", container = %container, worker = %worker)
}

/// Enter a container span and return its guard.
pub fn instrument_container(name: &str) -> tracing::span::EnteredSpan {
    span_container(name).entered()
}

/// Enter a worker span and return its guard.
pub fn instrument_worker(container: &str, worker: &str) -> tracing::span::EnteredSpan {
    span_worker(container, worker).entered()
}

/// Log a buffer being delivered.
#[inline]
pub fn trace_buffer_produced(circuit: usize, port: usize, tid: u32, size: u32, sequence: u32) {
    tracing::debug!(
        circuit = circuit,
        port = port,
        tid = tid,
        size = size,
        sequence = sequence,
        "buffer produced"
    );
}

/// Log an input buffer being released.
#[inline]
pub fn trace_buffer_consumed(circuit: usize, port: usize, tid: u32) {
    tracing::debug!(circuit = circuit, port = port, tid = tid, "buffer consumed");
}

/// Log end-of-stream leaving an output port.
#[inline]
pub fn trace_eos(circuit: usize, port: usize) {
    tracing::info!(circuit = circuit, port = port, "end of stream");
}

/// Log a worker failure.
#[inline]
pub fn trace_worker_failed(container: &str, worker: &str, reason: &str) {
    tracing::error!(
        container = %container,
        worker = %worker,
        reason = %reason,
        "worker disabled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracing_config() {
        let config = TracingConfig::default();
        assert!(config.container_spans && config.worker_spans);
        assert_eq!(
            TracingConfig::quiet(),
            TracingConfig {
                container_spans: false,
                worker_spans: false
            }
        );
    }

    #[test]
    fn test_spans_without_subscriber() {
        let _span = span_container("c");
        let _span = span_worker("c", "w");
        let _guard = instrument_container("c");
        let _guard = instrument_worker("c", "w");
        trace_buffer_produced(0, 0, 1, 64, 7);
        trace_buffer_consumed(0, 0, 1);
        trace_eos(0, 0);
        trace_worker_failed("c", "w", "fatal");
    }
}
