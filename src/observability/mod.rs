//! Observability features: metrics and tracing.
//!
//! - **Metrics**: counters, gauges and histograms via `metrics-rs`
//! - **Tracing**: structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `conduit_templates_created` | Counter | Templates built, by protocol |
//! | `conduit_buffers_produced` | Counter | Buffers delivered, by circuit |
//! | `conduit_bytes_produced` | Counter | Payload bytes delivered |
//! | `conduit_buffers_consumed` | Counter | Input buffers released |
//! | `conduit_produce_blocked` | Counter | Produces deferred by backpressure |
//! | `conduit_zero_copy_forwards` | Counter | Buffers forwarded without a copy |
//! | `conduit_worker_runs` | Counter | Worker invocations (run/callback/timeout) |
//! | `conduit_worker_failures` | Counter | Workers disabled after an error |
//! | `conduit_worker_run_time_ns` | Histogram | Time per worker invocation |
//! | `conduit_scheduler_passes` | Gauge | Passes of the last scheduler call |
//!
//! No recorder is installed by the library; without one every call is a
//! no-op. Install an exporter in the application and call
//! [`init_metrics`] once to publish descriptions.

mod metrics;
mod tracing_support;

pub use metrics::{
    WorkerMetrics, init_metrics, record_buffer_consumed, record_buffer_produced,
    record_produce_blocked, record_scheduler_passes, record_template_created, record_worker_failed,
    record_zero_copy,
};
pub use tracing_support::{
    TracingConfig, instrument_container, instrument_worker, span_container, span_worker,
    trace_buffer_consumed, trace_buffer_produced, trace_eos, trace_worker_failed,
};
