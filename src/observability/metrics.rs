//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, gauge, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const TEMPLATES_CREATED: &str = "conduit_templates_created";
const BUFFERS_PRODUCED: &str = "conduit_buffers_produced";
const BUFFERS_CONSUMED: &str = "conduit_buffers_consumed";
const BYTES_PRODUCED: &str = "conduit_bytes_produced";
const PRODUCE_BLOCKED: &str = "conduit_produce_blocked";
const ZERO_COPY_FORWARDS: &str = "conduit_zero_copy_forwards";
const WORKER_RUNS: &str = "conduit_worker_runs";
const WORKER_FAILURES: &str = "conduit_worker_failures";
const WORKER_RUN_TIME_NS: &str = "conduit_worker_run_time_ns";
const SCHEDULER_PASSES: &str = "conduit_scheduler_passes";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        TEMPLATES_CREATED,
        Unit::Count,
        "Transfer templates constructed by a driver"
    );
    metrics::describe_counter!(
        BUFFERS_PRODUCED,
        Unit::Count,
        "Buffers delivered from an output port set"
    );
    metrics::describe_counter!(
        BUFFERS_CONSUMED,
        Unit::Count,
        "Input buffers released back to their producers"
    );
    metrics::describe_counter!(BYTES_PRODUCED, Unit::Bytes, "Payload bytes delivered");
    metrics::describe_counter!(
        PRODUCE_BLOCKED,
        Unit::Count,
        "Produce attempts deferred for lack of a free target buffer"
    );
    metrics::describe_counter!(
        ZERO_COPY_FORWARDS,
        Unit::Count,
        "Input buffers forwarded without an intermediate copy"
    );
    metrics::describe_counter!(WORKER_RUNS, Unit::Count, "Worker invocations by result");
    metrics::describe_counter!(
        WORKER_FAILURES,
        Unit::Count,
        "Workers disabled after an error result"
    );
    metrics::describe_histogram!(
        WORKER_RUN_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in one worker invocation"
    );
    metrics::describe_gauge!(
        SCHEDULER_PASSES,
        Unit::Count,
        "Passes made by the most recent scheduler call"
    );
}

/// Record a template built for a protocol.
#[inline]
pub fn record_template_created(protocol: &str) {
    counter!(TEMPLATES_CREATED, "protocol" => protocol.to_string()).increment(1);
}

/// Record a buffer delivered by a circuit.
#[inline]
pub fn record_buffer_produced(circuit: usize, bytes: u64) {
    counter!(BUFFERS_PRODUCED, "circuit" => circuit.to_string()).increment(1);
    counter!(BYTES_PRODUCED, "circuit" => circuit.to_string()).increment(bytes);
}

/// Record an input buffer released by a circuit.
#[inline]
pub fn record_buffer_consumed(circuit: usize) {
    counter!(BUFFERS_CONSUMED, "circuit" => circuit.to_string()).increment(1);
}

/// Record a produce deferred by backpressure.
#[inline]
pub fn record_produce_blocked(circuit: usize) {
    counter!(PRODUCE_BLOCKED, "circuit" => circuit.to_string()).increment(1);
}

/// Record a zero-copy forward.
#[inline]
pub fn record_zero_copy(circuit: usize) {
    counter!(ZERO_COPY_FORWARDS, "circuit" => circuit.to_string()).increment(1);
}

/// Record a worker being disabled after a failure.
#[inline]
pub fn record_worker_failed(container: &str, worker: &str) {
    counter!(WORKER_FAILURES, "container" => container.to_string(), "worker" => worker.to_string())
        .increment(1);
}

/// Record the number of passes of the last scheduler call.
#[inline]
pub fn record_scheduler_passes(container: &str, passes: u32) {
    gauge!(SCHEDULER_PASSES, "container" => container.to_string()).set(f64::from(passes));
}

/// Metrics collector for one worker.
///
/// Provides a convenient way to record metrics with pre-configured labels.
#[derive(Clone)]
pub struct WorkerMetrics {
    container: String,
    worker: String,
    runs: Counter,
    callbacks: Counter,
    timeouts: Counter,
    run_time: Histogram,
}

impl WorkerMetrics {
    /// Create a collector for `worker` in `container`.
    pub fn new(container: &str, worker: &str) -> Self {
        let labels = |kind: &'static str| {
            counter!(
                WORKER_RUNS,
                "container" => container.to_string(),
                "worker" => worker.to_string(),
                "kind" => kind
            )
        };
        Self {
            container: container.to_string(),
            worker: worker.to_string(),
            runs: labels("run"),
            callbacks: labels("callback"),
            timeouts: labels("timeout"),
            run_time: histogram!(
                WORKER_RUN_TIME_NS,
                "container" => container.to_string(),
                "worker" => worker.to_string()
            ),
        }
    }

    /// Record a `run` invocation.
    #[inline]
    pub fn record_run(&self, timed_out: bool) {
        self.runs.increment(1);
        if timed_out {
            self.timeouts.increment(1);
        }
    }

    /// Record a port callback invocation.
    #[inline]
    pub fn record_callback(&self) {
        self.callbacks.increment(1);
    }

    /// Record time spent in the worker.
    #[inline]
    pub fn record_time(&self, duration: Duration) {
        self.run_time.record(duration.as_nanos() as f64);
    }
}

impl std::fmt::Debug for WorkerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerMetrics")
            .field("container", &self.container)
            .field("worker", &self.worker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics();
        init_metrics();
    }

    #[test]
    fn test_worker_metrics() {
        let metrics = WorkerMetrics::new("test-container", "fir");
        metrics.record_run(false);
        metrics.record_run(true);
        metrics.record_callback();
        metrics.record_time(Duration::from_micros(3));
        assert!(format!("{metrics:?}").contains("fir"));
    }

    #[test]
    fn test_global_recording_functions() {
        // no recorder installed: all no-ops
        record_template_created("ocpi-smb-pio");
        record_buffer_produced(0, 128);
        record_buffer_consumed(0);
        record_produce_blocked(0);
        record_zero_copy(0);
        record_worker_failed("c", "w");
        record_scheduler_passes("c", 3);
    }
}
