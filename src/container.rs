//! Containers: workers, the circuits between them and the scheduler loop.
//!
//! A [`Container`] is driven from a single thread. Each [`Container::run`]
//! call does at most [`SchedulerConfig::max_runs_per_call`] passes; a pass
//! dispatches the transport, then offers every enabled worker one run if
//! its run condition is met. Passes repeat while some worker ran.
//!
//! # Example
//!
//! ```rust
//! use conduit::config::TransportConfig;
//! use conduit::container::{ConnectOptions, Container};
//! use conduit::transfer::TransportContext;
//! use conduit::worker::{PortDecl, RunContext, RunResult, WorkerSpec};
//!
//! # fn main() -> conduit::Result<()> {
//! let ctx = TransportContext::with_pio(TransportConfig::default());
//! let mut container = Container::new("demo", ctx)?;
//!
//! let mut left = 3u8;
//! let source = container.add_worker(
//!     WorkerSpec::new("source").with_port(PortDecl::output("out")),
//!     move |ctx: &mut RunContext<'_>, _: bool| {
//!         if left == 0 {
//!             return RunResult::Done;
//!         }
//!         if let Some(buf) = ctx.output(0) {
//!             buf[0] = left;
//!             ctx.set_output(0, 1, 0);
//!             left -= 1;
//!             return RunResult::Advance;
//!         }
//!         RunResult::Ok
//!     },
//! )?;
//! let sink = container.add_worker(
//!     WorkerSpec::new("sink").with_port(PortDecl::input("in")),
//!     |_: &mut RunContext<'_>, _: bool| RunResult::Advance,
//! )?;
//! container.connect(source, 0, sink, 0, &ConnectOptions::default())?;
//! container.run_until_idle(100)?;
//! # Ok(())
//! # }
//! ```

use crate::circuit::{Circuit, CircuitId, CircuitSpec, PortRef, PortSetSpec};
use crate::config::SchedulerConfig;
use crate::error::{Error, Result};
use crate::observability::{self, TracingConfig, WorkerMetrics};
use crate::port::Direction;
use crate::transfer::TransportContext;
use crate::worker::{
    PortBinding, PortCallback, RunCondition, RunContext, RunResult, Worker, WorkerPort, WorkerSpec,
};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Buffers per port used by [`ConnectOptions::default`].
pub const DEFAULT_BUFFER_COUNT: u32 = 2;

/// Buffer size used by [`ConnectOptions::default`].
pub const DEFAULT_BUFFER_SIZE: u32 = 2048;

/// Identity of a worker within its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub usize);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Scheduling state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Considered by the scheduler.
    Enabled,
    /// Skipped until enabled.
    Disabled,
    /// Failed; skipped until reset.
    Unusable,
}

/// Buffer geometry and placement of a point-to-point connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Buffers per port.
    pub buffer_count: u32,
    /// Bytes per buffer.
    pub buffer_size: u32,
    /// Endpoint of the output side; the container's own if `None`.
    pub output_endpoint: Option<String>,
    /// Endpoint of the input side; the container's own if `None`.
    pub input_endpoint: Option<String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            buffer_count: DEFAULT_BUFFER_COUNT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            output_endpoint: None,
            input_endpoint: None,
        }
    }
}

impl ConnectOptions {
    /// Set the buffer count.
    pub fn with_buffer_count(mut self, count: u32) -> Self {
        self.buffer_count = count;
        self
    }

    /// Set the buffer size.
    pub fn with_buffer_size(mut self, size: u32) -> Self {
        self.buffer_size = size;
        self
    }

    /// Place the two sides on the given endpoints.
    pub fn with_endpoints(mut self, output: impl Into<String>, input: impl Into<String>) -> Self {
        self.output_endpoint = Some(output.into());
        self.input_endpoint = Some(input.into());
        self
    }
}

/// Scheduler counters, accumulated over every `run` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Scheduler passes.
    pub passes: u64,
    /// Worker invocations (runs and callback rounds).
    pub worker_runs: u64,
    /// Port callbacks invoked.
    pub callbacks: u64,
    /// Invocations forced by a run-condition timeout.
    pub timeouts: u64,
}

struct WorkerSlot {
    spec: WorkerSpec,
    condition: RunCondition,
    worker: Box<dyn Worker>,
    ports: Vec<WorkerPort>,
    callbacks: Vec<Option<PortCallback>>,
    state: WorkerState,
    last_run: Instant,
    metrics: WorkerMetrics,
}

/// Workers plus the circuits connecting them.
pub struct Container {
    name: String,
    ctx: Arc<TransportContext>,
    endpoint: String,
    owns_endpoint: bool,
    config: SchedulerConfig,
    tracing: TracingConfig,
    circuits: Vec<Option<Circuit>>,
    workers: Vec<WorkerSlot>,
    stats: SchedulerStats,
    last_passes: u32,
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.name)
            .field("endpoint", &self.endpoint)
            .field("workers", &self.workers.iter().map(|w| &w.spec.name).collect::<Vec<_>>())
            .field("circuits", &self.circuits.iter().flatten().count())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Container {
    /// Create a container with its own endpoint on the context's first driver.
    pub fn new(name: impl Into<String>, ctx: Arc<TransportContext>) -> Result<Self> {
        let endpoint = ctx.allocate_endpoint("")?;
        let mut container = Self::with_endpoint(name, ctx, endpoint)?;
        container.owns_endpoint = true;
        Ok(container)
    }

    /// Create a container whose local circuits live on `endpoint`.
    pub fn with_endpoint(
        name: impl Into<String>,
        ctx: Arc<TransportContext>,
        endpoint: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let endpoint = endpoint.into();
        ctx.resources(&endpoint)?;
        info!(container = %name, endpoint = %endpoint, "container created");
        Ok(Self {
            name,
            ctx,
            endpoint,
            owns_endpoint: false,
            config: SchedulerConfig::default(),
            tracing: TracingConfig::default(),
            circuits: Vec::new(),
            workers: Vec::new(),
            stats: SchedulerStats::default(),
            last_passes: 0,
        })
    }

    /// Set the scheduler configuration.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the tracing configuration.
    pub fn with_tracing(mut self, tracing: TracingConfig) -> Self {
        self.tracing = tracing;
        self
    }

    /// Container name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The container's own endpoint.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The transport context.
    pub fn context(&self) -> &Arc<TransportContext> {
        &self.ctx
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Add an enabled worker.
    ///
    /// # Errors
    ///
    /// Fails if the name is taken or the worker declares more than 32 ports.
    pub fn add_worker(&mut self, spec: WorkerSpec, worker: impl Worker + 'static) -> Result<WorkerId> {
        if self.worker_id(&spec.name).is_some() {
            return Err(Error::InvalidConfig(format!("worker '{}' already exists", spec.name)));
        }
        if spec.ports.len() > 32 {
            return Err(Error::InvalidConfig(format!(
                "worker '{}' declares {} ports, at most 32 fit a run-condition mask",
                spec.name,
                spec.ports.len()
            )));
        }
        let id = WorkerId(self.workers.len());
        debug!(container = %self.name, worker = %spec.name, %id, ports = spec.ports.len(), "worker added");
        self.workers.push(WorkerSlot {
            condition: spec.effective_run_condition(),
            worker: Box::new(worker),
            ports: spec.ports.iter().map(|_| WorkerPort::default()).collect(),
            callbacks: spec.ports.iter().map(|_| None).collect(),
            state: WorkerState::Enabled,
            last_run: Instant::now(),
            metrics: WorkerMetrics::new(&self.name, &spec.name),
            spec,
        });
        Ok(id)
    }

    /// Id of the worker called `name`.
    pub fn worker_id(&self, name: &str) -> Option<WorkerId> {
        self.workers.iter().position(|w| w.spec.name == name).map(WorkerId)
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Index of `worker`'s port called `name`.
    pub fn port_index(&self, worker: WorkerId, name: &str) -> Result<usize> {
        self.slot(worker)?
            .spec
            .port_index(name)
            .ok_or_else(|| Error::PortNotFound(format!("{worker}.{name}")))
    }

    fn slot(&self, id: WorkerId) -> Result<&WorkerSlot> {
        self.workers
            .get(id.0)
            .ok_or_else(|| Error::WorkerNotFound(id.to_string()))
    }

    fn slot_mut(&mut self, id: WorkerId) -> Result<&mut WorkerSlot> {
        self.workers
            .get_mut(id.0)
            .ok_or_else(|| Error::WorkerNotFound(id.to_string()))
    }

    fn check_port(&self, worker: WorkerId, port: usize, direction: Direction) -> Result<()> {
        let slot = self.slot(worker)?;
        let decl = slot
            .spec
            .ports
            .get(port)
            .ok_or_else(|| Error::PortNotFound(format!("{worker}.{port}")))?;
        if decl.direction != direction {
            return Err(Error::PortNotFound(format!(
                "{}.{} is an {:?} port",
                slot.spec.name, decl.name, decl.direction
            )));
        }
        if slot.ports[port].binding.is_some() {
            return Err(Error::InvalidConfig(format!(
                "{}.{} is already connected",
                slot.spec.name, decl.name
            )));
        }
        Ok(())
    }

    /// Connect `out_worker`'s output port to `in_worker`'s input port.
    pub fn connect(
        &mut self,
        out_worker: WorkerId,
        out_port: usize,
        in_worker: WorkerId,
        in_port: usize,
        options: &ConnectOptions,
    ) -> Result<CircuitId> {
        let output_ep = options.output_endpoint.clone().unwrap_or_else(|| self.endpoint.clone());
        let input_ep = options.input_endpoint.clone().unwrap_or_else(|| self.endpoint.clone());
        let spec = CircuitSpec::point_to_point(
            PortSetSpec::new(output_ep, options.buffer_count, options.buffer_size),
            PortSetSpec::new(input_ep, options.buffer_count, options.buffer_size),
        );
        self.connect_spec(&spec, &[(out_worker, out_port)], &[vec![(in_worker, in_port)]])
    }

    /// Connect worker ports through a circuit of any supported shape.
    ///
    /// `outputs[rank]` is bound to output port `rank` and
    /// `inputs[set][index]` to port `index` of input set `set`.
    pub fn connect_spec(
        &mut self,
        spec: &CircuitSpec,
        outputs: &[(WorkerId, usize)],
        inputs: &[Vec<(WorkerId, usize)>],
    ) -> Result<CircuitId> {
        if outputs.len() != spec.output.ports
            || inputs.len() != spec.inputs.len()
            || inputs.iter().zip(&spec.inputs).any(|(bound, set)| bound.len() != set.ports)
        {
            return Err(Error::UnsupportedTopology(
                "worker ports do not match the circuit's port sets".into(),
            ));
        }
        for &(worker, port) in outputs {
            self.check_port(worker, port, Direction::Output)?;
        }
        for &(worker, port) in inputs.iter().flatten() {
            self.check_port(worker, port, Direction::Input)?;
        }
        let mut seen: Vec<(WorkerId, usize)> = outputs.iter().chain(inputs.iter().flatten()).copied().collect();
        seen.sort_unstable();
        if seen.windows(2).any(|w| w[0] == w[1]) {
            return Err(Error::InvalidConfig("a worker port appears twice in one circuit".into()));
        }
        let id = CircuitId(self.circuits.len());
        let circuit = Circuit::connect(&self.ctx, id, spec)?;
        self.circuits.push(Some(circuit));

        for (rank, &(worker, port)) in outputs.iter().enumerate() {
            self.workers[worker.0].ports[port] = WorkerPort::bound(PortBinding {
                circuit: id,
                port: PortRef::output(rank),
            });
        }
        for (set, bound) in inputs.iter().enumerate() {
            for (index, &(worker, port)) in bound.iter().enumerate() {
                self.workers[worker.0].ports[port] = WorkerPort::bound(PortBinding {
                    circuit: id,
                    port: PortRef::input(set, index),
                });
            }
        }
        Ok(id)
    }

    /// A circuit of this container.
    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(id.0)?.as_ref()
    }

    /// Enable a disabled worker. Unusable workers stay unusable.
    pub fn enable(&mut self, id: WorkerId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        match slot.state {
            WorkerState::Unusable => {
                warn!(worker = %slot.spec.name, "unusable worker must be reset before it is enabled");
            }
            _ => {
                slot.state = WorkerState::Enabled;
                slot.last_run = Instant::now();
            }
        }
        Ok(())
    }

    /// Disable a worker.
    pub fn disable(&mut self, id: WorkerId) -> Result<()> {
        let slot = self.slot_mut(id)?;
        if slot.state == WorkerState::Enabled {
            slot.state = WorkerState::Disabled;
        }
        Ok(())
    }

    /// Scheduling state of a worker.
    pub fn worker_state(&self, id: WorkerId) -> Result<WorkerState> {
        Ok(self.slot(id)?.state)
    }

    /// Bring a worker back to [`WorkerState::Disabled`], giving back every
    /// buffer it holds.
    pub fn reset_worker(&mut self, id: WorkerId) -> Result<()> {
        let Self { workers, circuits, .. } = self;
        let slot = workers
            .get_mut(id.0)
            .ok_or_else(|| Error::WorkerNotFound(id.to_string()))?;
        for (decl, port) in slot.spec.ports.iter().zip(&mut slot.ports) {
            let (Some(binding), Some(handle)) = (port.binding, port.current) else {
                continue;
            };
            port.clear();
            let circuit = circuits
                .get_mut(binding.circuit.0)
                .and_then(Option::as_mut)
                .ok_or_else(|| Error::PortNotFound(binding.circuit.to_string()))?;
            match decl.direction {
                Direction::Input => circuit.release(handle)?,
                Direction::Output => circuit.discard(handle),
            }
        }
        slot.state = WorkerState::Disabled;
        info!(worker = %slot.spec.name, "worker reset");
        Ok(())
    }

    /// True if `worker`'s `port` is bound to a circuit.
    pub fn is_connected(&self, worker: WorkerId, port: usize) -> Result<bool> {
        let slot = self.slot(worker)?;
        let port = slot
            .ports
            .get(port)
            .ok_or_else(|| Error::PortNotFound(format!("{worker}.{port}")))?;
        Ok(port.binding.is_some())
    }

    /// Tear down circuit `id`.
    ///
    /// Buffers workers hold on it are handed back, input buffers of other
    /// circuits lent to its outputs are released, every worker port bound
    /// to it becomes unconnected and its transfer templates are released.
    pub fn disconnect(&mut self, id: CircuitId) -> Result<()> {
        let Self { workers, circuits, .. } = self;
        let circuit = circuits
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or_else(|| Error::PortNotFound(id.to_string()))?;
        for slot in workers.iter_mut() {
            for (decl, port) in slot.spec.ports.iter().zip(&mut slot.ports) {
                if port.binding.is_none_or(|b| b.circuit != id) {
                    continue;
                }
                if let Some(handle) = port.current {
                    match decl.direction {
                        Direction::Input => circuit.release(handle)?,
                        Direction::Output => circuit.discard(handle),
                    }
                }
                *port = WorkerPort::default();
            }
        }
        let lent = circuit.take_forwards();
        let circuit = circuits[id.0].take();
        for forwarded in lent {
            if let Some(source) = circuits.get_mut(forwarded.circuit.0).and_then(Option::as_mut) {
                source.release_forwarded(forwarded.handle)?;
            }
        }
        drop(circuit);
        info!(container = %self.name, circuit = %id, "circuit disconnected");
        Ok(())
    }

    /// Tear down a worker: disconnect every circuit it is bound to and
    /// leave it [`WorkerState::Disabled`].
    pub fn teardown_worker(&mut self, id: WorkerId) -> Result<()> {
        let mut bound: Vec<CircuitId> = self
            .slot(id)?
            .ports
            .iter()
            .filter_map(|p| p.binding.map(|b| b.circuit))
            .collect();
        bound.sort_unstable();
        bound.dedup();
        for circuit in bound {
            self.disconnect(circuit)?;
        }
        let slot = self.slot_mut(id)?;
        slot.state = WorkerState::Disabled;
        let slot = self.slot(id)?;
        info!(container = %self.name, worker = %slot.spec.name, "worker torn down");
        Ok(())
    }

    /// Call `callback` instead of the worker's `run` whenever `port` is ready.
    pub fn set_port_callback(
        &mut self,
        worker: WorkerId,
        port: usize,
        callback: impl FnMut(&mut RunContext<'_>, usize) -> RunResult + Send + 'static,
    ) -> Result<()> {
        let slot = self.slot_mut(worker)?;
        let entry = slot
            .callbacks
            .get_mut(port)
            .ok_or_else(|| Error::PortNotFound(format!("{worker}.{port}")))?;
        *entry = Some(Box::new(callback));
        Ok(())
    }

    /// Scheduler counters.
    pub fn stats(&self) -> SchedulerStats {
        self.stats
    }

    /// Passes done by the last `run` call.
    pub fn last_passes(&self) -> u32 {
        self.last_passes
    }

    /// Advance the transport: retry queued produces in every circuit and
    /// release input buffers whose zero-copy forwards have been delivered.
    pub fn dispatch(&mut self) -> Result<()> {
        for i in 0..self.circuits.len() {
            let Some(circuit) = self.circuits[i].as_mut() else {
                continue;
            };
            for forwarded in circuit.dispatch()? {
                // The source circuit may have been disconnected meanwhile.
                match self.circuits.get_mut(forwarded.circuit.0).and_then(Option::as_mut) {
                    Some(source) => source.release_forwarded(forwarded.handle)?,
                    None => debug!(circuit = %forwarded.circuit, "forward retired after its source was torn down"),
                }
            }
        }
        Ok(())
    }

    /// One scheduler call. Returns true if any worker ran.
    pub fn run(&mut self) -> Result<bool> {
        let _span = self
            .tracing
            .container_spans
            .then(|| observability::instrument_container(&self.name));
        let max = self.config.max_runs_per_call.max(1);
        let mut passes = 0;
        let mut any = false;
        self.dispatch()?;
        while passes < max {
            passes += 1;
            let mut progress = false;
            for wid in 0..self.workers.len() {
                if self.config.dispatch_per_worker {
                    self.dispatch()?;
                }
                progress |= self.run_worker(wid)?;
            }
            if !progress {
                break;
            }
            any = true;
            if !self.config.dispatch_per_worker {
                self.dispatch()?;
            }
        }
        self.stats.passes += u64::from(passes);
        self.last_passes = passes;
        observability::record_scheduler_passes(&self.name, passes);
        Ok(any)
    }

    /// Call [`run`](Self::run) until no worker runs or `max_calls` calls
    /// have been made. Returns the number of calls in which a worker ran.
    pub fn run_until_idle(&mut self, max_calls: usize) -> Result<usize> {
        let mut busy = 0;
        for _ in 0..max_calls {
            if !self.run()? {
                break;
            }
            busy += 1;
        }
        Ok(busy)
    }

    fn run_worker(&mut self, wid: usize) -> Result<bool> {
        let Self {
            name,
            circuits,
            workers,
            stats,
            tracing,
            ..
        } = self;
        let WorkerSlot {
            spec,
            condition,
            worker,
            ports,
            callbacks,
            state,
            last_run,
            metrics,
        } = &mut workers[wid];
        if *state != WorkerState::Enabled {
            return Ok(false);
        }

        let mut ctx = RunContext::new(&spec.name, &spec.ports, ports, circuits);
        let mut active = 0u32;
        for (i, decl) in spec.ports.iter().enumerate() {
            let ready = if ctx.is_connected(i) {
                ctx.is_ready(i)
            } else {
                decl.optional
            };
            if ready {
                active |= 1 << i;
            }
        }
        let timed_out = condition.timeout.is_some_and(|t| last_run.elapsed() >= t);
        if !timed_out && !condition.is_met(active) {
            return Ok(false);
        }

        let _span = tracing
            .worker_spans
            .then(|| observability::instrument_worker(name, &spec.name));
        let started = Instant::now();
        for i in (0..spec.ports.len()).filter(|i| active & (1 << i) != 0) {
            ctx.request(i);
        }

        let ready_callbacks: Vec<usize> = (0..spec.ports.len())
            .filter(|&i| active & (1 << i) != 0 && ctx.is_connected(i) && callbacks[i].is_some())
            .collect();
        let mut result = if ready_callbacks.is_empty() {
            let result = worker.run(&mut ctx, timed_out);
            if result == RunResult::Advance {
                ctx.advance_all();
            }
            result
        } else {
            let mut result = RunResult::Ok;
            for i in ready_callbacks {
                let Some(callback) = callbacks[i].as_mut() else {
                    continue;
                };
                stats.callbacks += 1;
                metrics.record_callback();
                let r = callback(&mut ctx, i);
                if r != RunResult::Ok {
                    // Any non-Ok callback result fails the worker.
                    result = if r.is_failure() { r } else { RunResult::Error };
                    break;
                }
            }
            result
        };
        let failure = ctx.take_failure();
        drop(ctx);

        if let Some(e) = &failure {
            warn!(worker = %spec.name, error = %e, "transfer failed during run");
            result = RunResult::Error;
        }
        match result {
            RunResult::Ok | RunResult::Advance => *last_run = Instant::now(),
            RunResult::Done => {
                *state = WorkerState::Disabled;
                info!(container = %name, worker = %spec.name, "worker done");
            }
            RunResult::Error | RunResult::Fatal => {
                *state = WorkerState::Unusable;
                let reason = failure.map_or_else(|| format!("{result:?}"), |e| e.to_string());
                observability::trace_worker_failed(name, &spec.name, &reason);
                observability::record_worker_failed(name, &spec.name);
            }
        }

        stats.worker_runs += 1;
        if timed_out {
            stats.timeouts += 1;
        }
        metrics.record_run(timed_out);
        metrics.record_time(started.elapsed());
        Ok(true)
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        // Circuits release their templates before the endpoint goes.
        self.circuits.clear();
        if self.owns_endpoint {
            self.ctx.release_resources(&self.endpoint);
        }
        debug!(container = %self.name, stats = ?self.stats, "container dropped");
    }
}
