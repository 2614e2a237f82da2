//! Workers and their view of the ports they own.
//!
//! A worker is a unit of computation driven by a [`Container`]'s scheduler.
//! It declares its ports in a [`WorkerSpec`] and, when its run condition is
//! met, gets [`Worker::run`] called with a [`RunContext`] giving access to
//! the buffer currently held at each port.
//!
//! Port operations never block. Backpressure shows up as `false`/`None`;
//! the worker returns and the scheduler calls it again once the ports are
//! ready.
//!
//! [`Container`]: crate::container::Container
//!
//! # Example
//!
//! ```rust
//! use conduit::worker::{RunContext, RunResult, Worker};
//!
//! /// Copies its input to its output, uppercased.
//! struct Upper;
//!
//! impl Worker for Upper {
//!     fn run(&mut self, ctx: &mut RunContext<'_>, _timed_out: bool) -> RunResult {
//!         let Some(data) = ctx.input(0).map(|d| d.to_ascii_uppercase()) else {
//!             return RunResult::Ok;
//!         };
//!         if let Some(out) = ctx.output(1) {
//!             out[..data.len()].copy_from_slice(&data);
//!             ctx.set_output(1, data.len() as u32, 0);
//!             return RunResult::Advance;
//!         }
//!         RunResult::Ok
//!     }
//! }
//! ```

use crate::circuit::{BufferHandle, Circuit, CircuitId, PortRef, PortSetId, ProduceOutcome};
use crate::error::{Error, Result};
use crate::port::{BufferMetaData, Direction};
use std::fmt;
use std::time::Duration;
use tracing::{trace, warn};

/// Outcome of one worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunResult {
    /// Nothing more to do; reset the run timer.
    Ok,
    /// Advance every port holding a buffer.
    Advance,
    /// Finished; disable the worker.
    Done,
    /// Failed; disable the worker and mark it unusable.
    Error,
    /// Failed beyond recovery; disable the worker and mark it unusable.
    Fatal,
}

impl RunResult {
    /// True for [`Error`](Self::Error) and [`Fatal`](Self::Fatal).
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Error | Self::Fatal)
    }
}

/// When a worker may run.
///
/// Each mask is a set of port indices (bit `i` = port `i`). The condition
/// holds if every port of at least one mask is ready. No masks means
/// always runnable. The timeout forces a run once that much time has passed
/// since the last one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunCondition {
    /// OR-ed port masks.
    pub port_masks: Vec<u32>,
    /// Forced run period.
    pub timeout: Option<Duration>,
}

impl RunCondition {
    /// Always runnable.
    pub fn always() -> Self {
        Self::default()
    }

    /// Runnable when all of the first `ports` ports are ready.
    pub fn all_ports(ports: usize) -> Self {
        let mask = match ports {
            0 => return Self::always(),
            32.. => u32::MAX,
            n => (1u32 << n) - 1,
        };
        Self {
            port_masks: vec![mask],
            timeout: None,
        }
    }

    /// Runnable when every port in `mask` is ready.
    pub fn mask(mask: u32) -> Self {
        Self {
            port_masks: vec![mask],
            timeout: None,
        }
    }

    /// Add an alternative mask.
    pub fn or(mut self, mask: u32) -> Self {
        self.port_masks.push(mask);
        self
    }

    /// Set the forced run period.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// True if the ports in `active` satisfy the condition.
    pub fn is_met(&self, active: u32) -> bool {
        self.port_masks.is_empty() || self.port_masks.iter().any(|&m| active & m == m)
    }
}

/// One declared port of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDecl {
    /// Port name.
    pub name: String,
    /// Input or output.
    pub direction: Direction,
    /// Whether the worker runs with the port unconnected.
    pub optional: bool,
}

impl PortDecl {
    /// A required input.
    pub fn input(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Input,
            optional: false,
        }
    }

    /// A required output.
    pub fn output(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: Direction::Output,
            optional: false,
        }
    }

    /// Mark the port optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

/// Static description of a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    /// Worker name, unique within its container.
    pub name: String,
    /// Ports, indexed by position.
    pub ports: Vec<PortDecl>,
    /// Run condition; `None` waits for every port.
    pub run_condition: Option<RunCondition>,
}

impl WorkerSpec {
    /// A worker with no ports.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
            run_condition: None,
        }
    }

    /// Add a port.
    pub fn with_port(mut self, port: PortDecl) -> Self {
        self.ports.push(port);
        self
    }

    /// Set the run condition.
    pub fn with_run_condition(mut self, condition: RunCondition) -> Self {
        self.run_condition = Some(condition);
        self
    }

    /// Index of the port called `name`.
    pub fn port_index(&self, name: &str) -> Option<usize> {
        self.ports.iter().position(|p| p.name == name)
    }

    /// The run condition in force.
    pub fn effective_run_condition(&self) -> RunCondition {
        self.run_condition
            .clone()
            .unwrap_or_else(|| RunCondition::all_ports(self.ports.len()))
    }
}

/// A computation driven by the scheduler.
pub trait Worker: Send {
    /// Do one unit of work.
    ///
    /// `timed_out` is true when the run was forced by the run condition's
    /// timeout rather than by port readiness.
    fn run(&mut self, ctx: &mut RunContext<'_>, timed_out: bool) -> RunResult;
}

impl<F> Worker for F
where
    F: FnMut(&mut RunContext<'_>, bool) -> RunResult + Send,
{
    fn run(&mut self, ctx: &mut RunContext<'_>, timed_out: bool) -> RunResult {
        self(ctx, timed_out)
    }
}

/// Callback invoked instead of [`Worker::run`] when its port is ready.
pub type PortCallback = Box<dyn FnMut(&mut RunContext<'_>, usize) -> RunResult + Send>;

/// An input buffer kept by a worker past the next request.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a taken buffer must be passed to release_taken"]
pub struct TakenBuffer {
    port: usize,
    circuit: CircuitId,
    handle: BufferHandle,
}

impl TakenBuffer {
    /// Worker port the buffer came from.
    pub fn port(&self) -> usize {
        self.port
    }
}

/// Where a worker port is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PortBinding {
    pub(crate) circuit: CircuitId,
    pub(crate) port: PortRef,
}

/// Runtime state of one worker port.
#[derive(Debug, Default)]
pub(crate) struct WorkerPort {
    pub(crate) binding: Option<PortBinding>,
    pub(crate) current: Option<BufferHandle>,
    pending: Option<(u32, u32)>,
}

impl WorkerPort {
    pub(crate) fn bound(binding: PortBinding) -> Self {
        Self {
            binding: Some(binding),
            ..Self::default()
        }
    }

    pub(crate) fn clear(&mut self) {
        self.current = None;
        self.pending = None;
    }
}

/// Mutable access to two distinct circuits of the arena.
fn pair_mut(
    circuits: &mut [Option<Circuit>],
    a: CircuitId,
    b: CircuitId,
) -> Option<(&mut Circuit, &mut Circuit)> {
    let (i, j) = (a.0, b.0);
    if i == j || i >= circuits.len() || j >= circuits.len() {
        return None;
    }
    let (x, y) = if i < j {
        let (lo, hi) = circuits.split_at_mut(j);
        (&mut lo[i], &mut hi[0])
    } else {
        let (lo, hi) = circuits.split_at_mut(i);
        (&mut hi[0], &mut lo[j])
    };
    Some((x.as_mut()?, y.as_mut()?))
}

/// A worker's access to its ports during one invocation.
///
/// Ports are addressed by their index in the [`WorkerSpec`]. Transfer
/// failures are not returned from the port operations; the first one is
/// recorded and fails the worker when the invocation returns.
pub struct RunContext<'a> {
    worker: &'a str,
    decls: &'a [PortDecl],
    ports: &'a mut [WorkerPort],
    circuits: &'a mut [Option<Circuit>],
    failure: Option<Error>,
}

impl fmt::Debug for RunContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunContext")
            .field("worker", &self.worker)
            .field("ports", &self.ports.len())
            .field("failure", &self.failure)
            .finish()
    }
}

impl<'a> RunContext<'a> {
    pub(crate) fn new(
        worker: &'a str,
        decls: &'a [PortDecl],
        ports: &'a mut [WorkerPort],
        circuits: &'a mut [Option<Circuit>],
    ) -> Self {
        Self {
            worker,
            decls,
            ports,
            circuits,
            failure: None,
        }
    }

    /// Name of the running worker.
    pub fn worker_name(&self) -> &str {
        self.worker
    }

    /// Number of ports.
    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// True if `port` is connected.
    pub fn is_connected(&self, port: usize) -> bool {
        self.ports.get(port).is_some_and(|p| p.binding.is_some())
    }

    pub(crate) fn take_failure(&mut self) -> Option<Error> {
        self.failure.take()
    }

    fn fail(&mut self, error: Error) {
        warn!(worker = %self.worker, error = %error, "port operation failed");
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    fn check(&mut self, result: Result<bool>) -> bool {
        result.unwrap_or_else(|e| {
            self.fail(e);
            false
        })
    }

    fn direction(&self, port: usize) -> Direction {
        match self.decls.get(port) {
            Some(decl) => decl.direction,
            None => panic!("worker {} has no port {port}", self.worker),
        }
    }

    fn binding(&self, port: usize) -> Option<PortBinding> {
        self.ports.get(port)?.binding
    }

    fn circuit(&self, id: CircuitId) -> &Circuit {
        match self.circuits.get(id.0).and_then(Option::as_ref) {
            Some(c) => c,
            None => panic!("{id} is not in the container"),
        }
    }

    fn circuit_mut(&mut self, id: CircuitId) -> &mut Circuit {
        match self.circuits.get_mut(id.0).and_then(Option::as_mut) {
            Some(c) => c,
            None => panic!("{id} is not in the container"),
        }
    }

    /// True if `port` holds a buffer or one is waiting at its cursor.
    pub(crate) fn is_ready(&self, port: usize) -> bool {
        let Some(b) = self.binding(port) else {
            return false;
        };
        if self.ports[port].current.is_some() {
            return true;
        }
        let circuit = self.circuit(b.circuit);
        match b.port.set {
            PortSetId::Output => circuit.has_empty_output_buffer(b.port.index),
            PortSetId::Input(set) => circuit.has_full_input_buffer(set, b.port.index),
        }
    }

    /// Make sure `port` holds a buffer. Returns false if none is available.
    pub fn request(&mut self, port: usize) -> bool {
        let Some(b) = self.binding(port) else {
            return false;
        };
        if self.ports[port].current.is_some() {
            return true;
        }
        let circuit = self.circuit_mut(b.circuit);
        let handle = match b.port.set {
            PortSetId::Output => circuit.next_empty_output_buffer(b.port.index),
            PortSetId::Input(set) => circuit.next_full_input_buffer(set, b.port.index),
        };
        self.ports[port].current = handle;
        handle.is_some()
    }

    /// Payload of the buffer held at input `port`, requesting one if needed.
    pub fn input(&mut self, port: usize) -> Option<&[u8]> {
        debug_assert_eq!(self.direction(port), Direction::Input);
        if !self.request(port) {
            return None;
        }
        let b = self.binding(port)?;
        let handle = self.ports[port].current?;
        Some(self.circuit(b.circuit).input_buffer(handle))
    }

    /// Metadata of the buffer held at input `port`.
    pub fn input_metadata(&mut self, port: usize) -> Option<BufferMetaData> {
        debug_assert_eq!(self.direction(port), Direction::Input);
        if !self.request(port) {
            return None;
        }
        let b = self.binding(port)?;
        let handle = self.ports[port].current?;
        Some(self.circuit(b.circuit).input_metadata(handle))
    }

    /// Writable payload of the buffer held at output `port`, requesting one
    /// if needed.
    pub fn output(&mut self, port: usize) -> Option<&mut [u8]> {
        debug_assert_eq!(self.direction(port), Direction::Output);
        if !self.request(port) {
            return None;
        }
        let b = self.binding(port)?;
        let handle = self.ports[port].current?;
        Some(self.circuit_mut(b.circuit).output_buffer_mut(handle))
    }

    /// Set the length and opcode sent by the next advance of output `port`.
    pub fn set_output(&mut self, port: usize, len: u32, opcode: u32) {
        debug_assert_eq!(self.direction(port), Direction::Output);
        if let Some(p) = self.ports.get_mut(port) {
            p.pending = Some((len, opcode));
        }
    }

    /// Send (output) or release (input) the buffer held at `port`, then
    /// request the next one. Returns true if a next buffer is held.
    pub fn advance(&mut self, port: usize) -> bool {
        let Some(b) = self.binding(port) else {
            return false;
        };
        let Some(handle) = self.ports[port].current.take() else {
            return self.request(port);
        };
        let result = match self.direction(port) {
            Direction::Output => {
                let (len, opcode) = self.ports[port].pending.take().unwrap_or((0, 0));
                self.circuit_mut(b.circuit).advance(handle, len, opcode).map(|_| ())
            }
            Direction::Input => self.circuit_mut(b.circuit).release(handle),
        };
        trace!(worker = %self.worker, port, tid = handle.tid, "port advanced");
        match result {
            Ok(()) => self.request(port),
            Err(e) => {
                self.fail(e);
                false
            }
        }
    }

    pub(crate) fn advance_all(&mut self) {
        for port in 0..self.ports.len() {
            if self.ports[port].current.is_some() {
                self.advance(port);
            }
        }
    }

    /// Release the buffer held at input `port` without requesting another.
    pub fn release(&mut self, port: usize) {
        debug_assert_eq!(self.direction(port), Direction::Input);
        let (Some(b), Some(handle)) = (self.binding(port), self.ports[port].current.take()) else {
            return;
        };
        let result = self.circuit_mut(b.circuit).release(handle);
        if let Err(e) = result {
            self.fail(e);
        }
    }

    /// Keep the buffer held at input `port` and request the next one.
    pub fn take(&mut self, port: usize) -> Option<TakenBuffer> {
        debug_assert_eq!(self.direction(port), Direction::Input);
        let b = self.binding(port)?;
        if !self.request(port) {
            return None;
        }
        let handle = self.ports[port].current.take()?;
        self.request(port);
        Some(TakenBuffer {
            port,
            circuit: b.circuit,
            handle,
        })
    }

    /// Payload of a taken buffer.
    ///
    /// Empty once the buffer's circuit has been disconnected.
    pub fn taken(&self, buffer: &TakenBuffer) -> &[u8] {
        match self.circuits.get(buffer.circuit.0).and_then(Option::as_ref) {
            Some(c) => c.input_buffer(buffer.handle),
            None => &[],
        }
    }

    /// Release a taken buffer.
    ///
    /// A buffer whose circuit has been disconnected went away with it.
    pub fn release_taken(&mut self, buffer: TakenBuffer) {
        let Some(circuit) = self.circuits.get_mut(buffer.circuit.0).and_then(Option::as_mut) else {
            return;
        };
        if let Err(e) = circuit.release(buffer.handle) {
            self.fail(e);
        }
    }

    /// Send the buffer held at input `in_port` out of output `out_port`.
    ///
    /// The payload is forwarded in place when both ports share an address
    /// space and copied otherwise. Both ports then request their next
    /// buffer. Returns false if either port has no buffer.
    pub fn send(&mut self, out_port: usize, in_port: usize) -> bool {
        debug_assert_eq!(self.direction(out_port), Direction::Output);
        debug_assert_eq!(self.direction(in_port), Direction::Input);
        let (Some(ob), Some(ib)) = (self.binding(out_port), self.binding(in_port)) else {
            return false;
        };
        if !self.request(in_port) || !self.request(out_port) {
            return false;
        }
        let (Some(out), Some(inp)) = (self.ports[out_port].current, self.ports[in_port].current) else {
            return false;
        };
        let result = self.forward(ob.circuit, out, ib.circuit, inp);
        self.ports[out_port].clear();
        self.ports[in_port].clear();
        if self.check(result) {
            self.request(in_port);
            self.request(out_port);
            true
        } else {
            false
        }
    }

    fn forward(
        &mut self,
        out_circuit: CircuitId,
        out: BufferHandle,
        in_circuit: CircuitId,
        inp: BufferHandle,
    ) -> Result<bool> {
        if out_circuit == in_circuit {
            // Same circuit: an input feeding its own output set. Copy.
            let circuit = self.circuit_mut(out_circuit);
            let meta = circuit.input_metadata(inp);
            let data = circuit.input_buffer(inp).to_vec();
            let dst = circuit.output_buffer_mut(out);
            let len = data.len().min(dst.len());
            dst[..len].copy_from_slice(&data[..len]);
            circuit.advance(out, len as u32, meta.opcode)?;
            circuit.release(inp)?;
            return Ok(true);
        }
        let worker = self.worker;
        let (oc, ic) = pair_mut(self.circuits, out_circuit, in_circuit)
            .ok_or_else(|| Error::PortNotFound(format!("{worker}: {out_circuit} or {in_circuit}")))?;
        let meta = ic.input_metadata(inp);
        let zero_copy = match (oc.port(out.port), ic.port(inp.port)) {
            (Some(o), Some(i)) => o.supports_zero_copy(i) && meta.length <= o.buffer_size(),
            _ => false,
        };
        if zero_copy {
            let source = ic.lend(inp);
            let outcome = oc.send_zero_copy(out, source, meta.length, meta.opcode)?;
            trace!(worker = %worker, queued = outcome == ProduceOutcome::Blocked, "forwarded in place");
            return Ok(true);
        }
        let data = ic.input_buffer(inp);
        let dst = oc.output_buffer_mut(out);
        let len = data.len().min(dst.len());
        dst[..len].copy_from_slice(&data[..len]);
        oc.advance(out, len as u32, meta.opcode)?;
        ic.release(inp)?;
        Ok(true)
    }

    /// Send end-of-stream from output `port` to every connected input.
    ///
    /// Uses the buffer held at the port if there is one. Returns false if
    /// no output buffer is free.
    pub fn end_of_stream(&mut self, port: usize) -> bool {
        debug_assert_eq!(self.direction(port), Direction::Output);
        let Some(b) = self.binding(port) else {
            return false;
        };
        let held = self.ports[port].current.take();
        self.ports[port].pending = None;
        let circuit = self.circuit_mut(b.circuit);
        let result = match held {
            Some(handle) => circuit.advance_end_of_stream(handle).map(|_| true),
            None => circuit.end_of_stream(b.port.index).map(|o| o.is_some()),
        };
        self.check(result)
    }

    /// Wait for `port` to become ready.
    ///
    /// Scheduling is polled, so this never waits and always returns false;
    /// return from `run` and let the run condition bring the worker back.
    pub fn wait(&mut self, _port: usize, _max: u32, _usecs: u32) -> bool {
        false
    }
}
