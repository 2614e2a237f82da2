//! Circuits: one output port set feeding one or more input port sets.
//!
//! [`Circuit::connect`] builds every port, runs the descriptor handshake
//! through the endpoints' mailboxes, resolves one transfer template per
//! endpoint pair and precomputes the transfer plans. From then on:
//!
//! - advancing an output buffer queues it; queued buffers are delivered in
//!   rank order as soon as every input set's controller has room,
//! - releasing an input buffer clears it and writes "empty" into the shadow
//!   words of every output, then retries whatever was queued.
//!
//! Transfers complete synchronously, so a delivered output buffer is free
//! again as soon as [`Circuit::advance`] returns [`ProduceOutcome::Produced`].
//!
//! # Example
//!
//! ```rust
//! use conduit::circuit::{Circuit, CircuitId, CircuitSpec, PortSetSpec, ProduceOutcome};
//! use conduit::config::TransportConfig;
//! use conduit::transfer::TransportContext;
//!
//! # fn main() -> conduit::Result<()> {
//! let ctx = TransportContext::with_pio(TransportConfig::default());
//! let ep = ctx.allocate_endpoint("")?;
//! let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
//! let mut circuit = Circuit::connect(&ctx, CircuitId(0), &spec)?;
//!
//! let out = circuit.next_empty_output_buffer(0).unwrap();
//! circuit.output_buffer_mut(out)[..5].copy_from_slice(b"hello");
//! assert_eq!(circuit.advance(out, 5, 0)?, ProduceOutcome::Produced);
//!
//! let inp = circuit.next_full_input_buffer(0, 0).unwrap();
//! assert_eq!(circuit.input_buffer(inp), b"hello");
//! circuit.release(inp)?;
//! # Ok(())
//! # }
//! ```

mod controller;
mod plan;

pub use controller::{Lockstep, RoundRobin, Target, TransferController};
pub use plan::{PlanKey, PlanRole, PlanTable, TransferPlan};

use crate::descriptor::Descriptor;
use crate::error::{Error, Result};
use crate::observability;
use crate::port::{
    BROADCAST, BUFFER_EMPTY_FLAG, BufferMetaData, BufferState, Direction, END_OF_STREAM, MAX_BUFFERS,
    MAX_PORT_COUNT, Port, PortMetaData, QueuedBuffer,
};
use crate::transfer::{MailBox, RequestKind, TransferTemplate, TransportContext};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Identity of a circuit within its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CircuitId(pub usize);

impl fmt::Display for CircuitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "circuit-{}", self.0)
    }
}

/// How an input port set shares the output's buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    /// Every port receives every buffer.
    #[default]
    Whole,
    /// Each buffer goes to one port, in rank order.
    RoundRobin,
    /// Each buffer is split into one part per port.
    Partitioned,
}

/// Which port set of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSetId {
    /// The output set.
    Output,
    /// The n-th input set.
    Input(usize),
}

/// One port of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRef {
    /// Port set.
    pub set: PortSetId,
    /// Rank within the set.
    pub index: usize,
}

impl PortRef {
    /// Output port `rank`.
    pub fn output(rank: usize) -> Self {
        Self {
            set: PortSetId::Output,
            index: rank,
        }
    }

    /// Port `index` of input set `set`.
    pub fn input(set: usize, index: usize) -> Self {
        Self {
            set: PortSetId::Input(set),
            index,
        }
    }
}

/// A buffer handed out to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    /// Owning port.
    pub port: PortRef,
    /// Buffer index.
    pub tid: u32,
}

/// An input buffer whose payload an output buffer sends in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardedBuffer {
    /// Circuit owning the input buffer.
    pub circuit: CircuitId,
    /// The input buffer.
    pub handle: BufferHandle,
    /// Offset of its payload in the shared mapping.
    pub data_offset: u64,
    /// Identity of that mapping, see [`SharedRegion::id`](crate::memory::SharedRegion::id).
    pub region_id: usize,
}

/// Shape of one port set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSetSpec {
    /// Number of ports.
    pub ports: usize,
    /// Buffers per port.
    pub buffer_count: u32,
    /// Bytes per buffer.
    pub buffer_size: u32,
    /// Sharing of buffers among input ports (ignored for the output set).
    pub distribution: Distribution,
    /// Endpoint holding the set's memory.
    pub endpoint: String,
}

impl PortSetSpec {
    /// A single-port set.
    pub fn new(endpoint: impl Into<String>, buffer_count: u32, buffer_size: u32) -> Self {
        Self {
            ports: 1,
            buffer_count,
            buffer_size,
            distribution: Distribution::Whole,
            endpoint: endpoint.into(),
        }
    }

    /// Set the number of ports.
    pub fn with_ports(mut self, ports: usize) -> Self {
        self.ports = ports;
        self
    }

    /// Set the distribution.
    pub fn with_distribution(mut self, distribution: Distribution) -> Self {
        self.distribution = distribution;
        self
    }
}

/// Shape of a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitSpec {
    /// Output set.
    pub output: PortSetSpec,
    /// Input sets.
    pub inputs: Vec<PortSetSpec>,
}

impl CircuitSpec {
    /// A circuit with no input sets yet.
    pub fn new(output: PortSetSpec) -> Self {
        Self {
            output,
            inputs: Vec::new(),
        }
    }

    /// One output set to one input set.
    pub fn point_to_point(output: PortSetSpec, input: PortSetSpec) -> Self {
        Self::new(output).with_input(input)
    }

    /// Add an input set.
    pub fn with_input(mut self, input: PortSetSpec) -> Self {
        self.inputs.push(input);
        self
    }
}

/// The ports of one set.
#[derive(Debug)]
pub struct PortSet {
    ports: Vec<Port>,
    distribution: Distribution,
    first: usize,
}

impl PortSet {
    /// Ports in rank order.
    pub fn ports(&self) -> &[Port] {
        &self.ports
    }

    /// Number of ports.
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Returns true if the set has no ports.
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }

    /// Distribution.
    pub fn distribution(&self) -> Distribution {
        self.distribution
    }

    /// Index of the first port across all input sets of the circuit.
    pub fn first(&self) -> usize {
        self.first
    }
}

/// Result of advancing an output buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProduceOutcome {
    /// Delivered; the buffer is free again.
    Produced,
    /// Queued until a target buffer frees up.
    Blocked,
}

/// Per-circuit counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CircuitStats {
    /// Buffers delivered (broadcasts included).
    pub produced: u64,
    /// Broadcasts delivered.
    pub broadcasts: u64,
    /// Input buffers released.
    pub released: u64,
    /// Output buffers sent from a forwarded input buffer.
    pub forwarded: u64,
    /// Advances that had to queue.
    pub blocked: u64,
}

/// Templates held by a circuit, released on drop.
struct Services {
    ctx: Arc<TransportContext>,
    held: HashMap<(String, String), Arc<TransferTemplate>>,
}

impl Services {
    fn get(&mut self, src: &str, dst: &str) -> Result<Arc<TransferTemplate>> {
        let key = (src.to_string(), dst.to_string());
        if let Some(template) = self.held.get(&key) {
            return Ok(Arc::clone(template));
        }
        let template = self.ctx.get_service(src, dst)?;
        self.held.insert(key, Arc::clone(&template));
        Ok(template)
    }
}

impl Drop for Services {
    fn drop(&mut self) {
        for (src, dst) in self.held.keys() {
            self.ctx.release_service(src, dst);
        }
    }
}

fn exchange(ctx: &TransportContext, from: &Port, to: &mut Port) -> Result<()> {
    let mailbox = MailBox::for_resource(ctx, from.resource());
    let payload = from.descriptor().encode()?;
    mailbox.make_request(ctx, from.resource(), to.endpoint_id(), RequestKind::Descriptor, &payload)?;
    let message = MailBox::receive(to.resource(), mailbox.slot())?.ok_or_else(|| {
        Error::TransferFailed(format!("descriptor from {} was not delivered", from.endpoint_id()))
    })?;
    if message.kind != RequestKind::Descriptor {
        return Err(Error::DescriptorMismatch(format!(
            "expected a descriptor, got {:?}",
            message.kind
        )));
    }
    to.apply_peer_descriptor(Descriptor::decode(&message.payload)?)
}

fn check_sizes(output: &PortSetSpec, input: &PortSetSpec) -> Result<()> {
    let needed = match input.distribution {
        Distribution::Partitioned => output.buffer_size.div_ceil(input.ports.max(1) as u32),
        _ => output.buffer_size,
    };
    if needed > input.buffer_size {
        return Err(Error::DescriptorMismatch(format!(
            "output buffers of {} bytes need input buffers of {needed}, have {}",
            output.buffer_size, input.buffer_size
        )));
    }
    Ok(())
}

/// A connected output set and its input sets.
pub struct Circuit {
    id: CircuitId,
    output: PortSet,
    inputs: Vec<PortSet>,
    controllers: Vec<TransferController>,
    plans: Vec<PlanTable>,
    retired: Vec<ForwardedBuffer>,
    stats: CircuitStats,
    services: Services,
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("outputs", &self.output.len())
            .field("inputs", &self.inputs.iter().map(PortSet::len).collect::<Vec<_>>())
            .field("stats", &self.stats)
            .finish()
    }
}

impl Circuit {
    /// Create the ports of `spec`, exchange descriptors and resolve plans.
    ///
    /// # Errors
    ///
    /// Setup errors: [`Error::UnsupportedTopology`] for pairings no
    /// controller handles or sets beyond [`MAX_PORT_COUNT`],
    /// [`Error::DescriptorMismatch`] for incompatible buffer sizes, and any
    /// endpoint, allocation or transfer error from the handshake.
    pub fn connect(ctx: &Arc<TransportContext>, id: CircuitId, spec: &CircuitSpec) -> Result<Self> {
        let out_n = spec.output.ports;
        if out_n == 0 || out_n > MAX_PORT_COUNT {
            return Err(Error::UnsupportedTopology(format!(
                "{out_n} output ports (1..={MAX_PORT_COUNT})"
            )));
        }
        if spec.output.distribution == Distribution::Partitioned {
            return Err(Error::UnsupportedTopology("an output set cannot be partitioned".into()));
        }
        if spec.inputs.is_empty() || spec.inputs.len() > MAX_PORT_COUNT {
            return Err(Error::UnsupportedTopology(format!(
                "{} input sets (1..={MAX_PORT_COUNT})",
                spec.inputs.len()
            )));
        }
        let total: usize = spec.inputs.iter().map(|s| s.ports).sum();
        if total > MAX_PORT_COUNT {
            return Err(Error::UnsupportedTopology(format!(
                "{total} input ports exceed {MAX_PORT_COUNT}"
            )));
        }

        let mut controllers = Vec::with_capacity(spec.inputs.len());
        let mut first = 0;
        for set in &spec.inputs {
            controllers.push(TransferController::select(
                out_n,
                set.distribution,
                first,
                set.ports,
                set.buffer_count,
            )?);
            check_sizes(&spec.output, set)?;
            first += set.ports;
        }

        let out_res = ctx.resources(&spec.output.endpoint)?;
        let mut outputs = (0..out_n)
            .map(|rank| {
                let meta = PortMetaData {
                    ordinal: rank as u32,
                    direction: Direction::Output,
                    buffer_count: spec.output.buffer_count,
                    buffer_size: spec.output.buffer_size,
                    rank,
                    shadow_row: 0,
                    parts: 1,
                    endpoint: out_res.endpoint().id().to_string(),
                };
                Port::new(meta, Arc::clone(&out_res))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut inputs = Vec::with_capacity(spec.inputs.len());
        let mut first = 0;
        for set in &spec.inputs {
            let res = ctx.resources(&set.endpoint)?;
            let ports = (0..set.ports)
                .map(|rank| {
                    let meta = PortMetaData {
                        ordinal: (first + rank) as u32,
                        direction: Direction::Input,
                        buffer_count: set.buffer_count,
                        buffer_size: set.buffer_size,
                        rank,
                        shadow_row: first + rank,
                        parts: match set.distribution {
                            Distribution::Partitioned => set.ports as u32,
                            _ => 1,
                        },
                        endpoint: res.endpoint().id().to_string(),
                    };
                    Port::new(meta, Arc::clone(&res))
                })
                .collect::<Result<Vec<_>>>()?;
            inputs.push(PortSet {
                ports,
                distribution: set.distribution,
                first,
            });
            first += set.ports;
        }

        // Every port learns every peer, local or not.
        for o in &mut outputs {
            o.begin_handshake(total);
        }
        for p in inputs.iter_mut().flat_map(|s| s.ports.iter_mut()) {
            p.begin_handshake(out_n);
        }
        for o in &outputs {
            for p in inputs.iter_mut().flat_map(|s| s.ports.iter_mut()) {
                exchange(ctx, o, p)?;
            }
        }
        for p in inputs.iter().flat_map(|s| s.ports.iter()) {
            for o in &mut outputs {
                exchange(ctx, p, o)?;
            }
        }

        let mut services = Services {
            ctx: Arc::clone(ctx),
            held: HashMap::new(),
        };
        let mut plans = Vec::with_capacity(inputs.len());
        for set in &inputs {
            let mut table = PlanTable::new();
            for p in &set.ports {
                let g = p.meta().shadow_row;
                for o in &outputs {
                    let rank = o.meta().rank;
                    let d = o.peer(g as u64).ok_or_else(|| {
                        Error::DescriptorMismatch(format!("output {rank} has no descriptor for input {g}"))
                    })?;
                    let forward = services.get(o.endpoint_id(), &d.endpoint)?;
                    for ot in 0..o.buffer_count() {
                        for pt in 0..d.n_buffers {
                            let pt64 = u64::from(pt);
                            let flag_dst = d.full_flag_base
                                + pt64 * u64::from(d.full_flag_pitch)
                                + rank as u64 * u64::from(d.full_flag_size);
                            for broadcast in [false, true] {
                                table.insert(
                                    PlanKey::produce(rank, ot, g, pt, broadcast),
                                    TransferPlan {
                                        template: Arc::clone(&forward),
                                        data_src: o.data_offset(ot),
                                        data_dst: (!broadcast)
                                            .then(|| d.data_buffer_base + pt64 * u64::from(d.data_buffer_pitch)),
                                        capacity: d.data_buffer_size,
                                        metadata_dst: Some(d.metadata_base + pt64 * u64::from(d.metadata_pitch)),
                                        flag_dst,
                                        flag_value: BufferState::produced(ot).raw(),
                                    },
                                );
                            }
                        }
                    }

                    let od = p.peer(rank as u64).ok_or_else(|| {
                        Error::DescriptorMismatch(format!("input {g} has no descriptor for output {rank}"))
                    })?;
                    let back = services.get(p.endpoint_id(), &od.endpoint)?;
                    for pt in 0..p.buffer_count() {
                        let flag_dst = od.empty_flag_base
                            + ((g * MAX_BUFFERS) as u64 + u64::from(pt)) * u64::from(od.empty_flag_pitch);
                        table.insert(
                            PlanKey::release(g, pt, rank),
                            TransferPlan {
                                template: Arc::clone(&back),
                                data_src: 0,
                                data_dst: None,
                                capacity: 0,
                                metadata_dst: None,
                                flag_dst,
                                flag_value: BUFFER_EMPTY_FLAG,
                            },
                        );
                    }
                }
            }
            plans.push(table);
        }

        for port in outputs.iter_mut().chain(inputs.iter_mut().flat_map(|s| s.ports.iter_mut())) {
            port.finalize();
        }

        info!(
            circuit = %id,
            outputs = out_n,
            inputs = total,
            variants = ?controllers.iter().map(TransferController::variant).collect::<Vec<_>>(),
            templates = services.held.len(),
            "circuit connected"
        );

        Ok(Self {
            id,
            output: PortSet {
                ports: outputs,
                distribution: spec.output.distribution,
                first: 0,
            },
            inputs,
            controllers,
            plans,
            retired: Vec::new(),
            stats: CircuitStats::default(),
            services,
        })
    }

    /// Identity within the container.
    pub fn id(&self) -> CircuitId {
        self.id
    }

    /// The output set.
    pub fn output_set(&self) -> &PortSet {
        &self.output
    }

    /// The input sets.
    pub fn input_sets(&self) -> &[PortSet] {
        &self.inputs
    }

    /// One controller per input set.
    pub fn controllers(&self) -> &[TransferController] {
        &self.controllers
    }

    /// Counters.
    pub fn stats(&self) -> CircuitStats {
        self.stats
    }

    /// Number of distinct templates the circuit holds.
    pub fn template_count(&self) -> usize {
        self.services.held.len()
    }

    /// Look up a port.
    pub fn port(&self, port: PortRef) -> Option<&Port> {
        match port.set {
            PortSetId::Output => self.output.ports.get(port.index),
            PortSetId::Input(set) => self.inputs.get(set)?.ports.get(port.index),
        }
    }

    fn port_mut(&mut self, port: PortRef) -> &mut Port {
        let found = match port.set {
            PortSetId::Output => self.output.ports.get_mut(port.index),
            PortSetId::Input(set) => self.inputs.get_mut(set).and_then(|s| s.ports.get_mut(port.index)),
        };
        match found {
            Some(p) => p,
            None => panic!("{} has no port {port:?}", self.id),
        }
    }

    fn output_rank(&self, handle: BufferHandle) -> usize {
        match handle.port.set {
            PortSetId::Output if handle.port.index < self.output.len() => handle.port.index,
            _ => panic!("{handle:?} is not an output buffer of {}", self.id),
        }
    }

    fn input_of(&self, handle: BufferHandle) -> (usize, usize) {
        match handle.port.set {
            PortSetId::Input(set)
                if set < self.inputs.len() && handle.port.index < self.inputs[set].len() =>
            {
                (set, handle.port.index)
            }
            _ => panic!("{handle:?} is not an input buffer of {}", self.id),
        }
    }

    // ---- producer side ----

    /// True if output `rank` has a free buffer at its cursor.
    pub fn has_empty_output_buffer(&self, rank: usize) -> bool {
        self.output.ports.get(rank).is_some_and(Port::has_empty_output_buffer)
    }

    /// Take the free buffer at output `rank`'s cursor.
    pub fn next_empty_output_buffer(&mut self, rank: usize) -> Option<BufferHandle> {
        let tid = self.output.ports.get_mut(rank)?.next_empty_output_buffer()?;
        Some(BufferHandle {
            port: PortRef::output(rank),
            tid,
        })
    }

    /// Writable payload of a taken output buffer.
    pub fn output_buffer_mut(&mut self, handle: BufferHandle) -> &mut [u8] {
        self.output_rank(handle);
        self.port_mut(handle.port).data_mut(handle.tid)
    }

    /// Give back a taken output buffer without sending it.
    pub fn discard(&mut self, handle: BufferHandle) {
        self.output_rank(handle);
        self.port_mut(handle.port).discard(handle.tid);
    }

    /// Send a taken output buffer holding `len` bytes.
    ///
    /// # Errors
    ///
    /// Fails only if a transfer fails; running out of target buffers is
    /// [`ProduceOutcome::Blocked`].
    pub fn advance(&mut self, handle: BufferHandle, len: u32, opcode: u32) -> Result<ProduceOutcome> {
        self.advance_with(handle, len, opcode, 0, false)
    }

    /// Send a taken output buffer as end-of-stream to every input port.
    pub fn advance_end_of_stream(&mut self, handle: BufferHandle) -> Result<ProduceOutcome> {
        let rank = self.output_rank(handle);
        observability::trace_eos(self.id.0, rank);
        self.advance_with(handle, 0, 0, END_OF_STREAM | BROADCAST, true)
    }

    /// Take a buffer from output `rank` and send end-of-stream with it.
    ///
    /// Returns `None` if no output buffer is free.
    pub fn end_of_stream(&mut self, rank: usize) -> Result<Option<ProduceOutcome>> {
        match self.next_empty_output_buffer(rank) {
            Some(handle) => self.advance_end_of_stream(handle).map(Some),
            None => Ok(None),
        }
    }

    /// Send `source`'s payload out of the taken output buffer `handle`
    /// without copying it into the output buffer first.
    ///
    /// The caller has lent `source` and must pass it to
    /// [`release_forwarded`](Self::release_forwarded) once it comes back
    /// from [`dispatch`](Self::dispatch).
    ///
    /// # Panics
    ///
    /// Panics if `source` lives in another mapping than the output port, or
    /// if `len` exceeds the output buffer size.
    pub fn send_zero_copy(
        &mut self,
        handle: BufferHandle,
        source: ForwardedBuffer,
        len: u32,
        opcode: u32,
    ) -> Result<ProduceOutcome> {
        let rank = self.output_rank(handle);
        let port = &self.output.ports[rank];
        assert_eq!(
            source.region_id,
            port.region().id(),
            "{}: zero-copy source {:?} is not in the output port's mapping",
            self.id,
            source.handle
        );
        assert!(
            len <= port.buffer_size(),
            "{}: zero-copy length {len} exceeds the {}-byte output buffer",
            self.id,
            port.buffer_size()
        );
        self.port_mut(handle.port).set_forwarded(handle.tid, source);
        self.stats.forwarded += 1;
        observability::record_zero_copy(self.id.0);
        debug!(circuit = %self.id, rank, source = ?source.handle, len, "zero-copy forward");
        self.advance_with(handle, len, opcode, 0, false)
    }

    fn advance_with(
        &mut self,
        handle: BufferHandle,
        len: u32,
        opcode: u32,
        flags: u32,
        broadcast: bool,
    ) -> Result<ProduceOutcome> {
        let rank = self.output_rank(handle);
        self.output.ports[rank].advance(handle.tid, opcode, len, flags, broadcast);
        self.flush()?;
        if self.output.ports[rank].own_state(handle.tid).is_empty() {
            Ok(ProduceOutcome::Produced)
        } else {
            self.stats.blocked += 1;
            observability::record_produce_blocked(self.id.0);
            Ok(ProduceOutcome::Blocked)
        }
    }

    /// Deliver queued buffers, output by output in rank order, until
    /// nothing more can move. Returns true if anything was delivered.
    fn flush(&mut self) -> Result<bool> {
        let mut any = false;
        loop {
            let mut progress = false;
            for rank in 0..self.output.ports.len() {
                while let Some(queued) = self.output.ports[rank].front_queued() {
                    if !self.try_produce(rank, queued)? {
                        break;
                    }
                    self.output.ports[rank].pop_queued();
                    progress = true;
                }
            }
            if !progress {
                return Ok(any);
            }
            any = true;
        }
    }

    fn try_produce(&mut self, rank: usize, queued: QueuedBuffer) -> Result<bool> {
        let outputs = &self.output.ports;
        let ready = self.controllers.iter().all(|c| {
            if queued.broadcast {
                c.can_broadcast(outputs, rank)
            } else {
                c.can_produce(outputs, rank)
            }
        });
        if !ready {
            return Ok(false);
        }

        let tid = queued.tid;
        let port = &outputs[rank];
        let meta = port.read_metadata(tid);
        let src_base = port.forwarded(tid).map_or(port.data_offset(tid), |f| f.data_offset);
        let marker = BufferState::produced(tid);

        for (set, controller) in self.controllers.iter().enumerate() {
            let targets = if queued.broadcast {
                controller.broadcast_targets()
            } else {
                controller.targets(meta.length)
            };
            // Shadows first, in every output, so no rank can pick these buffers.
            for t in &targets {
                for o in outputs {
                    o.set_shadow(t.port, t.tid, marker);
                }
            }
            for t in &targets {
                let key = PlanKey::produce(rank, tid, t.port, t.tid, queued.broadcast);
                let plan = self.plans[set]
                    .get(&key)
                    .ok_or_else(|| Error::TransferFailed(format!("{} has no plan for {key:?}", self.id)))?;
                let part_meta = match t.part {
                    Some(part) => meta.with_part(part, t.len),
                    None => meta,
                };
                let mut request = plan.produce_request(src_base + u64::from(t.offset), t.len, &part_meta);
                request.post()?;
            }
        }

        for controller in &mut self.controllers {
            if queued.broadcast {
                controller.broadcasted(rank);
            } else {
                controller.produced(rank);
            }
        }

        let port = &mut self.output.ports[rank];
        port.set_own_state(tid, BufferState::EMPTY);
        if let Some(source) = port.take_forwarded(tid) {
            self.retired.push(source);
        }
        self.stats.produced += 1;
        if queued.broadcast {
            self.stats.broadcasts += 1;
        }
        observability::record_buffer_produced(self.id.0, u64::from(meta.length));
        observability::trace_buffer_produced(self.id.0, rank, tid, meta.length, meta.sequence);
        Ok(true)
    }

    // ---- consumer side ----

    /// True if port `index` of input set `set` has a full buffer at its cursor.
    pub fn has_full_input_buffer(&self, set: usize, index: usize) -> bool {
        self.inputs
            .get(set)
            .and_then(|s| s.ports.get(index))
            .is_some_and(Port::has_full_input_buffer)
    }

    /// Take the full buffer at the cursor of port `index` of input set `set`.
    pub fn next_full_input_buffer(&mut self, set: usize, index: usize) -> Option<BufferHandle> {
        let tid = self.inputs.get_mut(set)?.ports.get_mut(index)?.next_full_input_buffer()?;
        Some(BufferHandle {
            port: PortRef::input(set, index),
            tid,
        })
    }

    /// Metadata of a taken input buffer.
    pub fn input_metadata(&self, handle: BufferHandle) -> BufferMetaData {
        let (set, index) = self.input_of(handle);
        self.inputs[set].ports[index].read_metadata(handle.tid)
    }

    /// Payload of a taken input buffer.
    pub fn input_buffer(&self, handle: BufferHandle) -> &[u8] {
        let (set, index) = self.input_of(handle);
        let port = &self.inputs[set].ports[index];
        port.data(handle.tid, port.read_metadata(handle.tid).length as usize)
    }

    /// Hand a taken input buffer back to its producers.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not held or is lent to a zero-copy forward.
    pub fn release(&mut self, handle: BufferHandle) -> Result<()> {
        let (set, index) = self.input_of(handle);
        let g = self.inputs[set].first + index;
        self.inputs[set].ports[index].release(handle.tid);
        for rank in 0..self.output.ports.len() {
            let key = PlanKey::release(g, handle.tid, rank);
            let plan = self.plans[set]
                .get(&key)
                .ok_or_else(|| Error::TransferFailed(format!("{} has no plan for {key:?}", self.id)))?;
            plan.release_request().post()?;
        }
        self.stats.released += 1;
        observability::record_buffer_consumed(self.id.0);
        observability::trace_buffer_consumed(self.id.0, g, handle.tid);
        self.flush()?;
        Ok(())
    }

    /// Lend a taken input buffer to a zero-copy forward.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not held or is already lent.
    pub fn lend(&mut self, handle: BufferHandle) -> ForwardedBuffer {
        self.input_of(handle);
        let circuit = self.id;
        let port = self.port_mut(handle.port);
        port.lend(handle.tid);
        ForwardedBuffer {
            circuit,
            handle,
            data_offset: port.data_offset(handle.tid),
            region_id: port.region().id(),
        }
    }

    /// Release an input buffer whose forward has retired.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was not lent.
    pub fn release_forwarded(&mut self, handle: BufferHandle) -> Result<()> {
        self.input_of(handle);
        self.port_mut(handle.port).unlend(handle.tid);
        self.release(handle)
    }

    /// Retry queued buffers and collect forwards whose output has been
    /// delivered.
    pub fn dispatch(&mut self) -> Result<Vec<ForwardedBuffer>> {
        self.flush()?;
        Ok(std::mem::take(&mut self.retired))
    }

    /// Drop every queued zero-copy forward and return the lent buffers,
    /// delivered or not, so their circuits can release them before this
    /// one is torn down.
    pub fn take_forwards(&mut self) -> Vec<ForwardedBuffer> {
        let mut lent = std::mem::take(&mut self.retired);
        for port in &mut self.output.ports {
            for tid in 0..port.buffer_count() {
                lent.extend(port.take_forwarded(tid));
            }
        }
        lent
    }
}

impl Drop for Circuit {
    fn drop(&mut self) {
        debug!(circuit = %self.id, stats = ?self.stats, "circuit torn down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;

    fn context() -> (Arc<TransportContext>, String) {
        let ctx = TransportContext::with_pio(TransportConfig::default().with_smb_size(1 << 20));
        let ep = ctx.allocate_endpoint("").unwrap();
        (ctx, ep)
    }

    fn produce(c: &mut Circuit, rank: usize, byte: u8, len: u32) -> ProduceOutcome {
        let h = c.next_empty_output_buffer(rank).unwrap();
        c.output_buffer_mut(h)[..len as usize].fill(byte);
        c.advance(h, len, u32::from(byte)).unwrap()
    }

    #[test]
    fn test_point_to_point() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
        let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
        assert_eq!(c.controllers()[0].variant(), 1);
        assert!(c.port(PortRef::output(0)).unwrap().state().is_complete());

        assert_eq!(produce(&mut c, 0, 1, 8), ProduceOutcome::Produced);
        assert_eq!(produce(&mut c, 0, 2, 8), ProduceOutcome::Produced);
        // both input buffers full: third produce queues
        assert_eq!(produce(&mut c, 0, 3, 8), ProduceOutcome::Blocked);
        assert_eq!(c.stats().blocked, 1);

        let h = c.next_full_input_buffer(0, 0).unwrap();
        assert_eq!(c.input_buffer(h), &[1u8; 8]);
        assert_eq!(c.input_metadata(h).opcode, 1);
        c.release(h).unwrap();
        // release drained the queued buffer
        assert_eq!(c.stats().produced, 3);
        assert!(c.has_empty_output_buffer(0));
    }

    #[test]
    fn test_unsupported_topologies() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(
            PortSetSpec::new(&ep, 2, 64).with_ports(2),
            PortSetSpec::new(&ep, 2, 64).with_ports(2),
        );
        assert!(matches!(
            Circuit::connect(&ctx, CircuitId(0), &spec),
            Err(Error::UnsupportedTopology(_))
        ));

        let spec = CircuitSpec::new(PortSetSpec::new(&ep, 2, 64));
        assert!(Circuit::connect(&ctx, CircuitId(0), &spec).is_err());
    }

    #[test]
    fn test_size_mismatch() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 128), PortSetSpec::new(&ep, 2, 64));
        assert!(matches!(
            Circuit::connect(&ctx, CircuitId(0), &spec),
            Err(Error::DescriptorMismatch(_))
        ));

        // partitioned: 128 / 2 parts fits 64
        let spec = CircuitSpec::point_to_point(
            PortSetSpec::new(&ep, 2, 128),
            PortSetSpec::new(&ep, 2, 64)
                .with_ports(2)
                .with_distribution(Distribution::Partitioned),
        );
        assert!(Circuit::connect(&ctx, CircuitId(0), &spec).is_ok());
    }

    #[test]
    fn test_partitioned_parts() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(
            PortSetSpec::new(&ep, 2, 96),
            PortSetSpec::new(&ep, 2, 32)
                .with_ports(3)
                .with_distribution(Distribution::Partitioned),
        );
        let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
        let h = c.next_empty_output_buffer(0).unwrap();
        let buf = c.output_buffer_mut(h);
        for (i, b) in buf[..10].iter_mut().enumerate() {
            *b = i as u8;
        }
        assert_eq!(c.advance(h, 10, 0).unwrap(), ProduceOutcome::Produced);

        let mut joined = Vec::new();
        for port in 0..3 {
            let h = c.next_full_input_buffer(0, port).unwrap();
            let meta = c.input_metadata(h);
            assert_eq!(meta.part(), port as u16);
            joined.extend_from_slice(c.input_buffer(h));
            c.release(h).unwrap();
        }
        assert_eq!(joined, (0..10).collect::<Vec<u8>>());
    }

    #[test]
    fn test_end_of_stream_reaches_every_port() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(
            PortSetSpec::new(&ep, 2, 64),
            PortSetSpec::new(&ep, 2, 64)
                .with_ports(3)
                .with_distribution(Distribution::RoundRobin),
        );
        let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
        assert_eq!(produce(&mut c, 0, 9, 4), ProduceOutcome::Produced);
        assert_eq!(c.end_of_stream(0).unwrap(), Some(ProduceOutcome::Produced));

        let first = c.next_full_input_buffer(0, 0).unwrap();
        assert!(!c.input_metadata(first).is_end_of_stream());
        c.release(first).unwrap();
        for port in 0..3 {
            let h = c.next_full_input_buffer(0, port).unwrap();
            let meta = c.input_metadata(h);
            assert!(meta.is_end_of_stream() && meta.is_broadcast());
            assert!(c.input_buffer(h).is_empty());
            c.release(h).unwrap();
        }
        assert_eq!(c.stats().broadcasts, 1);
    }

    #[test]
    fn test_templates_released_on_drop() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
        let c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
        assert_eq!(c.template_count(), 1);
        assert_eq!(ctx.template_refs(&ep, &ep), 1);
        drop(c);
        assert_eq!(ctx.template_count(), 0);
    }

    #[test]
    fn test_zero_copy_forward() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
        let mut first = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
        let mut second = Circuit::connect(&ctx, CircuitId(1), &spec).unwrap();
        let (out, inp) = (PortRef::output(0), PortRef::input(0, 0));
        assert!(second.port(out).unwrap().supports_zero_copy(first.port(inp).unwrap()));

        produce(&mut first, 0, 7, 16);
        let held = first.next_full_input_buffer(0, 0).unwrap();
        let source = first.lend(held);
        let target = second.next_empty_output_buffer(0).unwrap();
        assert_eq!(second.send_zero_copy(target, source, 16, 3).unwrap(), ProduceOutcome::Produced);

        let got = second.next_full_input_buffer(0, 0).unwrap();
        assert_eq!(second.input_buffer(got), &[7u8; 16]);
        assert_eq!(second.input_metadata(got).opcode, 3);

        let retired = second.dispatch().unwrap();
        assert_eq!(retired, vec![source]);
        assert!(first.port(inp).unwrap().is_lent(held.tid));
        first.release_forwarded(held).unwrap();
        assert!(!first.port(inp).unwrap().is_in_use(held.tid));
        assert_eq!(second.stats().forwarded, 1);
    }

    #[test]
    #[should_panic(expected = "not in the output port's mapping")]
    fn test_zero_copy_across_mappings_panics() {
        let (ctx, a) = context();
        let b = ctx.allocate_endpoint("").unwrap();
        let on_a = CircuitSpec::point_to_point(PortSetSpec::new(&a, 2, 64), PortSetSpec::new(&a, 2, 64));
        let on_b = CircuitSpec::point_to_point(PortSetSpec::new(&b, 2, 64), PortSetSpec::new(&b, 2, 64));
        let mut first = Circuit::connect(&ctx, CircuitId(0), &on_a).unwrap();
        let mut second = Circuit::connect(&ctx, CircuitId(1), &on_b).unwrap();

        produce(&mut first, 0, 7, 16);
        let held = first.next_full_input_buffer(0, 0).unwrap();
        let source = first.lend(held);
        assert_ne!(source.region_id, second.port(PortRef::output(0)).unwrap().region().id());
        let target = second.next_empty_output_buffer(0).unwrap();
        let _ = second.send_zero_copy(target, source, 16, 0);
    }

    #[test]
    #[should_panic(expected = "exceeds the 32-byte output buffer")]
    fn test_zero_copy_oversize_panics() {
        let (ctx, ep) = context();
        let wide = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
        let narrow = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 32), PortSetSpec::new(&ep, 2, 32));
        let mut first = Circuit::connect(&ctx, CircuitId(0), &wide).unwrap();
        let mut second = Circuit::connect(&ctx, CircuitId(1), &narrow).unwrap();

        produce(&mut first, 0, 1, 48);
        let held = first.next_full_input_buffer(0, 0).unwrap();
        let source = first.lend(held);
        let target = second.next_empty_output_buffer(0).unwrap();
        let _ = second.send_zero_copy(target, source, 48, 0);
    }

    #[test]
    #[should_panic(expected = "released but not held")]
    fn test_double_release_panics() {
        let (ctx, ep) = context();
        let spec = CircuitSpec::point_to_point(PortSetSpec::new(&ep, 2, 64), PortSetSpec::new(&ep, 2, 64));
        let mut c = Circuit::connect(&ctx, CircuitId(0), &spec).unwrap();
        produce(&mut c, 0, 1, 1);
        let h = c.next_full_input_buffer(0, 0).unwrap();
        c.release(h).unwrap();
        let _ = c.release(h);
    }
}
