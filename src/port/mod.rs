//! Ports and their buffers.
//!
//! A [`Port`] owns a fixed array of buffers carved out of one endpoint. It
//! knows its own flag words and, for outputs, the shadow words mirroring
//! every remote input buffer. It does not move data itself: the circuit's
//! transfer controller decides where a produced buffer goes and posts the
//! transfers.
//!
//! # Ownership
//!
//! An output buffer whose own state word is empty belongs to the producer.
//! Advancing it sets the word to a produced marker until the controller has
//! delivered it. An input buffer belongs to the consumer while any of its
//! fan-in slots is non-empty; releasing it clears every slot and tells the
//! producers, through their shadow words, that it is free again.
//!
//! Taking, advancing or releasing a buffer before the port's handshake has
//! completed is a programming error and panics.

mod buffer;
mod handshake;
mod metadata;
mod state;

pub use buffer::{DATA_ALIGN, MAX_BUFFERS, MAX_PORT_COUNT, PortLayout, QueuedBuffer};
use buffer::BufferRecord;
pub use handshake::PortState;
pub use metadata::{BROADCAST, BufferMetaData, Direction, END_OF_STREAM, METADATA_SIZE, PortMetaData};
pub use state::{BUFFER_EMPTY_FLAG, BufferState, FULL_MARKER, fan_in_full};

use crate::circuit::ForwardedBuffer;
use crate::descriptor::{Descriptor, DescriptorRole, DescriptorType, OPTION_PARTS_MASK};
use crate::error::Result;
use crate::memory::SharedRegion;
use crate::transfer::SharedMemoryResource;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tracing::trace;

/// One worker connection point and its buffers.
#[derive(Debug)]
pub struct Port {
    meta: PortMetaData,
    resource: Arc<SharedMemoryResource>,
    layout: PortLayout,
    state: PortState,
    peers: BTreeMap<u64, Descriptor>,
    expected_peers: usize,
    cursor: u32,
    buffers: Vec<BufferRecord>,
    sequence: u32,
    queued: VecDeque<QueuedBuffer>,
}

impl Port {
    /// Create a port, allocating its buffers from `resource`.
    ///
    /// # Errors
    ///
    /// Fails if the buffer geometry is invalid or the endpoint is full.
    pub fn new(meta: PortMetaData, resource: Arc<SharedMemoryResource>) -> Result<Self> {
        let layout = PortLayout::allocate(&resource, meta.direction, meta.buffer_count, meta.buffer_size)?;
        let buffers = (0..meta.buffer_count).map(|_| BufferRecord::default()).collect();
        trace!(
            ordinal = meta.ordinal,
            direction = ?meta.direction,
            endpoint = %meta.endpoint,
            data_base = layout.data_base,
            "port allocated"
        );
        Ok(Self {
            meta,
            resource,
            layout,
            state: PortState::NotExternal,
            peers: BTreeMap::new(),
            expected_peers: 0,
            cursor: 0,
            buffers,
            sequence: 0,
            queued: VecDeque::new(),
        })
    }

    /// Static description.
    pub fn meta(&self) -> &PortMetaData {
        &self.meta
    }

    /// Memory layout.
    pub fn layout(&self) -> &PortLayout {
        &self.layout
    }

    /// Handshake state.
    pub fn state(&self) -> PortState {
        self.state
    }

    /// Input or output.
    pub fn direction(&self) -> Direction {
        self.meta.direction
    }

    /// Number of buffers.
    pub fn buffer_count(&self) -> u32 {
        self.meta.buffer_count
    }

    /// Usable bytes per buffer.
    pub fn buffer_size(&self) -> u32 {
        self.meta.buffer_size
    }

    /// Endpoint holding this port's memory.
    pub fn endpoint_id(&self) -> &str {
        self.resource.endpoint().id()
    }

    /// The endpoint resource.
    pub fn resource(&self) -> &Arc<SharedMemoryResource> {
        &self.resource
    }

    /// The endpoint's memory.
    pub fn region(&self) -> &SharedRegion {
        self.resource.region()
    }

    /// Index of the next buffer to hand out.
    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    /// This port's flow-control descriptor.
    pub fn descriptor(&self) -> Descriptor {
        let l = &self.layout;
        let (kind, empty_base, empty_pitch) = match self.meta.direction {
            Direction::Output => (
                DescriptorType::Producer,
                l.shadow_base.unwrap_or(l.state_base),
                4,
            ),
            Direction::Input => (DescriptorType::ConsumerFlowControl, l.state_base, l.state_pitch),
        };
        let options = match self.meta.direction {
            Direction::Output => 0,
            Direction::Input => self.meta.parts & OPTION_PARTS_MASK,
        };
        Descriptor {
            kind,
            role: DescriptorRole::ActiveMessage,
            options,
            n_buffers: l.buffer_count,
            data_buffer_base: l.data_base,
            data_buffer_pitch: l.data_pitch,
            data_buffer_size: l.buffer_size,
            metadata_base: l.metadata_base,
            metadata_pitch: METADATA_SIZE as u32,
            full_flag_base: l.state_base,
            full_flag_size: 4,
            full_flag_pitch: l.state_pitch,
            full_flag_value: u64::from(FULL_MARKER),
            empty_flag_base: empty_base,
            empty_flag_size: 4,
            empty_flag_pitch: empty_pitch,
            empty_flag_value: u64::from(BUFFER_EMPTY_FLAG),
            port_id: u64::from(self.meta.ordinal),
            endpoint: self.meta.endpoint.clone(),
            cookie: self.meta.cookie(),
        }
    }

    /// Start the handshake, expecting descriptors from `expected_peers` peers.
    ///
    /// # Panics
    ///
    /// Panics if the handshake already started or `expected_peers` is zero.
    pub fn begin_handshake(&mut self, expected_peers: usize) {
        assert_eq!(
            self.state,
            PortState::NotExternal,
            "handshake started twice on port {}",
            self.meta.ordinal
        );
        assert!(expected_peers > 0, "a connected port needs at least one peer");
        self.expected_peers = expected_peers;
        self.state = PortState::WaitingForUpdate;
    }

    /// Record a peer's descriptor.
    ///
    /// Once every expected peer has been applied the port moves to
    /// [`PortState::WaitingForShadowBuffer`].
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::DescriptorMismatch`] if the peer cannot be
    /// paired with this port.
    ///
    /// # Panics
    ///
    /// Panics if the port is not waiting for descriptors.
    pub fn apply_peer_descriptor(&mut self, peer: Descriptor) -> Result<()> {
        assert_eq!(
            self.state,
            PortState::WaitingForUpdate,
            "peer descriptor applied to port {} in state {}",
            self.meta.ordinal,
            self.state
        );
        peer.validate_against(&self.descriptor())?;
        trace!(ordinal = self.meta.ordinal, peer = peer.cookie, endpoint = %peer.endpoint, "peer descriptor applied");
        self.peers.insert(peer.cookie, peer);
        if self.peers.len() == self.expected_peers {
            self.state = PortState::WaitingForShadowBuffer;
        }
        Ok(())
    }

    /// Complete the handshake once transfer plans are in place.
    ///
    /// # Panics
    ///
    /// Panics unless every peer descriptor has been applied.
    pub fn finalize(&mut self) {
        assert_eq!(
            self.state,
            PortState::WaitingForShadowBuffer,
            "port {} finalized in state {}",
            self.meta.ordinal,
            self.state
        );
        self.state = PortState::DefinitionComplete;
    }

    /// Descriptor of the peer with the given cookie.
    pub fn peer(&self, cookie: u64) -> Option<&Descriptor> {
        self.peers.get(&cookie)
    }

    /// All peer descriptors, ordered by cookie.
    pub fn peers(&self) -> impl Iterator<Item = &Descriptor> {
        self.peers.values()
    }

    fn assert_complete(&self) {
        assert!(
            self.state.is_complete(),
            "port {} used before its handshake completed (state {})",
            self.meta.ordinal,
            self.state
        );
    }

    fn assert_direction(&self, direction: Direction) {
        assert_eq!(
            self.meta.direction, direction,
            "{:?} operation on {:?} port {}",
            direction, self.meta.direction, self.meta.ordinal
        );
    }

    fn load(&self, offset: u64) -> BufferState {
        match self.region().load_flag(offset) {
            Ok(raw) => BufferState::from_raw(raw),
            Err(e) => panic!("port {} flag word unreadable: {e}", self.meta.ordinal),
        }
    }

    fn store(&self, offset: u64, state: BufferState) {
        if let Err(e) = self.region().store_flag(offset, state.raw()) {
            panic!("port {} flag word unwritable: {e}", self.meta.ordinal);
        }
    }

    fn record(&self, tid: u32) -> &BufferRecord {
        &self.buffers[tid as usize]
    }

    fn record_mut(&mut self, tid: u32) -> &mut BufferRecord {
        &mut self.buffers[tid as usize]
    }

    fn step_cursor(&mut self) -> u32 {
        let tid = self.cursor;
        self.cursor = (self.cursor + 1) % self.meta.buffer_count;
        tid
    }

    // ---- output side ----

    /// Own state word of output buffer `tid`.
    pub fn own_state(&self, tid: u32) -> BufferState {
        self.load(self.layout.state(tid, 0))
    }

    pub(crate) fn set_own_state(&self, tid: u32, state: BufferState) {
        self.store(self.layout.state(tid, 0), state);
    }

    /// This output's view of remote input buffer (`row`, `tid`).
    pub fn shadow_state(&self, row: usize, tid: u32) -> BufferState {
        self.load(self.layout.shadow(row, tid))
    }

    pub(crate) fn set_shadow(&self, row: usize, tid: u32, state: BufferState) {
        self.store(self.layout.shadow(row, tid), state);
    }

    /// True if the buffer at the cursor is free for the producer.
    pub fn has_empty_output_buffer(&self) -> bool {
        self.assert_complete();
        self.assert_direction(Direction::Output);
        let tid = self.cursor;
        !self.record(tid).in_use && self.own_state(tid).is_empty()
    }

    /// Hand out the buffer at the cursor, if it is free.
    pub fn next_empty_output_buffer(&mut self) -> Option<u32> {
        if !self.has_empty_output_buffer() {
            return None;
        }
        let tid = self.step_cursor();
        self.record_mut(tid).in_use = true;
        Some(tid)
    }

    /// Mark output buffer `tid` produced and queue it for delivery.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was not handed out, or `length` exceeds the
    /// buffer size.
    pub fn advance(&mut self, tid: u32, opcode: u32, length: u32, flags: u32, broadcast: bool) -> BufferMetaData {
        self.assert_complete();
        self.assert_direction(Direction::Output);
        assert!(
            self.record(tid).in_use,
            "output buffer {tid} of port {} advanced without being taken",
            self.meta.ordinal
        );
        assert!(
            length <= self.meta.buffer_size,
            "length {length} exceeds buffer size {}",
            self.meta.buffer_size
        );
        let meta = BufferMetaData {
            opcode,
            length,
            sequence: self.sequence,
            flags,
        };
        self.sequence = self.sequence.wrapping_add(1);
        self.write_metadata(tid, &meta);
        self.record_mut(tid).in_use = false;
        self.set_own_state(tid, BufferState::produced(tid));
        self.queued.push_back(QueuedBuffer { tid, broadcast });
        meta
    }

    /// Return a taken output buffer without sending it.
    ///
    /// # Panics
    ///
    /// Panics if the buffer was not handed out.
    pub fn discard(&mut self, tid: u32) {
        self.assert_direction(Direction::Output);
        let ordinal = self.meta.ordinal;
        let record = self.record_mut(tid);
        assert!(record.in_use, "output buffer {tid} of port {ordinal} discarded without being taken");
        record.in_use = false;
        record.forwarded = None;
    }

    /// Oldest advanced buffer not yet delivered.
    pub fn front_queued(&self) -> Option<QueuedBuffer> {
        self.queued.front().copied()
    }

    pub(crate) fn pop_queued(&mut self) -> Option<QueuedBuffer> {
        self.queued.pop_front()
    }

    /// Number of advanced buffers waiting for delivery.
    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    // ---- input side ----

    /// Fan-in slot `slot` of input buffer `tid`.
    pub fn input_slot(&self, tid: u32, slot: usize) -> BufferState {
        self.load(self.layout.state(tid, slot))
    }

    /// True if any producer's slot of input buffer `tid` is non-empty.
    pub fn is_input_full(&self, tid: u32) -> bool {
        fan_in_full((0..MAX_PORT_COUNT).map(|slot| self.input_slot(tid, slot)))
    }

    /// True if the buffer at the cursor holds data for the consumer.
    pub fn has_full_input_buffer(&self) -> bool {
        self.assert_complete();
        self.assert_direction(Direction::Input);
        let tid = self.cursor;
        !self.record(tid).in_use && self.is_input_full(tid)
    }

    /// Hand out the buffer at the cursor, if it is full.
    pub fn next_full_input_buffer(&mut self) -> Option<u32> {
        if !self.has_full_input_buffer() {
            return None;
        }
        let tid = self.step_cursor();
        self.record_mut(tid).in_use = true;
        Some(tid)
    }

    /// Empty input buffer `tid` locally.
    ///
    /// Notifying the producers is the circuit's job.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is not held by the consumer or is lent to a
    /// zero-copy forward.
    pub fn release(&mut self, tid: u32) {
        self.assert_complete();
        self.assert_direction(Direction::Input);
        let record = self.record(tid);
        assert!(
            record.in_use,
            "input buffer {tid} of port {} released but not held",
            self.meta.ordinal
        );
        assert!(
            !record.lent,
            "input buffer {tid} of port {} released while forwarded",
            self.meta.ordinal
        );
        for slot in 0..MAX_PORT_COUNT {
            self.store(self.layout.state(tid, slot), BufferState::EMPTY);
        }
        self.record_mut(tid).in_use = false;
    }

    /// True if input buffer `tid` is lent to a zero-copy forward.
    pub fn is_lent(&self, tid: u32) -> bool {
        self.record(tid).lent
    }

    pub(crate) fn lend(&mut self, tid: u32) {
        let ordinal = self.meta.ordinal;
        let record = self.record_mut(tid);
        assert!(record.in_use, "input buffer {tid} of port {ordinal} forwarded but not held");
        assert!(!record.lent, "input buffer {tid} of port {ordinal} forwarded twice");
        record.lent = true;
    }

    pub(crate) fn unlend(&mut self, tid: u32) {
        let ordinal = self.meta.ordinal;
        let record = self.record_mut(tid);
        assert!(record.lent, "input buffer {tid} of port {ordinal} retired but not forwarded");
        record.lent = false;
    }

    pub(crate) fn forwarded(&self, tid: u32) -> Option<ForwardedBuffer> {
        self.record(tid).forwarded
    }

    pub(crate) fn set_forwarded(&mut self, tid: u32, source: ForwardedBuffer) {
        self.record_mut(tid).forwarded = Some(source);
    }

    pub(crate) fn take_forwarded(&mut self, tid: u32) -> Option<ForwardedBuffer> {
        self.record_mut(tid).forwarded.take()
    }

    /// True if buffer `tid` is handed out.
    pub fn is_in_use(&self, tid: u32) -> bool {
        self.record(tid).in_use
    }

    // ---- both ----

    /// Offset of buffer `tid`'s data in the port's region.
    pub fn data_offset(&self, tid: u32) -> u64 {
        self.layout.data(tid)
    }

    /// Metadata of buffer `tid`.
    pub fn read_metadata(&self, tid: u32) -> BufferMetaData {
        let mut raw = [0u8; METADATA_SIZE];
        if let Err(e) = self.region().read(self.layout.metadata(tid), &mut raw) {
            panic!("port {} metadata unreadable: {e}", self.meta.ordinal);
        }
        BufferMetaData::decode(&raw)
    }

    pub(crate) fn write_metadata(&self, tid: u32, meta: &BufferMetaData) {
        if let Err(e) = self.region().write(self.layout.metadata(tid), &meta.encode()) {
            panic!("port {} metadata unwritable: {e}", self.meta.ordinal);
        }
    }

    /// Payload of buffer `tid`, up to `len` bytes.
    pub fn data(&self, tid: u32, len: usize) -> &[u8] {
        let len = len.min(self.meta.buffer_size as usize);
        match self.region().slice(self.layout.data(tid), len) {
            Ok(bytes) => bytes,
            Err(e) => panic!("port {} buffer {tid} unreadable: {e}", self.meta.ordinal),
        }
    }

    /// Writable payload of output buffer `tid`.
    ///
    /// # Panics
    ///
    /// Panics unless the buffer is handed out to the producer.
    pub fn data_mut(&mut self, tid: u32) -> &mut [u8] {
        self.assert_direction(Direction::Output);
        assert!(self.record(tid).in_use, "output buffer {tid} written without being taken");
        let size = self.meta.buffer_size as usize;
        // SAFETY: the producer owns an in-use output buffer and `&mut self`
        // keeps any other view of this port's data alive borrows out.
        match unsafe { self.region().slice_mut(self.layout.data(tid), size) } {
            Ok(bytes) => bytes,
            Err(e) => panic!("port {} buffer {tid} unwritable: {e}", self.meta.ordinal),
        }
    }

    /// True if `other`'s buffers share this port's address space.
    pub fn supports_zero_copy(&self, other: &Port) -> bool {
        self.region().same_mapping(other.region())
    }

    /// Mark every local buffer empty and rewind the cursor.
    ///
    /// The handshake state and peer descriptors are kept.
    pub fn reset(&mut self) {
        for word in self.layout.flag_words() {
            self.store(word, BufferState::EMPTY);
        }
        for record in &mut self.buffers {
            *record = BufferRecord::default();
        }
        self.cursor = 0;
        self.sequence = 0;
        self.queued.clear();
    }
}
