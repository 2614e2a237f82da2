//! Per-buffer and per-port metadata.

/// Size of an encoded [`BufferMetaData`] record.
pub const METADATA_SIZE: usize = 16;

/// Flag: last buffer of the stream.
pub const END_OF_STREAM: u32 = 1 << 0;
/// Flag: sent to every input port of the set.
pub const BROADCAST: u32 = 1 << 1;

const PART_SHIFT: u32 = 16;
const FLAG_MASK: u32 = (1 << PART_SHIFT) - 1;

/// Metadata travelling with each buffer.
///
/// Stored little-endian as four `u32`s: opcode, length, sequence, flags.
/// The upper 16 bits of `flags` carry the part index of a partitioned buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferMetaData {
    /// Application-defined message opcode.
    pub opcode: u32,
    /// Payload length in bytes.
    pub length: u32,
    /// Per-port sequence number assigned by the producer.
    pub sequence: u32,
    /// [`END_OF_STREAM`], [`BROADCAST`] and the part index.
    pub flags: u32,
}

impl BufferMetaData {
    /// Metadata for a payload.
    pub fn new(opcode: u32, length: u32) -> Self {
        Self {
            opcode,
            length,
            ..Self::default()
        }
    }

    /// Encode to the shared-memory form.
    pub fn encode(&self) -> [u8; METADATA_SIZE] {
        let mut out = [0u8; METADATA_SIZE];
        out[0..4].copy_from_slice(&self.opcode.to_le_bytes());
        out[4..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        out[12..16].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Decode the shared-memory form.
    pub fn decode(raw: &[u8; METADATA_SIZE]) -> Self {
        let word = |i: usize| u32::from_le_bytes([raw[i], raw[i + 1], raw[i + 2], raw[i + 3]]);
        Self {
            opcode: word(0),
            length: word(4),
            sequence: word(8),
            flags: word(12),
        }
    }

    /// True if the buffer ends the stream.
    pub fn is_end_of_stream(&self) -> bool {
        self.flags & END_OF_STREAM != 0
    }

    /// True if the buffer was broadcast.
    pub fn is_broadcast(&self) -> bool {
        self.flags & BROADCAST != 0
    }

    /// Part index of a partitioned buffer (0 otherwise).
    pub fn part(&self) -> u16 {
        (self.flags >> PART_SHIFT) as u16
    }

    /// Copy with a part index and length.
    pub fn with_part(mut self, part: u16, length: u32) -> Self {
        self.flags = (self.flags & FLAG_MASK) | (u32::from(part) << PART_SHIFT);
        self.length = length;
        self
    }
}

/// Direction of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Consumes buffers.
    Input,
    /// Produces buffers.
    Output,
}

/// Static description of one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMetaData {
    /// Ordinal of the port within its worker, advertised in descriptors.
    pub ordinal: u32,
    /// Input or output.
    pub direction: Direction,
    /// Number of buffers.
    pub buffer_count: u32,
    /// Usable bytes per buffer.
    pub buffer_size: u32,
    /// Position within its port set (round-robin order).
    pub rank: usize,
    /// Row of this input port in the producers' shadow arrays.
    pub shadow_row: usize,
    /// Parts each produced buffer is split into for this input (1 unless
    /// the input set is partitioned).
    pub parts: u32,
    /// Endpoint holding the port's memory.
    pub endpoint: String,
}

impl PortMetaData {
    /// Cookie advertised in this port's descriptor: rank for outputs,
    /// shadow row for inputs.
    pub fn cookie(&self) -> u64 {
        match self.direction {
            Direction::Output => self.rank as u64,
            Direction::Input => self.shadow_row as u64,
        }
    }
}
