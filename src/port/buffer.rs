//! Buffer memory layout and per-buffer bookkeeping.

use super::Direction;
use super::metadata::METADATA_SIZE;
use crate::circuit::ForwardedBuffer;
use crate::error::{Error, Result};
use crate::transfer::SharedMemoryResource;

/// Most ports in one port set, and most producers feeding one input.
pub const MAX_PORT_COUNT: usize = 16;

/// Most buffers per port.
pub const MAX_BUFFERS: usize = 32;

/// Alignment (and pitch granularity) of data buffers.
pub const DATA_ALIGN: u64 = 64;

const FLAG_SIZE: u64 = 4;

/// Where one port's buffers live inside its endpoint.
///
/// ```text
/// data      n x data_pitch            (pitch = size rounded up to 64)
/// metadata  n x 16
/// state     input:  n x MAX_PORT_COUNT words (one per producer rank)
///           output: n words (own full/empty)
/// shadow    output only: MAX_PORT_COUNT x MAX_BUFFERS words, row per remote input
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortLayout {
    /// Input or output.
    pub direction: Direction,
    /// Number of buffers.
    pub buffer_count: u32,
    /// Usable bytes per buffer.
    pub buffer_size: u32,
    /// Offset of buffer 0's data.
    pub data_base: u64,
    /// Distance between data buffers.
    pub data_pitch: u32,
    /// Offset of buffer 0's metadata.
    pub metadata_base: u64,
    /// Offset of buffer 0's state words.
    pub state_base: u64,
    /// Distance between consecutive buffers' state words.
    pub state_pitch: u32,
    /// Offset of the shadow array (outputs only).
    pub shadow_base: Option<u64>,
}

impl PortLayout {
    /// Carve a port's memory out of `resource`.
    ///
    /// # Errors
    ///
    /// Fails on a buffer count outside `1..=MAX_BUFFERS`, a zero buffer
    /// size, or an exhausted endpoint.
    pub fn allocate(
        resource: &SharedMemoryResource,
        direction: Direction,
        buffer_count: u32,
        buffer_size: u32,
    ) -> Result<Self> {
        if buffer_count == 0 || buffer_count as usize > MAX_BUFFERS {
            return Err(Error::InvalidConfig(format!(
                "buffer count {buffer_count} outside 1..={MAX_BUFFERS}"
            )));
        }
        if buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer size must be non-zero".into()));
        }
        let n = u64::from(buffer_count);
        let data_pitch = u64::from(buffer_size).div_ceil(DATA_ALIGN) * DATA_ALIGN;
        let data_pitch = u32::try_from(data_pitch)
            .map_err(|_| Error::InvalidConfig(format!("buffer size {buffer_size} too large")))?;

        let data_base = resource.alloc(n * u64::from(data_pitch), DATA_ALIGN)?;
        let metadata_base = resource.alloc(n * METADATA_SIZE as u64, 8)?;
        let state_pitch = match direction {
            Direction::Input => MAX_PORT_COUNT as u64 * FLAG_SIZE,
            Direction::Output => FLAG_SIZE,
        };
        let state_base = resource.alloc(n * state_pitch, 8)?;
        let shadow_base = match direction {
            Direction::Output => Some(resource.alloc(
                (MAX_PORT_COUNT * MAX_BUFFERS) as u64 * FLAG_SIZE,
                8,
            )?),
            Direction::Input => None,
        };

        Ok(Self {
            direction,
            buffer_count,
            buffer_size,
            data_base,
            data_pitch,
            metadata_base,
            state_base,
            state_pitch: state_pitch as u32,
            shadow_base,
        })
    }

    /// Offset of buffer `tid`'s data.
    #[inline]
    pub fn data(&self, tid: u32) -> u64 {
        debug_assert!(tid < self.buffer_count);
        self.data_base + u64::from(tid) * u64::from(self.data_pitch)
    }

    /// Offset of buffer `tid`'s metadata.
    #[inline]
    pub fn metadata(&self, tid: u32) -> u64 {
        debug_assert!(tid < self.buffer_count);
        self.metadata_base + u64::from(tid) * METADATA_SIZE as u64
    }

    /// Offset of buffer `tid`'s state word for producer slot `slot`.
    ///
    /// Output buffers have a single slot.
    #[inline]
    pub fn state(&self, tid: u32, slot: usize) -> u64 {
        debug_assert!(tid < self.buffer_count);
        debug_assert!(match self.direction {
            Direction::Input => slot < MAX_PORT_COUNT,
            Direction::Output => slot == 0,
        });
        self.state_base + u64::from(tid) * u64::from(self.state_pitch) + slot as u64 * FLAG_SIZE
    }

    /// Offset of the shadow word mirroring remote input `row`, buffer `tid`.
    ///
    /// # Panics
    ///
    /// Panics on an input layout.
    #[inline]
    pub fn shadow(&self, row: usize, tid: u32) -> u64 {
        let base = self
            .shadow_base
            .unwrap_or_else(|| panic!("input ports have no shadow state"));
        debug_assert!(row < MAX_PORT_COUNT && (tid as usize) < MAX_BUFFERS);
        base + ((row * MAX_BUFFERS) as u64 + u64::from(tid)) * FLAG_SIZE
    }

    /// Every state and shadow word offset of this port.
    pub fn flag_words(&self) -> Vec<u64> {
        let slots = match self.direction {
            Direction::Input => MAX_PORT_COUNT,
            Direction::Output => 1,
        };
        let mut words: Vec<u64> = (0..self.buffer_count)
            .flat_map(|tid| (0..slots).map(move |slot| (tid, slot)))
            .map(|(tid, slot)| self.state(tid, slot))
            .collect();
        if let Some(base) = self.shadow_base {
            words.extend((0..(MAX_PORT_COUNT * MAX_BUFFERS) as u64).map(|i| base + i * FLAG_SIZE));
        }
        words
    }
}

/// A buffer advanced by the worker and waiting for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedBuffer {
    /// Output buffer index.
    pub tid: u32,
    /// Send to every input port instead of the next target.
    pub broadcast: bool,
}

/// Local bookkeeping for one buffer slot.
#[derive(Debug, Default)]
pub(crate) struct BufferRecord {
    /// Handed out to the worker and not yet advanced/released.
    pub in_use: bool,
    /// Input only: forwarded zero-copy; released when the forward retires.
    pub lent: bool,
    /// Output only: the payload lives in this input buffer instead.
    pub forwarded: Option<ForwardedBuffer>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{Endpoint, EndpointUri};
    use crate::memory::{HeapSegment, SharedRegion};
    use std::sync::Arc;

    fn resource() -> SharedMemoryResource {
        let uri = EndpointUri::new("ocpi-smb-pio", "layout", 1 << 16, 1, 20).unwrap();
        let region = SharedRegion::new(HeapSegment::new(1 << 16).unwrap());
        SharedMemoryResource::new(Arc::new(Endpoint::new(uri, region, true).unwrap())).unwrap()
    }

    #[test]
    fn test_output_layout() {
        let res = resource();
        let l = PortLayout::allocate(&res, Direction::Output, 4, 100).unwrap();
        assert_eq!(l.data_pitch, 128);
        assert_eq!(l.data_base % DATA_ALIGN, 0);
        assert_eq!(l.data(2), l.data_base + 256);
        assert_eq!(l.metadata(3), l.metadata_base + 48);
        assert_eq!(l.state(1, 0), l.state_base + 4);
        let shadow = l.shadow_base.unwrap();
        assert_eq!(l.shadow(1, 2), shadow + (32 + 2) * 4);
        assert_eq!(l.flag_words().len(), 4 + MAX_PORT_COUNT * MAX_BUFFERS);
    }

    #[test]
    fn test_input_layout() {
        let res = resource();
        let l = PortLayout::allocate(&res, Direction::Input, 2, 64).unwrap();
        assert_eq!(l.data_pitch, 64);
        assert_eq!(l.state_pitch, 64);
        assert_eq!(l.state(1, 3), l.state_base + 64 + 12);
        assert!(l.shadow_base.is_none());
        assert_eq!(l.flag_words().len(), 2 * MAX_PORT_COUNT);
    }

    #[test]
    #[should_panic(expected = "no shadow")]
    fn test_input_has_no_shadow() {
        let res = resource();
        let l = PortLayout::allocate(&res, Direction::Input, 2, 64).unwrap();
        l.shadow(0, 0);
    }

    #[test]
    fn test_bad_counts() {
        let res = resource();
        assert!(PortLayout::allocate(&res, Direction::Input, 0, 64).is_err());
        assert!(PortLayout::allocate(&res, Direction::Input, 33, 64).is_err());
        assert!(PortLayout::allocate(&res, Direction::Input, 2, 0).is_err());
        assert!(PortLayout::allocate(&res, Direction::Input, 32, 1 << 20).is_err());
    }
}
