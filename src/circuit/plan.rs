//! Precomputed transfer plans.
//!
//! Every (source buffer, target buffer) pairing a circuit can use is
//! resolved once at connect time into a [`TransferPlan`]: the template to
//! use and the offsets to write. Producing or releasing a buffer is then a
//! map lookup plus a request build.

use crate::port::{BufferMetaData, METADATA_SIZE};
use crate::transfer::{TransferRequest, TransferTemplate};
use std::collections::HashMap;
use std::sync::Arc;

/// Whether a plan delivers a buffer or hands one back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlanRole {
    /// Output buffer to input buffer: data, metadata, full flag.
    Produce,
    /// Input buffer back to an output's shadow: empty flag.
    Release,
}

/// Lookup key of a plan.
///
/// For produce plans the source is an output port (by rank) and the target
/// an input port (by its index across all input sets). Release plans are
/// keyed the other way round, with a target tid of zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlanKey {
    /// Source port index.
    pub source_port: usize,
    /// Source buffer.
    pub source_tid: u32,
    /// Target port index.
    pub target_port: usize,
    /// Target buffer.
    pub target_tid: u32,
    /// Broadcast (metadata only) delivery.
    pub broadcast: bool,
    /// Produce or release.
    pub role: PlanRole,
}

impl PlanKey {
    /// Key of a produce plan.
    pub fn produce(source_port: usize, source_tid: u32, target_port: usize, target_tid: u32, broadcast: bool) -> Self {
        Self {
            source_port,
            source_tid,
            target_port,
            target_tid,
            broadcast,
            role: PlanRole::Produce,
        }
    }

    /// Key of a release plan from input `port` buffer `tid` to output `output`.
    pub fn release(port: usize, tid: u32, output: usize) -> Self {
        Self {
            source_port: port,
            source_tid: tid,
            target_port: output,
            target_tid: 0,
            broadcast: false,
            role: PlanRole::Release,
        }
    }
}

/// A resolved transfer between two buffers.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Template for the endpoint pair.
    pub template: Arc<TransferTemplate>,
    /// Data source offset in the source region.
    pub data_src: u64,
    /// Data destination offset; `None` for broadcasts and releases.
    pub data_dst: Option<u64>,
    /// Bytes the destination can take.
    pub capacity: u32,
    /// Metadata destination offset.
    pub metadata_dst: Option<u64>,
    /// Flag word written last.
    pub flag_dst: u64,
    /// Value written to the flag word.
    pub flag_value: u32,
}

impl TransferPlan {
    /// Request delivering `len` bytes at `src` plus `meta`, then the flag.
    ///
    /// `len` never exceeds the destination capacity: the port bounds it by
    /// its buffer size and the handshake rejects consumers smaller than that.
    /// Debug builds assert it.
    pub fn produce_request(&self, src: u64, len: u32, meta: &BufferMetaData) -> TransferRequest {
        let mut request = self.template.request();
        if let Some(dst) = self.data_dst {
            debug_assert!(
                len <= self.capacity,
                "{len} bytes do not fit a {}-byte buffer",
                self.capacity
            );
            if len > 0 {
                request.copy(src, dst, len as usize);
            }
        }
        if let Some(dst) = self.metadata_dst {
            let raw: [u8; METADATA_SIZE] = meta.encode();
            request.inline(dst, &raw);
        }
        request.write_flag(self.flag_dst, self.flag_value);
        request
    }

    /// Request writing only the flag.
    pub fn release_request(&self) -> TransferRequest {
        let mut request = self.template.request();
        request.write_flag(self.flag_dst, self.flag_value);
        request
    }
}

/// All plans of one input set, keyed flat.
pub type PlanTable = HashMap<PlanKey, TransferPlan>;
