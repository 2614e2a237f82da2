//! Transfer requests built from a template.
//!
//! A request is an ordered list of sub-transfers against one or more
//! templates. Posting executes every data sub-transfer first and every flag
//! sub-transfer last, so a peer that observes a flag also observes the data
//! that preceded it.

use super::TransferTemplate;
use crate::error::{Error, Result};
use smallvec::SmallVec;
use std::sync::Arc;

/// Largest payload carried inline in a request.
pub const INLINE_MAX: usize = 16;

/// Completion state of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Every sub-transfer finished.
    Complete,
    /// A sub-transfer failed; the flags of the failing group were not written.
    Failed,
    /// Not posted yet, or still in flight.
    Pending,
}

/// One unit of work within a request.
///
/// Offsets are relative to the template's source and target regions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubTransfer {
    /// Copy `len` bytes from source to target.
    Copy {
        /// Offset in the source region.
        src: u64,
        /// Offset in the target region.
        dst: u64,
        /// Number of bytes.
        len: usize,
    },
    /// Write bytes carried in the request itself into the target.
    Inline {
        /// Offset in the target region.
        dst: u64,
        /// Payload (only the first `len` bytes are written).
        bytes: [u8; INLINE_MAX],
        /// Number of bytes.
        len: usize,
    },
    /// Copy a 4-byte flag word from source to target with Release ordering.
    Flag {
        /// Offset of the flag word in the source region.
        src: u64,
        /// Offset of the flag word in the target region.
        dst: u64,
    },
    /// Store a literal flag value into the target with Release ordering.
    WriteFlag {
        /// Offset of the flag word in the target region.
        dst: u64,
        /// Value to store.
        value: u32,
    },
}

impl SubTransfer {
    /// True for flag sub-transfers, which are always performed last.
    pub fn is_flag(&self) -> bool {
        matches!(self, SubTransfer::Flag { .. } | SubTransfer::WriteFlag { .. })
    }
}

struct RequestGroup {
    template: Arc<TransferTemplate>,
    transfers: SmallVec<[SubTransfer; 4]>,
}

/// A group of sub-transfers posted together.
pub struct TransferRequest {
    groups: SmallVec<[RequestGroup; 1]>,
    status: CompletionStatus,
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("groups", &self.groups.len())
            .field("transfers", &self.len())
            .field("status", &self.status)
            .finish()
    }
}

impl TransferRequest {
    pub(crate) fn new(template: Arc<TransferTemplate>) -> Self {
        let mut groups = SmallVec::new();
        groups.push(RequestGroup {
            template,
            transfers: SmallVec::new(),
        });
        Self {
            groups,
            status: CompletionStatus::Pending,
        }
    }

    fn push(&mut self, transfer: SubTransfer) -> &mut Self {
        if let Some(group) = self.groups.last_mut() {
            group.transfers.push(transfer);
        }
        self
    }

    /// Append a data copy.
    pub fn copy(&mut self, src: u64, dst: u64, len: usize) -> &mut Self {
        self.push(SubTransfer::Copy { src, dst, len })
    }

    /// Append an inline write of at most [`INLINE_MAX`] bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data` is longer than [`INLINE_MAX`].
    pub fn inline(&mut self, dst: u64, data: &[u8]) -> &mut Self {
        assert!(
            data.len() <= INLINE_MAX,
            "inline payload of {} bytes exceeds {INLINE_MAX}",
            data.len()
        );
        let mut bytes = [0u8; INLINE_MAX];
        bytes[..data.len()].copy_from_slice(data);
        self.push(SubTransfer::Inline {
            dst,
            bytes,
            len: data.len(),
        })
    }

    /// Append a flag-word copy.
    pub fn flag(&mut self, src: u64, dst: u64) -> &mut Self {
        self.push(SubTransfer::Flag { src, dst })
    }

    /// Append a literal flag store.
    pub fn write_flag(&mut self, dst: u64, value: u32) -> &mut Self {
        self.push(SubTransfer::WriteFlag { dst, value })
    }

    /// Merge another request into this one so both are posted as one group.
    pub fn group(&mut self, other: TransferRequest) -> &mut Self {
        self.groups.extend(other.groups);
        self
    }

    /// Total number of sub-transfers.
    pub fn len(&self) -> usize {
        self.groups.iter().map(|g| g.transfers.len()).sum()
    }

    /// True if the request carries no sub-transfers.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sub-transfers in insertion order.
    pub fn transfers(&self) -> impl Iterator<Item = &SubTransfer> {
        self.groups.iter().flat_map(|g| g.transfers.iter())
    }

    /// Re-point the source of the `index`-th sub-transfer (counted across groups).
    ///
    /// # Errors
    ///
    /// Fails if there is no such sub-transfer or it has no source.
    pub fn modify_source(&mut self, index: usize, new_src: u64) -> Result<()> {
        let transfer = self
            .groups
            .iter_mut()
            .flat_map(|g| g.transfers.iter_mut())
            .nth(index)
            .ok_or_else(|| Error::TransferFailed(format!("no sub-transfer {index}")))?;
        match transfer {
            SubTransfer::Copy { src, .. } | SubTransfer::Flag { src, .. } => {
                *src = new_src;
                Ok(())
            }
            _ => Err(Error::TransferFailed(format!(
                "sub-transfer {index} has no source"
            ))),
        }
    }

    /// Execute the request.
    ///
    /// Data sub-transfers of every group run first, in order; flag
    /// sub-transfers follow, in order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TransferFailed`] (and leaves the status `Failed`) if
    /// any sub-transfer fails. No flag is written once a data copy failed.
    pub fn post(&mut self) -> Result<CompletionStatus> {
        self.status = CompletionStatus::Pending;
        let result = self.execute(false).and_then(|_| self.execute(true));
        match result {
            Ok(()) => {
                self.status = CompletionStatus::Complete;
                Ok(self.status)
            }
            Err(e) => {
                self.status = CompletionStatus::Failed;
                Err(Error::TransferFailed(e.to_string()))
            }
        }
    }

    fn execute(&self, flags: bool) -> Result<()> {
        for group in &self.groups {
            let engine = group.template.engine();
            let src = group.template.source().region();
            let dst = group.template.target().region();
            for transfer in group.transfers.iter().filter(|t| t.is_flag() == flags) {
                engine.execute(src, dst, transfer)?;
            }
        }
        Ok(())
    }

    /// Current completion status.
    pub fn status(&self) -> CompletionStatus {
        self.status
    }
}
