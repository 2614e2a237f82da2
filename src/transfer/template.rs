//! Transfer templates and the engines that execute them.

use super::request::{SubTransfer, TransferRequest};
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::memory::SharedRegion;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CREATION_ID: AtomicU64 = AtomicU64::new(1);

/// Moves bytes and flag words between two regions.
///
/// One engine exists per driver; templates share it.
pub trait TransferEngine: Send + Sync {
    /// Perform one sub-transfer from `src` to `dst`.
    fn execute(&self, src: &SharedRegion, dst: &SharedRegion, transfer: &SubTransfer) -> Result<()>;
}

/// Programmed-I/O engine: the CPU copies directly between mappings.
#[derive(Debug, Default, Clone, Copy)]
pub struct PioEngine;

impl TransferEngine for PioEngine {
    fn execute(&self, src: &SharedRegion, dst: &SharedRegion, transfer: &SubTransfer) -> Result<()> {
        match *transfer {
            SubTransfer::Copy {
                src: s,
                dst: d,
                len,
            } => SharedRegion::copy_between(src, s, dst, d, len),
            SubTransfer::Inline { dst: d, bytes, len } => dst.write(d, &bytes[..len]),
            SubTransfer::Flag { src: s, dst: d } => {
                let value = src.load_flag(s)?;
                dst.store_flag(d, value)
            }
            SubTransfer::WriteFlag { dst: d, value } => dst.store_flag(d, value),
        }
    }
}

/// The immutable recipe for moving data from one endpoint to another.
///
/// At most one template exists per ordered (source, target) pair in a
/// [`TransportContext`](super::TransportContext).
pub struct TransferTemplate {
    source: Arc<Endpoint>,
    target: Arc<Endpoint>,
    engine: Arc<dyn TransferEngine>,
    creation_id: u64,
}

impl std::fmt::Debug for TransferTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferTemplate")
            .field("source", &self.source.id())
            .field("target", &self.target.id())
            .field("creation_id", &self.creation_id)
            .finish()
    }
}

impl TransferTemplate {
    /// Create a template. Normally called by a driver.
    pub fn new(source: Arc<Endpoint>, target: Arc<Endpoint>, engine: Arc<dyn TransferEngine>) -> Self {
        Self {
            source,
            target,
            engine,
            creation_id: NEXT_CREATION_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Source endpoint.
    pub fn source(&self) -> &Arc<Endpoint> {
        &self.source
    }

    /// Target endpoint.
    pub fn target(&self) -> &Arc<Endpoint> {
        &self.target
    }

    /// Engine executing this template's requests.
    pub fn engine(&self) -> &dyn TransferEngine {
        self.engine.as_ref()
    }

    /// Process-unique id assigned at construction.
    pub fn creation_id(&self) -> u64 {
        self.creation_id
    }

    /// Start an empty request against this template.
    pub fn request(self: &Arc<Self>) -> TransferRequest {
        TransferRequest::new(Arc::clone(self))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointUri;
    use crate::memory::HeapSegment;

    #[test]
    fn test_creation_ids_unique() {
        let ep = |n: &str, m: u16| {
            let uri = EndpointUri::new("ocpi-smb-pio", n, 128, m, 20).unwrap();
            Arc::new(Endpoint::new(uri, SharedRegion::new(HeapSegment::new(128).unwrap()), true).unwrap())
        };
        let a = ep("a", 1);
        let b = ep("b", 2);
        let t1 = TransferTemplate::new(a.clone(), b.clone(), Arc::new(PioEngine));
        let t2 = TransferTemplate::new(b, a, Arc::new(PioEngine));
        assert_ne!(t1.creation_id(), t2.creation_id());
        assert_eq!(t1.source().id(), "ocpi-smb-pio:a:128.1.20");
    }

    #[test]
    fn test_pio_flag_copy() {
        let a = SharedRegion::new(HeapSegment::new(64).unwrap());
        let b = SharedRegion::new(HeapSegment::new(64).unwrap());
        a.store_flag(4, 42).unwrap();
        PioEngine
            .execute(&a, &b, &SubTransfer::Flag { src: 4, dst: 8 })
            .unwrap();
        assert_eq!(b.load_flag(8).unwrap(), 42);
    }
}
