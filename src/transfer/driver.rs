//! Pluggable transfer drivers.

use super::TransferTemplate;
use crate::endpoint::{Endpoint, EndpointUri, protocol_matches};
use crate::error::Result;
use std::sync::Arc;

/// A transport driver for one protocol.
///
/// Drivers create endpoints for URIs of their protocol and the templates
/// that move data between two such endpoints. They are registered with a
/// [`TransportContext`](super::TransportContext) and probed in registration
/// order.
pub trait TransferDriver: Send + Sync {
    /// Protocol prefix served by this driver, e.g. `"ocpi-smb-pio"`.
    fn protocol(&self) -> &str;

    /// Whether this driver can move data between `ep1` and `ep2`.
    ///
    /// See [`supports_endpoints`] for the default rule.
    fn supports(&self, ep1: &str, ep2: &str) -> bool {
        supports_endpoints(self.protocol(), ep1, ep2)
    }

    /// Format a new endpoint string of this protocol.
    fn allocate_endpoint(&self, name: &str, size: u64, mailbox: u16, max_count: u16) -> String {
        format!("{}:{name}:{size}.{mailbox}.{max_count}", self.protocol())
    }

    /// Create (or attach to) the endpoint named by `uri`.
    ///
    /// `local` requests memory owned by this process.
    fn create_endpoint(&self, uri: &EndpointUri, local: bool) -> Result<Arc<Endpoint>>;

    /// Build the template moving data from `source` to `target`.
    fn create_template(&self, source: &Arc<Endpoint>, target: &Arc<Endpoint>) -> Result<TransferTemplate>;

    /// Release driver-level state for `id`. Called at context shutdown.
    fn forget_endpoint(&self, _id: &str) {}
}

/// Endpoint-pair probe used by [`TransferDriver::supports`].
///
/// With two non-empty endpoints both must match `protocol`; with exactly one,
/// that one must; with none, nothing matches.
pub fn supports_endpoints(protocol: &str, ep1: &str, ep2: &str) -> bool {
    match (ep1.is_empty(), ep2.is_empty()) {
        (false, false) => protocol_matches(ep1, protocol) && protocol_matches(ep2, protocol),
        (false, true) => protocol_matches(ep1, protocol),
        (true, false) => protocol_matches(ep2, protocol),
        (true, true) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_endpoints() {
        let p = "ocpi-smb-pio";
        assert!(supports_endpoints(p, "ocpi-smb-pio:test1:100.1.20", ""));
        assert!(supports_endpoints(p, "", "ocpi-smb-pio:test1:100.1.20"));
        assert!(supports_endpoints(
            p,
            "ocpi-smb-pio:a:100.1.20",
            "ocpi-smb-pio:b:100.2.20"
        ));
        assert!(!supports_endpoints(
            p,
            "ocpi-smb-pio:a:100.1.20",
            "ocpi-dma:b:100.2.20"
        ));
        assert!(!supports_endpoints(p, "ocpi-smb-piox:test1:100.1.20", ""));
        assert!(!supports_endpoints(p, "", ""));
    }
}
