//! Endpoints: addressable memory participants.
//!
//! An [`Endpoint`] pairs a parsed [`EndpointUri`] with the
//! [`SharedRegion`] it maps. Endpoints are shared as `Arc<Endpoint>`; the
//! mapping goes away when the last port, resource or template holding it is
//! dropped.

mod mailbox;
mod uri;

pub use mailbox::MailboxAllocator;
pub use uri::{EndpointUri, protocol_matches};

use crate::error::{Error, Result};
use crate::memory::SharedRegion;

/// One memory-addressable participant.
#[derive(Debug)]
pub struct Endpoint {
    uri: EndpointUri,
    id: String,
    region: SharedRegion,
    local: bool,
}

impl Endpoint {
    /// Bind a URI to a mapped region.
    ///
    /// `local` is true when this process created the memory, false when it
    /// attached to memory owned elsewhere.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AllocationFailed`] if the region is smaller than the
    /// size the URI advertises.
    pub fn new(uri: EndpointUri, region: SharedRegion, local: bool) -> Result<Self> {
        if (region.len() as u64) < uri.size() {
            return Err(Error::AllocationFailed(format!(
                "endpoint {uri} needs {} bytes, region has {}",
                uri.size(),
                region.len()
            )));
        }
        Ok(Self {
            id: uri.to_string(),
            uri,
            region,
            local,
        })
    }

    /// Canonical endpoint string.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Parsed URI.
    pub fn uri(&self) -> &EndpointUri {
        &self.uri
    }

    /// Protocol part of the URI.
    pub fn protocol(&self) -> &str {
        self.uri.protocol()
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.uri.size()
    }

    /// Mailbox number.
    pub fn mailbox(&self) -> u16 {
        self.uri.mailbox()
    }

    /// Number of mailboxes in the protocol domain.
    pub fn max_count(&self) -> u16 {
        self.uri.max_count()
    }

    /// Mapped memory.
    pub fn region(&self) -> &SharedRegion {
        &self.region
    }

    /// Whether this process owns the memory.
    pub fn is_local(&self) -> bool {
        self.local
    }
}
