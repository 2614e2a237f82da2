//! The transfer layer: drivers, templates, requests and the transport context.
//!
//! # Architecture
//!
//! - [`TransportContext`]: registry of drivers, endpoints and resources, and
//!   the template cache (one template per ordered endpoint pair)
//! - [`TransferDriver`]: a pluggable protocol; [`PioDriver`] is the shared-memory one
//! - [`TransferTemplate`] / [`TransferRequest`]: recipe and unit of data movement
//! - [`MailBox`]: control-plane requests between endpoints
//!
//! # Example
//!
//! ```rust
//! use conduit::config::TransportConfig;
//! use conduit::transfer::{PioDriver, TransportContext};
//! use std::sync::Arc;
//!
//! let ctx = TransportContext::new(TransportConfig::default().with_smb_size(1 << 16));
//! ctx.register(Arc::new(PioDriver::heap()));
//! ctx.init();
//!
//! let a = ctx.allocate_endpoint("").unwrap();
//! let b = ctx.allocate_endpoint("").unwrap();
//! ctx.endpoint(&a).unwrap().region().write(0, b"data").unwrap();
//!
//! let template = ctx.get_service(&a, &b).unwrap();
//! let mut request = template.request();
//! request.copy(0, 0, 4);
//! request.post().unwrap();
//! assert_eq!(ctx.endpoint(&b).unwrap().region().slice(0, 4).unwrap(), b"data");
//! ```

mod driver;
mod mailbox;
mod pio;
mod registry;
mod request;
mod resources;
mod template;

pub use driver::{TransferDriver, supports_endpoints};
pub use mailbox::{MailBox, MailboxMessage, RequestKind};
pub use pio::{PIO_PROTOCOL, PioBacking, PioDriver};
pub use registry::TransportContext;
pub use request::{CompletionStatus, INLINE_MAX, SubTransfer, TransferRequest};
pub use resources::{
    COMMS_MAGIC, MAILBOX_BASE, MAILBOX_HEADER_SIZE, MAILBOX_PAYLOAD_MAX, MAILBOX_SLOT_SIZE,
    SharedMemoryResource, comms_size, mailbox_offset,
};
pub use template::{PioEngine, TransferEngine, TransferTemplate};
