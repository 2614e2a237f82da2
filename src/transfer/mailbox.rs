//! Control-plane mailbox requests.
//!
//! Small messages (flow-control descriptors during a port handshake) are
//! delivered by writing into the peer's comms block. Sending is the one
//! place the transport busy-waits: first until the peer's slot is free,
//! then until the posted request completes. Data-plane buffers never go
//! through here.

use super::registry::TransportContext;
use super::request::CompletionStatus;
use super::resources::{MAILBOX_HEADER_SIZE, MAILBOX_PAYLOAD_MAX, SharedMemoryResource, mailbox_offset};
use crate::error::{Error, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, trace};

/// Kind of a mailbox request. Zero in the header means the slot is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RequestKind {
    /// A flow-control descriptor for a port handshake.
    Descriptor = 1,
    /// The sender is going away.
    Shutdown = 2,
}

impl RequestKind {
    fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::Descriptor),
            2 => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// A received mailbox request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxMessage {
    /// Request kind.
    pub kind: RequestKind,
    /// Mailbox number of the sender.
    pub source: u16,
    /// Sender's request counter.
    pub sequence: u32,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

/// The sending side of one endpoint's mailbox.
pub struct MailBox {
    slot: u16,
    retry_count: u32,
    sequence: AtomicU32,
}

impl MailBox {
    /// Mailbox for an endpoint whose mailbox number is `slot`.
    pub fn new(slot: u16, retry_count: u32) -> Self {
        Self {
            slot,
            retry_count: retry_count.max(1),
            sequence: AtomicU32::new(0),
        }
    }

    /// Mailbox of `resource`'s endpoint, with the context's retry count.
    pub fn for_resource(ctx: &TransportContext, resource: &SharedMemoryResource) -> Self {
        Self::new(resource.endpoint().mailbox(), ctx.config().retry_count)
    }

    /// This mailbox's slot number.
    pub fn slot(&self) -> u16 {
        self.slot
    }

    fn spin(&self, mut done: impl FnMut() -> Result<bool>) -> Result<bool> {
        for round in 0..self.retry_count {
            if done()? {
                return Ok(true);
            }
            if round % 16 == 15 {
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
        done()
    }

    /// Deliver `payload` into `target`'s mailbox slot for this sender.
    ///
    /// The header body and payload go out as one copy, the header `kind`
    /// word as a flag written after it, both in one grouped request.
    ///
    /// # Errors
    ///
    /// Fails if the payload is too large, the peer's slot stays busy for
    /// `retry_count` rounds, or the transfer fails.
    pub fn make_request(
        &self,
        ctx: &TransportContext,
        source: &SharedMemoryResource,
        target: &str,
        kind: RequestKind,
        payload: &[u8],
    ) -> Result<()> {
        if payload.len() > MAILBOX_PAYLOAD_MAX {
            return Err(Error::TransferFailed(format!(
                "mailbox payload of {} bytes exceeds {MAILBOX_PAYLOAD_MAX}",
                payload.len()
            )));
        }
        let _staging = source.lock_staging();

        let template = ctx.get_service(source.endpoint().id(), target)?;
        let result = (|| {
            let target_region = template.target().region();
            let dst = mailbox_offset(template.target().max_count(), self.slot)?;
            let src = source.mailbox_offset(self.slot)?;

            let free = self.spin(|| Ok(target_region.load_flag(dst)? == 0))?;
            if !free {
                return Err(Error::TransferFailed(format!(
                    "mailbox {} of {target} still busy after {} rounds",
                    self.slot, self.retry_count
                )));
            }

            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            let mut header = [0u8; (MAILBOX_HEADER_SIZE - 4) as usize];
            header[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
            header[4..8].copy_from_slice(&u32::from(self.slot).to_le_bytes());
            header[8..12].copy_from_slice(&sequence.to_le_bytes());
            let region = source.region();
            region.write(src + 4, &header)?;
            region.write(src + MAILBOX_HEADER_SIZE, payload)?;

            let mut request = template.request();
            request.copy(src + 4, dst + 4, (MAILBOX_HEADER_SIZE - 4) as usize + payload.len());
            let mut header_flag = template.request();
            header_flag.write_flag(dst, kind as u32);
            request.group(header_flag);
            request.post()?;

            let complete = self.spin(|| Ok(request.status() != CompletionStatus::Pending))?;
            match request.status() {
                CompletionStatus::Complete if complete => {
                    trace!(slot = self.slot, target = %target, sequence, "mailbox request delivered");
                    Ok(())
                }
                status => Err(Error::TransferFailed(format!(
                    "mailbox request to {target} ended {status:?}"
                ))),
            }
        })();
        ctx.release_service(source.endpoint().id(), target);
        result
    }

    /// Take the request sent to `resource` by the peer with mailbox `from`.
    ///
    /// Returns `None` if the slot is empty; otherwise frees the slot.
    pub fn receive(resource: &SharedMemoryResource, from: u16) -> Result<Option<MailboxMessage>> {
        let region = resource.region();
        let offset = resource.mailbox_offset(from)?;
        let raw = region.load_flag(offset)?;
        if raw == 0 {
            return Ok(None);
        }
        let kind = RequestKind::from_raw(raw).ok_or_else(|| {
            Error::TransferFailed(format!("unknown mailbox request kind {raw}"))
        })?;

        let mut header = [0u8; (MAILBOX_HEADER_SIZE - 4) as usize];
        region.read(offset + 4, &mut header)?;
        let word = |i: usize| u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]]);
        let len = word(0) as usize;
        if len > MAILBOX_PAYLOAD_MAX {
            return Err(Error::TransferFailed(format!(
                "mailbox payload length {len} exceeds {MAILBOX_PAYLOAD_MAX}"
            )));
        }
        let mut payload = vec![0u8; len];
        region.read(offset + MAILBOX_HEADER_SIZE, &mut payload)?;
        region.store_flag(offset, 0)?;

        let message = MailboxMessage {
            kind,
            source: word(4) as u16,
            sequence: word(8),
            payload,
        };
        debug!(slot = from, kind = ?message.kind, len, "mailbox request received");
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transfer::PioDriver;
    use std::sync::Arc;

    fn context() -> TransportContext {
        let ctx = TransportContext::new(TransportConfig::default().with_smb_size(64 * 1024));
        ctx.register(Arc::new(PioDriver::heap()));
        ctx.init();
        ctx
    }

    #[test]
    fn test_request_round_trip() {
        let ctx = context();
        let a = ctx.allocate_endpoint("").unwrap();
        let b = ctx.allocate_endpoint("").unwrap();
        let res_a = ctx.resources(&a).unwrap();
        let res_b = ctx.resources(&b).unwrap();

        let mailbox = MailBox::for_resource(&ctx, &res_a);
        mailbox
            .make_request(&ctx, &res_a, &b, RequestKind::Descriptor, b"hello peer")
            .unwrap();
        // the template is only held for the duration of the request
        assert_eq!(ctx.template_count(), 0);

        let msg = MailBox::receive(&res_b, mailbox.slot()).unwrap().unwrap();
        assert_eq!(msg.kind, RequestKind::Descriptor);
        assert_eq!(msg.source, mailbox.slot());
        assert_eq!(msg.payload, b"hello peer");
        assert!(MailBox::receive(&res_b, mailbox.slot()).unwrap().is_none());
    }

    #[test]
    fn test_busy_slot_times_out() {
        let ctx = context();
        let a = ctx.allocate_endpoint("").unwrap();
        let b = ctx.allocate_endpoint("").unwrap();
        let res_a = ctx.resources(&a).unwrap();
        let mailbox = MailBox::new(res_a.endpoint().mailbox(), 4);

        mailbox
            .make_request(&ctx, &res_a, &b, RequestKind::Descriptor, b"one")
            .unwrap();
        let err = mailbox
            .make_request(&ctx, &res_a, &b, RequestKind::Descriptor, b"two")
            .unwrap_err();
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn test_loopback() {
        let ctx = context();
        let a = ctx.allocate_endpoint("").unwrap();
        let res = ctx.resources(&a).unwrap();
        let mailbox = MailBox::for_resource(&ctx, &res);
        mailbox
            .make_request(&ctx, &res, &a, RequestKind::Shutdown, &[])
            .unwrap();
        let msg = MailBox::receive(&res, mailbox.slot()).unwrap().unwrap();
        assert_eq!(msg.kind, RequestKind::Shutdown);
        assert!(msg.payload.is_empty());
    }

    #[test]
    fn test_payload_too_large() {
        let ctx = context();
        let a = ctx.allocate_endpoint("").unwrap();
        let res = ctx.resources(&a).unwrap();
        let mailbox = MailBox::for_resource(&ctx, &res);
        let big = vec![0u8; MAILBOX_PAYLOAD_MAX + 1];
        assert!(
            mailbox
                .make_request(&ctx, &res, &a, RequestKind::Descriptor, &big)
                .is_err()
        );
    }
}
