//! Mailbox number allocation within one protocol domain.

use crate::error::{Error, Result};
use crate::memory::AtomicBitmap;

/// Hands out mailbox numbers for endpoints of one protocol.
///
/// Numbers below `first` are never handed out automatically (mailbox 0 is
/// reserved), but may still be claimed with [`reserve`](Self::reserve) when an
/// endpoint string arrives with an explicit mailbox.
pub struct MailboxAllocator {
    protocol: String,
    used: AtomicBitmap,
    first: u16,
    max: u16,
}

impl MailboxAllocator {
    /// Allocator for mailboxes `first..max` of `protocol`.
    pub fn new(protocol: impl Into<String>, first: u16, max: u16) -> Self {
        let used = AtomicBitmap::new(max as usize);
        for reserved in 0..first.min(max) {
            used.claim(reserved as usize);
        }
        Self {
            protocol: protocol.into(),
            used,
            first,
            max,
        }
    }

    /// Protocol this allocator serves.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Number of mailboxes in the domain.
    pub fn max(&self) -> u16 {
        self.max
    }

    fn exhausted(&self) -> Error {
        Error::MailboxExhausted {
            protocol: self.protocol.clone(),
            max: self.max,
        }
    }

    /// Next free mailbox, lowest first.
    pub fn next(&self) -> Result<u16> {
        self.used
            .claim_lowest()
            .map(|m| m as u16)
            .ok_or_else(|| self.exhausted())
    }

    /// Lowest free mailbox that differs from `remote`'s.
    pub fn new_compatible(&self, remote: u16) -> Result<u16> {
        let m = self.next()?;
        if m != remote {
            return Ok(m);
        }
        let other = self.next();
        self.release(m);
        other
    }

    /// Claim a specific mailbox. Returns `false` if it was already taken.
    pub fn reserve(&self, mailbox: u16) -> bool {
        self.used.claim(mailbox as usize)
    }

    /// Give a mailbox back.
    pub fn release(&self, mailbox: u16) {
        if mailbox >= self.first && mailbox < self.max {
            self.used.unclaim(mailbox as usize);
        }
    }

    /// Whether a mailbox is in use.
    pub fn is_used(&self, mailbox: u16) -> bool {
        mailbox >= self.first && self.used.contains(mailbox as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_from_first() {
        let alloc = MailboxAllocator::new("ocpi-smb-pio", 1, 4);
        assert_eq!(alloc.next().unwrap(), 1);
        assert_eq!(alloc.next().unwrap(), 2);
        assert_eq!(alloc.next().unwrap(), 3);
        assert!(matches!(
            alloc.next(),
            Err(Error::MailboxExhausted { max: 4, .. })
        ));
        alloc.release(2);
        assert_eq!(alloc.next().unwrap(), 2);
    }

    #[test]
    fn test_compatible_skips_remote() {
        let alloc = MailboxAllocator::new("ocpi-smb-pio", 1, 20);
        assert_eq!(alloc.new_compatible(1).unwrap(), 2);
        // mailbox 1 went back to the pool
        assert!(!alloc.is_used(1));
        assert_eq!(alloc.new_compatible(5).unwrap(), 1);
    }

    #[test]
    fn test_reserve_explicit() {
        let alloc = MailboxAllocator::new("ocpi-smb-pio", 1, 20);
        assert!(alloc.reserve(1));
        assert!(!alloc.reserve(1));
        assert_eq!(alloc.next().unwrap(), 2);
    }

    #[test]
    fn test_compatible_exhausted() {
        let alloc = MailboxAllocator::new("p", 1, 2);
        assert!(alloc.new_compatible(1).is_err());
        assert!(!alloc.is_used(1));
    }
}
