//! Endpoint URI grammar.
//!
//! ```text
//! <protocol>:<name>:<size>.<mailbox>.<max_count>
//! ```
//!
//! The name may itself contain `:` (socket addresses do), so the resource
//! suffix is taken from the last `:`.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// A parsed endpoint URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointUri {
    protocol: String,
    name: String,
    size: u64,
    mailbox: u16,
    max_count: u16,
}

impl EndpointUri {
    /// Build a URI from parts.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::InvalidEndpoint`] on an empty protocol or name, a
    /// zero size, or a mailbox outside `0..max_count`.
    pub fn new(
        protocol: impl Into<String>,
        name: impl Into<String>,
        size: u64,
        mailbox: u16,
        max_count: u16,
    ) -> Result<Self> {
        let uri = Self {
            protocol: protocol.into(),
            name: name.into(),
            size,
            mailbox,
            max_count,
        };
        uri.validate()?;
        Ok(uri)
    }

    /// Parse an endpoint string.
    pub fn parse(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidEndpoint(s.to_string());

        let (protocol, rest) = s.split_once(':').ok_or_else(invalid)?;
        let (name, resource) = rest.rsplit_once(':').ok_or_else(invalid)?;

        let mut parts = resource.split('.');
        let (Some(size), Some(mailbox), Some(max_count), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };

        let uri = Self {
            protocol: protocol.to_string(),
            name: name.to_string(),
            size: size.parse().map_err(|_| invalid())?,
            mailbox: mailbox.parse().map_err(|_| invalid())?,
            max_count: max_count.parse().map_err(|_| invalid())?,
        };
        uri.validate().map_err(|_| invalid())?;
        Ok(uri)
    }

    fn validate(&self) -> Result<()> {
        let ok = !self.protocol.is_empty()
            && !self.protocol.contains(':')
            && !self.name.is_empty()
            && self.size > 0
            && self.mailbox < self.max_count;
        if ok {
            Ok(())
        } else {
            Err(Error::InvalidEndpoint(self.to_string()))
        }
    }

    /// Text before the first `:`, or the whole string if there is none.
    pub fn protocol_of(s: &str) -> &str {
        s.split_once(':').map_or(s, |(p, _)| p)
    }

    /// Protocol part.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Driver-specific name part.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Size of the endpoint's memory in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mailbox number.
    pub fn mailbox(&self) -> u16 {
        self.mailbox
    }

    /// Number of mailboxes in this endpoint's protocol domain.
    pub fn max_count(&self) -> u16 {
        self.max_count
    }

    /// Whether a local endpoint with this URI can talk to `remote`.
    ///
    /// Requires the same protocol and mailbox domain, and a different mailbox.
    pub fn can_support(&self, remote: &EndpointUri) -> bool {
        self.protocol == remote.protocol
            && self.max_count == remote.max_count
            && self.mailbox != remote.mailbox
    }
}

impl fmt::Display for EndpointUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}.{}.{}",
            self.protocol, self.name, self.size, self.mailbox, self.max_count
        )
    }
}

impl FromStr for EndpointUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Protocol prefix match.
///
/// `uri` matches `protocol` if it starts with it and the next character is
/// `:` or the end of the string, so `"foo"` does not claim `"foobar:..."`.
pub fn protocol_matches(uri: &str, protocol: &str) -> bool {
    if protocol.is_empty() {
        return false;
    }
    match uri.strip_prefix(protocol) {
        Some(rest) => rest.is_empty() || rest.starts_with(':'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let uri = EndpointUri::parse("ocpi-smb-pio:test1:900000.1.20").unwrap();
        assert_eq!(uri.protocol(), "ocpi-smb-pio");
        assert_eq!(uri.name(), "test1");
        assert_eq!(uri.size(), 900_000);
        assert_eq!(uri.mailbox(), 1);
        assert_eq!(uri.max_count(), 20);
        assert_eq!(uri.to_string(), "ocpi-smb-pio:test1:900000.1.20");
    }

    #[test]
    fn test_name_with_colons() {
        let uri: EndpointUri = "ocpi-socket:10.0.0.1:4000:65536.2.8".parse().unwrap();
        assert_eq!(uri.name(), "10.0.0.1:4000");
        assert_eq!(uri.size(), 65536);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "ocpi-smb-pio",
            "ocpi-smb-pio:test1",
            "ocpi-smb-pio:test1:100.1",
            "ocpi-smb-pio:test1:100.1.20.3",
            "ocpi-smb-pio:test1:abc.1.20",
            ":test1:100.1.20",
            "ocpi-smb-pio::100.1.20",
            "ocpi-smb-pio:test1:0.1.20",
            "ocpi-smb-pio:test1:100.20.20",
        ] {
            assert!(EndpointUri::parse(bad).is_err(), "accepted {bad:?}");
        }
    }

    #[test]
    fn test_protocol_prefix_rule() {
        assert!(protocol_matches("ocpi-smb-pio:test1:100.1.20", "ocpi-smb-pio"));
        assert!(protocol_matches("ocpi-smb-pio", "ocpi-smb-pio"));
        assert!(!protocol_matches("ocpi-smb-piox:test1:100.1.20", "ocpi-smb-pio"));
        assert!(!protocol_matches("ocpi-smb:test1:100.1.20", "ocpi-smb-pio"));
        assert!(!protocol_matches("anything", ""));
        assert_eq!(EndpointUri::protocol_of("ocpi-dma:x:1.1.2"), "ocpi-dma");
        assert_eq!(EndpointUri::protocol_of("bare"), "bare");
    }

    #[test]
    fn test_can_support() {
        let a = EndpointUri::parse("ocpi-smb-pio:a:1000.1.20").unwrap();
        let b = EndpointUri::parse("ocpi-smb-pio:b:1000.2.20").unwrap();
        let same_mb = EndpointUri::parse("ocpi-smb-pio:c:1000.1.20").unwrap();
        let other_domain = EndpointUri::parse("ocpi-smb-pio:d:1000.2.16").unwrap();
        let other_proto = EndpointUri::parse("ocpi-dma:e:1000.2.20").unwrap();
        assert!(a.can_support(&b));
        assert!(!a.can_support(&same_mb));
        assert!(!a.can_support(&other_domain));
        assert!(!a.can_support(&other_proto));
    }
}
