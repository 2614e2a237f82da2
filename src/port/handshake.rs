//! Port handshake states.

use std::fmt;

/// Where a port is in its descriptor exchange.
///
/// ```text
/// NotExternal -> WaitingForUpdate -> WaitingForShadowBuffer -> DefinitionComplete
/// ```
///
/// Buffers may only be taken or advanced in `DefinitionComplete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    /// Created, not yet connected to any peer.
    NotExternal,
    /// Own descriptor published; waiting for every peer's descriptor.
    WaitingForUpdate,
    /// All peer descriptors applied; transfer plans not yet resolved.
    WaitingForShadowBuffer,
    /// Ready for data.
    DefinitionComplete,
}

impl PortState {
    /// The state following this one, if any.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::NotExternal => Some(Self::WaitingForUpdate),
            Self::WaitingForUpdate => Some(Self::WaitingForShadowBuffer),
            Self::WaitingForShadowBuffer => Some(Self::DefinitionComplete),
            Self::DefinitionComplete => None,
        }
    }

    /// True once the handshake has finished.
    pub fn is_complete(self) -> bool {
        self == Self::DefinitionComplete
    }
}

impl fmt::Display for PortState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotExternal => "not-external",
            Self::WaitingForUpdate => "waiting-for-update",
            Self::WaitingForShadowBuffer => "waiting-for-shadow-buffer",
            Self::DefinitionComplete => "definition-complete",
        };
        f.write_str(s)
    }
}
