//! Buffer state flag words.
//!
//! A state word is either [`BUFFER_EMPTY_FLAG`] or a "produced" marker
//! carrying the producer's tid. Input buffers have one word per
//! contributing producer (fan-in); output buffers have one own word plus a
//! shadow word per remote input buffer.

/// Sentinel value of an empty buffer.
pub const BUFFER_EMPTY_FLAG: u32 = 0;

/// High bit set in every produced marker.
pub const FULL_MARKER: u32 = 0x8000_0000;

/// Decoded value of one state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferState(u32);

impl BufferState {
    /// The empty state.
    pub const EMPTY: Self = Self(BUFFER_EMPTY_FLAG);

    /// Marker for a buffer produced from the producer's buffer `tid`.
    #[inline]
    pub fn produced(tid: u32) -> Self {
        Self(FULL_MARKER | (tid & !FULL_MARKER))
    }

    /// Wrap a raw word.
    #[inline]
    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Raw word.
    #[inline]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// True for [`BUFFER_EMPTY_FLAG`].
    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == BUFFER_EMPTY_FLAG
    }

    /// True for any produced marker.
    #[inline]
    pub fn is_full(self) -> bool {
        !self.is_empty()
    }

    /// Producer tid encoded in a produced marker.
    pub fn producer_tid(self) -> Option<u32> {
        (self.0 & FULL_MARKER != 0).then_some(self.0 & !FULL_MARKER)
    }
}

/// Fan-in rule: a buffer is full iff any contributing slot is non-empty.
pub fn fan_in_full(slots: impl IntoIterator<Item = BufferState>) -> bool {
    slots.into_iter().any(BufferState::is_full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers() {
        assert!(BufferState::EMPTY.is_empty());
        let s = BufferState::produced(3);
        assert!(s.is_full());
        assert_eq!(s.producer_tid(), Some(3));
        assert_eq!(s.raw(), 0x8000_0003);
        // tid 0 must still be distinguishable from empty
        assert!(BufferState::produced(0).is_full());
        assert_eq!(BufferState::EMPTY.producer_tid(), None);
    }

    #[test]
    fn test_fan_in() {
        let e = BufferState::EMPTY;
        let f = BufferState::produced(1);
        assert!(!fan_in_full([e, e, e]));
        assert!(fan_in_full([e, f, e]));
        assert!(fan_in_full([f, f, f]));
        assert!(!fan_in_full([]));
    }
}
