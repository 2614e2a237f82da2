//! Lock-free set of small numbers, used for mailbox bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

const BITS: usize = u64::BITS as usize;

/// Fixed-capacity set of claimed numbers `0..len`.
pub struct AtomicBitmap {
    words: Box<[AtomicU64]>,
    len: usize,
}

impl AtomicBitmap {
    /// An empty set able to hold `0..len`.
    pub fn new(len: usize) -> Self {
        Self {
            words: (0..len.div_ceil(BITS)).map(|_| AtomicU64::new(0)).collect(),
            len,
        }
    }

    /// Capacity.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the capacity is zero.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Claim the lowest unclaimed number.
    pub fn claim_lowest(&self) -> Option<usize> {
        self.words.iter().enumerate().find_map(|(w, word)| {
            let mut bit = 0;
            word.fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                bit = (!cur).trailing_zeros() as usize;
                (bit < BITS && w * BITS + bit < self.len).then(|| cur | (1 << bit))
            })
            .ok()
            .map(|_| w * BITS + bit)
        })
    }

    /// Claim `n`. Returns false if it was already claimed or is out of range.
    pub fn claim(&self, n: usize) -> bool {
        if n >= self.len {
            return false;
        }
        let mask = 1u64 << (n % BITS);
        self.words[n / BITS].fetch_or(mask, Ordering::AcqRel) & mask == 0
    }

    /// Unclaim `n`. Out-of-range numbers are ignored.
    pub fn unclaim(&self, n: usize) {
        if n < self.len {
            self.words[n / BITS].fetch_and(!(1u64 << (n % BITS)), Ordering::Release);
        }
    }

    /// Whether `n` is claimed.
    pub fn contains(&self, n: usize) -> bool {
        n < self.len && self.words[n / BITS].load(Ordering::Acquire) & (1u64 << (n % BITS)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_lowest_first() {
        let set = AtomicBitmap::new(3);
        assert!(set.claim(1));
        assert!(!set.claim(1));
        assert_eq!(set.claim_lowest(), Some(0));
        assert_eq!(set.claim_lowest(), Some(2));
        assert_eq!(set.claim_lowest(), None);
        set.unclaim(1);
        assert!(!set.contains(1));
        assert_eq!(set.claim_lowest(), Some(1));
        assert!(!set.claim(3));
    }

    #[test]
    fn test_spans_words() {
        let set = AtomicBitmap::new(70);
        for n in 0..64 {
            assert!(set.claim(n));
        }
        assert_eq!(set.claim_lowest(), Some(64));
    }

    #[test]
    fn test_concurrent_claims_unique() {
        let set = Arc::new(AtomicBitmap::new(130));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let set = Arc::clone(&set);
                thread::spawn(move || std::iter::from_fn(|| set.claim_lowest()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..130).collect::<Vec<_>>());
    }
}
