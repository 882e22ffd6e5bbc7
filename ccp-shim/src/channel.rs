use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam::queue::ArrayQueue;

/// Fixed-capacity queue whose producers never wait.
///
/// A push into a full channel discards the record and bumps the drop
/// counter; consumers see nothing of it.
pub struct Channel<T> {
    queue: ArrayQueue<T>,
    dropped: AtomicU64,
}

impl<T> Channel<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns false when the record was dropped.
    pub fn push(&self, item: T) -> bool {
        match self.queue.push(item) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Pops at most `bound` records into `f`, returning how many were taken.
    pub fn drain_bounded(&self, bound: usize, mut f: impl FnMut(T)) -> usize {
        let mut taken = 0;
        while taken < bound {
            match self.queue.pop() {
                Some(item) => {
                    f(item);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn push_on_full_drops_and_counts() {
        let ch = Channel::with_capacity(2);
        assert!(ch.push(1));
        assert!(ch.push(2));
        assert!(!ch.push(3));
        assert_eq!(ch.dropped(), 1);
        assert_eq!(ch.pop(), Some(1));
        assert_eq!(ch.pop(), Some(2));
        assert_eq!(ch.pop(), None);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let ch = Channel::with_capacity(0);
        assert_eq!(ch.capacity(), 1);
        assert!(ch.push(()));
    }

    proptest! {
        #[test]
        fn drain_takes_min_of_pending_and_bound(pending in 0usize..64, bound in 0usize..64) {
            let ch = Channel::with_capacity(64);
            for i in 0..pending {
                ch.push(i);
            }
            let mut seen = Vec::new();
            let taken = ch.drain_bounded(bound, |v| seen.push(v));
            prop_assert_eq!(taken, pending.min(bound));
            prop_assert_eq!(seen, (0..pending.min(bound)).collect::<Vec<_>>());
            prop_assert_eq!(ch.len(), pending - pending.min(bound));
        }
    }
}
