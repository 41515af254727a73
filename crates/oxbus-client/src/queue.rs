//! The response queue: completed slots ordered by priority, FIFO within
//! a priority class, with a condvar standing in for the wakeup semaphore.

use std::{
    cmp::Ordering as CmpOrdering,
    collections::BinaryHeap,
    sync::{
        Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

/// Poison-tolerant lock: a panicked holder never touched anything the
/// next holder can't overwrite.
pub(crate) fn lock_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(PartialEq, Eq)]
struct Entry {
    priority: i64,
    seq: u64,
    slot: u16,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // Max-heap on priority, earliest sequence first within a class.
        self.priority.cmp(&other.priority).then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub(crate) struct RespQueue {
    heap: Mutex<BinaryHeap<Entry>>,
    ready: Condvar,
    seq: AtomicU64,
}

impl RespQueue {
    pub fn push(&self, priority: i64, slot: u16) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        lock_recover(&self.heap).push(Entry { priority, seq, slot });
        self.ready.notify_one();
    }

    /// Highest-priority completed slot, waiting up to `timeout` for one
    /// to arrive.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<u16> {
        let mut heap = lock_recover(&self.heap);
        if let Some(e) = heap.pop() {
            return Some(e.slot);
        }
        let (mut heap, _) = self
            .ready
            .wait_timeout(heap, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        heap.pop().map(|e| e.slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TICK: Duration = Duration::from_millis(10);

    #[test]
    fn priority_order_across_classes() {
        let q = RespQueue::default();
        q.push(1, 10);
        q.push(5, 11);
        q.push(3, 12);
        assert_eq!(q.pop_timeout(TICK), Some(11));
        assert_eq!(q.pop_timeout(TICK), Some(12));
        assert_eq!(q.pop_timeout(TICK), Some(10));
        assert_eq!(q.pop_timeout(TICK), None);
    }

    #[test]
    fn fifo_within_a_class() {
        let q = RespQueue::default();
        for slot in [7u16, 8, 9] {
            q.push(0, slot);
        }
        assert_eq!(q.pop_timeout(TICK), Some(7));
        assert_eq!(q.pop_timeout(TICK), Some(8));
        assert_eq!(q.pop_timeout(TICK), Some(9));
    }

    #[test]
    fn wakes_a_waiting_consumer() {
        let q = std::sync::Arc::new(RespQueue::default());
        let q2 = std::sync::Arc::clone(&q);
        let consumer = std::thread::spawn(move || q2.pop_timeout(Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        q.push(0, 42);
        assert_eq!(consumer.join().unwrap(), Some(42));
    }
}
