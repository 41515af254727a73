//! The timeout wheel: a fixed ring of buckets advanced one slot per
//! millisecond. Inserting stamps the current tick, so the bucket retired
//! at tick C is exactly the one whose deadline has just elapsed:
//! (C + N − timeout_ticks) mod N.
//!
//! Buckets hold slot indices in spin-locked side lists rather than
//! threading links through the slots themselves; a per-slot atomic
//! records which bucket a slot currently lives in (−1 when unlinked).

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use crate::{
    registry::{Registry, TxnState},
    timing::Nanos,
};

/// Buckets past the timeout horizon; keeps the ring strictly larger than
/// the deadline in ticks.
const SLACK_TICKS: usize = 100;
/// Ring size is rounded up to a multiple of this.
const SIZE_MULTIPLE: usize = 32;
/// Wheel resolution.
pub(crate) const TICK_MS: u64 = 1;

pub(crate) struct TimeoutWheel {
    buckets: Box<[spin::Mutex<Vec<u16>>]>,
    /// Bucket a slot is linked into, −1 when unlinked. Updated only under
    /// that bucket's lock.
    slot_bucket: Box<[AtomicI32]>,
    counter: AtomicUsize,
    timeout_ticks: usize,
}

impl TimeoutWheel {
    pub fn new(n_slots: usize, response_timeout: Nanos) -> Self {
        let timeout_ticks = (response_timeout.as_millis_u64() / TICK_MS).max(1) as usize;
        let mut size = timeout_ticks + SLACK_TICKS;
        if size % SIZE_MULTIPLE != 0 {
            size += SIZE_MULTIPLE - size % SIZE_MULTIPLE;
        }
        let buckets = (0..size)
            .map(|_| spin::Mutex::new(Vec::new()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let slot_bucket =
            (0..n_slots).map(|_| AtomicI32::new(-1)).collect::<Vec<_>>().into_boxed_slice();
        Self { buckets, slot_bucket, counter: AtomicUsize::new(0), timeout_ticks }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn timeout_ticks(&self) -> usize {
        self.timeout_ticks
    }

    /// One tick forward; called by the timer thread only.
    pub fn advance(&self) -> usize {
        let next = (self.counter.load(Ordering::Relaxed) + 1) % self.buckets.len();
        self.counter.store(next, Ordering::Release);
        next
    }

    /// Links an in-flight slot into the current bucket.
    pub fn insert(&self, id: u16) {
        let c = self.counter.load(Ordering::Acquire);
        let mut list = self.buckets[c].lock();
        list.push(id);
        self.slot_bucket[usize::from(id)].store(c as i32, Ordering::Release);
    }

    /// Unlinks a slot if it is linked anywhere. The bucket cell is
    /// re-read under the lock in case the slot moved between the
    /// unlocked read and the acquisition.
    pub fn remove(&self, id: u16) {
        loop {
            let b = self.slot_bucket[usize::from(id)].load(Ordering::Acquire);
            if b < 0 {
                return;
            }
            let mut list = self.buckets[b as usize].lock();
            if self.slot_bucket[usize::from(id)].load(Ordering::Acquire) == b {
                if let Some(pos) = list.iter().position(|&x| x == id) {
                    list.swap_remove(pos);
                }
                self.slot_bucket[usize::from(id)].store(-1, Ordering::Release);
                return;
            }
        }
    }

    /// Retires the bucket whose deadline elapsed at `tick`: every linked
    /// slot still in flight is CAS-moved to ResponseTimedOut and
    /// detached. Slots that lost the race to a response stay linked until
    /// release. The timed-out ids are returned for the caller to finish
    /// outside the bucket lock.
    pub fn retire(&self, tick: usize, registry: &Registry) -> Vec<u16> {
        let n = self.buckets.len();
        let expired = (tick + n - self.timeout_ticks) % n;
        let mut timed_out = Vec::new();
        let mut list = self.buckets[expired].lock();
        list.retain(|&id| {
            let Some(slot) = registry.get(id) else {
                return false;
            };
            if slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseTimedOut) {
                self.slot_bucket[usize::from(id)].store(-1, Ordering::Release);
                timed_out.push(id);
                false
            } else {
                true
            }
        });
        drop(list);
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn in_flight_slot(reg: &Registry) -> u16 {
        let slot = reg.reserve().unwrap();
        assert!(reg.emplace(slot, Nanos::ZERO));
        assert!(slot.state.transition(TxnState::ReceivedFromApp, TxnState::SentOnNetwork));
        slot.id
    }

    #[test]
    fn ring_is_strictly_larger_than_the_deadline() {
        let wheel = TimeoutWheel::new(8, Nanos::from_millis(1_000));
        assert!(wheel.len() > wheel.timeout_ticks());
        assert_eq!(wheel.len() % SIZE_MULTIPLE, 0);
    }

    #[test]
    fn retires_exactly_at_the_deadline_tick() {
        let reg = Registry::new(4);
        let wheel = TimeoutWheel::new(reg.len(), Nanos::from_millis(5));
        let id = in_flight_slot(&reg);
        wheel.insert(id);

        for step in 1..=wheel.timeout_ticks() {
            let tick = wheel.advance();
            let retired = wheel.retire(tick, &reg);
            if step < wheel.timeout_ticks() {
                assert!(retired.is_empty(), "retired early at step {step}");
            } else {
                assert_eq!(retired, vec![id]);
            }
        }
        assert_eq!(reg.get(id).unwrap().state.load(), TxnState::ResponseTimedOut);
    }

    #[test]
    fn responded_slot_survives_retirement() {
        let reg = Registry::new(4);
        let wheel = TimeoutWheel::new(reg.len(), Nanos::from_millis(3));
        let id = in_flight_slot(&reg);
        wheel.insert(id);

        // The response wins the race before the deadline.
        let slot = reg.get(id).unwrap();
        assert!(slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseReceived));

        for _ in 0..wheel.len() {
            let tick = wheel.advance();
            assert!(wheel.retire(tick, &reg).is_empty());
        }
        assert_eq!(slot.state.load(), TxnState::ResponseReceived);

        // Release unlinks it; a later lap of the wheel finds nothing.
        reg.release(slot, &wheel);
        let tick = wheel.advance();
        assert!(wheel.retire(tick, &reg).is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let reg = Registry::new(2);
        let wheel = TimeoutWheel::new(reg.len(), Nanos::from_millis(3));
        let id = in_flight_slot(&reg);
        wheel.insert(id);
        wheel.remove(id);
        wheel.remove(id);
        for _ in 0..wheel.len() {
            let tick = wheel.advance();
            assert!(wheel.retire(tick, &reg).is_empty());
        }
    }
}
