//! The bounded transaction registry: a fixed arena of slots reserved,
//! filled, sent, completed and recycled through an atomic state cell.
//! A slot's index doubles as its wire transaction id on the TCP carrier,
//! which makes duplicate in-flight wire ids structurally impossible.

use std::{
    net::{Ipv4Addr, SocketAddrV4},
    sync::atomic::{AtomicU8, Ordering},
};

use oxbus::{DecodedPayload, ErrorKind, MAX_ADU_LEN, Transport};
use tracing::error;

use crate::{
    completion::{Completion, Endpoint, Timestamps},
    context::ContextId,
    timing::Nanos,
    wheel::TimeoutWheel,
};

/// Lifecycle states of a transaction slot.
///
/// Ownership of a slot transfers only through compare-and-swap on this
/// value; the legal transitions are
/// Idle → Reserved → ReceivedFromApp → SentOnNetwork →
/// {ResponseReceived | ResponseTimedOut | ResponseError} → Idle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum TxnState {
    Idle = 0,
    Reserved = 1,
    ReceivedFromApp = 2,
    SentOnNetwork = 3,
    ResponseReceived = 4,
    ResponseTimedOut = 5,
    ResponseError = 6,
}

impl TxnState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Reserved,
            2 => Self::ReceivedFromApp,
            3 => Self::SentOnNetwork,
            4 => Self::ResponseReceived,
            5 => Self::ResponseTimedOut,
            6 => Self::ResponseError,
            other => {
                error!(other, "corrupt transaction state");
                Self::Idle
            }
        }
    }
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    fn new() -> Self {
        Self(AtomicU8::new(TxnState::Idle as u8))
    }

    #[inline]
    pub fn load(&self) -> TxnState {
        TxnState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// CAS ownership transfer; the only way a slot changes hands.
    #[inline]
    pub fn transition(&self, from: TxnState, to: TxnState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    fn store(&self, state: TxnState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Everything a transaction carries besides its state cell. Guarded by a
/// short spinlock; per the state machine only one actor mutates it at a
/// time, so the lock is never contended for long.
pub(crate) struct SlotBody {
    pub unit_id: u8,
    pub function_code: u8,
    pub app_tx_id: u16,
    pub start_address: u16,
    pub quantity: u16,
    pub priority: i64,
    pub context: ContextId,
    pub endpoint: Endpoint,
    pub transport: Transport,
    pub status: Option<ErrorKind>,
    pub tx_len: usize,
    pub rx_len: usize,
    pub tx_buf: [u8; MAX_ADU_LEN],
    pub rx_buf: [u8; MAX_ADU_LEN],
    pub decoded: DecodedPayload,
    pub completion: Option<Completion>,
    pub ts: Timestamps,
}

impl SlotBody {
    fn new() -> Self {
        Self {
            unit_id: 0,
            function_code: 0,
            app_tx_id: 0,
            start_address: 0,
            quantity: 0,
            priority: 0,
            context: ContextId::default(),
            endpoint: Endpoint::Tcp(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
            transport: Transport::Tcp,
            status: None,
            tx_len: 0,
            rx_len: 0,
            tx_buf: [0; MAX_ADU_LEN],
            rx_buf: [0; MAX_ADU_LEN],
            decoded: DecodedPayload::None,
            completion: None,
            ts: Timestamps::default(),
        }
    }

    /// Clears everything a recycled slot must not leak into its next
    /// lifecycle. The byte buffers are length-gated and left as is.
    pub fn reset(&mut self) {
        self.status = None;
        self.tx_len = 0;
        self.rx_len = 0;
        self.decoded = DecodedPayload::None;
        self.completion = None;
        self.ts = Timestamps::default();
    }
}

pub(crate) struct Slot {
    pub id: u16,
    pub state: StateCell,
    pub body: spin::Mutex<SlotBody>,
}

pub(crate) struct Registry {
    slots: Box<[Slot]>,
    cursor: spin::Mutex<usize>,
}

impl Registry {
    /// Builds the arena once; no slot is ever allocated or freed after
    /// this.
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|id| Slot {
                id: id as u16,
                state: StateCell::new(),
                body: spin::Mutex::new(SlotBody::new()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { slots, cursor: spin::Mutex::new(0) }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn get(&self, id: u16) -> Option<&Slot> {
        self.slots.get(usize::from(id))
    }

    /// Round-robin scan from the remembered cursor; the first slot won by
    /// CAS Idle → Reserved is returned. `None` only when every slot is in
    /// use.
    pub fn reserve(&self) -> Option<&Slot> {
        let mut cursor = self.cursor.lock();
        for _ in 0..self.slots.len() {
            *cursor = (*cursor + 1) % self.slots.len();
            let slot = &self.slots[*cursor];
            if slot.state.transition(TxnState::Idle, TxnState::Reserved) {
                return Some(slot);
            }
        }
        None
    }

    /// Takes a reserved slot into the submission path. Clears everything
    /// but `ts_recv`; fails only if the reservation was stolen, which the
    /// state machine rules out.
    pub fn emplace(&self, slot: &Slot, ts_recv: Nanos) -> bool {
        if !slot.state.transition(TxnState::Reserved, TxnState::ReceivedFromApp) {
            error!(id = slot.id, "reserved slot changed hands before emplace");
            return false;
        }
        let mut body = slot.body.lock();
        body.reset();
        body.ts.req_recv = ts_recv;
        true
    }

    /// Returns a finished slot to the free pool: detach from its timeout
    /// bucket if linked, wipe the body, then publish Idle. Safe from any
    /// finalizer.
    pub fn release(&self, slot: &Slot, wheel: &TimeoutWheel) {
        wheel.remove(slot.id);
        slot.body.lock().reset();
        slot.state.store(TxnState::Idle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wheel_for(reg: &Registry) -> TimeoutWheel {
        TimeoutWheel::new(reg.len(), Nanos::from_millis(10))
    }

    #[test]
    fn reserve_hands_out_distinct_slots() {
        let reg = Registry::new(4);
        let a = reg.reserve().unwrap();
        let b = reg.reserve().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(a.state.load(), TxnState::Reserved);
    }

    #[test]
    fn exhaustion_returns_none() {
        let reg = Registry::new(2);
        let a = reg.reserve().unwrap();
        let _b = reg.reserve().unwrap();
        assert!(reg.reserve().is_none());

        // Releasing one makes it reservable again, starting at Reserved.
        let wheel = wheel_for(&reg);
        reg.release(a, &wheel);
        let c = reg.reserve().unwrap();
        assert_eq!(c.state.load(), TxnState::Reserved);
    }

    #[test]
    fn emplace_keeps_only_the_receive_timestamp() {
        let reg = Registry::new(2);
        let wheel = wheel_for(&reg);
        let slot = reg.reserve().unwrap();
        {
            let mut body = slot.body.lock();
            body.ts.req_sent = Nanos(99);
            body.status = Some(ErrorKind::SendFailed);
        }
        assert!(reg.emplace(slot, Nanos(7)));
        {
            let body = slot.body.lock();
            assert_eq!(body.ts.req_recv, Nanos(7));
            assert_eq!(body.ts.req_sent, Nanos::ZERO);
            assert_eq!(body.status, None);
        }
        assert_eq!(slot.state.load(), TxnState::ReceivedFromApp);
        reg.release(slot, &wheel);
        assert_eq!(slot.state.load(), TxnState::Idle);
    }

    #[test]
    fn illegal_transitions_fail() {
        let reg = Registry::new(1);
        let slot = reg.reserve().unwrap();
        // Not in flight, so a receive cannot claim it.
        assert!(!slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseReceived));
        assert_eq!(slot.state.load(), TxnState::Reserved);
    }
}
