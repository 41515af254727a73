//! The TCP receive reactor: one thread multiplexing readiness over every
//! device socket, assembling header-then-body frames per socket and
//! correlating complete frames back to in-flight slots by wire
//! transaction id.
//!
//! Sockets register and deregister dynamically, keyed by table index =
//! poll token. The table mutex is held across the whole readiness scan,
//! so a writer registering a fresh socket waits at most one cycle.

use std::{
    io,
    os::fd::RawFd,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use mio::{Events, Interest, Poll, Token, unix::SourceFd};
use oxbus::{MAX_ADU_LEN, MBAP_HEADER_LEN};
use tracing::{debug, warn};

use crate::{
    engine::EngineShared,
    queue::lock_recover,
    registry::TxnState,
    timing::Nanos,
};

/// Sockets the reactor can watch at once.
pub(crate) const MAX_DEVICES: usize = 64;
const POLL_TIMEOUT: Duration = Duration::from_millis(100);
/// Fixed prefix read before the length field can be parsed: transaction
/// id, protocol id and length. The unit id is counted by the length
/// field itself.
const FRAME_PREFIX_LEN: usize = MBAP_HEADER_LEN - 1;

/// Per-socket frame assembly state.
struct RxEntry {
    fd: RawFd,
    /// Parsed value of the MBAP length field, 0 until known.
    frame_len: usize,
    bytes_read: usize,
    buf: [u8; MAX_ADU_LEN],
}

impl RxEntry {
    fn new(fd: RawFd) -> Self {
        Self { fd, frame_len: 0, bytes_read: 0, buf: [0; MAX_ADU_LEN] }
    }

    fn reset_assembly(&mut self) {
        self.frame_len = 0;
        self.bytes_read = 0;
    }
}

enum SocketProgress {
    /// Drained; keep the registration.
    Keep,
    /// Peer closed or the read failed; drop the registration.
    Disconnect,
}

pub(crate) struct ReactorShared {
    poll_registry: mio::Registry,
    table: Mutex<Vec<Option<RxEntry>>>,
    /// Frames whose (tx id, unit id) matched nothing in flight.
    pub mismatched_frames: AtomicU64,
}

impl ReactorShared {
    pub fn new(poll_registry: mio::Registry) -> Self {
        let mut table = Vec::with_capacity(MAX_DEVICES);
        table.resize_with(MAX_DEVICES, || None);
        Self { poll_registry, table: Mutex::new(table), mismatched_frames: AtomicU64::new(0) }
    }

    /// Registers a socket for readable events. Idempotent per fd; returns
    /// the table index the carrier keeps as its back-reference.
    pub fn add(&self, fd: RawFd) -> io::Result<usize> {
        let mut table = lock_recover(&self.table);
        if let Some(i) = table.iter().position(|e| e.as_ref().is_some_and(|e| e.fd == fd)) {
            return Ok(i);
        }
        let Some(free) = table.iter().position(Option::is_none) else {
            return Err(io::Error::other("reactor table full"));
        };
        self.poll_registry.register(&mut SourceFd(&fd), Token(free), Interest::READABLE)?;
        table[free] = Some(RxEntry::new(fd));
        Ok(free)
    }

    /// Drops a registration. The socket itself belongs to its writer.
    pub fn remove(&self, index: usize) {
        let mut table = lock_recover(&self.table);
        Self::remove_locked(&self.poll_registry, &mut table, index);
    }

    fn remove_locked(registry: &mio::Registry, table: &mut [Option<RxEntry>], index: usize) {
        if let Some(entry) = table.get_mut(index).and_then(Option::take) {
            if let Err(err) = registry.deregister(&mut SourceFd(&entry.fd)) {
                debug!(?err, "reactor deregister");
            }
        }
    }
}

pub(crate) fn reactor_loop(shared: Arc<EngineShared>, mut poll: Poll) {
    crate::thread::thread_boot(shared.config.scheduler, shared.config.priority);
    let mut events = Events::with_capacity(MAX_DEVICES);

    while !shared.is_shutdown() {
        if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(?err, "reactor poll failed");
            std::thread::sleep(POLL_TIMEOUT);
            continue;
        }

        // One mutex span for the whole scan keeps add/remove serial with
        // it.
        let mut table = lock_recover(&shared.reactor.table);
        for event in events.iter() {
            let index = event.token().0;
            match drain_socket(&shared, &mut table, index) {
                SocketProgress::Keep => {}
                SocketProgress::Disconnect => {
                    if let Some(fd) =
                        table.get(index).and_then(|e| e.as_ref().map(|e| e.fd))
                    {
                        // Poison the fd so the writer's next send fails
                        // fast and re-opens.
                        unsafe { libc::shutdown(fd, libc::SHUT_RDWR) };
                    }
                    ReactorShared::remove_locked(&shared.reactor.poll_registry, &mut table, index);
                }
            }
        }
    }
}

/// Reads as much as the socket will give, delivering every complete
/// frame. Readiness is edge-triggered, so this must run to `WouldBlock`.
fn drain_socket(
    shared: &EngineShared,
    table: &mut [Option<RxEntry>],
    index: usize,
) -> SocketProgress {
    let Some(entry) = table.get_mut(index).and_then(Option::as_mut) else {
        return SocketProgress::Keep;
    };

    loop {
        let target = if entry.bytes_read < FRAME_PREFIX_LEN {
            FRAME_PREFIX_LEN
        } else {
            FRAME_PREFIX_LEN + entry.frame_len
        };
        let want = target - entry.bytes_read;

        let n = unsafe {
            libc::recv(
                entry.fd,
                entry.buf.as_mut_ptr().add(entry.bytes_read).cast(),
                want,
                0,
            )
        };
        if n == 0 {
            debug!(index, "peer closed");
            return SocketProgress::Disconnect;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => SocketProgress::Keep,
                io::ErrorKind::Interrupted => continue,
                _ => {
                    warn!(?err, index, "socket recv failed");
                    SocketProgress::Disconnect
                }
            };
        }
        entry.bytes_read += n as usize;

        if entry.bytes_read == FRAME_PREFIX_LEN && entry.frame_len == 0 {
            let len = usize::from(u16::from_be_bytes([entry.buf[4], entry.buf[5]]));
            if len < 2 || FRAME_PREFIX_LEN + len > MAX_ADU_LEN {
                warn!(len, index, "unframeable length field");
                return SocketProgress::Disconnect;
            }
            entry.frame_len = len;
        }

        if entry.frame_len != 0 && entry.bytes_read == FRAME_PREFIX_LEN + entry.frame_len {
            deliver_frame(shared, &entry.buf[..entry.bytes_read]);
            entry.reset_assembly();
        }
    }
}

/// Correlates a complete frame to its in-flight slot. A frame whose
/// transaction id or unit id matches nothing in `SentOnNetwork` is
/// dropped without touching any slot: the request already timed out or
/// was never issued.
fn deliver_frame(shared: &EngineShared, frame: &[u8]) {
    let tx_id = u16::from_be_bytes([frame[0], frame[1]]);
    let unit_id = frame[6];

    let Some(slot) = shared.registry.get(tx_id) else {
        shared.reactor.mismatched_frames.fetch_add(1, Ordering::Relaxed);
        debug!(tx_id, unit_id, "frame for unknown transaction");
        return;
    };

    let mut body = slot.body.lock();
    if body.unit_id != unit_id {
        shared.reactor.mismatched_frames.fetch_add(1, Ordering::Relaxed);
        debug!(tx_id, unit_id, expected = body.unit_id, "unit id mismatch");
        return;
    }
    if !slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseReceived) {
        debug!(tx_id, "late frame for settled slot");
        return;
    }
    body.rx_buf[..frame.len()].copy_from_slice(frame);
    body.rx_len = frame.len();
    body.ts.resp_recv = Nanos::now();
    let priority = body.priority;
    drop(body);

    shared.resp_q.push(priority, slot.id);
}
