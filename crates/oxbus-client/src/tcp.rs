//! The TCP carrier writer: one thread per device owning the socket and
//! its connect state machine, draining the per-carrier work queue in
//! FIFO order. Receive multiplexing lives in the reactor; the writer only
//! registers its socket there.

use std::{io, mem, net::SocketAddrV4, os::fd::RawFd, sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use oxbus::ErrorKind;
use tracing::{debug, warn};

use crate::{
    engine::EngineShared,
    registry::{Slot, TxnState},
    timing::{Nanos, sleep_micros},
};

const MAX_CONNECT_RETRIES: u32 = 5;
const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConnectState {
    NotConnected,
    InProgress,
    Connected,
    Failed,
}

pub(crate) struct TcpCarrier {
    addr: SocketAddrV4,
    fd: RawFd,
    state: ConnectState,
    retry_count: u32,
    registered: bool,
    reactor_index: usize,
    response_timeout: Nanos,
}

impl TcpCarrier {
    pub fn new(addr: SocketAddrV4, response_timeout: Nanos) -> Self {
        Self {
            addr,
            fd: -1,
            state: ConnectState::NotConnected,
            retry_count: 0,
            registered: false,
            reactor_index: 0,
            response_timeout,
        }
    }

    /// Drives the connection to `Connected` and the socket into the
    /// reactor. Each call makes at most one connect attempt; an
    /// in-progress connect gets one writability wait.
    fn ensure_ready(&mut self, shared: &EngineShared) -> Result<(), ErrorKind> {
        if self.fd < 0 || self.state == ConnectState::Failed {
            self.open_socket()?;
        }
        if self.state == ConnectState::NotConnected {
            self.start_connect()?;
        }
        if self.state == ConnectState::InProgress {
            self.await_connect(shared)?;
        }
        if !self.registered {
            match shared.reactor.add(self.fd) {
                Ok(index) => {
                    self.reactor_index = index;
                    self.registered = true;
                }
                Err(err) => {
                    warn!(?err, addr = %self.addr, "reactor registration failed");
                    self.teardown(shared);
                    return Err(ErrorKind::SocketFailed);
                }
            }
        }
        Ok(())
    }

    fn open_socket(&mut self) -> Result<(), ErrorKind> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            warn!("socket creation failed: {}", io::Error::last_os_error());
            return Err(ErrorKind::SocketFailed);
        }
        self.fd = fd;
        self.state = ConnectState::NotConnected;
        self.retry_count = 0;
        self.registered = false;

        let one: libc::c_int = 1;
        unsafe {
            if libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                (&raw const one).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                warn!("setsockopt(TCP_NODELAY) failed: {}", io::Error::last_os_error());
            }
            if libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&raw const one).cast(),
                mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                warn!("setsockopt(SO_REUSEADDR) failed: {}", io::Error::last_os_error());
            }
            let flags = libc::fcntl(fd, libc::F_GETFL);
            libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
        Ok(())
    }

    fn start_connect(&mut self) -> Result<(), ErrorKind> {
        let sa = sockaddr_v4(self.addr);
        let rc = unsafe {
            libc::connect(
                self.fd,
                (&raw const sa).cast(),
                mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc == 0 {
            self.state = ConnectState::Connected;
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            self.state = ConnectState::InProgress;
            return Ok(());
        }
        warn!(?err, addr = %self.addr, "connect failed");
        self.close();
        Err(ErrorKind::ConnectFailed)
    }

    fn await_connect(&mut self, shared: &EngineShared) -> Result<(), ErrorKind> {
        self.retry_count += 1;
        if self.retry_count > MAX_CONNECT_RETRIES {
            debug!(addr = %self.addr, "connect still in progress, retries exhausted");
            self.teardown(shared);
            return Err(ErrorKind::ConnectFailed);
        }

        let mut pfd = libc::pollfd { fd: self.fd, events: libc::POLLOUT, revents: 0 };
        let timeout_ms = self.response_timeout.as_millis_u64().max(1) as libc::c_int;
        let ready = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if ready == 0 {
            // Still in progress; the grace window spans requests until
            // the retry budget runs out.
            return Err(ErrorKind::ConnectFailed);
        }
        if ready < 0 {
            self.teardown(shared);
            return Err(ErrorKind::ConnectFailed);
        }

        let mut so_error: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_ERROR,
                (&raw mut so_error).cast(),
                &mut len,
            )
        };
        if rc != 0 || so_error != 0 {
            debug!(so_error, addr = %self.addr, "deferred connect failed");
            self.teardown(shared);
            return Err(ErrorKind::ConnectFailed);
        }
        self.state = ConnectState::Connected;
        Ok(())
    }

    /// All-or-nothing send; the protocol has no continuation for a short
    /// write.
    fn send_all(&mut self, shared: &EngineShared, frame: &[u8]) -> Result<(), ErrorKind> {
        let n = unsafe { libc::send(self.fd, frame.as_ptr().cast(), frame.len(), libc::MSG_NOSIGNAL) };
        if n == frame.len() as isize {
            return Ok(());
        }
        if n < 0 {
            warn!(addr = %self.addr, "send failed: {}", io::Error::last_os_error());
        } else {
            warn!(addr = %self.addr, sent = n, wanted = frame.len(), "short write");
        }
        self.teardown(shared);
        Err(ErrorKind::SendFailed)
    }

    /// Deregisters from the reactor and closes the socket; the next
    /// request re-opens from scratch.
    fn teardown(&mut self, shared: &EngineShared) {
        if self.registered {
            shared.reactor.remove(self.reactor_index);
            self.registered = false;
        }
        self.close();
        self.state = ConnectState::Failed;
    }

    fn close(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
        self.fd = -1;
        self.retry_count = 0;
    }
}

impl Drop for TcpCarrier {
    fn drop(&mut self) {
        self.close();
    }
}

fn sockaddr_v4(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr { s_addr: u32::from_ne_bytes(addr.ip().octets()) },
        sin_zero: [0; 8],
    }
}

pub(crate) fn writer_loop(shared: Arc<EngineShared>, addr: SocketAddrV4, work: Receiver<u16>) {
    crate::thread::thread_boot(shared.config.scheduler, shared.config.priority);
    let mut carrier = TcpCarrier::new(addr, shared.config.response_timeout);

    loop {
        match work.recv_timeout(RECV_POLL) {
            Ok(id) => {
                if let Some(slot) = shared.registry.get(id) {
                    process(&shared, &mut carrier, slot);
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.is_shutdown() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    carrier.teardown(&shared);
}

fn process(shared: &EngineShared, carrier: &mut TcpCarrier, slot: &Slot) {
    let (frame, len) = {
        let body = slot.body.lock();
        (body.tx_buf, body.tx_len)
    };

    if let Err(kind) = carrier.ensure_ready(shared) {
        return shared.fail_slot(slot, kind);
    }

    // Pace consecutive sends so a slow device can keep up.
    sleep_micros(shared.config.inter_frame_delay.as_micros_u64());
    slot.body.lock().ts.req_sent = Nanos::now();

    match carrier.send_all(shared, &frame[..len]) {
        Ok(()) => {
            if slot.state.transition(TxnState::ReceivedFromApp, TxnState::SentOnNetwork) {
                shared.wheel.insert(slot.id);
            } else {
                warn!(id = slot.id, "slot left the send path before going on the wire");
            }
        }
        Err(kind) => shared.fail_slot(slot, kind),
    }
}
