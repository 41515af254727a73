//! The RTU carrier writer: one thread per port. Serial has no wire
//! transaction id and no receive multiplexing; correlation is positional
//! with exactly one outstanding request, so the writer itself performs
//! the two-phase response read after every send.

use std::{ffi::CString, io, os::fd::RawFd, sync::Arc, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use oxbus::{ErrorKind, MAX_ADU_LEN};
use tracing::{debug, warn};

use crate::{
    config::{Parity, SerialParams},
    engine::EngineShared,
    registry::{Slot, TxnState},
    timing::{Nanos, sleep_micros},
};

const RECV_POLL: Duration = Duration::from_millis(100);
/// Unit id, function code, and the length-or-exception byte.
const RESPONSE_HEADER_LEN: usize = 3;

/// Outcome of one response read on the line.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ReadOutcome {
    /// A complete frame of this many bytes.
    Frame(usize),
    /// Nothing arrived before the readiness wait gave up.
    TimedOut,
    /// Short frame, peer close, or a read error.
    Failed,
}

struct SerialLink {
    fd: RawFd,
    /// Baud-rate-derived inter-frame silence, microseconds.
    computed_delay_us: u64,
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
        }
    }
}

pub(crate) struct SerialCarrier {
    params: SerialParams,
    link: Option<SerialLink>,
}

impl SerialCarrier {
    pub fn new(params: SerialParams) -> Self {
        Self { params, link: None }
    }

    fn ensure_open(&mut self) -> Result<(RawFd, u64), ErrorKind> {
        if self.link.is_none() {
            self.link = Some(open_port(&self.params)?);
        }
        let link = self.link.as_ref().ok_or(ErrorKind::SerialPortError)?;
        Ok((link.fd, link.computed_delay_us))
    }
}

/// Rates at or below 19200 get the classic 3.5-character silence scaled
/// from the baud rate; faster lines use a fixed floor.
fn interframe_delay_us(baud: u32) -> u64 {
    if baud <= 19_200 { 38_500_000 / u64::from(baud) } else { 1_750 }
}

fn baud_to_speed(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        110 => libc::B110,
        300 => libc::B300,
        600 => libc::B600,
        1_200 => libc::B1200,
        2_400 => libc::B2400,
        4_800 => libc::B4800,
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        460_800 => libc::B460800,
        500_000 => libc::B500000,
        576_000 => libc::B576000,
        921_600 => libc::B921600,
        1_000_000 => libc::B1000000,
        1_152_000 => libc::B1152000,
        1_500_000 => libc::B1500000,
        2_500_000 => libc::B2500000,
        3_000_000 => libc::B3000000,
        3_500_000 => libc::B3500000,
        4_000_000 => libc::B4000000,
        _ => return None,
    })
}

/// Opens and configures the port: 8 data bits, raw non-canonical I/O,
/// stop bits and parity flags derived from the parity choice.
fn open_port(params: &SerialParams) -> Result<SerialLink, ErrorKind> {
    let speed = match baud_to_speed(params.baud) {
        Some(speed) => speed,
        None => {
            warn!(baud = params.baud, "unsupported baud rate");
            return Err(ErrorKind::InvalidBaudRate);
        }
    };
    let path = CString::new(params.port_name.as_str()).map_err(|_| ErrorKind::SerialPortError)?;
    let fd = unsafe {
        libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NOCTTY | libc::O_NDELAY | libc::O_EXCL)
    };
    if fd < 0 {
        warn!(port = %params.port_name, "open failed: {}", io::Error::last_os_error());
        return Err(ErrorKind::SerialPortError);
    }
    // From here the link owns the fd; any early return closes it.
    let link = SerialLink { fd, computed_delay_us: interframe_delay_us(params.baud) };

    let mut tios: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tios) } != 0 {
        warn!(port = %params.port_name, "tcgetattr failed: {}", io::Error::last_os_error());
        return Err(ErrorKind::SerialPortError);
    }
    if unsafe { libc::cfsetispeed(&mut tios, speed) } < 0
        || unsafe { libc::cfsetospeed(&mut tios, speed) } < 0
    {
        return Err(ErrorKind::SerialPortError);
    }

    tios.c_cflag |= libc::CREAD | libc::CLOCAL;
    tios.c_cflag &= !libc::CSIZE;
    tios.c_cflag |= libc::CS8;

    match params.parity {
        Parity::None => {
            tios.c_cflag &= !(libc::PARENB | libc::PARODD);
            // Second stop bit in place of parity keeps the 11-bit
            // character.
            tios.c_cflag |= libc::CSTOPB;
        }
        Parity::Even => {
            tios.c_cflag |= libc::PARENB;
            tios.c_cflag &= !libc::PARODD;
            tios.c_cflag &= !libc::CSTOPB;
        }
        Parity::Odd => {
            tios.c_cflag |= libc::PARENB | libc::PARODD;
            tios.c_cflag &= !libc::CSTOPB;
        }
    }

    tios.c_lflag &= !(libc::ICANON | libc::ECHO | libc::ECHOE | libc::ISIG);
    if params.parity == Parity::None {
        tios.c_iflag &= !libc::INPCK;
    } else {
        tios.c_iflag |= libc::INPCK;
    }
    tios.c_iflag &= !(libc::IGNBRK
        | libc::BRKINT
        | libc::PARMRK
        | libc::ISTRIP
        | libc::INLCR
        | libc::IGNCR
        | libc::ICRNL);
    tios.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
    tios.c_oflag &= !libc::OPOST;
    // Non-blocking open; reads are gated by poll, not VMIN/VTIME.
    tios.c_cc[libc::VMIN] = 0;
    tios.c_cc[libc::VTIME] = 0;

    if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &tios) } < 0 {
        warn!(port = %params.port_name, "tcsetattr failed: {}", io::Error::last_os_error());
        return Err(ErrorKind::SerialPortError);
    }
    Ok(link)
}

fn wait_readable(fd: RawFd, timeout: Nanos) -> libc::c_int {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let timeout_ms = timeout.as_millis_u64().max(1) as libc::c_int;
    unsafe { libc::poll(&mut pfd, 1, timeout_ms) }
}

/// Two-phase response read.
///
/// Phase 1 gathers exactly three header bytes; the phase switch happens
/// only once all three are in, so a burst split inside the header can
/// never misread the exception bit. Phase 2 reads two trailer bytes for
/// an exception frame, or `length + 2` bytes for a data frame.
pub(crate) fn read_response(fd: RawFd, timeout: Nanos, buf: &mut [u8; MAX_ADU_LEN]) -> ReadOutcome {
    let mut total: usize = 0;
    let mut to_read: usize = RESPONSE_HEADER_LEN;
    let mut header_done = false;
    let mut wait_expired = false;

    while to_read > 0 {
        let ready = wait_readable(fd, timeout);
        if ready == 0 {
            wait_expired = true;
            break;
        }
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            warn!(?err, "serial poll failed");
            return ReadOutcome::Failed;
        }

        let n = unsafe { libc::read(fd, buf.as_mut_ptr().add(total).cast(), to_read) };
        if n == 0 {
            break;
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => continue,
                _ => {
                    warn!(?err, "serial read failed");
                    return ReadOutcome::Failed;
                }
            }
        }
        total += n as usize;
        to_read -= n as usize;

        if total > RESPONSE_HEADER_LEN - 1 && !header_done {
            header_done = true;
            if buf[1] & 0x80 != 0 {
                // Exception frame: only the CRC trailer follows.
                to_read = 2;
            } else {
                let rest = usize::from(buf[2]) + 2;
                if RESPONSE_HEADER_LEN + rest > MAX_ADU_LEN {
                    return ReadOutcome::Failed;
                }
                to_read = rest;
            }
        }
    }

    if to_read == 0 {
        ReadOutcome::Frame(total)
    } else if total == 0 && wait_expired {
        ReadOutcome::TimedOut
    } else {
        ReadOutcome::Failed
    }
}

pub(crate) fn writer_loop(shared: Arc<EngineShared>, params: SerialParams, work: Receiver<u16>) {
    crate::thread::thread_boot(shared.config.scheduler, shared.config.priority);
    let mut carrier = SerialCarrier::new(params);

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
}

fn process(shared: &EngineShared, carrier: &mut SerialCarrier, slot: &Slot) {
    let (frame, len) = {
        let body = slot.body.lock();
        (body.tx_buf, body.tx_len)
    };

    let (fd, computed_delay_us) = match carrier.ensure_open() {
        Ok(v) => v,
        Err(kind) => return shared.fail_slot(slot, kind),
    };

    unsafe { libc::tcflush(fd, libc::TCIOFLUSH) };
    // Frame silence between consecutive packets on the shared line.
    sleep_micros(carrier.params.inter_frame_delay.as_micros_u64() + computed_delay_us);

    let written = unsafe { libc::write(fd, frame.as_ptr().cast(), len) };
    if written != len as isize {
        warn!(written, wanted = len, "serial write failed");
        return shared.fail_slot(slot, ErrorKind::SendFailed);
    }
    slot.body.lock().ts.req_sent = Nanos::now();

    if !slot.state.transition(TxnState::ReceivedFromApp, TxnState::SentOnNetwork) {
        warn!(id = slot.id, "slot left the send path before going on the wire");
        return;
    }

    let mut rx = [0u8; MAX_ADU_LEN];
    match read_response(fd, carrier.params.response_timeout, &mut rx) {
        ReadOutcome::Frame(n) => {
            if slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseReceived) {
                let mut body = slot.body.lock();
                body.rx_buf[..n].copy_from_slice(&rx[..n]);
                body.rx_len = n;
                body.ts.resp_recv = Nanos::now();
                let priority = body.priority;
                drop(body);
                shared.resp_q.push(priority, slot.id);
            }
        }
        ReadOutcome::TimedOut => {
            if slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseTimedOut) {
                let mut body = slot.body.lock();
                body.status = Some(ErrorKind::RecvTimeout);
                body.rx_len = 0;
                body.ts.resp_recv = Nanos::now();
                let priority = body.priority;
                drop(body);
                shared.resp_q.push(priority, slot.id);
            }
        }
        ReadOutcome::Failed => {
            if slot.state.transition(TxnState::SentOnNetwork, TxnState::ResponseError) {
                let mut body = slot.body.lock();
                body.status = Some(ErrorKind::RecvFailed);
                body.rx_len = 0;
                body.ts.resp_recv = Nanos::now();
                let priority = body.priority;
                drop(body);
                shared.resp_q.push(priority, slot.id);
            }
        }
    }
    debug!(id = slot.id, "serial transaction settled");
}

#[cfg(test)]
mod tests {
    use std::{thread, time::Duration};

    use super::*;
    use oxbus::crc16;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn close(fd: RawFd) {
        unsafe { libc::close(fd) };
    }

    fn write_all(fd: RawFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n, bytes.len() as isize);
    }

    fn data_frame() -> Vec<u8> {
        let mut frame = vec![0x0A, 0x03, 0x04, 0x00, 0x2A, 0x01, 0x17];
        let trailer = crc16(&frame);
        frame.extend_from_slice(&trailer);
        frame
    }

    #[test]
    fn reads_a_complete_data_frame() {
        let (r, w) = pipe();
        let frame = data_frame();
        write_all(w, &frame);

        let mut buf = [0u8; MAX_ADU_LEN];
        let outcome = read_response(r, Nanos::from_millis(200), &mut buf);
        assert_eq!(outcome, ReadOutcome::Frame(frame.len()));
        assert_eq!(&buf[..frame.len()], frame.as_slice());
        close(r);
        close(w);
    }

    #[test]
    fn reads_an_exception_frame() {
        let (r, w) = pipe();
        let mut frame = vec![0x0A, 0x85, 0x03];
        let trailer = crc16(&frame);
        frame.extend_from_slice(&trailer);
        write_all(w, &frame);

        let mut buf = [0u8; MAX_ADU_LEN];
        assert_eq!(read_response(r, Nanos::from_millis(200), &mut buf), ReadOutcome::Frame(5));
        assert_eq!(buf[1], 0x85);
        close(r);
        close(w);
    }

    #[test]
    fn header_split_across_bursts_is_reassembled() {
        let (r, w) = pipe();
        let frame = data_frame();
        let head = frame[..2].to_vec();
        let tail = frame[2..].to_vec();

        write_all(w, &head);
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            write_all(w, &tail);
            w
        });

        let mut buf = [0u8; MAX_ADU_LEN];
        let outcome = read_response(r, Nanos::from_millis(500), &mut buf);
        assert_eq!(outcome, ReadOutcome::Frame(frame.len()));
        assert_eq!(&buf[..frame.len()], frame.as_slice());

        close(writer.join().unwrap());
        close(r);
    }

    #[test]
    fn empty_line_times_out() {
        let (r, w) = pipe();
        let mut buf = [0u8; MAX_ADU_LEN];
        assert_eq!(read_response(r, Nanos::from_millis(20), &mut buf), ReadOutcome::TimedOut);
        close(r);
        close(w);
    }

    #[test]
    fn peer_close_mid_frame_fails() {
        let (r, w) = pipe();
        write_all(w, &[0x0A, 0x03]);
        close(w);
        let mut buf = [0u8; MAX_ADU_LEN];
        assert_eq!(read_response(r, Nanos::from_millis(100), &mut buf), ReadOutcome::Failed);
        close(r);
    }

    #[test]
    fn delay_tracks_baud_rate() {
        assert_eq!(interframe_delay_us(9_600), 38_500_000 / 9_600);
        assert_eq!(interframe_delay_us(19_200), 38_500_000 / 19_200);
        assert_eq!(interframe_delay_us(115_200), 1_750);
    }
}
