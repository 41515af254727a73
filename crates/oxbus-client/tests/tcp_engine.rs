//! End-to-end exercises of the transaction engine against real localhost
//! TCP listeners standing in for devices.

use std::{
    collections::HashSet,
    io::{Read, Write},
    net::{Ipv4Addr, SocketAddrV4, TcpListener},
    sync::mpsc,
    thread,
    time::{Duration, Instant},
};

use oxbus::{ErrorKind, ExceptionStatus};
use oxbus_client::{CompletionRecord, Engine, Nanos, StackConfig};

/// MBAP header + fc + address + quantity.
const READ_REQUEST_LEN: usize = 12;

fn engine_with_timeout(timeout_ms: u64) -> Engine {
    let mut cfg = StackConfig::default();
    cfg.response_timeout = Nanos::from_millis(timeout_ms);
    Engine::new(cfg).unwrap()
}

fn listen() -> (TcpListener, SocketAddrV4) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, SocketAddrV4::new(Ipv4Addr::LOCALHOST, port))
}

fn assert_timestamps_ordered(rec: &CompletionRecord) {
    let ts = rec.timestamps;
    assert!(ts.req_recv <= ts.req_sent, "recv {:?} > sent {:?}", ts.req_recv, ts.req_sent);
    assert!(ts.req_sent <= ts.resp_recv);
    assert!(ts.resp_recv <= ts.resp_sent);
}

#[test]
fn read_holding_registers_success() {
    let (listener, addr) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut req = [0u8; READ_REQUEST_LEN];
        stream.read_exact(&mut req).unwrap();
        assert_eq!(&req[7..], &[0x03, 0x00, 0x6B, 0x00, 0x03]);
        // Echo the wire transaction id, answer three registers.
        let resp = [
            req[0], req[1], 0x00, 0x00, 0x00, 0x09, 0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00,
            0x00, 0x64,
        ];
        stream.write_all(&resp).unwrap();
    });

    let engine = engine_with_timeout(1_000);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .read_holding_registers(ctx, 0x006B, 3, 0x0001, 0x11, 0, move |rec| {
            tx.send(rec).unwrap();
        })
        .unwrap();

    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rec.transaction_id, 0x0001);
    assert_eq!(rec.unit_id, 0x11);
    assert_eq!(rec.function_code, 3);
    assert_eq!(rec.exception_status, ExceptionStatus::None);
    assert_eq!(rec.exception_code, 0);
    assert_eq!(rec.data, vec![0x02, 0x2B, 0x00, 0x00, 0x00, 0x64]);
    assert_eq!(rec.start_address, 0x006B);
    assert_eq!(rec.quantity, 3);
    assert_timestamps_ordered(&rec);

    server.join().unwrap();
    engine.shutdown();
}

#[test]
fn protocol_exception_reaches_the_completion() {
    let (listener, addr) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut req = [0u8; READ_REQUEST_LEN];
        stream.read_exact(&mut req).unwrap();
        let resp = [req[0], req[1], 0x00, 0x00, 0x00, 0x03, 0x11, 0x83, 0x02];
        stream.write_all(&resp).unwrap();
    });

    let engine = engine_with_timeout(1_000);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .read_holding_registers(ctx, 0x006B, 3, 0x0002, 0x11, 0, move |rec| {
            tx.send(rec).unwrap();
        })
        .unwrap();

    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rec.function_code, 3);
    assert_eq!(rec.exception_status, ExceptionStatus::Exception);
    assert_eq!(rec.exception_code, 0x02);
    assert!(rec.data.is_empty());

    server.join().unwrap();
    engine.shutdown();
}

#[test]
fn silent_server_times_out() {
    const TIMEOUT_MS: u64 = 300;

    let (listener, addr) = listen();
    let (done_tx, done_rx) = mpsc::channel::<()>();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut req = [0u8; READ_REQUEST_LEN];
        stream.read_exact(&mut req).unwrap();
        // Hold the connection open without answering.
        let _ = done_rx.recv_timeout(Duration::from_secs(10));
    });

    let engine = engine_with_timeout(TIMEOUT_MS);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    let submitted = Instant::now();
    engine
        .read_holding_registers(ctx, 0x006B, 3, 0x0003, 0x11, 0, move |rec| {
            tx.send(rec).unwrap();
        })
        .unwrap();

    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let elapsed = submitted.elapsed();
    assert_eq!(rec.exception_status, ExceptionStatus::StackError);
    assert_eq!(rec.exception_code, ErrorKind::RecvTimeout.code());
    assert!(rec.data.is_empty());
    assert!(
        elapsed >= Duration::from_millis(TIMEOUT_MS),
        "retired after {elapsed:?}, deadline was {TIMEOUT_MS}ms"
    );
    assert_timestamps_ordered(&rec);

    done_tx.send(()).unwrap();
    server.join().unwrap();
    engine.shutdown();
}

#[test]
fn late_frame_after_timeout_is_dropped() {
    const TIMEOUT_MS: u64 = 200;

    let (listener, addr) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut req = [0u8; READ_REQUEST_LEN];
        stream.read_exact(&mut req).unwrap();
        // Answer well past the deadline.
        thread::sleep(Duration::from_millis(TIMEOUT_MS + 400));
        let resp = [
            req[0], req[1], 0x00, 0x00, 0x00, 0x09, 0x11, 0x03, 0x06, 0x02, 0x2B, 0x00, 0x00,
            0x00, 0x64,
        ];
        let _ = stream.write_all(&resp);
        // Give the reactor a moment to observe the late frame.
        thread::sleep(Duration::from_millis(200));
    });

    let engine = engine_with_timeout(TIMEOUT_MS);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .read_holding_registers(ctx, 0x006B, 3, 0x0004, 0x11, 0, move |rec| {
            tx.send(rec).unwrap();
        })
        .unwrap();

    // Exactly one completion, and it is the timeout.
    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rec.exception_status, ExceptionStatus::StackError);
    assert_eq!(rec.exception_code, ErrorKind::RecvTimeout.code());
    assert!(rx.recv_timeout(Duration::from_secs(1)).is_err(), "slot completed twice");

    server.join().unwrap();
    engine.shutdown();
}

#[test]
fn concurrent_submissions_all_complete_once() {
    const TOTAL: usize = 100;
    const SUBMITTERS: usize = 8;

    let (listener, addr) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut wire_tx_ids = HashSet::new();
        for _ in 0..TOTAL {
            let mut req = [0u8; READ_REQUEST_LEN];
            stream.read_exact(&mut req).unwrap();
            let wire_tx = u16::from_be_bytes([req[0], req[1]]);
            assert!(wire_tx_ids.insert(wire_tx), "duplicate wire transaction id {wire_tx}");
            let resp = [
                req[0], req[1], 0x00, 0x00, 0x00, 0x05, req[6], 0x03, 0x02, 0x00, 0x2A,
            ];
            stream.write_all(&resp).unwrap();
        }
        wire_tx_ids.len()
    });

    let engine = engine_with_timeout(5_000);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();

    thread::scope(|scope| {
        for submitter in 0..SUBMITTERS {
            let tx = tx.clone();
            let engine = &engine;
            scope.spawn(move || {
                for i in 0..TOTAL {
                    if i % SUBMITTERS != submitter {
                        continue;
                    }
                    let hint = i as u16;
                    let tx = tx.clone();
                    engine
                        .read_holding_registers(ctx, 0x0000, 1, hint, 0x11, 0, move |rec| {
                            tx.send(rec).unwrap();
                        })
                        .unwrap();
                }
            });
        }
    });
    drop(tx);

    let mut hints = HashSet::new();
    for _ in 0..TOTAL {
        let rec = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(rec.exception_status, ExceptionStatus::None);
        assert_eq!(rec.data, vec![0x00, 0x2A]);
        assert!(hints.insert(rec.transaction_id), "duplicate completion {}", rec.transaction_id);
    }
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err(), "more than {TOTAL} completions");
    assert_eq!(server.join().unwrap(), TOTAL);

    engine.shutdown();
}

#[test]
fn unreachable_device_fails_the_request() {
    // Bind then drop, so nothing listens on the port.
    let (listener, addr) = listen();
    drop(listener);

    let engine = engine_with_timeout(300);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .read_holding_registers(ctx, 0x0000, 1, 0x0005, 0x11, 0, move |rec| {
            tx.send(rec).unwrap();
        })
        .unwrap();

    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rec.exception_status, ExceptionStatus::StackError);
    assert_eq!(rec.exception_code, ErrorKind::ConnectFailed.code());

    engine.shutdown();
}

#[test]
fn unknown_context_is_rejected_synchronously() {
    let engine = engine_with_timeout(300);
    let err = engine
        .read_holding_registers(
            oxbus_client::ContextId(999),
            0,
            1,
            0,
            0x11,
            0,
            |_rec| {},
        )
        .unwrap_err();
    assert_eq!(err, ErrorKind::UnknownContext);
    engine.shutdown();
}

#[test]
fn invalid_parameters_consume_no_slot() {
    let (listener, addr) = listen();
    let engine = engine_with_timeout(300);
    let ctx = engine.open_tcp_context(addr).unwrap();

    let err = engine.read_holding_registers(ctx, 0, 0, 0, 0x11, 0, |_rec| {}).unwrap_err();
    assert_eq!(err, ErrorKind::InvalidInput);
    let err = engine.write_single_coil(ctx, 0, 0x1234, 0, 0x11, 0, |_rec| {}).unwrap_err();
    assert_eq!(err, ErrorKind::InvalidInput);

    drop(listener);
    engine.shutdown();
}

#[test]
fn write_single_coil_echo_roundtrip() {
    let (listener, addr) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut req = [0u8; READ_REQUEST_LEN];
        stream.read_exact(&mut req).unwrap();
        assert_eq!(&req[7..], &[0x05, 0x00, 0xAC, 0xFF, 0x00]);
        // A write echo mirrors the request bytes.
        stream.write_all(&req).unwrap();
    });

    let engine = engine_with_timeout(1_000);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .write_single_coil(ctx, 0x00AC, 0xFF00, 0x0006, 0x0A, 0, move |rec| {
            tx.send(rec).unwrap();
        })
        .unwrap();

    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rec.exception_status, ExceptionStatus::None);
    assert_eq!(rec.start_address, 0x00AC);
    assert_eq!(rec.data, vec![0xFF, 0x00]);

    server.join().unwrap();
    engine.shutdown();
}

#[test]
fn burst_of_pipelined_responses_completes_every_request() {
    // Both responses arrive in one segment; the reactor must carve two
    // frames out of a single readable burst.
    let (listener, addr) = listen();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut reqs = Vec::new();
        for _ in 0..2 {
            let mut req = [0u8; READ_REQUEST_LEN];
            stream.read_exact(&mut req).unwrap();
            reqs.push(req);
        }
        let mut burst = Vec::new();
        for req in &reqs {
            burst.extend_from_slice(&[
                req[0], req[1], 0x00, 0x00, 0x00, 0x05, req[6], 0x03, 0x02, 0x00, 0x01,
            ]);
        }
        stream.write_all(&burst).unwrap();
    });

    let engine = engine_with_timeout(2_000);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    for (hint, priority) in [(1u16, 1i64), (2, 9)] {
        let tx = tx.clone();
        engine
            .read_holding_registers(ctx, 0, 1, hint, 0x11, priority, move |rec| {
                tx.send(rec).unwrap();
            })
            .unwrap();
    }

    let mut seen = HashSet::new();
    for _ in 0..2 {
        let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(rec.exception_status, ExceptionStatus::None);
        assert_eq!(rec.data, vec![0x00, 0x01]);
        seen.insert(rec.transaction_id);
    }
    assert_eq!(seen, HashSet::from([1u16, 2]));

    server.join().unwrap();
    engine.shutdown();
}

#[test]
fn read_coils_over_the_wire() {
    let (listener, addr) = listen();
    let engine = engine_with_timeout(1_000);
    let ctx = engine.open_tcp_context(addr).unwrap();
    let (tx, rx) = mpsc::channel();
    engine
        .read_coils(ctx, 0x0013, 10, 0x0007, 0x11, 0, move |rec| {
            let _ = tx.send(rec);
        })
        .unwrap();

    let (mut stream, _) = listener.accept().unwrap();
    let mut req = [0u8; READ_REQUEST_LEN];
    stream.read_exact(&mut req).unwrap();
    assert_eq!(req[7], 0x01);
    let resp = [req[0], req[1], 0x00, 0x00, 0x00, 0x05, req[6], 0x01, 0x02, 0xCD, 0x01];
    stream.write_all(&resp).unwrap();

    let rec = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(rec.exception_status, ExceptionStatus::None);
    assert_eq!(rec.data, vec![0xCD, 0x01]);
    engine.shutdown();
}
