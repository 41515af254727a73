//! The engine handle: every former process-wide singleton (configuration,
//! registry, reactor table, timeout wheel, response queue, shutdown flag)
//! packed behind explicit `new`/`shutdown`, so several engines can
//! coexist in one process.

use std::{
    net::SocketAddrV4,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{Builder, JoinHandle},
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use mio::Poll;
use oxbus::{ErrorKind, FunctionCode, Transport, build_rtu_adu, build_tcp_adu, pdu};
use tracing::{info, warn};

use crate::{
    completion::{Completion, CompletionRecord, Endpoint},
    config::{SerialParams, StackConfig},
    context::{CarrierHandle, ContextId, ContextRegistry},
    dispatch, queue::RespQueue,
    reactor::{self, ReactorShared},
    registry::{Registry, Slot, TxnState},
    serial, tcp,
    thread::thread_boot,
    timing::{Nanos, monotonic_ns, sleep_until_monotonic_ns},
    wheel::{TICK_MS, TimeoutWheel},
};

const TICK_QUEUE_DEPTH: usize = 1_024;
const RETIRE_POLL: Duration = Duration::from_millis(100);

pub(crate) struct EngineShared {
    pub config: StackConfig,
    pub registry: Registry,
    pub wheel: TimeoutWheel,
    pub resp_q: RespQueue,
    pub reactor: ReactorShared,
    pub contexts: ContextRegistry,
    shutdown: AtomicBool,
}

impl EngineShared {
    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Fails a request that never made it onto the wire: records the
    /// kind, moves the slot to its terminal state and hands it to the
    /// dispatcher.
    pub fn fail_slot(&self, slot: &Slot, kind: ErrorKind) {
        let priority = {
            let mut body = slot.body.lock();
            body.status = Some(kind);
            body.priority
        };
        if slot.state.transition(TxnState::ReceivedFromApp, TxnState::ResponseError) {
            self.resp_q.push(priority, slot.id);
        } else {
            warn!(id = slot.id, ?kind, "slot already settled while failing it");
        }
    }
}

/// A running transaction engine.
///
/// Submission methods are callable from any thread. Dropping the engine
/// shuts it down: carrier queues close and their writers join first, then
/// the core threads in reverse start order.
pub struct Engine {
    shared: Arc<EngineShared>,
    /// Core threads in start order: dispatcher, timer, retirer, reactor.
    core_threads: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn new(config: StackConfig) -> Result<Self, ErrorKind> {
        config.validate()?;

        let poll = Poll::new().map_err(|err| {
            warn!(?err, "couldn't create the readiness poller");
            ErrorKind::SocketFailed
        })?;
        let poll_registry = poll.registry().try_clone().map_err(|err| {
            warn!(?err, "couldn't clone the poll registry");
            ErrorKind::SocketFailed
        })?;

        let shared = Arc::new(EngineShared {
            registry: Registry::new(config.max_requests),
            wheel: TimeoutWheel::new(config.max_requests, config.response_timeout),
            resp_q: RespQueue::default(),
            reactor: ReactorShared::new(poll_registry),
            contexts: ContextRegistry::default(),
            shutdown: AtomicBool::new(false),
            config,
        });

        let (tick_tx, tick_rx) = bounded::<usize>(TICK_QUEUE_DEPTH);
        let mut core_threads = Vec::with_capacity(4);

        let s = Arc::clone(&shared);
        core_threads.push(spawn_named("oxbus-dispatch", move || dispatch::dispatcher_loop(s))?);
        let s = Arc::clone(&shared);
        core_threads.push(spawn_named("oxbus-timer", move || timer_loop(&s, &tick_tx))?);
        let s = Arc::clone(&shared);
        core_threads.push(spawn_named("oxbus-retire", move || retire_loop(&s, &tick_rx))?);
        let s = Arc::clone(&shared);
        core_threads.push(spawn_named("oxbus-reactor", move || reactor::reactor_loop(s, poll))?);

        info!(
            slots = shared.registry.len(),
            wheel = shared.wheel.len(),
            timeout_ticks = shared.wheel.timeout_ticks(),
            "transaction engine started"
        );
        Ok(Self { shared, core_threads })
    }

    pub fn config(&self) -> &StackConfig {
        &self.shared.config
    }

    /// Frames the reactor observed that matched no in-flight request.
    pub fn mismatched_frames(&self) -> u64 {
        self.shared.reactor.mismatched_frames.load(Ordering::Relaxed)
    }

    /// Opens a carrier to one TCP device and returns the id submissions
    /// route through.
    pub fn open_tcp_context(&self, addr: SocketAddrV4) -> Result<ContextId, ErrorKind> {
        let (sender, work) = bounded::<u16>(self.shared.config.max_requests);
        let shared = Arc::clone(&self.shared);
        let join = Builder::new()
            .name(format!("oxbus-tcp-{}", addr.port()))
            .spawn(move || tcp::writer_loop(shared, addr, work))
            .map_err(|err| {
                warn!(?err, "couldn't spawn tcp writer");
                ErrorKind::ThreadCreate
            })?;
        Ok(self.shared.contexts.insert(CarrierHandle {
            sender,
            join: Some(join),
            transport: Transport::Tcp,
            endpoint: Endpoint::Tcp(addr),
        }))
    }

    /// Opens a carrier to one RTU serial port. The port itself is opened
    /// lazily on the first submission.
    pub fn open_rtu_context(&self, params: SerialParams) -> Result<ContextId, ErrorKind> {
        let (sender, work) = bounded::<u16>(self.shared.config.max_requests);
        let shared = Arc::clone(&self.shared);
        let join = Builder::new()
            .name("oxbus-rtu".to_string())
            .spawn(move || serial::writer_loop(shared, params, work))
            .map_err(|err| {
                warn!(?err, "couldn't spawn serial writer");
                ErrorKind::ThreadCreate
            })?;
        Ok(self.shared.contexts.insert(CarrierHandle {
            sender,
            join: Some(join),
            transport: Transport::Rtu,
            endpoint: Endpoint::Serial { unit_id: 0 },
        }))
    }

    /// Closes a carrier: the work queue drops and the writer joins.
    /// In-flight requests on it still complete through timeout or the
    /// already-registered socket.
    pub fn remove_context(&self, id: ContextId) -> Result<(), ErrorKind> {
        let handle = self.shared.contexts.take(id).ok_or(ErrorKind::UnknownContext)?;
        let CarrierHandle { sender, join, .. } = handle;
        drop(sender);
        if let Some(join) = join {
            let _ = join.join();
        }
        Ok(())
    }

    /// Stops every thread and tears the engine down. Also runs on drop.
    pub fn shutdown(mut self) {
        self.do_shutdown();
    }

    fn do_shutdown(&mut self) {
        for handle in self.shared.contexts.drain() {
            let CarrierHandle { sender, join, .. } = handle;
            drop(sender);
            if let Some(join) = join {
                let _ = join.join();
            }
        }
        self.shared.shutdown.store(true, Ordering::Release);
        while let Some(handle) = self.core_threads.pop() {
            let _ = handle.join();
        }
    }

    // Submission surface: one entry per function code. Each returns
    // synchronously only for immediate failures; everything else arrives
    // through the completion exactly once.

    #[allow(clippy::too_many_arguments)]
    pub fn read_coils(
        &self,
        ctx: ContextId,
        start: u16,
        quantity: u16,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_bits(FunctionCode::ReadCoils, start, quantity)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadCoils,
            start,
            quantity,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_discrete_inputs(
        &self,
        ctx: ContextId,
        start: u16,
        quantity: u16,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_bits(FunctionCode::ReadDiscreteInputs, start, quantity)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadDiscreteInputs,
            start,
            quantity,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_holding_registers(
        &self,
        ctx: ContextId,
        start: u16,
        quantity: u16,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_registers(FunctionCode::ReadHoldingRegisters, start, quantity)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadHoldingRegisters,
            start,
            quantity,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_input_registers(
        &self,
        ctx: ContextId,
        start: u16,
        quantity: u16,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_registers(FunctionCode::ReadInputRegisters, start, quantity)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadInputRegisters,
            start,
            quantity,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_single_coil(
        &self,
        ctx: ContextId,
        address: u16,
        value: u16,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::write_single_coil(address, value)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::WriteSingleCoil,
            address,
            1,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_single_register(
        &self,
        ctx: ContextId,
        address: u16,
        value: u16,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::write_single_register(address, value);
        self.submit(
            ctx,
            unit_id,
            FunctionCode::WriteSingleRegister,
            address,
            1,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_multiple_coils(
        &self,
        ctx: ContextId,
        start: u16,
        quantity: u16,
        values: &[u8],
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::write_multiple_coils(start, quantity, values)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::WriteMultipleCoils,
            start,
            quantity,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_multiple_registers(
        &self,
        ctx: ContextId,
        start: u16,
        values: &[u16],
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::write_multiple_registers(start, values)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::WriteMultipleRegisters,
            start,
            values.len() as u16,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_write_registers(
        &self,
        ctx: ContextId,
        read_start: u16,
        read_quantity: u16,
        write_start: u16,
        values: &[u16],
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_write_registers(read_start, read_quantity, write_start, values)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadWriteMultipleRegisters,
            read_start,
            read_quantity,
            tx_id,
            priority,
            &pdu,
            Completion::Generic(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_file_record(
        &self,
        ctx: ContextId,
        records: &[pdu::FileRecordRequest],
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord, Option<oxbus::ReadFileRecordResponse>) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_file_record(records)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadFileRecord,
            0,
            0,
            tx_id,
            priority,
            &pdu,
            Completion::ReadFileRecord(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn write_file_record(
        &self,
        ctx: ContextId,
        records: &[pdu::WriteFileRecord],
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord, Option<oxbus::WriteFileRecordResponse>) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::write_file_record(records)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::WriteFileRecord,
            0,
            0,
            tx_id,
            priority,
            &pdu,
            Completion::WriteFileRecord(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn read_device_identification(
        &self,
        ctx: ContextId,
        mei_type: u8,
        device_id_code: u8,
        object_id: u8,
        tx_id: u16,
        unit_id: u8,
        priority: i64,
        on_done: impl FnOnce(CompletionRecord, Option<oxbus::DeviceIdResponse>) + Send + 'static,
    ) -> Result<(), ErrorKind> {
        let pdu = pdu::read_device_identification(mei_type, device_id_code, object_id)?;
        self.submit(
            ctx,
            unit_id,
            FunctionCode::ReadDeviceIdentification,
            0,
            0,
            tx_id,
            priority,
            &pdu,
            Completion::DeviceIdentification(Box::new(on_done)),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn submit(
        &self,
        ctx: ContextId,
        unit_id: u8,
        fc: FunctionCode,
        start: u16,
        quantity: u16,
        app_tx_id: u16,
        priority: i64,
        pdu: &[u8],
        completion: Completion,
    ) -> Result<(), ErrorKind> {
        let (sender, transport, endpoint) =
            self.shared.contexts.route(ctx).ok_or(ErrorKind::UnknownContext)?;

        let slot = self.shared.registry.reserve().ok_or(ErrorKind::MaxRequestsInFlight)?;
        if !self.shared.registry.emplace(slot, Nanos::now()) {
            return Err(ErrorKind::MaxRequestsInFlight);
        }

        {
            let mut body = slot.body.lock();
            body.unit_id = unit_id;
            body.function_code = fc.as_u8();
            body.app_tx_id = app_tx_id;
            body.start_address = start;
            body.quantity = quantity;
            body.priority = priority;
            body.context = ctx;
            body.transport = transport;
            body.endpoint = match endpoint {
                Endpoint::Tcp(addr) => Endpoint::Tcp(addr),
                Endpoint::Serial { .. } => Endpoint::Serial { unit_id },
            };
            body.completion = Some(completion);
            let written = match transport {
                Transport::Tcp => build_tcp_adu(&mut body.tx_buf, slot.id, unit_id, pdu),
                Transport::Rtu => build_rtu_adu(&mut body.tx_buf, unit_id, pdu),
            };
            match written {
                Ok(n) => body.tx_len = n,
                Err(kind) => {
                    drop(body);
                    self.shared.registry.release(slot, &self.shared.wheel);
                    return Err(kind);
                }
            }
        }

        if sender.try_send(slot.id).is_err() {
            self.shared.registry.release(slot, &self.shared.wheel);
            return Err(ErrorKind::QueueSend);
        }
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.do_shutdown();
    }
}

fn spawn_named(
    name: &str,
    f: impl FnOnce() + Send + 'static,
) -> Result<JoinHandle<()>, ErrorKind> {
    Builder::new().name(name.to_string()).spawn(f).map_err(|err| {
        warn!(?err, name, "couldn't spawn engine thread");
        ErrorKind::ThreadCreate
    })
}

/// Advances the wheel once per millisecond on the absolute monotonic
/// clock and feeds the new counter to the retirer.
fn timer_loop(shared: &EngineShared, ticks: &Sender<usize>) {
    thread_boot(shared.config.scheduler, shared.config.priority);
    let Some(mut next) = monotonic_ns() else {
        warn!("no monotonic clock; response timeouts will not fire");
        return;
    };
    while !shared.is_shutdown() {
        next += TICK_MS * 1_000_000;
        if !sleep_until_monotonic_ns(next) {
            continue;
        }
        let tick = shared.wheel.advance();
        if ticks.try_send(tick).is_err() {
            warn!("timeout tick queue full, dropping tick");
        }
    }
}

/// Retires the bucket whose deadline elapsed at each published tick.
fn retire_loop(shared: &EngineShared, ticks: &Receiver<usize>) {
    thread_boot(shared.config.scheduler, shared.config.priority);
    loop {
        match ticks.recv_timeout(RETIRE_POLL) {
            Ok(tick) => {
                for id in shared.wheel.retire(tick, &shared.registry) {
                    let Some(slot) = shared.registry.get(id) else {
                        continue;
                    };
                    let priority = {
                        let mut body = slot.body.lock();
                        body.status = Some(ErrorKind::RecvTimeout);
                        body.rx_len = 0;
                        body.ts.resp_recv = Nanos::now();
                        body.priority
                    };
                    shared.resp_q.push(priority, id);
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
