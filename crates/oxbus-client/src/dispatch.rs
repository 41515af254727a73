//! The response dispatcher: the single thread that turns terminal slots
//! into exactly one application completion each, then recycles them.

use std::{sync::Arc, time::Duration};

use oxbus::{
    DecodeError, DecodedPayload, EXCEPTION_BIT, ErrorKind, ExceptionStatus, RequestEcho,
    decode_response,
};
use tracing::{debug, warn};

use crate::{
    completion::{Completion, CompletionRecord},
    engine::EngineShared,
    registry::{Slot, TxnState},
    timing::Nanos,
};

const POP_POLL: Duration = Duration::from_millis(100);

pub(crate) fn dispatcher_loop(shared: Arc<EngineShared>) {
    crate::thread::thread_boot(shared.config.scheduler, shared.config.priority);
    loop {
        match shared.resp_q.pop_timeout(POP_POLL) {
            Some(id) => {
                if let Some(slot) = shared.registry.get(id) {
                    finish(&shared, slot);
                }
            }
            None => {
                if shared.is_shutdown() {
                    break;
                }
            }
        }
    }
}

fn map_decode_error(err: DecodeError) -> ErrorKind {
    match err {
        DecodeError::CorrelationMismatch => ErrorKind::CorrelationMismatch,
        DecodeError::MemoryExhausted => ErrorKind::AllocFailed,
        DecodeError::Truncated
        | DecodeError::CrcMismatch
        | DecodeError::Malformed
        | DecodeError::UnsupportedFunction(_) => ErrorKind::RecvFailed,
    }
}

fn finish(shared: &EngineShared, slot: &Slot) {
    let state = slot.state.load();
    let mut body = slot.body.lock();

    if state == TxnState::ResponseReceived {
        let echo = RequestEcho {
            transaction_id: slot.id,
            unit_id: body.unit_id,
            function_code: body.function_code,
        };
        match decode_response(&body.rx_buf[..body.rx_len], body.transport, &echo) {
            Ok(resp) => {
                body.function_code = resp.function_code;
                body.decoded = resp.payload;
            }
            Err(err) => {
                debug!(id = slot.id, ?err, "response decode failed");
                body.status = Some(map_decode_error(err));
                body.decoded = DecodedPayload::None;
            }
        }
    }
    body.ts.resp_sent = Nanos::now();

    let decoded = std::mem::take(&mut body.decoded);
    let mut exception_status = ExceptionStatus::None;
    let mut exception_code = 0u8;
    let mut data = Vec::new();
    match &decoded {
        DecodedPayload::Exception(code) => {
            exception_status = ExceptionStatus::Exception;
            exception_code = *code;
        }
        DecodedPayload::Bits(bytes) => data = bytes.clone(),
        DecodedPayload::Registers(words) => {
            data.reserve(words.len() * 2);
            for w in words {
                data.extend_from_slice(&w.to_be_bytes());
            }
        }
        DecodedPayload::WriteEcho { address, value } => {
            body.start_address = *address;
            data = value.to_be_bytes().to_vec();
        }
        DecodedPayload::WriteMultipleEcho { address, quantity } => {
            body.start_address = *address;
            body.quantity = *quantity;
        }
        DecodedPayload::None
        | DecodedPayload::ReadFileRecord(_)
        | DecodedPayload::WriteFileRecord(_)
        | DecodedPayload::DeviceIdentification(_) => {}
    }
    // A device exception outranks whatever the stack recorded; a stack
    // failure fills both bytes only when the device never answered.
    if exception_status == ExceptionStatus::None {
        if let Some(kind) = body.status {
            exception_status = ExceptionStatus::StackError;
            exception_code = kind.code();
        }
    }

    let record = CompletionRecord {
        transaction_id: body.app_tx_id,
        unit_id: body.unit_id,
        function_code: body.function_code & !EXCEPTION_BIT,
        endpoint: body.endpoint,
        exception_status,
        exception_code,
        data,
        start_address: body.start_address,
        quantity: body.quantity,
        priority: body.priority,
        context: body.context,
        timestamps: body.ts,
    };
    let completion = body.completion.take();
    drop(body);

    match completion {
        Some(Completion::Generic(cb)) => cb(record),
        Some(Completion::ReadFileRecord(cb)) => {
            let payload = match decoded {
                DecodedPayload::ReadFileRecord(r) => Some(r),
                _ => None,
            };
            cb(record, payload);
        }
        Some(Completion::WriteFileRecord(cb)) => {
            let payload = match decoded {
                DecodedPayload::WriteFileRecord(r) => Some(r),
                _ => None,
            };
            cb(record, payload);
        }
        Some(Completion::DeviceIdentification(cb)) => {
            let payload = match decoded {
                DecodedPayload::DeviceIdentification(r) => Some(r),
                _ => None,
            };
            cb(record, payload);
        }
        None => warn!(id = slot.id, "terminal slot without a completion"),
    }

    shared.registry.release(slot, &shared.wheel);
}
