use std::{fmt, net::SocketAddrV4};

use oxbus::{DeviceIdResponse, ExceptionStatus, ReadFileRecordResponse, WriteFileRecordResponse};

use crate::{context::ContextId, timing::Nanos};

/// Where a completed request was addressed. Serial correlation is
/// positional, so the unit id is all there is to report.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddrV4),
    Serial { unit_id: u8 },
}

/// The four lifecycle timestamps of a transaction, each set exactly once.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Timestamps {
    /// Request accepted from the application.
    pub req_recv: Nanos,
    /// Request bytes handed to the carrier.
    pub req_sent: Nanos,
    /// Response frame assembled, or the deadline elapsed.
    pub resp_recv: Nanos,
    /// Completion handed back to the application.
    pub resp_sent: Nanos,
}

/// Flat record handed to every completion.
///
/// `exception_status` and `exception_code` are two orthogonal bytes:
/// status `None` means `data` holds a successful decode, `Exception`
/// means the device refused and the code is the protocol exception value,
/// `StackError` means the stack failed and the code is an
/// [`oxbus::ErrorKind`] code.
#[derive(Clone, Debug)]
pub struct CompletionRecord {
    /// The transaction-id hint supplied at submission.
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Function code with the exception bit stripped.
    pub function_code: u8,
    pub endpoint: Endpoint,
    pub exception_status: ExceptionStatus,
    pub exception_code: u8,
    /// Flat response data fields (packed bits, big-endian register bytes,
    /// or a single-write echo value). Empty for record operations and on
    /// any failure.
    pub data: Vec<u8>,
    pub start_address: u16,
    pub quantity: u16,
    pub priority: i64,
    pub context: ContextId,
    pub timestamps: Timestamps,
}

pub type GenericCallback = Box<dyn FnOnce(CompletionRecord) + Send>;
pub type ReadFileRecordCallback =
    Box<dyn FnOnce(CompletionRecord, Option<ReadFileRecordResponse>) + Send>;
pub type WriteFileRecordCallback =
    Box<dyn FnOnce(CompletionRecord, Option<WriteFileRecordResponse>) + Send>;
pub type DeviceIdCallback = Box<dyn FnOnce(CompletionRecord, Option<DeviceIdResponse>) + Send>;

/// Dispatch target carried by a slot, tagged by the request kind. Record
/// operations get their structured payload alongside the flat record;
/// everything else goes through the generic variant.
pub enum Completion {
    Generic(GenericCallback),
    ReadFileRecord(ReadFileRecordCallback),
    WriteFileRecord(WriteFileRecordCallback),
    DeviceIdentification(DeviceIdCallback),
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Generic(_) => "Generic",
            Self::ReadFileRecord(_) => "ReadFileRecord",
            Self::WriteFileRecord(_) => "WriteFileRecord",
            Self::DeviceIdentification(_) => "DeviceIdentification",
        };
        f.write_str(name)
    }
}
