//! Client-side Modbus protocol layer.
//!
//! Everything in this crate is pure byte manipulation: function codes,
//! the CRC-16 used by the RTU carrier, ADU framing for both carriers,
//! request PDU builders and response decoding into typed payloads.
//! No I/O, no threads; the transaction engine lives in `oxbus-client`.

mod crc;
mod decode;
mod error;
mod frame;
mod function;
pub mod pdu;

pub use crc::{crc16, verify_crc};
pub use decode::{
    DecodeError, DecodedPayload, DeviceIdObject, DeviceIdResponse, ReadFileRecordResponse,
    ReadFileSubRecord, RequestEcho, Response, WriteFileRecordResponse, WriteFileSubRecord,
    decode_response,
};
pub use error::{ErrorKind, ExceptionStatus};
pub use frame::{
    EXCEPTION_BIT, MAX_ADU_LEN, MAX_PDU_LEN, MBAP_HEADER_LEN, MbapHeader, RTU_CRC_LEN, Transport,
    build_rtu_adu, build_tcp_adu,
};
pub use function::FunctionCode;
pub use pdu::{FileRecordRequest, WriteFileRecord};
