//! Response decoding: a complete inbound frame plus the echo of the
//! originating request in, a typed payload out. CRC and correlation are
//! verified before any payload byte is interpreted.

use thiserror::Error;

use crate::{
    FunctionCode,
    crc::verify_crc,
    frame::{EXCEPTION_BIT, MBAP_HEADER_LEN, MbapHeader, RTU_CRC_LEN, Transport},
    pdu::FILE_RECORD_REF_TYPE,
};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame shorter than its own framing claims")]
    Truncated,
    #[error("crc trailer mismatch")]
    CrcMismatch,
    #[error("transaction, unit or function echo does not match the request")]
    CorrelationMismatch,
    #[error("malformed payload")]
    Malformed,
    #[error("allocation failed while decoding a record chain")]
    MemoryExhausted,
    #[error("unsupported function code {0:#04x}")]
    UnsupportedFunction(u8),
}

/// The identity a response must echo to be accepted for a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestEcho {
    /// Wire transaction id, checked on the TCP carrier only.
    pub transaction_id: u16,
    pub unit_id: u8,
    /// Function code without the exception bit.
    pub function_code: u8,
}

/// A decoded response: the raw function-code byte (exception bit
/// preserved) and the typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub function_code: u8,
    pub payload: DecodedPayload,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DecodedPayload {
    #[default]
    None,
    /// The device refused the operation; carries the exception code.
    Exception(u8),
    /// Packed bits from a coil or discrete-input read.
    Bits(Vec<u8>),
    /// Register words from a register read.
    Registers(Vec<u16>),
    /// Echo of a single-write.
    WriteEcho { address: u16, value: u16 },
    /// Echo of a multiple-write.
    WriteMultipleEcho { address: u16, quantity: u16 },
    ReadFileRecord(ReadFileRecordResponse),
    WriteFileRecord(WriteFileRecordResponse),
    DeviceIdentification(DeviceIdResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFileRecordResponse {
    pub data_len: u8,
    pub sub_records: Vec<ReadFileSubRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadFileSubRecord {
    pub ref_type: u8,
    pub data: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFileRecordResponse {
    pub data_len: u8,
    pub sub_records: Vec<WriteFileSubRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteFileSubRecord {
    pub ref_type: u8,
    pub file_number: u16,
    pub record_number: u16,
    pub data: Vec<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdResponse {
    pub mei_type: u8,
    pub device_id_code: u8,
    pub conformity_level: u8,
    pub more_follows: u8,
    pub next_object_id: u8,
    pub number_of_objects: u8,
    pub objects: Vec<DeviceIdObject>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdObject {
    pub object_id: u8,
    pub length: u8,
    pub value: Vec<u8>,
}

/// Bounds-checked cursor over a payload; every read is explicit about its
/// byte order.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.buf.get(self.pos).ok_or(DecodeError::Truncated)?;
        self.pos += 1;
        Ok(b)
    }

    fn u16_be(&mut self) -> Result<u16, DecodeError> {
        let hi = self.u8()?;
        let lo = self.u8()?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self.pos.checked_add(n).ok_or(DecodeError::Truncated)?;
        let s = self.buf.get(self.pos..end).ok_or(DecodeError::Truncated)?;
        self.pos = end;
        Ok(s)
    }

    fn consumed(&self) -> usize {
        self.pos
    }
}

/// Decodes one complete inbound frame.
///
/// For TCP the frame starts at the MBAP header; for RTU it starts at the
/// unit id and ends with the CRC trailer. The CRC is verified before
/// decoding; the transaction id (TCP), unit id and function code must
/// match `echo` or the frame is rejected as a correlation mismatch.
pub fn decode_response(
    frame: &[u8],
    transport: Transport,
    echo: &RequestEcho,
) -> Result<Response, DecodeError> {
    let (unit_id, body) = match transport {
        Transport::Tcp => {
            let header = MbapHeader::parse(frame).ok_or(DecodeError::Truncated)?;
            if header.transaction_id != echo.transaction_id {
                return Err(DecodeError::CorrelationMismatch);
            }
            let end = MBAP_HEADER_LEN
                .checked_add(usize::from(header.length).saturating_sub(1))
                .ok_or(DecodeError::Truncated)?;
            let body = frame.get(MBAP_HEADER_LEN..end).ok_or(DecodeError::Truncated)?;
            (header.unit_id, body)
        }
        Transport::Rtu => {
            if frame.len() < 2 + RTU_CRC_LEN {
                return Err(DecodeError::Truncated);
            }
            if !verify_crc(frame) {
                return Err(DecodeError::CrcMismatch);
            }
            (frame[0], &frame[1..frame.len() - RTU_CRC_LEN])
        }
    };

    let mut r = Reader::new(body);
    let function_code = r.u8()?;
    if unit_id != echo.unit_id || (function_code & !EXCEPTION_BIT) != echo.function_code {
        return Err(DecodeError::CorrelationMismatch);
    }

    let payload = if function_code & EXCEPTION_BIT != 0 {
        DecodedPayload::Exception(r.u8()?)
    } else {
        let fc = FunctionCode::from_u8(function_code)
            .ok_or(DecodeError::UnsupportedFunction(function_code))?;
        decode_pdu(fc, &mut r)?
    };

    Ok(Response { function_code, payload })
}

/// Fallible allocation for record-chain nodes: exhaustion surfaces as
/// [`DecodeError::MemoryExhausted`] instead of aborting, and whatever
/// partial chain was built drops when the slot is released.
fn try_vec<T>(capacity: usize) -> Result<Vec<T>, DecodeError> {
    let mut v = Vec::new();
    v.try_reserve_exact(capacity).map_err(|_| DecodeError::MemoryExhausted)?;
    Ok(v)
}

fn try_push<T>(chain: &mut Vec<T>, node: T) -> Result<(), DecodeError> {
    chain.try_reserve(1).map_err(|_| DecodeError::MemoryExhausted)?;
    chain.push(node);
    Ok(())
}

fn decode_pdu(fc: FunctionCode, r: &mut Reader<'_>) -> Result<DecodedPayload, DecodeError> {
    Ok(match fc {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let byte_count = r.u8()?;
            DecodedPayload::Bits(r.take(usize::from(byte_count))?.to_vec())
        }

        FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters
        | FunctionCode::ReadWriteMultipleRegisters => {
            let byte_count = r.u8()?;
            if byte_count % 2 != 0 {
                return Err(DecodeError::Malformed);
            }
            let mut words = Vec::with_capacity(usize::from(byte_count) / 2);
            for _ in 0..byte_count / 2 {
                words.push(r.u16_be()?);
            }
            DecodedPayload::Registers(words)
        }

        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            let address = r.u16_be()?;
            let value = r.u16_be()?;
            DecodedPayload::WriteEcho { address, value }
        }

        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            let address = r.u16_be()?;
            let quantity = r.u16_be()?;
            DecodedPayload::WriteMultipleEcho { address, quantity }
        }

        FunctionCode::ReadFileRecord => {
            let data_len = r.u8()?;
            let start = r.consumed();
            let mut sub_records = Vec::new();
            loop {
                let resp_len = r.u8()?;
                let ref_type = r.u8()?;
                if ref_type != FILE_RECORD_REF_TYPE || resp_len < 1 || (resp_len - 1) % 2 != 0 {
                    return Err(DecodeError::Malformed);
                }
                let mut data = try_vec(usize::from(resp_len - 1) / 2)?;
                for _ in 0..(resp_len - 1) / 2 {
                    data.push(r.u16_be()?);
                }
                try_push(&mut sub_records, ReadFileSubRecord { ref_type, data })?;
                if usize::from(data_len) <= r.consumed() - start {
                    break;
                }
            }
            DecodedPayload::ReadFileRecord(ReadFileRecordResponse { data_len, sub_records })
        }

        FunctionCode::WriteFileRecord => {
            let data_len = r.u8()?;
            let start = r.consumed();
            let mut sub_records = Vec::new();
            loop {
                let ref_type = r.u8()?;
                if ref_type != FILE_RECORD_REF_TYPE {
                    return Err(DecodeError::Malformed);
                }
                let file_number = r.u16_be()?;
                let record_number = r.u16_be()?;
                let record_length = r.u16_be()?;
                let mut data = try_vec(usize::from(record_length))?;
                for _ in 0..record_length {
                    data.push(r.u16_be()?);
                }
                try_push(
                    &mut sub_records,
                    WriteFileSubRecord { ref_type, file_number, record_number, data },
                )?;
                if usize::from(data_len) <= r.consumed() - start {
                    break;
                }
            }
            DecodedPayload::WriteFileRecord(WriteFileRecordResponse { data_len, sub_records })
        }

        FunctionCode::ReadDeviceIdentification => {
            let mei_type = r.u8()?;
            let device_id_code = r.u8()?;
            let conformity_level = r.u8()?;
            let more_follows = r.u8()?;
            let next_object_id = r.u8()?;
            let number_of_objects = r.u8()?;
            // Only an explicit more_follows of zero trims the count to the
            // objects present before next_object_id; 0xFF and every other
            // byte leave it at number_of_objects.
            let mut remaining = if more_follows == 0 {
                number_of_objects.saturating_sub(next_object_id)
            } else {
                number_of_objects
            };
            let mut objects = try_vec(usize::from(remaining))?;
            while remaining > 0 {
                let object_id = r.u8()?;
                let length = r.u8()?;
                let mut value = try_vec(usize::from(length))?;
                value.extend_from_slice(r.take(usize::from(length))?);
                objects.push(DeviceIdObject { object_id, length, value });
                remaining -= 1;
            }
            DecodedPayload::DeviceIdentification(DeviceIdResponse {
                mei_type,
                device_id_code,
                conformity_level,
                more_follows,
                next_object_id,
                number_of_objects,
                objects,
            })
        }
    })
}
