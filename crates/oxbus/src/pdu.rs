//! Request PDU builders, one per operation, with parameter validation at
//! the submission boundary. A builder returns the function-code byte plus
//! the operation payload; framing is the carrier's business.

use crate::{ErrorKind, FunctionCode};

/// Most bits one read may request.
pub const MAX_READ_BITS: u16 = 2000;
/// Most registers one read may request.
pub const MAX_READ_REGISTERS: u16 = 125;
/// Most coils one write may carry.
pub const MAX_WRITE_COILS: u16 = 1968;
/// Most registers one write may carry.
pub const MAX_WRITE_REGISTERS: u16 = 123;
/// Write-side register cap of the combined read/write operation.
pub const MAX_READ_WRITE_REGISTERS: u16 = 121;
/// The only reference type the file-record operations define.
pub const FILE_RECORD_REF_TYPE: u8 = 6;

/// One sub-request of a read-file-record operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileRecordRequest {
    pub file_number: u16,
    pub record_number: u16,
    pub record_length: u16,
}

/// One sub-request of a write-file-record operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteFileRecord {
    pub file_number: u16,
    pub record_number: u16,
    pub data: Vec<u16>,
}

#[inline]
fn push_u16(out: &mut Vec<u8>, word: u16) {
    out.extend_from_slice(&word.to_be_bytes());
}

fn check_span(start: u16, quantity: u16, max: u16) -> Result<(), ErrorKind> {
    if quantity == 0 || quantity > max {
        return Err(ErrorKind::InvalidInput);
    }
    if u32::from(start) + u32::from(quantity) > 0x1_0000 {
        return Err(ErrorKind::InvalidInput);
    }
    Ok(())
}

/// Read coils or discrete inputs.
pub fn read_bits(fc: FunctionCode, start: u16, quantity: u16) -> Result<Vec<u8>, ErrorKind> {
    if !matches!(fc, FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs) {
        return Err(ErrorKind::InvalidInput);
    }
    check_span(start, quantity, MAX_READ_BITS)?;
    let mut out = Vec::with_capacity(5);
    out.push(fc.as_u8());
    push_u16(&mut out, start);
    push_u16(&mut out, quantity);
    Ok(out)
}

/// Read holding or input registers.
pub fn read_registers(fc: FunctionCode, start: u16, quantity: u16) -> Result<Vec<u8>, ErrorKind> {
    if !matches!(fc, FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters) {
        return Err(ErrorKind::InvalidInput);
    }
    check_span(start, quantity, MAX_READ_REGISTERS)?;
    let mut out = Vec::with_capacity(5);
    out.push(fc.as_u8());
    push_u16(&mut out, start);
    push_u16(&mut out, quantity);
    Ok(out)
}

/// Write a single coil. The output value is all-or-nothing on the wire.
pub fn write_single_coil(address: u16, value: u16) -> Result<Vec<u8>, ErrorKind> {
    if value != 0x0000 && value != 0xFF00 {
        return Err(ErrorKind::InvalidInput);
    }
    let mut out = Vec::with_capacity(5);
    out.push(FunctionCode::WriteSingleCoil.as_u8());
    push_u16(&mut out, address);
    push_u16(&mut out, value);
    Ok(out)
}

/// Write a single holding register.
pub fn write_single_register(address: u16, value: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(5);
    out.push(FunctionCode::WriteSingleRegister.as_u8());
    push_u16(&mut out, address);
    push_u16(&mut out, value);
    out
}

/// Write multiple coils from pre-packed bit bytes (LSB first).
pub fn write_multiple_coils(start: u16, quantity: u16, values: &[u8]) -> Result<Vec<u8>, ErrorKind> {
    check_span(start, quantity, MAX_WRITE_COILS)?;
    let byte_count = usize::from(quantity).div_ceil(8);
    if values.len() < byte_count {
        return Err(ErrorKind::InvalidInput);
    }
    let mut out = Vec::with_capacity(6 + byte_count);
    out.push(FunctionCode::WriteMultipleCoils.as_u8());
    push_u16(&mut out, start);
    push_u16(&mut out, quantity);
    out.push(byte_count as u8);
    out.extend_from_slice(&values[..byte_count]);
    Ok(out)
}

/// Write multiple holding registers.
pub fn write_multiple_registers(start: u16, values: &[u16]) -> Result<Vec<u8>, ErrorKind> {
    let quantity = values.len() as u16;
    check_span(start, quantity, MAX_WRITE_REGISTERS)?;
    let mut out = Vec::with_capacity(6 + values.len() * 2);
    out.push(FunctionCode::WriteMultipleRegisters.as_u8());
    push_u16(&mut out, start);
    push_u16(&mut out, quantity);
    out.push((values.len() * 2) as u8);
    for &w in values {
        push_u16(&mut out, w);
    }
    Ok(out)
}

/// Combined write-then-read of holding registers.
pub fn read_write_registers(
    read_start: u16,
    read_quantity: u16,
    write_start: u16,
    values: &[u16],
) -> Result<Vec<u8>, ErrorKind> {
    check_span(read_start, read_quantity, MAX_READ_REGISTERS)?;
    let write_quantity = values.len() as u16;
    check_span(write_start, write_quantity, MAX_READ_WRITE_REGISTERS)?;
    let mut out = Vec::with_capacity(10 + values.len() * 2);
    out.push(FunctionCode::ReadWriteMultipleRegisters.as_u8());
    push_u16(&mut out, read_start);
    push_u16(&mut out, read_quantity);
    push_u16(&mut out, write_start);
    push_u16(&mut out, write_quantity);
    out.push((values.len() * 2) as u8);
    for &w in values {
        push_u16(&mut out, w);
    }
    Ok(out)
}

/// Read one or more file records.
pub fn read_file_record(records: &[FileRecordRequest]) -> Result<Vec<u8>, ErrorKind> {
    // 7 bytes per sub-request, byte count capped at 245 by the protocol.
    if records.is_empty() || records.len() > 35 {
        return Err(ErrorKind::InvalidInput);
    }
    let byte_count = records.len() * 7;
    let mut out = Vec::with_capacity(2 + byte_count);
    out.push(FunctionCode::ReadFileRecord.as_u8());
    out.push(byte_count as u8);
    for rec in records {
        if rec.record_length == 0 {
            return Err(ErrorKind::InvalidInput);
        }
        out.push(FILE_RECORD_REF_TYPE);
        push_u16(&mut out, rec.file_number);
        push_u16(&mut out, rec.record_number);
        push_u16(&mut out, rec.record_length);
    }
    Ok(out)
}

/// Write one or more file records.
pub fn write_file_record(records: &[WriteFileRecord]) -> Result<Vec<u8>, ErrorKind> {
    if records.is_empty() {
        return Err(ErrorKind::InvalidInput);
    }
    let byte_count: usize = records.iter().map(|r| 7 + r.data.len() * 2).sum();
    if byte_count > 245 {
        return Err(ErrorKind::PacketLengthExceeded);
    }
    let mut out = Vec::with_capacity(2 + byte_count);
    out.push(FunctionCode::WriteFileRecord.as_u8());
    out.push(byte_count as u8);
    for rec in records {
        if rec.data.is_empty() {
            return Err(ErrorKind::InvalidInput);
        }
        out.push(FILE_RECORD_REF_TYPE);
        push_u16(&mut out, rec.file_number);
        push_u16(&mut out, rec.record_number);
        push_u16(&mut out, rec.data.len() as u16);
        for &w in &rec.data {
            push_u16(&mut out, w);
        }
    }
    Ok(out)
}

/// Read device identification through the encapsulated-interface opcode.
pub fn read_device_identification(
    mei_type: u8,
    device_id_code: u8,
    object_id: u8,
) -> Result<Vec<u8>, ErrorKind> {
    if !(1..=4).contains(&device_id_code) {
        return Err(ErrorKind::InvalidInput);
    }
    Ok(vec![FunctionCode::ReadDeviceIdentification.as_u8(), mei_type, device_id_code, object_id])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_holding_registers_pdu() {
        let pdu = read_registers(FunctionCode::ReadHoldingRegisters, 0x006B, 3).unwrap();
        assert_eq!(pdu, vec![0x03, 0x00, 0x6B, 0x00, 0x03]);
    }

    #[test]
    fn coil_value_must_be_full_scale() {
        assert!(write_single_coil(0x00AC, 0xFF00).is_ok());
        assert!(write_single_coil(0x00AC, 0x0000).is_ok());
        assert_eq!(write_single_coil(0x00AC, 0x1234), Err(ErrorKind::InvalidInput));
    }

    #[test]
    fn span_limits_enforced() {
        assert!(read_bits(FunctionCode::ReadCoils, 0, MAX_READ_BITS).is_ok());
        assert_eq!(read_bits(FunctionCode::ReadCoils, 0, 0), Err(ErrorKind::InvalidInput));
        assert_eq!(
            read_bits(FunctionCode::ReadCoils, 0, MAX_READ_BITS + 1),
            Err(ErrorKind::InvalidInput)
        );
        // Address wrap past the end of the register space.
        assert_eq!(
            read_registers(FunctionCode::ReadHoldingRegisters, 0xFFFF, 2),
            Err(ErrorKind::InvalidInput)
        );
    }

    #[test]
    fn write_multiple_registers_layout() {
        let pdu = write_multiple_registers(0x0001, &[0x000A, 0x0102]).unwrap();
        assert_eq!(pdu, vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]);
    }

    #[test]
    fn file_record_request_layout() {
        let pdu = read_file_record(&[FileRecordRequest {
            file_number: 4,
            record_number: 1,
            record_length: 2,
        }])
        .unwrap();
        assert_eq!(pdu, vec![0x14, 0x07, 0x06, 0x00, 0x04, 0x00, 0x01, 0x00, 0x02]);
    }

    #[test]
    fn coil_byte_count_from_quantity() {
        let pdu = write_multiple_coils(0x0013, 10, &[0xCD, 0x01]).unwrap();
        assert_eq!(pdu, vec![0x0F, 0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]);
        assert_eq!(write_multiple_coils(0, 10, &[0xCD]), Err(ErrorKind::InvalidInput));
    }
}
