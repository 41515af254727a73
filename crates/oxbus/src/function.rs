/// 1-byte protocol opcode identifying the operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FunctionCode {
    ReadCoils = 0x01,
    ReadDiscreteInputs = 0x02,
    ReadHoldingRegisters = 0x03,
    ReadInputRegisters = 0x04,
    WriteSingleCoil = 0x05,
    WriteSingleRegister = 0x06,
    WriteMultipleCoils = 0x0F,
    WriteMultipleRegisters = 0x10,
    ReadFileRecord = 0x14,
    WriteFileRecord = 0x15,
    ReadWriteMultipleRegisters = 0x17,
    ReadDeviceIdentification = 0x2B,
}

impl FunctionCode {
    /// Maps a raw opcode byte (exception bit already stripped) back to the
    /// operation, or `None` for codes this stack does not speak.
    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0x01 => Self::ReadCoils,
            0x02 => Self::ReadDiscreteInputs,
            0x03 => Self::ReadHoldingRegisters,
            0x04 => Self::ReadInputRegisters,
            0x05 => Self::WriteSingleCoil,
            0x06 => Self::WriteSingleRegister,
            0x0F => Self::WriteMultipleCoils,
            0x10 => Self::WriteMultipleRegisters,
            0x14 => Self::ReadFileRecord,
            0x15 => Self::WriteFileRecord,
            0x17 => Self::ReadWriteMultipleRegisters,
            0x2B => Self::ReadDeviceIdentification,
            _ => return None,
        })
    }

    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Operations whose responses carry structured record chains rather
    /// than flat data fields.
    #[inline]
    pub const fn is_record_operation(self) -> bool {
        matches!(
            self,
            Self::ReadFileRecord | Self::WriteFileRecord | Self::ReadDeviceIdentification
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_raw_opcodes() {
        for raw in 0u8..=0x2B {
            if let Some(fc) = FunctionCode::from_u8(raw) {
                assert_eq!(fc.as_u8(), raw);
            }
        }
        assert_eq!(FunctionCode::from_u8(0x2B), Some(FunctionCode::ReadDeviceIdentification));
        assert_eq!(FunctionCode::from_u8(0x07), None);
    }
}
