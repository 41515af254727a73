use crate::{ErrorKind, crc::crc16};

/// Largest application data unit either carrier can produce.
pub const MAX_ADU_LEN: usize = 260;
/// Largest protocol data unit (function code + payload).
pub const MAX_PDU_LEN: usize = 253;
/// TCP pre-PDU header: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;
/// RTU trailer length.
pub const RTU_CRC_LEN: usize = 2;
/// High bit of the function-code byte marking an exception frame.
pub const EXCEPTION_BIT: u8 = 0x80;

/// Which carrier framed a byte sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Rtu,
}

/// The fixed TCP pre-PDU header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MbapHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
    pub unit_id: u8,
}

impl MbapHeader {
    /// Reads the header off the front of a frame, or `None` when fewer
    /// than [`MBAP_HEADER_LEN`] bytes are present.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < MBAP_HEADER_LEN {
            return None;
        }
        Some(Self {
            transaction_id: u16::from_be_bytes([frame[0], frame[1]]),
            protocol_id: u16::from_be_bytes([frame[2], frame[3]]),
            length: u16::from_be_bytes([frame[4], frame[5]]),
            unit_id: frame[6],
        })
    }
}

/// Writes a TCP ADU into `out` and returns its total length.
///
/// The length field counts the unit id through the end of the payload.
pub fn build_tcp_adu(out: &mut [u8], tx_id: u16, unit_id: u8, pdu: &[u8]) -> Result<usize, ErrorKind> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(ErrorKind::PacketLengthExceeded);
    }
    let total = MBAP_HEADER_LEN + pdu.len();
    if out.len() < total {
        return Err(ErrorKind::PacketLengthExceeded);
    }
    out[0..2].copy_from_slice(&tx_id.to_be_bytes());
    out[2..4].copy_from_slice(&0u16.to_be_bytes());
    out[4..6].copy_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    out[6] = unit_id;
    out[MBAP_HEADER_LEN..total].copy_from_slice(pdu);
    Ok(total)
}

/// Writes an RTU ADU into `out`, CRC trailer included, and returns its
/// total length.
pub fn build_rtu_adu(out: &mut [u8], unit_id: u8, pdu: &[u8]) -> Result<usize, ErrorKind> {
    if pdu.is_empty() || pdu.len() > MAX_PDU_LEN {
        return Err(ErrorKind::PacketLengthExceeded);
    }
    let body = 1 + pdu.len();
    let total = body + RTU_CRC_LEN;
    if out.len() < total {
        return Err(ErrorKind::PacketLengthExceeded);
    }
    out[0] = unit_id;
    out[1..body].copy_from_slice(pdu);
    let trailer = crc16(&out[..body]);
    out[body..total].copy_from_slice(&trailer);
    Ok(total)
}
