//! Modbus-RTU frame building and response validation
//!
//! Frames are `[addr][func][data...][crc_lo][crc_hi]`. Floats travel as
//! big-endian IEEE-754 in two consecutive registers.

use crate::error::{HvError, HvResult};

pub const FC_READ_HOLDING: u8 = 0x03;
pub const FC_WRITE_COIL: u8 = 0x05;
pub const FC_WRITE_MULTIPLE: u8 = 0x10;

/// Exception responses are always five bytes
pub const EXCEPTION_LEN: usize = 5;

/// HAPS06 register map
pub mod registers {
    /// Model word, used for address probing
    pub const MODEL: u16 = 0x0B04;
    /// Remote-control coil
    pub const REMOTE_COIL: u16 = 0x0500;
    /// Voltage setpoint (float, 2 registers)
    pub const VSET: u16 = 0x0A05;
    /// Apply command (1 register, value 1)
    pub const CMD: u16 = 0x0A00;
    /// Actual output voltage (float, 2 registers)
    pub const VS: u16 = 0x0B00;
}

/// Modbus CRC16 (init 0xFFFF, reflected polynomial 0xA001)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check the trailing CRC of a complete frame
pub fn verify_crc(frame: &[u8]) -> bool {
    if frame.len() < 3 {
        return false;
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    crc16(body) == u16::from_le_bytes([tail[0], tail[1]])
}

pub fn encode_f32(value: f64) -> [u8; 4] {
    (value as f32).to_be_bytes()
}

pub fn decode_f32(bytes: &[u8]) -> HvResult<f64> {
    let raw: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| HvError::protocol(format!("float needs 4 bytes, got {}", bytes.len())))?;
    Ok(f64::from(f32::from_be_bytes(raw)))
}

/// Application frame before CRC is applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    pub slave_addr: u8,
    pub function_code: u8,
    pub payload: Vec<u8>,
}

impl ModbusFrame {
    /// Wire bytes including CRC
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 4);
        out.push(self.slave_addr);
        out.push(self.function_code);
        out.extend_from_slice(&self.payload);
        append_crc(&mut out);
        out
    }

    pub fn read_holding(slave_addr: u8, start: u16, count: u16) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        Self {
            slave_addr,
            function_code: FC_READ_HOLDING,
            payload,
        }
    }

    pub fn write_coil(slave_addr: u8, coil: u16, on: bool) -> Self {
        let mut payload = Vec::with_capacity(4);
        payload.extend_from_slice(&coil.to_be_bytes());
        payload.extend_from_slice(if on { &[0xFF, 0x00] } else { &[0x00, 0x00] });
        Self {
            slave_addr,
            function_code: FC_WRITE_COIL,
            payload,
        }
    }

    /// FC 0x10 with `data.len() / 2` registers
    pub fn write_registers(slave_addr: u8, start: u16, data: &[u8]) -> Self {
        let count = (data.len() / 2) as u16;
        let mut payload = Vec::with_capacity(5 + data.len());
        payload.extend_from_slice(&start.to_be_bytes());
        payload.extend_from_slice(&count.to_be_bytes());
        payload.push(data.len() as u8);
        payload.extend_from_slice(data);
        Self {
            slave_addr,
            function_code: FC_WRITE_MULTIPLE,
            payload,
        }
    }

    /// Response length of a well-formed reply to this request
    pub fn expected_response_len(&self) -> usize {
        match self.function_code {
            FC_READ_HOLDING => {
                let count = u16::from_be_bytes([self.payload[2], self.payload[3]]) as usize;
                5 + count * 2
            },
            _ => 8,
        }
    }
}

pub fn exception_description(code: u8) -> &'static str {
    match code {
        0x01 => "Illegal Function",
        0x02 => "Illegal Data Address",
        0x03 => "Illegal Data Value",
        0x04 => "Slave Device Failure",
        0x05 => "Acknowledge",
        0x06 => "Slave Device Busy",
        0x07 => "Negative Acknowledge",
        0x08 => "Memory Parity Error",
        0x0A => "Gateway Path Unavailable",
        0x0B => "Gateway Target Device Failed to Respond",
        _ => "Unknown Exception",
    }
}

/// Validate a raw reply to `request`.
///
/// Empty means the device said nothing (`Timeout`); everything else that
/// is not a well-formed, CRC-valid reply from the addressed slave is a
/// `ProtocolError`.
pub fn check_response(request: &[u8], raw: &[u8], expected_len: usize) -> HvResult<()> {
    if raw.is_empty() {
        return Err(HvError::timeout("no response"));
    }

    if raw.len() == EXCEPTION_LEN && raw[1] & 0x80 != 0 && verify_crc(raw) {
        return Err(HvError::protocol(format!(
            "exception 0x{:02X} for function 0x{:02X}: {}",
            raw[2],
            raw[1] & 0x7F,
            exception_description(raw[2])
        )));
    }

    if raw.len() != expected_len {
        return Err(HvError::protocol(format!(
            "length mismatch: expected {expected_len} bytes, got {}",
            raw.len()
        )));
    }

    if !verify_crc(raw) {
        let n = raw.len();
        return Err(HvError::protocol(format!(
            "CRC mismatch: expected 0x{:04X}, got 0x{:04X}",
            crc16(&raw[..n - 2]),
            u16::from_le_bytes([raw[n - 2], raw[n - 1]])
        )));
    }

    if raw[0] != request[0] || raw[1] != request[1] {
        return Err(HvError::protocol(format!(
            "unexpected reply header {:02X} {:02X} for {:02X} {:02X}",
            raw[0], raw[1], request[0], request[1]
        )));
    }

    Ok(())
}

/// Register bytes of a validated FC 0x03 reply
pub fn register_data(raw: &[u8]) -> HvResult<&[u8]> {
    let count = *raw
        .get(2)
        .ok_or_else(|| HvError::protocol("read reply too short"))? as usize;
    raw.get(3..3 + count)
        .ok_or_else(|| HvError::protocol(format!("byte count {count} exceeds reply")))
}

/// A write acknowledgement echoes the first six request bytes
pub fn check_write_ack(request: &[u8], raw: &[u8]) -> HvResult<()> {
    if raw.len() < 6 || request.len() < 6 || raw[..6] != request[..6] {
        return Err(HvError::protocol("write acknowledgement does not echo request"));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_crc_probe_frame_validates() {
        let frame = ModbusFrame::read_holding(0x01, registers::MODEL, 1).encode();
        assert_eq!(&frame[..6], &[0x01, 0x03, 0x0B, 0x04, 0x00, 0x01]);
        assert_eq!(frame.len(), 8);
        assert!(verify_crc(&frame));

        for i in 0..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x01;
            assert!(!verify_crc(&corrupted), "byte {i} mutation not detected");
        }
    }

    #[test]
    fn test_crc_known_vector() {
        // Read 1 register at 0 from slave 1
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01];
        append_crc(&mut frame);
        assert_eq!(&frame[6..], &[0x84, 0x0A]);
    }

    #[test]
    fn test_float_round_trip() {
        let bytes = encode_f32(123.45);
        assert_eq!(bytes, 123.45f32.to_be_bytes());
        let back = decode_f32(&bytes).unwrap();
        assert!((back - 123.45).abs() < 1e-4);
    }

    #[test]
    fn test_write_frames() {
        let coil = ModbusFrame::write_coil(3, registers::REMOTE_COIL, true).encode();
        assert_eq!(&coil[..6], &[0x03, 0x05, 0x05, 0x00, 0xFF, 0x00]);

        let cmd = ModbusFrame::write_registers(3, registers::CMD, &[0x00, 0x01]).encode();
        assert_eq!(&cmd[..9], &[0x03, 0x10, 0x0A, 0x00, 0x00, 0x01, 0x02, 0x00, 0x01]);
        assert_eq!(ModbusFrame::write_registers(3, registers::VSET, &[0; 4]).expected_response_len(), 8);
        assert_eq!(ModbusFrame::read_holding(3, registers::VS, 2).expected_response_len(), 9);
    }

    #[test]
    fn test_check_response_classification() {
        let req = ModbusFrame::read_holding(1, registers::VS, 2).encode();

        assert!(matches!(check_response(&req, &[], 9), Err(HvError::Timeout(_))));
        assert!(matches!(check_response(&req, &[0x01, 0x03], 9), Err(HvError::ProtocolError(_))));

        let mut exc = vec![0x01, 0x83, 0x02];
        append_crc(&mut exc);
        let err = check_response(&req, &exc, 9).unwrap_err();
        assert!(err.to_string().contains("Illegal Data Address"));

        let mut good = vec![0x01, 0x03, 0x04];
        good.extend_from_slice(&encode_f32(500.0));
        append_crc(&mut good);
        check_response(&req, &good, 9).unwrap();
        assert_eq!(decode_f32(register_data(&good).unwrap()).unwrap(), 500.0);

        let mut bad = good.clone();
        bad[8] ^= 0xFF;
        assert!(check_response(&req, &bad, 9).unwrap_err().to_string().contains("CRC"));
    }
}
