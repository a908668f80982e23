//! Modbus RTU frame codec for holding-register reads (0x03) and
//! single-register writes (0x06).
//!
//! Frames are `PDU ++ CRC16(PDU)` with the CRC low byte first. Fields inside
//! the PDU are big-endian.

use serde::Serialize;
use std::fmt;

use super::crc::{crc_bytes, verify};
use crate::utils::error::ModbusError;

pub const MIN_SLAVE_ID: u8 = 1;
pub const MAX_SLAVE_ID: u8 = 247;
pub const MAX_READ_REGISTERS: u16 = 125;

/// Shortest frame a slave can legally answer with (exception response).
pub const MIN_RESPONSE_LEN: usize = 5;
pub const REQUEST_FRAME_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FunctionCode {
    ReadHoldingRegisters,
    WriteSingleRegister,
}

impl FunctionCode {
    pub fn code(self) -> u8 {
        match self {
            FunctionCode::ReadHoldingRegisters => 0x03,
            FunctionCode::WriteSingleRegister => 0x06,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x03 => Some(FunctionCode::ReadHoldingRegisters),
            0x06 => Some(FunctionCode::WriteSingleRegister),
            _ => None,
        }
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FunctionCode::ReadHoldingRegisters => write!(f, "Read Holding Registers (0x03)"),
            FunctionCode::WriteSingleRegister => write!(f, "Write Single Register (0x06)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPayload {
    RegisterCount(u16),
    SingleValue(u16),
}

/// A validated master request. Fields are private so a `Request` always
/// satisfies the slave-id and register-count limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    slave_id: u8,
    function: FunctionCode,
    start_address: u16,
    payload: RequestPayload,
}

impl Request {
    pub fn read_holding_registers(slave_id: u8, start_address: u16, count: u16) -> Result<Self, ModbusError> {
        validate_slave_id(slave_id)?;
        if count == 0 || count > MAX_READ_REGISTERS {
            return Err(ModbusError::InvalidArgument(format!(
                "register count {} out of range 1-{}",
                count, MAX_READ_REGISTERS
            )));
        }
        Ok(Self {
            slave_id,
            function: FunctionCode::ReadHoldingRegisters,
            start_address,
            payload: RequestPayload::RegisterCount(count),
        })
    }

    pub fn write_single_register(slave_id: u8, address: u16, value: u16) -> Result<Self, ModbusError> {
        validate_slave_id(slave_id)?;
        Ok(Self {
            slave_id,
            function: FunctionCode::WriteSingleRegister,
            start_address: address,
            payload: RequestPayload::SingleValue(value),
        })
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn function(&self) -> FunctionCode {
        self.function
    }

    pub fn start_address(&self) -> u16 {
        self.start_address
    }

    pub fn payload(&self) -> RequestPayload {
        self.payload
    }

    /// Number of registers the response is expected to carry.
    pub fn expected_registers(&self) -> u16 {
        match self.payload {
            RequestPayload::RegisterCount(count) => count,
            RequestPayload::SingleValue(_) => 1,
        }
    }

    fn payload_word(&self) -> u16 {
        match self.payload {
            RequestPayload::RegisterCount(count) => count,
            RequestPayload::SingleValue(value) => value,
        }
    }

    pub fn pdu(&self) -> [u8; 6] {
        let address = self.start_address.to_be_bytes();
        let word = self.payload_word().to_be_bytes();
        [
            self.slave_id,
            self.function.code(),
            address[0],
            address[1],
            word[0],
            word[1],
        ]
    }

    pub fn encode(&self) -> Vec<u8> {
        with_crc(&self.pdu())
    }
}

fn validate_slave_id(slave_id: u8) -> Result<(), ModbusError> {
    if !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&slave_id) {
        return Err(ModbusError::InvalidArgument(format!(
            "slave id {} out of range {}-{}",
            slave_id, MIN_SLAVE_ID, MAX_SLAVE_ID
        )));
    }
    Ok(())
}

/// Appends the wire-order CRC to `pdu`.
pub fn with_crc(pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(pdu.len() + 2);
    frame.extend_from_slice(pdu);
    frame.extend_from_slice(&crc_bytes(pdu));
    frame
}

pub fn encode_read_request(slave_id: u8, address: u16, count: u16) -> Result<Vec<u8>, ModbusError> {
    Ok(Request::read_holding_registers(slave_id, address, count)?.encode())
}

pub fn encode_write_request(slave_id: u8, address: u16, value: u16) -> Result<Vec<u8>, ModbusError> {
    Ok(Request::write_single_register(slave_id, address, value)?.encode())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedResponse {
    pub function_code: u8,
    pub registers: Vec<u16>,
}

/// Validates and decodes a slave response.
///
/// Checks run in a fixed order and the first failure wins: length, slave id,
/// CRC, exception flag, function code, payload. The slave id is checked
/// before the CRC, so a corrupt frame with a wrong id byte reports
/// `SlaveIdMismatch`.
pub fn decode_response(
    bytes: &[u8],
    expected_slave_id: u8,
    expected_function: FunctionCode,
    expected_registers: u16,
) -> Result<ParsedResponse, ModbusError> {
    if bytes.len() < MIN_RESPONSE_LEN {
        return Err(ModbusError::FrameTooShort {
            required: MIN_RESPONSE_LEN,
            received: bytes.len(),
        });
    }

    let slave_id = bytes[0];
    let function_code = bytes[1];

    if slave_id != expected_slave_id {
        return Err(ModbusError::SlaveIdMismatch {
            expected: expected_slave_id,
            received: slave_id,
        });
    }

    if !verify(bytes) {
        let data_len = bytes.len() - 2;
        return Err(ModbusError::CrcMismatch {
            expected: crc_bytes(&bytes[..data_len]),
            received: [bytes[data_len], bytes[data_len + 1]],
        });
    }

    if function_code > 0x80 {
        return Err(ModbusError::exception(bytes[2]));
    }

    if function_code != expected_function.code() {
        return Err(ModbusError::FunctionCodeMismatch {
            expected: expected_function.code(),
            received: function_code,
        });
    }

    let registers = match expected_function {
        FunctionCode::ReadHoldingRegisters => {
            let byte_count = bytes[2] as usize;
            let expected_bytes = expected_registers as usize * 2;
            if byte_count != expected_bytes {
                return Err(ModbusError::RegisterCountMismatch {
                    expected: expected_bytes,
                    received: byte_count,
                });
            }
            // slave id + function + byte count + data + crc
            let required = 3 + expected_bytes + 2;
            if bytes.len() < required {
                return Err(ModbusError::FrameTooShort {
                    required,
                    received: bytes.len(),
                });
            }
            bytes[3..3 + expected_bytes]
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect()
        }
        FunctionCode::WriteSingleRegister => {
            if bytes.len() < REQUEST_FRAME_LEN {
                return Err(ModbusError::FrameTooShort {
                    required: REQUEST_FRAME_LEN,
                    received: bytes.len(),
                });
            }
            vec![u16::from_be_bytes([bytes[4], bytes[5]])]
        }
    };

    Ok(ParsedResponse {
        function_code,
        registers,
    })
}

/// Parses a master request frame, as seen by a slave on the bus.
pub fn decode_request(bytes: &[u8]) -> Result<Request, ModbusError> {
    if bytes.len() != REQUEST_FRAME_LEN {
        return Err(ModbusError::FrameTooShort {
            required: REQUEST_FRAME_LEN,
            received: bytes.len(),
        });
    }
    if !verify(bytes) {
        return Err(ModbusError::CrcMismatch {
            expected: crc_bytes(&bytes[..6]),
            received: [bytes[6], bytes[7]],
        });
    }

    let address = u16::from_be_bytes([bytes[2], bytes[3]]);
    let word = u16::from_be_bytes([bytes[4], bytes[5]]);
    match FunctionCode::from_code(bytes[1]) {
        Some(FunctionCode::ReadHoldingRegisters) => Request::read_holding_registers(bytes[0], address, word),
        Some(FunctionCode::WriteSingleRegister) => Request::write_single_register(bytes[0], address, word),
        None => Err(ModbusError::InvalidArgument(format!(
            "unsupported function code 0x{:02X}",
            bytes[1]
        ))),
    }
}

/// The byte count field is one byte, so at most `MAX_READ_REGISTERS` fit.
pub fn encode_read_response(slave_id: u8, registers: &[u16]) -> Result<Vec<u8>, ModbusError> {
    if registers.is_empty() || registers.len() > MAX_READ_REGISTERS as usize {
        return Err(ModbusError::InvalidArgument(format!(
            "read response must carry 1-{} registers, got {}",
            MAX_READ_REGISTERS,
            registers.len()
        )));
    }
    let mut pdu = vec![
        slave_id,
        FunctionCode::ReadHoldingRegisters.code(),
        (registers.len() * 2) as u8,
    ];
    for register in registers {
        pdu.extend_from_slice(&register.to_be_bytes());
    }
    Ok(with_crc(&pdu))
}

pub fn encode_write_response(slave_id: u8, address: u16, value: u16) -> Vec<u8> {
    let mut pdu = vec![slave_id, FunctionCode::WriteSingleRegister.code()];
    pdu.extend_from_slice(&address.to_be_bytes());
    pdu.extend_from_slice(&value.to_be_bytes());
    with_crc(&pdu)
}

pub fn encode_exception(slave_id: u8, function_code: u8, exception_code: u8) -> Vec<u8> {
    with_crc(&[slave_id, function_code | 0x80, exception_code])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::error::ExceptionKind;

    #[test]
    fn test_encode_read_request_golden_vector() {
        let frame = encode_read_request(1, 0, 1).unwrap();
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x01, 0x84, 0x0A]);
    }

    #[test]
    fn test_encode_write_request_layout() {
        let frame = encode_write_request(0x11, 0x0001, 0x0003).unwrap();
        assert_eq!(&frame[..6], &[0x11, 0x06, 0x00, 0x01, 0x00, 0x03]);
        assert_eq!(frame.len(), 8);
        assert!(verify(&frame));
    }

    #[test]
    fn test_request_rejects_invalid_arguments() {
        assert!(matches!(encode_read_request(1, 0, 0), Err(ModbusError::InvalidArgument(_))));
        assert!(matches!(encode_read_request(1, 0, 126), Err(ModbusError::InvalidArgument(_))));
        assert!(encode_read_request(1, 0, 125).is_ok());
        assert!(matches!(encode_read_request(0, 0, 1), Err(ModbusError::InvalidArgument(_))));
        assert!(matches!(encode_write_request(248, 0, 1), Err(ModbusError::InvalidArgument(_))));
        assert!(encode_write_request(247, 0xFFFF, 0xFFFF).is_ok());
    }

    #[test]
    fn test_decode_read_response() {
        let frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        let parsed = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 1).unwrap();
        assert_eq!(parsed.function_code, 0x03);
        assert_eq!(parsed.registers, vec![42]);
    }

    #[test]
    fn test_decode_multi_register_response() {
        let frame = encode_read_response(5, &[0x1234, 0xABCD, 0x0001]).unwrap();
        let parsed = decode_response(&frame, 5, FunctionCode::ReadHoldingRegisters, 3).unwrap();
        assert_eq!(parsed.registers, vec![0x1234, 0xABCD, 0x0001]);
    }

    #[test]
    fn test_decode_exception_response() {
        let frame = with_crc(&[0x01, 0x83, 0x02]);
        let err = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 1).unwrap_err();
        match err {
            ModbusError::ModbusException { code, kind } => {
                assert_eq!(code, 2);
                assert_eq!(kind, ExceptionKind::IllegalDataAddress);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_decode_too_short() {
        let err = decode_response(&[0x01, 0x03, 0x00, 0x00], 1, FunctionCode::ReadHoldingRegisters, 1).unwrap_err();
        assert!(matches!(err, ModbusError::FrameTooShort { required: 5, received: 4 }));
    }

    #[test]
    fn test_slave_id_checked_before_crc() {
        let mut frame = with_crc(&[0x02, 0x03, 0x02, 0x00, 0x2A]);
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 1).unwrap_err();
        assert!(matches!(err, ModbusError::SlaveIdMismatch { expected: 1, received: 2 }));
    }

    #[test]
    fn test_decode_crc_mismatch() {
        let mut frame = with_crc(&[0x01, 0x03, 0x02, 0x00, 0x2A]);
        frame[4] = 0x2B;
        let err = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 1).unwrap_err();
        assert!(matches!(err, ModbusError::CrcMismatch { .. }));
    }

    #[test]
    fn test_decode_function_code_mismatch() {
        let frame = encode_write_response(1, 0, 7);
        let err = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 1).unwrap_err();
        assert!(matches!(err, ModbusError::FunctionCodeMismatch { expected: 0x03, received: 0x06 }));
    }

    #[test]
    fn test_decode_register_count_mismatch() {
        let frame = encode_read_response(1, &[1, 2]).unwrap();
        let err = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 3).unwrap_err();
        assert!(matches!(err, ModbusError::RegisterCountMismatch { expected: 6, received: 4 }));
    }

    #[test]
    fn test_decode_truncated_payload_is_too_short() {
        // Byte count claims two registers but only one is present
        let frame = with_crc(&[0x01, 0x03, 0x04, 0x00, 0x2A]);
        let err = decode_response(&frame, 1, FunctionCode::ReadHoldingRegisters, 2).unwrap_err();
        assert!(matches!(err, ModbusError::FrameTooShort { required: 9, received: 7 }));
    }

    #[test]
    fn test_decode_write_echo() {
        let frame = encode_write_response(3, 0x0010, 0xBEEF);
        let parsed = decode_response(&frame, 3, FunctionCode::WriteSingleRegister, 1).unwrap();
        assert_eq!(parsed.function_code, 0x06);
        assert_eq!(parsed.registers, vec![0xBEEF]);
    }

    #[test]
    fn test_request_roundtrip_through_slave_decoder() {
        let request = Request::read_holding_registers(9, 0x0100, 10).unwrap();
        assert_eq!(decode_request(&request.encode()).unwrap(), request);

        let request = Request::write_single_register(9, 0x0100, 0x8001).unwrap();
        assert_eq!(decode_request(&request.encode()).unwrap(), request);
    }

    #[test]
    fn test_exception_frame_layout() {
        let frame = encode_exception(1, 0x03, 0x02);
        assert_eq!(&frame[..3], &[0x01, 0x83, 0x02]);
        assert!(verify(&frame));
    }

    #[test]
    fn test_read_response_rejects_oversized_register_list() {
        let registers = vec![0u16; MAX_READ_REGISTERS as usize + 3];
        assert!(matches!(encode_read_response(1, &registers), Err(ModbusError::InvalidArgument(_))));
        assert!(encode_read_response(1, &[]).is_err());

        let frame = encode_read_response(1, &registers[..MAX_READ_REGISTERS as usize]).unwrap();
        assert_eq!(frame[2], 250);
    }
}
