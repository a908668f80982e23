use std::fmt;
use thiserror::Error;

/// Device-reported exception categories (function code with the high bit set).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionKind {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    SlaveDeviceFailure,
    Unknown,
}

impl ExceptionKind {
    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => ExceptionKind::IllegalFunction,
            0x02 => ExceptionKind::IllegalDataAddress,
            0x03 => ExceptionKind::IllegalDataValue,
            0x04 => ExceptionKind::SlaveDeviceFailure,
            _ => ExceptionKind::Unknown,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExceptionKind::IllegalFunction => "function not supported by the slave",
            ExceptionKind::IllegalDataAddress => "register address does not exist",
            ExceptionKind::IllegalDataValue => "value not accepted by the slave",
            ExceptionKind::SlaveDeviceFailure => "internal slave device failure",
            ExceptionKind::Unknown => "unknown Modbus exception",
        }
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExceptionKind::IllegalFunction => "ILLEGAL FUNCTION",
            ExceptionKind::IllegalDataAddress => "ILLEGAL DATA ADDRESS",
            ExceptionKind::IllegalDataValue => "ILLEGAL DATA VALUE",
            ExceptionKind::SlaveDeviceFailure => "SLAVE DEVICE FAILURE",
            ExceptionKind::Unknown => "UNKNOWN",
        };
        write!(f, "{} ({})", name, self.description())
    }
}

#[derive(Error, Debug)]
pub enum ModbusError {
    // Connection level
    #[error("Serial connection is not open")]
    NotConnected,

    #[error("Serial connection is already open, close it first")]
    AlreadyConnected,

    #[error("Another transaction is already in progress")]
    TransactionInProgress,

    #[error("Timed out opening serial port after {0} ms")]
    OpenTimeout(u64),

    #[error("Failed to open serial port: {0}")]
    OpenFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("No response from slave within {0} ms")]
    Timeout(u64),

    // Protocol level
    #[error("Response frame too short: {received} bytes, need at least {required}")]
    FrameTooShort { required: usize, received: usize },

    #[error("CRC mismatch: expected {expected:02X?}, received {received:02X?}")]
    CrcMismatch { expected: [u8; 2], received: [u8; 2] },

    #[error("Slave ID mismatch: expected {expected}, received {received}")]
    SlaveIdMismatch { expected: u8, received: u8 },

    #[error("Function code mismatch: expected 0x{expected:02X}, received 0x{received:02X}")]
    FunctionCodeMismatch { expected: u8, received: u8 },

    #[error("Register byte count mismatch: expected {expected} bytes, received {received}")]
    RegisterCountMismatch { expected: usize, received: usize },

    #[error("Modbus exception {code}: {kind}")]
    ModbusException { code: u8, kind: ExceptionKind },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl ModbusError {
    pub fn exception(code: u8) -> Self {
        ModbusError::ModbusException {
            code,
            kind: ExceptionKind::from_code(code),
        }
    }

    /// Failures of the link itself; the caller should reconnect.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ModbusError::NotConnected
                | ModbusError::AlreadyConnected
                | ModbusError::OpenTimeout(_)
                | ModbusError::OpenFailed(_)
                | ModbusError::WriteFailed(_)
        )
    }

    /// The slave answered (or stayed silent); the caller may re-query.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            ModbusError::Timeout(_)
                | ModbusError::FrameTooShort { .. }
                | ModbusError::CrcMismatch { .. }
                | ModbusError::SlaveIdMismatch { .. }
                | ModbusError::FunctionCodeMismatch { .. }
                | ModbusError::RegisterCountMismatch { .. }
                | ModbusError::ModbusException { .. }
        )
    }
}

impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        ModbusError::WriteFailed(format!("IO error: {}", err))
    }
}

impl From<serialport::Error> for ModbusError {
    fn from(err: serialport::Error) -> Self {
        ModbusError::OpenFailed(err.to_string())
    }
}

impl From<toml::de::Error> for ModbusError {
    fn from(err: toml::de::Error) -> Self {
        ModbusError::ConfigError(format!("TOML parse error: {}", err))
    }
}

impl From<toml::ser::Error> for ModbusError {
    fn from(err: toml::ser::Error) -> Self {
        ModbusError::ConfigError(format!("TOML serialize error: {}", err))
    }
}
