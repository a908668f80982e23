//! Modbus RTU master over a serial line.
//!
//! Builds read/write holding-register requests, frames the byte stream by
//! inter-byte silence, validates responses (slave ID, CRC, exception,
//! function code, byte count) and keeps at most one transaction on the bus.

pub mod cli;
pub mod config;
pub mod modbus;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, ParityConfig, SerialConfig, TimingConfig};
pub use modbus::{FunctionCode, ModbusClient, ParsedResponse, Request};
pub use transport::{SerialPortTransport, SerialTransport, SimulatedSlave};
pub use utils::error::{ExceptionKind, ModbusError};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
