pub mod client;
pub mod connection;
pub mod crc;
pub mod framer;
pub mod protocol;
pub mod transaction;

pub use client::ModbusClient;
pub use connection::{Connection, ConnectionSettings};
pub use crc::crc16_modbus;
pub use framer::{RawChunk, StreamFramer};
pub use protocol::{FunctionCode, ParsedResponse, Request};
pub use transaction::{TransactionManager, TransactionState};
