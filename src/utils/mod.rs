pub mod error;

pub use error::{ExceptionKind, ModbusError};
