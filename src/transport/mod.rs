pub mod loopback;
pub mod serial;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::SerialConfig;
use crate::utils::error::ModbusError;

/// Byte runs as they come off the line, in arrival order.
pub type ByteStream = mpsc::Receiver<Vec<u8>>;

/// Channel depth between the port reader and the framer.
pub const BYTE_STREAM_CAPACITY: usize = 64;

/// Physical serial link as seen by the connection.
///
/// `open` hands back the receive side of the line; every other call acts on
/// the port opened last. Implementations must make `close` safe to call on
/// a port that never finished opening.
#[async_trait]
pub trait SerialTransport: Send {
    async fn open(&mut self, config: &SerialConfig) -> Result<ByteStream, ModbusError>;
    async fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError>;
    /// Discards input the driver or OS still holds. Bytes already handed to
    /// the `ByteStream` are out of reach; the framer drains those itself.
    async fn flush_input(&mut self) -> Result<(), ModbusError>;
    async fn close(&mut self) -> Result<(), ModbusError>;
}

pub use loopback::{SimulatedSlave, SlaveBehavior};
pub use serial::{list_ports, PortInfo, SerialPortTransport};
