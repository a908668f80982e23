use async_trait::async_trait;
use log::{debug, error, info, warn};
use serde::Serialize;
use serialport::SerialPort;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ByteStream, SerialTransport, BYTE_STREAM_CAPACITY};
use crate::config::{ParityConfig, SerialConfig};
use crate::utils::error::ModbusError;

/// Poll period of the blocking reader thread.
const READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Serialize)]
pub struct PortInfo {
    pub path: String,
    pub manufacturer: Option<String>,
}

/// Lists the serial devices present on this machine.
pub fn list_ports() -> Result<Vec<PortInfo>, ModbusError> {
    let ports = serialport::available_ports()
        .map_err(|e| ModbusError::OpenFailed(format!("Failed to enumerate ports: {}", e)))?;

    Ok(ports
        .into_iter()
        .map(|port| {
            let manufacturer = match port.port_type {
                serialport::SerialPortType::UsbPort(usb_info) => usb_info.manufacturer,
                _ => None,
            };
            PortInfo {
                path: port.port_name,
                manufacturer,
            }
        })
        .collect())
}

/// `serialport` backed transport. The port handle is blocking, so reads run
/// on a dedicated thread that forwards byte runs into the async side.
pub struct SerialPortTransport {
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
    reader_stop: Option<Arc<AtomicBool>>,
}

impl SerialPortTransport {
    pub fn new() -> Self {
        Self {
            port: None,
            reader_stop: None,
        }
    }

    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>, ModbusError> {
        self.port.clone().ok_or(ModbusError::NotConnected)
    }
}

impl Default for SerialPortTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn open_port(config: &SerialConfig) -> Result<Box<dyn SerialPort>, ModbusError> {
    let data_bits = match config.data_bits {
        7 => serialport::DataBits::Seven,
        _ => serialport::DataBits::Eight,
    };
    let stop_bits = match config.stop_bits {
        2 => serialport::StopBits::Two,
        _ => serialport::StopBits::One,
    };
    let parity = match config.parity {
        ParityConfig::None => serialport::Parity::None,
        ParityConfig::Even => serialport::Parity::Even,
        ParityConfig::Odd => serialport::Parity::Odd,
    };

    serialport::new(&config.port, config.baud_rate)
        .timeout(READ_POLL_INTERVAL)
        .data_bits(data_bits)
        .stop_bits(stop_bits)
        .parity(parity)
        .open()
        .map_err(|e| {
            error!("❌ Failed to open serial port {}: {}", config.port, e);
            ModbusError::OpenFailed(format!("{}: {}", config.port, e))
        })
}

fn spawn_reader(mut port: Box<dyn SerialPort>, tx: mpsc::Sender<Vec<u8>>, stop: Arc<AtomicBool>) {
    thread::spawn(move || {
        let mut buffer = [0u8; 256];
        while !stop.load(Ordering::Relaxed) {
            match port.read(&mut buffer) {
                Ok(0) => continue,
                Ok(n) => {
                    if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    warn!("⚠️ Serial read error, stopping reader: {}", e);
                    break;
                }
            }
        }
        debug!("Serial reader thread exited");
    });
}

#[async_trait]
impl SerialTransport for SerialPortTransport {
    async fn open(&mut self, config: &SerialConfig) -> Result<ByteStream, ModbusError> {
        info!("🔌 Connecting to Modbus RTU port: {}", config.port);
        info!("⚙️  Configuration: {}", config);

        let owned = config.clone();
        let port = tokio::task::spawn_blocking(move || open_port(&owned))
            .await
            .map_err(|e| ModbusError::OpenFailed(format!("open task failed: {}", e)))??;

        let reader = port
            .try_clone()
            .map_err(|e| ModbusError::OpenFailed(format!("Failed to clone port handle: {}", e)))?;

        let (tx, rx) = mpsc::channel(BYTE_STREAM_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        spawn_reader(reader, tx, stop.clone());

        self.port = Some(Arc::new(Mutex::new(port)));
        self.reader_stop = Some(stop);
        Ok(rx)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        let port = self.port()?;
        let frame = bytes.to_vec();

        tokio::task::spawn_blocking(move || {
            let mut port = port
                .lock()
                .map_err(|_| ModbusError::WriteFailed("port lock poisoned".to_string()))?;
            port.write_all(&frame)
                .map_err(|e| ModbusError::WriteFailed(format!("Write failed: {}", e)))?;
            port.flush()
                .map_err(|e| ModbusError::WriteFailed(format!("Flush failed: {}", e)))
        })
        .await
        .map_err(|e| ModbusError::WriteFailed(format!("write task failed: {}", e)))?
    }

    // Only the OS receive buffer; the reader thread may already have
    // forwarded earlier bytes into the channel.
    async fn flush_input(&mut self) -> Result<(), ModbusError> {
        let port = self.port()?;
        let port = port
            .lock()
            .map_err(|_| ModbusError::WriteFailed("port lock poisoned".to_string()))?;
        port.clear(serialport::ClearBuffer::Input)
            .map_err(|e| ModbusError::WriteFailed(format!("Failed to clear input buffer: {}", e)))
    }

    async fn close(&mut self) -> Result<(), ModbusError> {
        if let Some(stop) = self.reader_stop.take() {
            stop.store(true, Ordering::Relaxed);
        }
        if self.port.take().is_some() {
            info!("✅ Serial port closed");
        }
        Ok(())
    }
}
