use log::{debug, error, info, warn};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::framer::{self, FrameHandle};
use crate::config::{SerialConfig, TimingConfig};
use crate::transport::SerialTransport;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub inter_byte_timeout: Duration,
    pub open_timeout: Duration,
    pub settle_delay: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            inter_byte_timeout: framer::DEFAULT_QUIET_INTERVAL,
            open_timeout: Duration::from_millis(3000),
            settle_delay: Duration::from_millis(50),
        }
    }
}

impl From<&TimingConfig> for ConnectionSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            inter_byte_timeout: Duration::from_millis(timing.inter_byte_timeout_ms),
            open_timeout: Duration::from_millis(timing.open_timeout_ms),
            settle_delay: Duration::from_millis(timing.settle_delay_ms),
        }
    }
}

struct Link {
    port: String,
    frames: FrameHandle,
    driver: JoinHandle<()>,
}

/// Owns the serial transport and its open/closed state.
///
/// While open, a driver task feeds the line into a `FrameHandle`; the
/// transaction manager reaches the wire only through `write`,
/// `flush_input` and `frames`.
pub struct Connection {
    transport: AsyncMutex<Box<dyn SerialTransport>>,
    link: Mutex<Option<Link>>,
    settings: ConnectionSettings,
}

impl Connection {
    pub fn new(transport: Box<dyn SerialTransport>, settings: ConnectionSettings) -> Self {
        Self {
            transport: AsyncMutex::new(transport),
            link: Mutex::new(None),
            settings,
        }
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.settings
    }

    fn link(&self) -> MutexGuard<'_, Option<Link>> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_open(&self) -> bool {
        self.link().is_some()
    }

    pub fn port_name(&self) -> Option<String> {
        self.link().as_ref().map(|link| link.port.clone())
    }

    /// Framer of the open link, or `NotConnected`.
    pub fn frames(&self) -> Result<FrameHandle, ModbusError> {
        self.link()
            .as_ref()
            .map(|link| link.frames.clone())
            .ok_or(ModbusError::NotConnected)
    }

    pub async fn open(&self, config: &SerialConfig) -> Result<(), ModbusError> {
        config.validate()?;
        if self.is_open() {
            return Err(ModbusError::AlreadyConnected);
        }

        let mut transport = self.transport.lock().await;
        // Another open may have won while we waited for the transport
        if self.is_open() {
            return Err(ModbusError::AlreadyConnected);
        }

        let open_ms = self.settings.open_timeout.as_millis() as u64;
        let mut bytes = match timeout(self.settings.open_timeout, transport.open(config)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                error!("❌ Failed to open {}: {}", config.port, e);
                return Err(e);
            }
            Err(_) => {
                error!("❌ Opening {} timed out after {} ms", config.port, open_ms);
                if let Err(e) = transport.close().await {
                    warn!("⚠️ Failed to close half-open port {}: {}", config.port, e);
                }
                return Err(ModbusError::OpenTimeout(open_ms));
            }
        };

        // Stale bytes from a previous session or power-up transients
        if let Err(e) = transport.flush_input().await {
            warn!("⚠️ Failed to flush input buffer of {}: {}", config.port, e);
        }
        sleep(self.settings.settle_delay).await;

        let mut discarded = 0usize;
        while let Ok(stale) = bytes.try_recv() {
            discarded += stale.len();
        }
        if discarded > 0 {
            debug!("Discarded {} stale bytes received while settling", discarded);
        }

        let frames = FrameHandle::new(self.settings.inter_byte_timeout);
        let driver = tokio::spawn(framer::drive(frames.clone(), bytes));
        *self.link() = Some(Link {
            port: config.port.clone(),
            frames,
            driver,
        });

        info!("✅ Modbus RTU connection established on {} ({})", config.port, config);
        Ok(())
    }

    /// Closes the link. Closing a closed connection succeeds.
    ///
    /// An `open` still in progress holds the transport lock, so a concurrent
    /// close waits for it and then tears the fresh link down.
    pub async fn close(&self) -> Result<(), ModbusError> {
        let mut transport = self.transport.lock().await;
        let link = self.link().take();
        let Some(link) = link else {
            debug!("Connection already closed");
            return Ok(());
        };

        // Resolves any pending transaction before the port goes away
        link.frames.shutdown();
        link.driver.abort();

        if let Err(e) = transport.close().await {
            warn!("⚠️ Error while closing {}: {}", link.port, e);
        }
        info!("🔌 Disconnected from {}", link.port);
        Ok(())
    }

    pub async fn write(&self, bytes: &[u8]) -> Result<(), ModbusError> {
        if !self.is_open() {
            return Err(ModbusError::NotConnected);
        }
        let mut transport = self.transport.lock().await;
        transport.write(bytes).await
    }

    pub async fn flush_input(&self) -> Result<(), ModbusError> {
        if !self.is_open() {
            return Err(ModbusError::NotConnected);
        }
        let mut transport = self.transport.lock().await;
        transport.flush_input().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::SimulatedSlave;

    fn connection(slave: &SimulatedSlave) -> Connection {
        Connection::new(Box::new(slave.clone()), ConnectionSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_flushes_and_settles() {
        let slave = SimulatedSlave::new(1);
        slave.set_power_up_noise(vec![0x00, 0xFF, 0x13]);
        let conn = connection(&slave);

        let started = tokio::time::Instant::now();
        conn.open(&SerialConfig::default()).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(conn.is_open());
        assert_eq!(slave.input_flushes(), 1);
        assert_eq!(slave.last_config().unwrap(), SerialConfig::default());

        // Power-up noise never reaches the framer
        let frames = conn.frames().unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(frames.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_timeout_closes_half_open_port() {
        let slave = SimulatedSlave::new(1);
        slave.set_open_delay(Some(Duration::from_secs(10)));
        let conn = connection(&slave);

        let err = conn.open(&SerialConfig::default()).await.unwrap_err();
        assert!(matches!(err, ModbusError::OpenTimeout(3000)));
        assert!(!conn.is_open());
        assert_eq!(slave.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_open_is_rejected() {
        let slave = SimulatedSlave::new(1);
        let conn = connection(&slave);
        conn.open(&SerialConfig::default()).await.unwrap();
        let err = conn.open(&SerialConfig::default()).await.unwrap_err();
        assert!(matches!(err, ModbusError::AlreadyConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_is_idempotent() {
        let slave = SimulatedSlave::new(1);
        let conn = connection(&slave);
        conn.open(&SerialConfig::default()).await.unwrap();

        assert!(conn.close().await.is_ok());
        assert!(conn.close().await.is_ok());
        assert!(!conn.is_open());
        assert!(!slave.is_open());
        assert_eq!(slave.closes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_open_leaves_port_closed() {
        let slave = SimulatedSlave::new(1);
        slave.set_open_delay(Some(Duration::from_millis(100)));
        let conn = std::sync::Arc::new(connection(&slave));

        let opening = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.open(&SerialConfig::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        conn.close().await.unwrap();
        opening.await.unwrap().unwrap();

        assert!(!conn.is_open());
        assert!(!slave.is_open());
        assert_eq!(slave.closes(), 1);
        assert!(matches!(conn.frames(), Err(ModbusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_fast() {
        let slave = SimulatedSlave::new(1);
        let conn = connection(&slave);
        assert!(matches!(conn.frames(), Err(ModbusError::NotConnected)));
        assert!(matches!(conn.write(&[0x01]).await, Err(ModbusError::NotConnected)));
        assert!(matches!(conn.flush_input().await, Err(ModbusError::NotConnected)));
    }

    #[tokio::test]
    async fn test_invalid_serial_config_is_rejected() {
        let slave = SimulatedSlave::new(1);
        let conn = connection(&slave);
        let config = SerialConfig {
            data_bits: 6,
            ..SerialConfig::default()
        };
        assert!(matches!(conn.open(&config).await, Err(ModbusError::ConfigError(_))));
    }
}
