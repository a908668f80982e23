use log::{info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::connection::{Connection, ConnectionSettings};
use super::protocol::{ParsedResponse, Request};
use super::transaction::TransactionManager;
use crate::config::{Config, SerialConfig};
use crate::transport::{SerialPortTransport, SerialTransport};
use crate::utils::error::ModbusError;

/// Address probed by `test_connection`.
const PROBE_ADDRESS: u16 = 0;

/// Pause between polling rounds, giving the slave time to settle.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What `poll_registers` reads and how often.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSettings {
    pub address: u16,
    pub count: u16,
    pub interval: Duration,
    /// Stop after this many rounds; `None` polls until cancelled.
    pub rounds: Option<u64>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    pub rounds: u64,
    pub failures: u64,
    pub cancelled: bool,
}

/// Result of one pair in `write_registers`.
#[derive(Debug)]
pub struct WriteOutcome {
    pub address: u16,
    pub value: u16,
    pub result: Result<u16, ModbusError>,
}

/// Value echoed by a write-single-register response.
fn echoed_value(response: &ParsedResponse) -> Result<u16, ModbusError> {
    match response.registers.as_slice() {
        [value] => Ok(*value),
        other => Err(ModbusError::RegisterCountMismatch {
            expected: 2,
            received: other.len() * 2,
        }),
    }
}

/// Caller-facing Modbus RTU master bound to one serial bus.
pub struct ModbusClient {
    connection: Arc<Connection>,
    transactions: TransactionManager,
    probe_timeout: Duration,
}

impl ModbusClient {
    pub fn new(transport: Box<dyn SerialTransport>, config: &Config) -> Self {
        let connection = Arc::new(Connection::new(transport, ConnectionSettings::from(&config.timing)));
        Self {
            transactions: TransactionManager::new(connection.clone()),
            connection,
            probe_timeout: Duration::from_millis(config.timing.probe_timeout_ms),
        }
    }

    /// Client over a real serial port.
    pub fn serial(config: &Config) -> Self {
        Self::new(Box::new(SerialPortTransport::new()), config)
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub async fn open_connection(&self, serial: &SerialConfig) -> Result<(), ModbusError> {
        self.connection.open(serial).await
    }

    pub async fn close_connection(&self) -> Result<(), ModbusError> {
        self.connection.close().await
    }

    pub async fn read_registers(
        &self,
        slave_id: u8,
        address: u16,
        count: u16,
        timeout: Duration,
    ) -> Result<Vec<u16>, ModbusError> {
        info!("📊 Reading {} registers from device {} starting at address {}", count, slave_id, address);

        let request = Request::read_holding_registers(slave_id, address, count)?;
        let response = self.transactions.send(&request, timeout).await?;
        Ok(response.registers)
    }

    /// Writes one holding register and returns the value echoed by the slave.
    pub async fn write_register(
        &self,
        slave_id: u8,
        address: u16,
        value: u16,
        timeout: Duration,
    ) -> Result<u16, ModbusError> {
        info!("📝 Writing {} to register {} on device {}", value, address, slave_id);

        let request = Request::write_single_register(slave_id, address, value)?;
        let response = self.transactions.send(&request, timeout).await?;
        echoed_value(&response)
    }

    /// Writes `pairs` one after another. A failed pair is logged and skipped;
    /// the remaining pairs are still written.
    pub async fn write_registers(&self, slave_id: u8, pairs: &[(u16, u16)], timeout: Duration) -> Vec<WriteOutcome> {
        info!("📝 Writing {} register(s) on device {}", pairs.len(), slave_id);

        let mut outcomes = Vec::with_capacity(pairs.len());
        for &(address, value) in pairs {
            let result = self.write_register(slave_id, address, value, timeout).await;
            if let Err(e) = &result {
                warn!("❌ Write of {} to register {} failed, skipping: {}", value, address, e);
            }
            outcomes.push(WriteOutcome { address, value, result });
        }
        outcomes
    }

    /// Reads the same block repeatedly until `cancel` completes, the round
    /// limit is reached or the link fails.
    ///
    /// Every round is reported to `on_round`. Slave-side failures (timeouts,
    /// bad frames, exceptions) are counted and polling goes on; a connection
    /// error ends polling with that error.
    pub async fn poll_registers<C, F>(
        &self,
        slave_id: u8,
        settings: &PollSettings,
        cancel: C,
        mut on_round: F,
    ) -> Result<PollSummary, ModbusError>
    where
        C: Future<Output = ()>,
        F: FnMut(u64, &Result<Vec<u16>, ModbusError>),
    {
        tokio::pin!(cancel);
        let mut summary = PollSummary {
            rounds: 0,
            failures: 0,
            cancelled: false,
        };
        info!(
            "🔄 Polling {} register(s) at {} on device {} every {} ms",
            settings.count,
            settings.address,
            slave_id,
            settings.interval.as_millis()
        );

        loop {
            let result = tokio::select! {
                result = self.read_registers(slave_id, settings.address, settings.count, settings.timeout) => result,
                _ = &mut cancel => {
                    summary.cancelled = true;
                    break;
                }
            };

            summary.rounds += 1;
            on_round(summary.rounds, &result);
            if let Err(e) = result {
                if e.is_connection_error() {
                    warn!("❌ Polling stopped after {} round(s): {}", summary.rounds, e);
                    return Err(e);
                }
                summary.failures += 1;
            }
            if settings.rounds.is_some_and(|limit| summary.rounds >= limit) {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(settings.interval) => {}
                _ = &mut cancel => {
                    summary.cancelled = true;
                    break;
                }
            }
        }

        info!(
            "⏹️ Polling finished: {} round(s), {} failed",
            summary.rounds, summary.failures
        );
        Ok(summary)
    }

    /// Reads one register at address 0 to check that the slave answers.
    pub async fn test_connection(&self, slave_id: u8) -> Result<(), ModbusError> {
        self.read_registers(slave_id, PROBE_ADDRESS, 1, self.probe_timeout).await?;
        info!("✅ Device {} is responsive", slave_id);
        Ok(())
    }
}
