//! In-process simulated slave.
//!
//! Answers master requests written to it the way a real RTU slave on the
//! other end of the cable would, so the whole stack can run without
//! hardware. Tests use it to script silence, exceptions, delays and noise.

use async_trait::async_trait;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{ByteStream, SerialTransport, BYTE_STREAM_CAPACITY};
use crate::config::SerialConfig;
use crate::modbus::protocol::{self, FunctionCode, RequestPayload};
use crate::utils::error::{ExceptionKind, ModbusError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlaveBehavior {
    /// Serve reads and writes from the register map.
    Respond,
    /// Never answer.
    Silent,
    /// Answer every request with this exception code.
    Exception(u8),
    /// Answer every request with these exact bytes.
    Reply(Vec<u8>),
}

#[derive(Debug)]
struct SlaveState {
    slave_id: u8,
    registers: HashMap<u16, u16>,
    // Writes here are refused with IllegalDataAddress
    read_only: HashSet<u16>,
    behavior: SlaveBehavior,
    response_delay: Duration,
    // Splits each reply into two halves separated by this gap
    split_gap: Option<Duration>,
    open_delay: Option<Duration>,
    power_up_noise: Vec<u8>,
    fail_writes: bool,
    tx: Option<mpsc::Sender<Vec<u8>>>,
    last_config: Option<SerialConfig>,
    requests: Vec<Vec<u8>>,
    input_flushes: usize,
    closes: usize,
}

/// Cloneable handle; every clone drives the same simulated device.
#[derive(Debug, Clone)]
pub struct SimulatedSlave {
    state: Arc<Mutex<SlaveState>>,
}

impl SimulatedSlave {
    pub fn new(slave_id: u8) -> Self {
        Self {
            state: Arc::new(Mutex::new(SlaveState {
                slave_id,
                registers: HashMap::new(),
                read_only: HashSet::new(),
                behavior: SlaveBehavior::Respond,
                response_delay: Duration::from_millis(10),
                split_gap: None,
                open_delay: None,
                power_up_noise: Vec::new(),
                fail_writes: false,
                tx: None,
                last_config: None,
                requests: Vec::new(),
                input_flushes: 0,
                closes: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SlaveState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_register(&self, address: u16, value: u16) {
        self.state().registers.insert(address, value);
    }

    pub fn register(&self, address: u16) -> u16 {
        self.state().registers.get(&address).copied().unwrap_or(0)
    }

    pub fn set_read_only(&self, address: u16) {
        self.state().read_only.insert(address);
    }

    pub fn set_behavior(&self, behavior: SlaveBehavior) {
        self.state().behavior = behavior;
    }

    pub fn set_response_delay(&self, delay: Duration) {
        self.state().response_delay = delay;
    }

    pub fn set_split_gap(&self, gap: Option<Duration>) {
        self.state().split_gap = gap;
    }

    pub fn set_open_delay(&self, delay: Option<Duration>) {
        self.state().open_delay = delay;
    }

    pub fn set_power_up_noise(&self, noise: Vec<u8>) {
        self.state().power_up_noise = noise;
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn last_config(&self) -> Option<SerialConfig> {
        self.state().last_config.clone()
    }

    /// Every frame the master has written, oldest first.
    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.state().requests.clone()
    }

    pub fn input_flushes(&self) -> usize {
        self.state().input_flushes
    }

    pub fn closes(&self) -> usize {
        self.state().closes
    }

    pub fn is_open(&self) -> bool {
        self.state().tx.is_some()
    }

    /// Puts raw bytes on the line now, as if sent by some device.
    pub async fn inject(&self, bytes: Vec<u8>) -> bool {
        let tx = self.state().tx.clone();
        match tx {
            Some(tx) => tx.send(bytes).await.is_ok(),
            None => false,
        }
    }

    fn reply_for(state: &mut SlaveState, frame: &[u8]) -> Option<Vec<u8>> {
        let request = match protocol::decode_request(frame) {
            Ok(request) => request,
            Err(e) => {
                debug!("Simulated slave ignoring malformed request: {}", e);
                return None;
            }
        };
        if request.slave_id() != state.slave_id {
            return None;
        }

        let function = request.function().code();
        match &state.behavior {
            SlaveBehavior::Silent => None,
            SlaveBehavior::Exception(code) => Some(protocol::encode_exception(state.slave_id, function, *code)),
            SlaveBehavior::Reply(bytes) => Some(bytes.clone()),
            SlaveBehavior::Respond => match (request.function(), request.payload()) {
                (FunctionCode::ReadHoldingRegisters, RequestPayload::RegisterCount(count)) => {
                    let start = request.start_address() as u32;
                    if start + count as u32 > 0x1_0000 {
                        return Some(protocol::encode_exception(
                            state.slave_id,
                            function,
                            exception_code(ExceptionKind::IllegalDataAddress),
                        ));
                    }
                    let values: Vec<u16> = (0..count)
                        .map(|offset| {
                            let address = request.start_address() + offset;
                            state.registers.get(&address).copied().unwrap_or(0)
                        })
                        .collect();
                    match protocol::encode_read_response(state.slave_id, &values) {
                        Ok(frame) => Some(frame),
                        Err(_) => Some(protocol::encode_exception(
                            state.slave_id,
                            function,
                            exception_code(ExceptionKind::IllegalDataValue),
                        )),
                    }
                }
                (FunctionCode::WriteSingleRegister, RequestPayload::SingleValue(_))
                    if state.read_only.contains(&request.start_address()) =>
                {
                    Some(protocol::encode_exception(
                        state.slave_id,
                        function,
                        exception_code(ExceptionKind::IllegalDataAddress),
                    ))
                }
                (FunctionCode::WriteSingleRegister, RequestPayload::SingleValue(value)) => {
                    state.registers.insert(request.start_address(), value);
                    Some(protocol::encode_write_response(state.slave_id, request.start_address(), value))
                }
                _ => Some(protocol::encode_exception(
                    state.slave_id,
                    function,
                    exception_code(ExceptionKind::IllegalFunction),
                )),
            },
        }
    }
}

fn exception_code(kind: ExceptionKind) -> u8 {
    match kind {
        ExceptionKind::IllegalFunction => 0x01,
        ExceptionKind::IllegalDataAddress => 0x02,
        ExceptionKind::IllegalDataValue => 0x03,
        ExceptionKind::SlaveDeviceFailure => 0x04,
        ExceptionKind::Unknown => 0xFF,
    }
}

#[async_trait]
impl SerialTransport for SimulatedSlave {
    async fn open(&mut self, config: &SerialConfig) -> Result<ByteStream, ModbusError> {
        let open_delay = self.state().open_delay;
        if let Some(delay) = open_delay {
            tokio::time::sleep(delay).await;
        }

        let (tx, rx) = mpsc::channel(BYTE_STREAM_CAPACITY);
        let mut state = self.state();
        if !state.power_up_noise.is_empty() {
            let _ = tx.try_send(state.power_up_noise.clone());
        }
        state.tx = Some(tx);
        state.last_config = Some(config.clone());
        debug!("Simulated slave {} attached ({})", state.slave_id, config);
        Ok(rx)
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), ModbusError> {
        let (tx, reply, delay, split_gap) = {
            let mut state = self.state();
            if state.fail_writes {
                return Err(ModbusError::WriteFailed("simulated device unplugged".to_string()));
            }
            let tx = state.tx.clone().ok_or(ModbusError::NotConnected)?;
            state.requests.push(bytes.to_vec());
            let reply = Self::reply_for(&mut state, bytes);
            (tx, reply, state.response_delay, state.split_gap)
        };

        if let Some(reply) = reply {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                match split_gap {
                    Some(gap) if reply.len() > 1 => {
                        let (head, tail) = reply.split_at(reply.len() / 2);
                        if tx.send(head.to_vec()).await.is_err() {
                            return;
                        }
                        tokio::time::sleep(gap).await;
                        let _ = tx.send(tail.to_vec()).await;
                    }
                    _ => {
                        let _ = tx.send(reply).await;
                    }
                }
            });
        }
        Ok(())
    }

    async fn flush_input(&mut self) -> Result<(), ModbusError> {
        self.state().input_flushes += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ModbusError> {
        let mut state = self.state();
        state.tx = None;
        state.closes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SerialConfig {
        SerialConfig::default()
    }

    #[tokio::test(start_paused = true)]
    async fn test_answers_read_from_register_map() {
        let mut slave = SimulatedSlave::new(1);
        slave.set_register(10, 0x1234);
        let mut rx = slave.open(&config()).await.unwrap();

        slave.write(&protocol::encode_read_request(1, 10, 2).unwrap()).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, protocol::encode_read_response(1, &[0x1234, 0]).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_slave_ids() {
        let mut slave = SimulatedSlave::new(1);
        let mut rx = slave.open(&config()).await.unwrap();

        slave.write(&protocol::encode_read_request(2, 0, 1).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(slave.requests().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_updates_register_map() {
        let mut slave = SimulatedSlave::new(4);
        let mut rx = slave.open(&config()).await.unwrap();

        let request = protocol::encode_write_request(4, 7, 99).unwrap();
        slave.write(&request).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), request);
        assert_eq!(slave.register(7), 99);
    }

    #[tokio::test]
    async fn test_write_before_open_is_not_connected() {
        let mut slave = SimulatedSlave::new(1);
        let err = slave.write(&[0x01]).await.unwrap_err();
        assert!(matches!(err, ModbusError::NotConnected));
    }
}
