use clap::ArgMatches;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::modbus::protocol::{MAX_SLAVE_ID, MIN_SLAVE_ID};
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    // Line settings
    pub serial: SerialConfig,

    // Timeouts and framing
    pub timing: TimingConfig,

    // Slave addressed when the command line does not name one
    pub default_slave_id: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SerialConfig {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: ParityConfig,
    pub stop_bits: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimingConfig {
    pub response_timeout_ms: u64,
    pub probe_timeout_ms: u64,
    pub inter_byte_timeout_ms: u64,
    pub open_timeout_ms: u64,
    pub settle_delay_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    None,
    Even,
    Odd,
}

impl FromStr for ParityConfig {
    type Err = ModbusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Ok(ParityConfig::None),
            "even" | "e" => Ok(ParityConfig::Even),
            "odd" | "o" => Ok(ParityConfig::Odd),
            other => Err(ModbusError::ConfigError(format!("unknown parity '{}'", other))),
        }
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            parity: ParityConfig::None,
            stop_bits: 1,
        }
    }
}

impl fmt::Display for SerialConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parity = match self.parity {
            ParityConfig::None => 'N',
            ParityConfig::Even => 'E',
            ParityConfig::Odd => 'O',
        };
        write!(f, "{} baud, {}{}{}", self.baud_rate, self.data_bits, parity, self.stop_bits)
    }
}

impl SerialConfig {
    pub fn validate(&self) -> Result<(), ModbusError> {
        if self.port.trim().is_empty() {
            return Err(ModbusError::ConfigError("serial port path is empty".to_string()));
        }
        if self.baud_rate == 0 {
            return Err(ModbusError::ConfigError("baud rate must be positive".to_string()));
        }
        if !matches!(self.data_bits, 7 | 8) {
            return Err(ModbusError::ConfigError(format!("data bits must be 7 or 8, got {}", self.data_bits)));
        }
        if !matches!(self.stop_bits, 1 | 2) {
            return Err(ModbusError::ConfigError(format!("stop bits must be 1 or 2, got {}", self.stop_bits)));
        }
        Ok(())
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 1000,
            probe_timeout_ms: 2000,
            inter_byte_timeout_ms: 50,
            open_timeout_ms: 3000,
            settle_delay_ms: 50,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            timing: TimingConfig::default(),
            default_slave_id: 1,
        }
    }
}

fn parse_arg<T: FromStr>(matches: &ArgMatches, name: &str) -> Result<Option<T>, ModbusError>
where
    T::Err: fmt::Display,
{
    match matches.get_one::<String>(name) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|e| ModbusError::ConfigError(format!("invalid --{} '{}': {}", name, raw, e))),
        None => Ok(None),
    }
}

impl Config {
    /// Loads `--config` when given, then applies command line overrides.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self, ModbusError> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        if let Some(port) = matches.get_one::<String>("port") {
            config.serial.port = port.clone();
        }
        if let Some(baud) = parse_arg::<u32>(matches, "baud")? {
            config.serial.baud_rate = baud;
        }
        if let Some(data_bits) = parse_arg::<u8>(matches, "data-bits")? {
            config.serial.data_bits = data_bits;
        }
        if let Some(parity) = parse_arg::<ParityConfig>(matches, "parity")? {
            config.serial.parity = parity;
        }
        if let Some(stop_bits) = parse_arg::<u8>(matches, "stop-bits")? {
            config.serial.stop_bits = stop_bits;
        }
        if let Some(slave) = parse_arg::<u8>(matches, "slave")? {
            config.default_slave_id = slave;
        }
        if let Some(timeout) = parse_arg::<u64>(matches, "timeout")? {
            config.timing.response_timeout_ms = timeout;
        }

        config.validate()?;
        debug!("Effective configuration: {:?}", config);
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ModbusError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ModbusError::ConfigError(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config = toml::from_str(&content)?;
        info!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ModbusError> {
        let path = path.as_ref();
        // Create directory if it doesn't exist
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ModbusError::ConfigError(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)
            .map_err(|e| ModbusError::ConfigError(format!("cannot write {}: {}", path.display(), e)))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ModbusError> {
        self.serial.validate()?;

        if !(MIN_SLAVE_ID..=MAX_SLAVE_ID).contains(&self.default_slave_id) {
            return Err(ModbusError::ConfigError(format!(
                "default slave id {} out of range {}-{}",
                self.default_slave_id, MIN_SLAVE_ID, MAX_SLAVE_ID
            )));
        }

        let timing = &self.timing;
        if timing.inter_byte_timeout_ms == 0 {
            return Err(ModbusError::ConfigError("inter-byte timeout must be positive".to_string()));
        }
        // The silence window has to close before the response deadline
        if timing.inter_byte_timeout_ms >= timing.response_timeout_ms {
            return Err(ModbusError::ConfigError(format!(
                "inter-byte timeout ({} ms) must be shorter than the response timeout ({} ms)",
                timing.inter_byte_timeout_ms, timing.response_timeout_ms
            )));
        }
        if timing.open_timeout_ms == 0 {
            return Err(ModbusError::ConfigError("open timeout must be positive".to_string()));
        }
        Ok(())
    }
}
