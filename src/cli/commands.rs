use clap::ArgMatches;
use log::{error, info, warn};
use serde_json::json;
use std::future::Future;
use std::time::Duration;

use crate::config::Config;
use crate::modbus::client::{PollSettings, PollSummary};
use crate::modbus::ModbusClient;
use crate::transport::list_ports;
use crate::utils::error::ModbusError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    pub fn from_matches(matches: &ArgMatches) -> Self {
        match matches.get_one::<String>("format").map(String::as_str) {
            Some("json") => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

/// One `ADDR=VALUE` argument of the write command and what became of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub target: String,
    pub address: Option<u16>,
    pub value: Option<u16>,
    pub outcome: Result<u16, String>,
}

/// Result of a bus command, ready to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutput {
    Probe { slave_id: u8 },
    Registers { slave_id: u8, address: u16, values: Vec<u16> },
    Written { slave_id: u8, reports: Vec<WriteReport> },
    Polled { slave_id: u8, summary: PollSummary },
}

impl CommandOutput {
    pub fn render(&self, format: OutputFormat) -> String {
        match format {
            OutputFormat::Json => self.to_json().to_string(),
            OutputFormat::Text => self.to_text(),
        }
    }

    fn to_json(&self) -> serde_json::Value {
        match self {
            CommandOutput::Probe { slave_id } => json!({ "success": true, "slave_id": slave_id }),
            CommandOutput::Registers { slave_id, address, values } => json!({
                "success": true,
                "slave_id": slave_id,
                "address": address,
                "data": values,
            }),
            CommandOutput::Written { slave_id, reports } => {
                let writes: Vec<serde_json::Value> = reports
                    .iter()
                    .map(|report| match &report.outcome {
                        Ok(echoed) => json!({
                            "address": report.address,
                            "value": echoed,
                            "success": true,
                        }),
                        Err(message) => json!({
                            "target": report.target,
                            "success": false,
                            "message": message,
                        }),
                    })
                    .collect();
                json!({
                    "success": reports.iter().all(|r| r.outcome.is_ok()),
                    "slave_id": slave_id,
                    "writes": writes,
                })
            }
            CommandOutput::Polled { slave_id, summary } => json!({
                "success": true,
                "slave_id": slave_id,
                "rounds": summary.rounds,
                "failures": summary.failures,
                "cancelled": summary.cancelled,
            }),
        }
    }

    fn to_text(&self) -> String {
        match self {
            CommandOutput::Probe { slave_id } => {
                format!("✅ Connection test passed: device {} responded", slave_id)
            }
            CommandOutput::Registers { slave_id, address, values } => {
                let mut out = format!("📊 Device {} - {} register(s) from {}:", slave_id, values.len(), address);
                for (offset, value) in values.iter().enumerate() {
                    out.push_str(&format!(
                        "\n   [{}] {} (0x{:04X})",
                        *address as usize + offset,
                        value,
                        value
                    ));
                }
                out
            }
            CommandOutput::Written { slave_id, reports } => {
                let ok = reports.iter().filter(|r| r.outcome.is_ok()).count();
                let mut out = format!("📝 Device {} - {}/{} write(s) succeeded:", slave_id, ok, reports.len());
                for report in reports {
                    match (&report.outcome, report.address) {
                        (Ok(echoed), Some(address)) => {
                            out.push_str(&format!("\n   ✅ Wrote {} to register {}", echoed, address))
                        }
                        (Err(message), _) => out.push_str(&format!("\n   ❌ {}: {}", report.target, message)),
                        (Ok(_), None) => {}
                    }
                }
                out
            }
            CommandOutput::Polled { summary, .. } => format!(
                "⏹️  Polling stopped after {} round(s), {} failed",
                summary.rounds, summary.failures
            ),
        }
    }
}

fn render_error(err: &ModbusError, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => json!({
            "success": false,
            "message": err.to_string(),
            "connection_error": err.is_connection_error(),
        })
        .to_string(),
        OutputFormat::Text => format!("❌ {}", err),
    }
}

fn render_round(round: u64, address: u16, result: &Result<Vec<u16>, ModbusError>, format: OutputFormat) -> String {
    match (format, result) {
        (OutputFormat::Json, Ok(values)) => {
            json!({ "round": round, "success": true, "address": address, "data": values }).to_string()
        }
        (OutputFormat::Json, Err(e)) => {
            json!({ "round": round, "success": false, "message": e.to_string() }).to_string()
        }
        (OutputFormat::Text, Ok(values)) => {
            let values: Vec<String> = values.iter().map(u16::to_string).collect();
            format!("🔄 #{} [{}]: {}", round, address, values.join(", "))
        }
        (OutputFormat::Text, Err(e)) => format!("❌ #{} {}", round, e),
    }
}

/// Parses a register word, decimal or `0x` hex.
pub fn parse_word(raw: &str, what: &str) -> Result<u16, ModbusError> {
    let trimmed = raw.trim();
    let parsed = match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => trimmed.parse::<u16>(),
    };
    parsed.map_err(|_| ModbusError::InvalidArgument(format!("{} '{}' is not a value in 0-65535", what, raw)))
}

/// Splits write arguments into `(address, value)` pairs. A bare
/// `<address> <value>` is one pair; anything else must be `ADDR=VALUE`.
pub fn parse_write_pairs(args: &[String]) -> Vec<(String, Result<(u16, u16), ModbusError>)> {
    if let [address, value] = args {
        if !address.contains('=') && !value.contains('=') {
            let target = format!("{}={}", address, value);
            let pair = parse_word(address, "address").and_then(|a| Ok((a, parse_word(value, "value")?)));
            return vec![(target, pair)];
        }
    }

    args.iter()
        .map(|arg| {
            let pair = match arg.split_once('=') {
                Some((address, value)) => {
                    parse_word(address, "address").and_then(|a| Ok((a, parse_word(value, "value")?)))
                }
                None => Err(ModbusError::InvalidArgument(format!("'{}' is not ADDR=VALUE", arg))),
            };
            (arg.clone(), pair)
        })
        .collect()
}

fn required<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String, ModbusError> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| ModbusError::InvalidArgument(format!("missing <{}>", name)))
}

/// Runs one bus command on an already open client.
pub async fn run_bus_command(
    client: &ModbusClient,
    name: &str,
    matches: &ArgMatches,
    config: &Config,
) -> Result<CommandOutput, ModbusError> {
    let slave_id = config.default_slave_id;
    let timeout = Duration::from_millis(config.timing.response_timeout_ms);

    match name {
        "test" => {
            client.test_connection(slave_id).await?;
            Ok(CommandOutput::Probe { slave_id })
        }
        "read" => {
            let address = parse_word(required(matches, "address")?, "address")?;
            let count = parse_word(required(matches, "count")?, "count")?;
            let values = client.read_registers(slave_id, address, count, timeout).await?;
            Ok(CommandOutput::Registers { slave_id, address, values })
        }
        "write" => {
            let args: Vec<String> = matches
                .get_many::<String>("pairs")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();
            let parsed = parse_write_pairs(&args);

            let mut reports = Vec::with_capacity(parsed.len());
            for (target, pair) in parsed {
                let report = match pair {
                    Ok((address, value)) => {
                        let mut outcomes = client.write_registers(slave_id, &[(address, value)], timeout).await;
                        let outcome = outcomes
                            .pop()
                            .map(|o| o.result.map_err(|e| e.to_string()))
                            .unwrap_or_else(|| Err("no write performed".to_string()));
                        WriteReport { target, address: Some(address), value: Some(value), outcome }
                    }
                    Err(e) => {
                        warn!("❌ Skipping '{}': {}", target, e);
                        WriteReport { target, address: None, value: None, outcome: Err(e.to_string()) }
                    }
                };
                reports.push(report);
            }
            Ok(CommandOutput::Written { slave_id, reports })
        }
        other => Err(ModbusError::InvalidArgument(format!("unknown command '{}'", other))),
    }
}

/// Polls until `cancel` completes, printing each round as it arrives.
pub async fn run_poll<C>(
    client: &ModbusClient,
    matches: &ArgMatches,
    config: &Config,
    format: OutputFormat,
    cancel: C,
) -> Result<CommandOutput, ModbusError>
where
    C: Future<Output = ()>,
{
    let slave_id = config.default_slave_id;
    let interval = required(matches, "interval")?;
    let interval = interval
        .parse::<u64>()
        .map_err(|_| ModbusError::InvalidArgument(format!("interval '{}' is not a number of ms", interval)))?;
    let rounds = match matches.get_one::<String>("rounds") {
        Some(raw) => Some(
            raw.parse::<u64>()
                .map_err(|_| ModbusError::InvalidArgument(format!("rounds '{}' is not a count", raw)))?,
        ),
        None => None,
    };

    let settings = PollSettings {
        address: parse_word(required(matches, "address")?, "address")?,
        count: parse_word(required(matches, "count")?, "count")?,
        interval: Duration::from_millis(interval),
        rounds,
        timeout: Duration::from_millis(config.timing.response_timeout_ms),
    };

    let summary = client
        .poll_registers(slave_id, &settings, cancel, |round, result| {
            println!("{}", render_round(round, settings.address, result, format));
        })
        .await?;
    Ok(CommandOutput::Polled { slave_id, summary })
}

/// Completes on Ctrl-C. Never completes if the handler cannot be installed.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("❌ Cannot listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Dispatches the parsed command line. Returns `Ok(false)` when no known
/// subcommand was given.
pub async fn handle_subcommands(matches: &ArgMatches, config: &Config) -> Result<bool, ModbusError> {
    let format = OutputFormat::from_matches(matches);
    let Some((name, sub)) = matches.subcommand() else {
        return Ok(false);
    };

    match name {
        "ports" => {
            let ports = list_ports()?;
            match format {
                OutputFormat::Json => println!("{}", json!(ports)),
                OutputFormat::Text if ports.is_empty() => println!("⚠️  No serial ports found"),
                OutputFormat::Text => {
                    println!("📡 Available Serial Ports:");
                    for (index, port) in ports.iter().enumerate() {
                        match &port.manufacturer {
                            Some(manufacturer) => println!("   {}. {} ({})", index + 1, port.path, manufacturer),
                            None => println!("   {}. {}", index + 1, port.path),
                        }
                    }
                }
            }
            Ok(true)
        }
        "init-config" => {
            let path = required(sub, "path")?;
            config.save_to_file(path)?;
            println!("📝 Configuration written to {}", path);
            Ok(true)
        }
        "test" | "read" | "write" | "poll" => {
            let client = ModbusClient::serial(config);
            client.open_connection(&config.serial).await?;

            let result = if name == "poll" {
                Some(run_poll(&client, sub, config, format, interrupted()).await)
            } else {
                tokio::select! {
                    result = run_bus_command(&client, name, sub, config) => Some(result),
                    _ = interrupted() => None,
                }
            };
            if let Err(e) = client.close_connection().await {
                error!("❌ Failed to close connection: {}", e);
            }

            match result {
                None => {
                    warn!("⚠️  Interrupted, pending transaction abandoned");
                    Ok(true)
                }
                Some(Ok(output)) => {
                    println!("{}", output.render(format));
                    Ok(true)
                }
                Some(Err(e)) => {
                    info!("Command '{}' failed: {}", name, e);
                    println!("{}", render_error(&e, format));
                    Err(e)
                }
            }
        }
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::build_cli;
    use crate::transport::SimulatedSlave;

    async fn open_client(slave: &SimulatedSlave, config: &Config) -> ModbusClient {
        let client = ModbusClient::new(Box::new(slave.clone()), config);
        client.open_connection(&config.serial).await.unwrap();
        client
    }

    fn sub_matches(args: &[&str]) -> (String, ArgMatches) {
        let matches = build_cli().try_get_matches_from(args).unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        (name.to_string(), sub.clone())
    }

    fn strings(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_word_accepts_decimal_and_hex() {
        assert_eq!(parse_word("42", "value").unwrap(), 42);
        assert_eq!(parse_word("0xBEEF", "value").unwrap(), 0xBEEF);
        assert!(parse_word("65536", "value").is_err());
        assert!(parse_word("-1", "value").is_err());
    }

    #[test]
    fn test_parse_write_pairs() {
        let pairs = parse_write_pairs(&strings(&["0x10", "500"]));
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].0, "0x10=500");
        assert_eq!(pairs[0].1.as_ref().unwrap(), &(16, 500));

        let pairs = parse_write_pairs(&strings(&["1=2", "oops", "3=0xFF"]));
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0].1.as_ref().unwrap(), &(1, 2));
        assert!(matches!(pairs[1].1, Err(ModbusError::InvalidArgument(_))));
        assert_eq!(pairs[2].1.as_ref().unwrap(), &(3, 255));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_command_against_simulated_slave() {
        let slave = SimulatedSlave::new(1);
        slave.set_register(100, 7);
        slave.set_register(101, 8);
        let config = Config::default();
        let client = open_client(&slave, &config).await;

        let (name, sub) = sub_matches(&["rtu-master", "read", "100", "2"]);
        let output = run_bus_command(&client, &name, &sub, &config).await.unwrap();
        assert_eq!(
            output,
            CommandOutput::Registers { slave_id: 1, address: 100, values: vec![7, 8] }
        );
        assert_eq!(
            output.render(OutputFormat::Json),
            r#"{"address":100,"data":[7,8],"slave_id":1,"success":true}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_command_reports_echo() {
        let slave = SimulatedSlave::new(1);
        let config = Config::default();
        let client = open_client(&slave, &config).await;

        let (name, sub) = sub_matches(&["rtu-master", "write", "0x10", "500"]);
        let output = run_bus_command(&client, &name, &sub, &config).await.unwrap();
        match &output {
            CommandOutput::Written { reports, .. } => {
                assert_eq!(reports.len(), 1);
                assert_eq!(reports[0].outcome, Ok(500));
            }
            other => panic!("unexpected output: {:?}", other),
        }
        assert!(output.render(OutputFormat::Text).contains("Wrote 500 to register 16"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_command_skips_bad_pairs_and_keeps_going() {
        let slave = SimulatedSlave::new(1);
        slave.set_read_only(2);
        let config = Config::default();
        let client = open_client(&slave, &config).await;

        let (name, sub) = sub_matches(&["rtu-master", "write", "1=10", "2=20", "junk", "3=30"]);
        let output = run_bus_command(&client, &name, &sub, &config).await.unwrap();

        let CommandOutput::Written { reports, .. } = &output else {
            panic!("unexpected output: {:?}", output);
        };
        let outcomes: Vec<bool> = reports.iter().map(|r| r.outcome.is_ok()).collect();
        assert_eq!(outcomes, vec![true, false, false, true]);
        assert_eq!(slave.register(1), 10);
        assert_eq!(slave.register(3), 30);
        // The unparsable pair never reached the bus
        assert_eq!(slave.requests().len(), 3);

        let json: serde_json::Value = serde_json::from_str(&output.render(OutputFormat::Json)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["writes"][3]["value"], 30);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_command_runs_requested_rounds() {
        let slave = SimulatedSlave::new(1);
        slave.set_register(5, 55);
        let config = Config::default();
        let client = open_client(&slave, &config).await;

        let (_, sub) = sub_matches(&["rtu-master", "poll", "5", "--rounds", "3", "--interval", "20"]);
        let output = run_poll(&client, &sub, &config, OutputFormat::Json, std::future::pending())
            .await
            .unwrap();

        assert_eq!(
            output,
            CommandOutput::Polled {
                slave_id: 1,
                summary: PollSummary { rounds: 3, failures: 0, cancelled: false },
            }
        );
        assert_eq!(slave.requests().len(), 3);
    }

    #[test]
    fn test_round_rendering() {
        let ok: Result<Vec<u16>, ModbusError> = Ok(vec![1, 2]);
        assert_eq!(render_round(4, 10, &ok, OutputFormat::Text), "🔄 #4 [10]: 1, 2");
        let failed: Result<Vec<u16>, ModbusError> = Err(ModbusError::Timeout(100));
        let json: serde_json::Value = serde_json::from_str(&render_round(5, 10, &failed, OutputFormat::Json)).unwrap();
        assert_eq!(json["round"], 5);
        assert_eq!(json["success"], false);
    }

    #[test]
    fn test_error_rendering() {
        let err = ModbusError::Timeout(1000);
        assert_eq!(render_error(&err, OutputFormat::Text), "❌ No response from slave within 1000 ms");
        let json: serde_json::Value = serde_json::from_str(&render_error(&err, OutputFormat::Json)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["connection_error"], false);
    }
}
