pub mod commands;

use clap::{Arg, ArgAction, Command};

pub use commands::{handle_subcommands, OutputFormat};

pub fn build_cli() -> Command {
    Command::new("rtu-master")
        .version(crate::VERSION)
        .about("Modbus RTU master for holding registers over a serial line")
        .arg(Arg::new("config").short('c').long("config").global(true).help("TOML configuration file"))
        .arg(Arg::new("port").short('p').long("port").global(true).help("Serial port path, e.g. /dev/ttyUSB0 or COM3"))
        .arg(Arg::new("baud").short('b').long("baud").global(true).help("Baud rate"))
        .arg(Arg::new("data-bits").long("data-bits").global(true).help("Data bits (7 or 8)"))
        .arg(Arg::new("parity").long("parity").global(true).help("Parity: none, even or odd"))
        .arg(Arg::new("stop-bits").long("stop-bits").global(true).help("Stop bits (1 or 2)"))
        .arg(Arg::new("slave").short('s').long("slave").global(true).help("Slave ID (1-247)"))
        .arg(Arg::new("timeout").short('t').long("timeout").global(true).help("Response timeout in ms"))
        .arg(
            Arg::new("format")
                .short('f')
                .long("format")
                .global(true)
                .value_parser(["text", "json"])
                .default_value("text")
                .help("Output format"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Log frames and transaction states"),
        )
        .subcommand_required(true)
        .subcommand(Command::new("ports").about("List available serial ports"))
        .subcommand(Command::new("test").about("Probe the slave with a 1-register read at address 0"))
        .subcommand(
            Command::new("read")
                .about("Read holding registers (function 0x03)")
                .arg(Arg::new("address").required(true).help("Start address (0-65535)"))
                .arg(Arg::new("count").default_value("1").help("Number of registers (1-125)")),
        )
        .subcommand(
            Command::new("poll")
                .about("Read holding registers repeatedly until Ctrl-C")
                .arg(Arg::new("address").required(true).help("Start address (0-65535)"))
                .arg(Arg::new("count").default_value("1").help("Number of registers (1-125)"))
                .arg(
                    Arg::new("interval")
                        .short('i')
                        .long("interval")
                        .default_value("100")
                        .help("Pause between reads in ms"),
                )
                .arg(Arg::new("rounds").short('n').long("rounds").help("Stop after this many reads")),
        )
        .subcommand(
            Command::new("write")
                .about("Write holding registers one by one (function 0x06)")
                .arg(
                    Arg::new("pairs")
                        .required(true)
                        .num_args(1..)
                        .value_name("ADDR=VALUE")
                        .help("Registers to write, e.g. 16=500 0x11=0xFF; `<address> <value>` also works"),
                ),
        )
        .subcommand(
            Command::new("init-config")
                .about("Write a default configuration file")
                .arg(Arg::new("path").required(true).help("Destination TOML file")),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition_is_consistent() {
        build_cli().debug_assert();
    }

    #[test]
    fn test_read_defaults_to_one_register() {
        let matches = build_cli().try_get_matches_from(["rtu-master", "read", "100"]).unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "read");
        assert_eq!(sub.get_one::<String>("count").unwrap(), "1");
        assert_eq!(matches.get_one::<String>("format").unwrap(), "text");
    }

    #[test]
    fn test_write_takes_many_pairs_and_poll_defaults() {
        let matches = build_cli().try_get_matches_from(["rtu-master", "write", "1=2", "3=4"]).unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        let pairs: Vec<&String> = sub.get_many::<String>("pairs").unwrap().collect();
        assert_eq!(pairs, ["1=2", "3=4"]);

        let matches = build_cli().try_get_matches_from(["rtu-master", "poll", "5"]).unwrap();
        let (_, sub) = matches.subcommand().unwrap();
        assert_eq!(sub.get_one::<String>("interval").unwrap(), "100");
        assert!(sub.get_one::<String>("rounds").is_none());
    }

    #[test]
    fn test_subcommand_is_required() {
        assert!(build_cli().try_get_matches_from(["rtu-master"]).is_err());
    }
}
