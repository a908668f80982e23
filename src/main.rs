use anyhow::Result;
use log::error;

use rtu_master::cli::{build_cli, handle_subcommands};
use rtu_master::Config;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level));
    if verbose {
        // --verbose wins over RUST_LOG for our own frames
        builder.filter_module("rtu_master", log::LevelFilter::Debug);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));

    let config = match matches.subcommand_name() {
        // Listing ports works without a valid serial setup
        Some("ports") => Config::default(),
        _ => Config::from_matches(&matches)?,
    };

    // Bus commands handle Ctrl-C themselves so the port is closed cleanly
    let outcome = handle_subcommands(&matches, &config).await;

    match outcome {
        Ok(true) => Ok(()),
        Ok(false) => {
            error!("❌ Unknown command");
            std::process::exit(2);
        }
        Err(e) => {
            error!("❌ {}", e);
            std::process::exit(1);
        }
    }
}
