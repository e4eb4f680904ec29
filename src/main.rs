use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

/// Orchestrates PX4 SITL instances from a line console on stdin.
#[derive(Debug, Parser)]
#[command(name = "sitl-fleetd", version, about)]
struct Args {
    /// Config file (default: ~/.sitl_fleet/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the config file. RUST_LOG takes precedence.
    #[arg(long)]
    log_level: Option<String>,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Replies go to stdout, so logs stay on stderr.
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
    {
        eprintln!("Failed to initialise logging: {}", e);
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match sitl_fleet::load_config(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load config: {}", e);
            return ExitCode::FAILURE;
        }
    };
    init_logging(args.log_level.as_deref().unwrap_or(&config.log_level));

    match sitl_fleet::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
