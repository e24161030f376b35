//! dh-runner entry point

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dh_runner::{lifecycle, Args, DaemonConfig};

fn main() -> ExitCode {
    let args = Args::parse();
    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return e.exit_code();
        }
    };

    if let Err(e) = init_logging(&config) {
        eprintln!("Error: {}", e);
        return ExitCode::from(2);
    }

    match lifecycle::run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            e.exit_code()
        }
    }
}

/// Logs go to stderr; stdout may be the protocol channel
fn init_logging(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = if std::env::var_os("RUST_LOG").is_some() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::from_default_env().add_directive(config.log_directive().parse()?)
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialise logging: {e}"))?;
    Ok(())
}
