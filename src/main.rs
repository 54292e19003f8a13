use std::sync::Once;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use nb::cli::{self, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = nb::config::load().unwrap_or_default();
    init_tracing(cli::effective_verbosity(cli.verbose, config.verbosity));

    if let Err(e) = cli::run(cli) {
        eprintln!("nb: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbosity: u8) {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let default = match verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .without_time()
            .init();
    });
}
