use std::io;
use std::process;

use anyhow::Result;
use power_runner::commands;
use power_runner::config::{Command, RunnerConfig, USAGE};
use power_runner::monitors;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .with_writer(io::stderr)
        .init();

    let config = RunnerConfig::from_env().unwrap_or_else(|err| {
        eprintln!("{err}");
        eprintln!("{USAGE}");
        process::exit(2);
    });

    if let Err(err) = execute(&config) {
        eprintln!("error: {err:#}");
        process::exit(1);
    }
}

fn execute(config: &RunnerConfig) -> Result<()> {
    match &config.command {
        Command::Run => commands::run(config).map(drop),
        Command::Stream(options) => {
            let mut monitor = monitors::open(&config.monitor)?;
            commands::stream(&mut monitor, options, io::stdout().lock()).map(drop)
        }
        Command::Status => {
            let mut monitor = monitors::open(&config.monitor)?;
            commands::status(&mut monitor, io::stdout().lock())
        }
        Command::Set(options) => {
            let mut monitor = monitors::open(&config.monitor)?;
            commands::set(&mut monitor, options, io::stdin().lock(), io::stdout().lock())
        }
    }
}
