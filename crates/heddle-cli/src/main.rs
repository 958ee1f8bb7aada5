use anyhow::{Context as _, Result};
use clap::Parser as _;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt as _, util::SubscriberInitExt as _};

use heddle_core::HeddleConfig;
use heddle_core::config::{LogFormat, LoggingConfig};

mod cli;
mod commands;
mod plan;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HeddleConfig::load(cli.config.as_deref()).context("failed to load config")?;
    config.apply_env(cli.db);
    init_tracing(&config.logging);

    match cli.command {
        Commands::Demo => commands::demo(config).await?,
        Commands::Plan { file, run } => commands::plan(config, &file, run).await?,
        Commands::Locks => commands::locks(config).await?,
    }

    Ok(())
}

/// `RUST_LOG` wins; otherwise `heddle=<logging.level>`.
fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("heddle={}", logging.level)));
    let registry = tracing_subscriber::registry().with(filter);
    match logging.format {
        LogFormat::Pretty => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}
