use anyhow::{Context, Result};
use atft::{Cli, Config, Console};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .filter_level(cli.log_level)
        .try_init()
        .context("init env logger")?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("load configuration from {}", cli.config.display()))?;

    let console = Console::new(
        config,
        cli.config,
        cli.fastboot,
        cli.product,
        cli.auto,
    );
    console.start().await
}
