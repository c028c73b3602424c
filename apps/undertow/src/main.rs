use anyhow::Context;
use clap::Parser;
use tracing::debug;

use undertow::telemetry::logging;
use undertow::terminal::{app, cli::Cli};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_config = cli.logging.to_config();
    logging::init(&log_config).context("configuring logging")?;
    debug!(target = "undertow::cli", log_level = ?log_config.level, log_file = ?log_config.file, "logging configured");
    app::run(cli).await?;
    Ok(())
}
