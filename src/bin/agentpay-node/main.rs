//! agentpay-node CLI entry point.

mod cli;

use agentpay::NodeBuilder;
use clap::Parser;
use cli::Cli;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    }

    info!("agentpay-node v{}", env!("CARGO_PKG_VERSION"));

    // Write the effective configuration and exit if asked to
    if let Some(path) = cli.write_config.clone() {
        let config = cli.into_config()?;
        config.to_file(&path)?;
        info!("Configuration written to {}", path.display());
        return Ok(());
    }

    // Build configuration
    let config = cli.into_config()?;

    // Build and run the node
    let mut node = NodeBuilder::new(config).build().await?;
    info!("Listening on http://{}", node.local_addr()?);

    // Run until shutdown
    node.run().await?;

    info!("Goodbye!");
    Ok(())
}
