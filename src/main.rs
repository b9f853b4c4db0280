use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crossway::{Config, Server};

/// L7 reverse proxy with host/path routing, middleware chains, load
/// balancing, SSE and WebSocket passthrough.
#[derive(Parser)]
#[command(name = "crossway", version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "crossway=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let validation = config.validate()?;
    for warning in &validation.warnings {
        tracing::warn!("{warning}");
    }

    tracing::info!(
        config = %args.config.display(),
        host_rules = config.host_rules.len(),
        services = config.services.len(),
        "Configuration loaded"
    );

    let server = Server::new(config)?;
    server.run().await?;

    tracing::info!("Server stopped gracefully");
    Ok(())
}
