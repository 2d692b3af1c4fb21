use std::sync::Arc;

use clap::Parser;
use tokio::io::BufReader;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use floodcast::cli;
use floodcast::node::BroadcastNode;
use floodcast::runtime;
use floodcast::settings::{self, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args and env vars
    let settings = cli::Cli::parse().into_settings();
    settings.validate()?;

    // stdout carries protocol traffic, so logs go to stderr
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "floodcast=info".into());
    match settings.log_format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
    }

    info!(
        "Starting {} {} with {:?} retry interval",
        settings::APP_NAME,
        settings::APP_VERSION,
        settings.retry_interval
    );
    runtime::run(
        &settings,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        |transport, settings| Ok(Arc::new(BroadcastNode::new(transport, settings))),
    )
    .await?;

    Ok(())
}
