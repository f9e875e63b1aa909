//! Package feed server
//!
//! Run with: cargo run -p feed --features cli -- --config feed.toml

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use feed::{FeedBuilder, FeedConfig};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "feed-server")]
#[command(about = "Serve a NuGet v3 package feed")]
#[command(version)]
struct Cli {
    /// TOML configuration file. Defaults apply when omitted.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:5000")]
    listen: SocketAddr,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => {
            let document = tokio::fs::read_to_string(path).await?;
            FeedConfig::from_toml(&document)?
        }
        None => FeedConfig::default(),
    };

    let app = FeedBuilder::from_config(&config).await?.router();

    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    tracing::info!(
        "Package feed listening on http://{} (public URL {})",
        cli.listen,
        config.base_url
    );

    axum::serve(listener, app).await?;

    Ok(())
}
