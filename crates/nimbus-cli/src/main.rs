//! nimbus - remote object storage as an NBD block device

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nimbus_cli::{Cli, Commands};
use nimbus_store::{DropboxProvider, LocalProvider};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match cli.command {
        Commands::ServeLocal { folder, device } => {
            let provider = LocalProvider::open(folder, device.block_size as usize)
                .await
                .context("opening local block store")?;
            nimbus_cli::serve(Arc::new(provider), &device).await
        }
        Commands::ServeDropbox {
            token,
            folder,
            device,
        } => {
            let provider = DropboxProvider::connect(token, folder, device.block_size as usize)
                .await
                .context("connecting to Dropbox")?;
            nimbus_cli::serve(Arc::new(provider), &device).await
        }
    }
}
