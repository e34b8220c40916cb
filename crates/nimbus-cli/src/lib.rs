//! nimbus CLI library
//!
//! Argument types and the serve loop shared by the binary and its
//! tests. The binary picks a provider per subcommand; everything
//! after that is identical wiring.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use nimbus_block::{
    BlockCache, BlockDevice, BlockMap, BlockMapConfig, DEFAULT_BLOCK_SIZE, DEFAULT_CACHE_BYTES,
    NbdServer, NbdServerConfig,
};
use nimbus_store::BlockProvider;

/// Top-level command line
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(author, version, about = "Serve remote object storage as an NBD block device")]
pub struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands, one per provider
#[derive(Subcommand)]
pub enum Commands {
    /// Serve blocks stored as files in a local directory
    ServeLocal {
        /// Directory holding the block files
        folder: PathBuf,

        #[command(flatten)]
        device: DeviceOpts,
    },
    /// Serve blocks stored in a Dropbox folder
    ServeDropbox {
        /// OAuth2 access token
        #[arg(long)]
        token: String,

        /// Dropbox folder holding the block files
        folder: String,

        #[command(flatten)]
        device: DeviceOpts,
    },
}

/// Device geometry and tuning shared by every provider
#[derive(Args)]
pub struct DeviceOpts {
    /// Virtual device size in bytes; must be a multiple of the block size
    #[arg(long)]
    pub size: u64,

    /// Bytes per block
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    pub block_size: u64,

    /// Block cache budget in bytes
    #[arg(long, default_value_t = DEFAULT_CACHE_BYTES)]
    pub cache: u64,

    /// Background flush period in seconds
    #[arg(long, default_value_t = 5)]
    pub sync_interval: u64,

    /// Dirty-block count that forces a flush
    #[arg(long, default_value_t = 16)]
    pub max_write_queue: usize,

    /// Bound on parallel block downloads per request
    #[arg(long, default_value_t = 4)]
    pub concurrent_reads: usize,

    /// Bound on parallel block uploads
    #[arg(long, default_value_t = 4)]
    pub concurrent_writes: usize,

    /// TCP address the NBD server listens on
    #[arg(long, default_value = "127.0.0.1:10809")]
    pub bind: SocketAddr,

    /// Export name announced to NBD clients
    #[arg(long, default_value = "nimbus")]
    pub export: String,
}

impl DeviceOpts {
    /// Block map configuration for these options
    pub fn block_map_config(&self) -> Result<BlockMapConfig> {
        if self.block_size == 0 {
            bail!("--block-size must be non-zero");
        }
        if self.size == 0 {
            bail!("--size must be non-zero");
        }
        if self.size % self.block_size != 0 {
            bail!(
                "--size {} is not a multiple of the block size {}",
                self.size,
                self.block_size
            );
        }

        Ok(BlockMapConfig::new(self.size, self.block_size)
            .max_write_queue(self.max_write_queue)
            .concurrent_reads(self.concurrent_reads)
            .concurrent_writes(self.concurrent_writes)
            .sync_interval(Duration::from_secs(self.sync_interval)))
    }
}

/// Serve a provider until ctrl-c, flushing buffered writes on the way out
pub async fn serve(provider: Arc<dyn BlockProvider>, opts: &DeviceOpts) -> Result<()> {
    let config = opts.block_map_config()?;
    let cache = BlockCache::with_byte_budget(opts.cache, opts.block_size);
    info!(
        size = opts.size,
        block_size = opts.block_size,
        cache_entries = cache.capacity(),
        "starting device"
    );

    let map = Arc::new(BlockMap::new(provider, cache, config).context("creating block map")?);
    let device = Arc::new(BlockDevice::new(Arc::clone(&map)));

    let server_config = NbdServerConfig::default()
        .bind(opts.bind)
        .export(&opts.export);
    let server = NbdServer::bind(device, server_config)
        .await
        .context("binding NBD server")?;

    tokio::select! {
        result = server.run() => result.context("NBD server failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down, flushing buffered writes");
            map.sync().await.context("final sync")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args.iter().copied()).unwrap()
    }

    #[test]
    fn defaults_apply_to_local_serve() {
        let cli = parse(&["nimbus", "serve-local", "/tmp/blocks", "--size", "8388608"]);
        match cli.command {
            Commands::ServeLocal { folder, device } => {
                assert_eq!(folder, PathBuf::from("/tmp/blocks"));
                assert_eq!(device.size, 8 * 1024 * 1024);
                assert_eq!(device.block_size, DEFAULT_BLOCK_SIZE);
                assert_eq!(device.max_write_queue, 16);
                assert_eq!(device.concurrent_reads, 4);
                assert_eq!(device.sync_interval, 5);
                assert_eq!(device.bind.port(), 10809);
            }
            _ => panic!("expected serve-local"),
        }
    }

    #[test]
    fn dropbox_serve_requires_a_token() {
        let result = Cli::try_parse_from([
            "nimbus",
            "serve-dropbox",
            "vdisk",
            "--size",
            "4194304",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn zero_block_size_is_rejected() {
        let cli = parse(&[
            "nimbus",
            "serve-local",
            "/tmp/blocks",
            "--size",
            "1024",
            "--block-size",
            "0",
        ]);
        match cli.command {
            Commands::ServeLocal { device, .. } => {
                assert!(device.block_map_config().is_err());
            }
            _ => panic!("expected serve-local"),
        }
    }

    #[test]
    fn unaligned_size_is_rejected() {
        let cli = parse(&[
            "nimbus",
            "serve-local",
            "/tmp/blocks",
            "--size",
            "1000",
            "--block-size",
            "16",
        ]);
        match cli.command {
            Commands::ServeLocal { device, .. } => {
                assert!(device.block_map_config().is_err());
            }
            _ => panic!("expected serve-local"),
        }
    }

    #[test]
    fn aligned_size_builds_a_config() {
        let cli = parse(&[
            "nimbus",
            "serve-local",
            "/tmp/blocks",
            "--size",
            "64",
            "--block-size",
            "16",
            "--max-write-queue",
            "2",
        ]);
        match cli.command {
            Commands::ServeLocal { device, .. } => {
                let config = device.block_map_config().unwrap();
                assert_eq!(config.block_count, 4);
                assert_eq!(config.max_write_queue, 2);
            }
            _ => panic!("expected serve-local"),
        }
    }
}
