//! NBD server
//!
//! Listens for NBD clients, hands each accepted stream to a
//! connection handler, and drives the periodic flush of the device's
//! write buffer. The device is built for one kernel client, but a
//! reconnecting client gets a fresh handler.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::NbdServerConfig;
use crate::device::BlockDevice;
use crate::error::BlockResult;
use crate::nbd::{ExportInfo, NbdConnection};

/// NBD server over one block device
pub struct NbdServer {
    listener: TcpListener,
    device: Arc<BlockDevice>,
    export: ExportInfo,
    connections: AtomicU64,
}

impl NbdServer {
    /// Bind the listening socket and announce the export
    pub async fn bind(device: Arc<BlockDevice>, config: NbdServerConfig) -> BlockResult<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let map = device.block_map();
        let export = ExportInfo::new(&config.export, map.size(), map.block_size() as u32);
        info!(
            addr = %listener.local_addr()?,
            export = %export.name,
            size = export.size,
            "NBD server listening"
        );

        Ok(Self {
            listener,
            device,
            export,
            connections: AtomicU64::new(0),
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> BlockResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Total connections accepted so far
    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    /// Export metadata announced to clients
    pub fn export(&self) -> &ExportInfo {
        &self.export
    }

    /// Accept clients until the task is dropped
    ///
    /// Also spawns the background ticker that flushes a stale write
    /// buffer every `sync_interval`.
    pub async fn run(&self) -> BlockResult<()> {
        let ticker_device = Arc::clone(&self.device);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(ticker_device.block_map().sync_interval());
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                if let Err(e) = ticker_device.sync_if_timeout().await {
                    warn!(error = %e, "periodic flush failed; blocks stay buffered");
                }
            }
        });

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "accepted NBD connection");
                    self.connections.fetch_add(1, Ordering::Relaxed);

                    let device = Arc::clone(&self.device);
                    let export = self.export.clone();
                    tokio::spawn(async move {
                        match NbdConnection::new(stream).run(&export, device).await {
                            Ok(()) => debug!(%addr, "connection closed"),
                            Err(e) => warn!(%addr, error = %e, "connection failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "failed to accept NBD connection");
                }
            }
        }
    }
}
