//! NBD connection handler
//!
//! Drives one client through the fixed newstyle handshake, the option
//! loop and the transmission phase against a [`DeviceIo`]. A failed
//! request is answered with its errno and the connection keeps
//! serving; only socket errors and a client disconnect end the loop.

use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, trace, warn};

use super::{
    ClientFlags, ExportInfo, HandshakeFlags, NBD_INIT_MAGIC, NBD_OPTS_MAGIC, NBD_REP_MAGIC,
    NbdCommand, NbdOption, NbdOptionReply, NbdReply, NbdRequest,
};
use crate::device::DeviceIo;
use crate::error::{BlockError, BlockResult, NbdErrno};

/// Largest request payload the server accepts
const MAX_REQUEST_SIZE: u32 = 32 * 1024 * 1024;

/// Handler for a single NBD client connection
pub struct NbdConnection {
    stream: TcpStream,
    client_flags: ClientFlags,
}

/// Outcome of one negotiation option
enum Negotiation {
    Continue,
    Transmit,
    Abort,
}

impl NbdConnection {
    /// Wrap an accepted stream
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            client_flags: ClientFlags::new(0),
        }
    }

    /// Serve the connection until the client disconnects
    pub async fn run<D: DeviceIo>(mut self, export: &ExportInfo, device: Arc<D>) -> BlockResult<()> {
        self.send_greeting().await?;

        let flags = self.stream.read_u32().await?;
        self.client_flags = ClientFlags::new(flags);
        debug!(flags, "received client flags");

        loop {
            match self.handle_option(export).await? {
                Negotiation::Continue => continue,
                Negotiation::Abort => {
                    debug!("client aborted negotiation");
                    return Ok(());
                }
                Negotiation::Transmit => break,
            }
        }

        info!(export = %export.name, "entering transmission phase");
        self.transmission_loop(export, device).await
    }

    async fn send_greeting(&mut self) -> BlockResult<()> {
        let mut buf = BytesMut::with_capacity(18);
        buf.put_u64(NBD_INIT_MAGIC);
        buf.put_u64(NBD_OPTS_MAGIC);
        buf.put_u16(HandshakeFlags::announced().bits());

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn handle_option(&mut self, export: &ExportInfo) -> BlockResult<Negotiation> {
        let magic = self.stream.read_u64().await?;
        if magic != NBD_OPTS_MAGIC {
            return Err(BlockError::Protocol(format!(
                "bad option magic {:016x}",
                magic
            )));
        }

        let option_code = self.stream.read_u32().await?;
        let data_len = self.stream.read_u32().await?;
        let mut data = vec![0u8; data_len as usize];
        if data_len > 0 {
            self.stream.read_exact(&mut data).await?;
        }
        trace!(option = option_code, data_len, "received option");

        match NbdOption::try_from(option_code) {
            Ok(NbdOption::ExportName) => {
                let name = String::from_utf8_lossy(&data).to_string();
                if !self.names_export(&name, export) {
                    // The oldstyle path has no error reply; drop the client.
                    return Err(BlockError::Protocol(format!("unknown export {:?}", name)));
                }
                self.send_export_block(export).await?;
                Ok(Negotiation::Transmit)
            }
            Ok(NbdOption::Abort) => {
                self.send_option_reply(option_code, NbdOptionReply::Ack, &[])
                    .await?;
                Ok(Negotiation::Abort)
            }
            Ok(NbdOption::List) => {
                let name = export.name.as_bytes();
                let mut body = BytesMut::with_capacity(4 + name.len());
                body.put_u32(name.len() as u32);
                body.put_slice(name);
                self.send_option_reply(option_code, NbdOptionReply::Server, &body)
                    .await?;
                self.send_option_reply(option_code, NbdOptionReply::Ack, &[])
                    .await?;
                Ok(Negotiation::Continue)
            }
            Ok(NbdOption::Info) => {
                self.describe_export(option_code, &data, export).await?;
                Ok(Negotiation::Continue)
            }
            Ok(NbdOption::Go) => {
                if self.describe_export(option_code, &data, export).await? {
                    Ok(Negotiation::Transmit)
                } else {
                    Ok(Negotiation::Continue)
                }
            }
            Err(_) => {
                self.send_option_reply(option_code, NbdOptionReply::ErrUnsup, &[])
                    .await?;
                Ok(Negotiation::Continue)
            }
        }
    }

    /// An empty requested name selects the default (only) export
    fn names_export(&self, requested: &str, export: &ExportInfo) -> bool {
        requested.is_empty() || requested == export.name
    }

    /// Oldstyle export info: size, flags, optional zero pad
    async fn send_export_block(&mut self, export: &ExportInfo) -> BlockResult<()> {
        let mut buf = BytesMut::with_capacity(134);
        buf.put_u64(export.size);
        buf.put_u16(export.flags.bits());
        if !self.client_flags.no_zeroes() {
            buf.put_bytes(0, 124);
        }

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Info/Go reply sequence; returns whether the export matched
    async fn describe_export(
        &mut self,
        option: u32,
        data: &[u8],
        export: &ExportInfo,
    ) -> BlockResult<bool> {
        // Option payload: u32 name length, name, u16 info-request count.
        let name = if data.len() >= 4 {
            let name_len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            String::from_utf8_lossy(data.get(4..4 + name_len).unwrap_or_default()).to_string()
        } else {
            String::new()
        };

        if !self.names_export(&name, export) {
            self.send_option_reply(option, NbdOptionReply::ErrUnknown, &[])
                .await?;
            return Ok(false);
        }

        // NBD_INFO_EXPORT
        let mut body = BytesMut::with_capacity(12);
        body.put_u16(0);
        body.put_u64(export.size);
        body.put_u16(export.flags.bits());
        self.send_option_reply(option, NbdOptionReply::Info, &body)
            .await?;

        // NBD_INFO_BLOCK_SIZE: minimum, preferred, maximum
        let mut body = BytesMut::with_capacity(14);
        body.put_u16(3);
        body.put_u32(1);
        body.put_u32(export.preferred_block_size);
        body.put_u32(MAX_REQUEST_SIZE);
        self.send_option_reply(option, NbdOptionReply::Info, &body)
            .await?;

        self.send_option_reply(option, NbdOptionReply::Ack, &[])
            .await?;
        Ok(true)
    }

    async fn send_option_reply(
        &mut self,
        option: u32,
        reply: NbdOptionReply,
        data: &[u8],
    ) -> BlockResult<()> {
        let mut buf = BytesMut::with_capacity(20 + data.len());
        buf.put_u64(NBD_REP_MAGIC);
        buf.put_u32(option);
        buf.put_u32(reply as u32);
        buf.put_u32(data.len() as u32);
        buf.put_slice(data);

        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn transmission_loop<D: DeviceIo>(
        &mut self,
        export: &ExportInfo,
        device: Arc<D>,
    ) -> BlockResult<()> {
        let mut header = [0u8; NbdRequest::SIZE];

        loop {
            match self.stream.read_exact(&mut header).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    debug!("client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }

            let request = NbdRequest::parse(&header)?;
            trace!(
                command = ?request.command,
                offset = request.offset,
                length = request.length,
                "request"
            );

            match self.handle_command(&request, export, &device).await {
                Ok(true) => continue,
                Ok(false) => {
                    debug!("client requested disconnect");
                    return Ok(());
                }
                Err(e) => {
                    warn!(command = ?request.command, error = %e, "request failed");
                    self.send_reply(request.handle, e.to_nbd_errno()).await?;
                }
            }
        }
    }

    /// Serve one request; `Ok(false)` ends the connection
    async fn handle_command<D: DeviceIo>(
        &mut self,
        request: &NbdRequest,
        export: &ExportInfo,
        device: &Arc<D>,
    ) -> BlockResult<bool> {
        match request.command {
            NbdCommand::Read => {
                self.check_length(request)?;
                let data = device.read(request.offset, request.length).await?;

                let mut buf = BytesMut::with_capacity(NbdReply::SIZE + data.len());
                NbdReply::ok(request.handle).encode(&mut buf);
                buf.put_slice(&data);
                self.stream.write_all(&buf).await?;
                Ok(true)
            }
            NbdCommand::Write => {
                // Validate the client-supplied length before sizing a
                // buffer from it. The payload must still leave the
                // socket so the stream stays framed, so an oversized
                // one is drained in bounded chunks.
                if let Err(e) = self.check_length(request) {
                    self.drain(request.length as u64).await?;
                    return Err(e);
                }
                let mut data = vec![0u8; request.length as usize];
                self.stream.read_exact(&mut data).await?;

                device.write(request.offset, &data).await?;
                if request.flags.has_fua() {
                    device.flush().await?;
                }
                self.send_reply(request.handle, NbdErrno::Ok).await?;
                Ok(true)
            }
            NbdCommand::Disc => Ok(false),
            NbdCommand::Flush => {
                device.flush().await?;
                self.send_reply(request.handle, NbdErrno::Ok).await?;
                Ok(true)
            }
            NbdCommand::WriteZeroes => {
                self.check_length(request)?;
                let zeros = vec![0u8; request.length as usize];
                device.write(request.offset, &zeros).await?;
                if request.flags.has_fua() {
                    device.flush().await?;
                }
                self.send_reply(request.handle, NbdErrno::Ok).await?;
                Ok(true)
            }
            // Trim is advisory; the store keeps its objects.
            NbdCommand::Trim | NbdCommand::Cache => {
                self.send_reply(request.handle, NbdErrno::Ok).await?;
                Ok(true)
            }
        }
    }

    fn check_length(&self, request: &NbdRequest) -> BlockResult<()> {
        if request.length > MAX_REQUEST_SIZE {
            return Err(BlockError::Protocol(format!(
                "request length {} over limit",
                request.length
            )));
        }
        Ok(())
    }

    /// Discard `remaining` payload bytes without buffering them
    async fn drain(&mut self, mut remaining: u64) -> BlockResult<()> {
        let mut scratch = [0u8; 8192];
        while remaining > 0 {
            let n = remaining.min(scratch.len() as u64) as usize;
            self.stream.read_exact(&mut scratch[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    async fn send_reply(&mut self, handle: u64, errno: NbdErrno) -> BlockResult<()> {
        let mut buf = BytesMut::with_capacity(NbdReply::SIZE);
        NbdReply::new(handle, errno).encode(&mut buf);
        self.stream.write_all(&buf).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Device stub over a plain byte vector
    struct VecDevice {
        data: parking_lot::RwLock<Vec<u8>>,
        flushes: AtomicU64,
    }

    impl VecDevice {
        fn new(size: usize) -> Self {
            Self {
                data: parking_lot::RwLock::new(vec![0u8; size]),
                flushes: AtomicU64::new(0),
            }
        }
    }

    #[async_trait]
    impl DeviceIo for VecDevice {
        fn size(&self) -> u64 {
            self.data.read().len() as u64
        }

        async fn read(&self, offset: u64, length: u32) -> BlockResult<Bytes> {
            let data = self.data.read();
            let start = offset as usize;
            let end = start + length as usize;
            if end > data.len() {
                return Err(BlockError::OutOfBounds {
                    offset,
                    length: length as u64,
                    size: data.len() as u64,
                });
            }
            Ok(Bytes::copy_from_slice(&data[start..end]))
        }

        async fn write(&self, offset: u64, data: &[u8]) -> BlockResult<()> {
            let mut stored = self.data.write();
            let start = offset as usize;
            let end = start + data.len();
            if end > stored.len() {
                return Err(BlockError::OutOfBounds {
                    offset,
                    length: data.len() as u64,
                    size: stored.len() as u64,
                });
            }
            stored[start..end].copy_from_slice(data);
            Ok(())
        }

        async fn flush(&self) -> BlockResult<()> {
            self.flushes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    #[tokio::test]
    async fn device_stub_round_trips() {
        let device = VecDevice::new(256);
        device.write(10, b"abc").await.unwrap();
        assert_eq!(&device.read(10, 3).await.unwrap()[..], b"abc");
    }

    #[tokio::test]
    async fn device_stub_rejects_overruns() {
        let device = VecDevice::new(16);
        assert!(device.read(10, 100).await.is_err());
        assert!(device.write(10, &[0u8; 100]).await.is_err());
    }

    #[tokio::test]
    async fn flush_counts_accumulate() {
        let device = VecDevice::new(16);
        device.flush().await.unwrap();
        device.flush().await.unwrap();
        assert_eq!(device.flushes.load(Ordering::Relaxed), 2);
    }
}
