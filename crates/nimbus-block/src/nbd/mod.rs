//! NBD protocol types
//!
//! Wire-level constants and framing for the fixed newstyle
//! negotiation and the transmission phase, per
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md

mod connection;

pub use connection::NbdConnection;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{BlockError, BlockResult, NbdErrno};

/// "NBDMAGIC", first half of the server greeting
pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943;
/// "IHAVEOPT", second half of the greeting and every option header
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054;
/// Option reply magic
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
/// Transmission request magic
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
/// Simple reply magic
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

/// Handshake flags sent by the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeFlags(u16);

impl HandshakeFlags {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u16 = 1 << 0;
    /// Client may omit the 124-byte zero pad after export info
    pub const NO_ZEROES: u16 = 1 << 1;

    /// Flags this server always announces
    pub fn announced() -> Self {
        Self(Self::FIXED_NEWSTYLE | Self::NO_ZEROES)
    }

    /// Raw wire value
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Handshake flags echoed by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u32 = 1 << 0;
    /// Client does not want the zero pad
    pub const NO_ZEROES: u32 = 1 << 1;

    /// Wrap a raw wire value
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Whether the client opted out of the zero pad
    pub fn no_zeroes(&self) -> bool {
        self.0 & Self::NO_ZEROES != 0
    }

    /// Raw wire value
    pub fn bits(&self) -> u32 {
        self.0
    }
}

/// Per-export transmission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    /// Always set
    pub const HAS_FLAGS: u16 = 1 << 0;
    /// Client may send FLUSH
    pub const SEND_FLUSH: u16 = 1 << 2;
    /// Client may send TRIM
    pub const SEND_TRIM: u16 = 1 << 5;
    /// Client may send WRITE_ZEROES
    pub const SEND_WRITE_ZEROES: u16 = 1 << 6;

    /// Flags for a writable single-client export
    pub fn writable() -> Self {
        Self(Self::HAS_FLAGS | Self::SEND_FLUSH | Self::SEND_TRIM | Self::SEND_WRITE_ZEROES)
    }

    /// Raw wire value
    pub fn bits(&self) -> u16 {
        self.0
    }
}

/// Negotiation option codes this server recognizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOption {
    /// Enter transmission on a named export, oldstyle reply
    ExportName = 1,
    /// Abandon negotiation
    Abort = 2,
    /// List export names
    List = 3,
    /// Describe an export without entering transmission
    Info = 6,
    /// Describe an export and enter transmission
    Go = 7,
}

impl TryFrom<u32> for NbdOption {
    type Error = BlockError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ExportName),
            2 => Ok(Self::Abort),
            3 => Ok(Self::List),
            6 => Ok(Self::Info),
            7 => Ok(Self::Go),
            _ => Err(BlockError::Protocol(format!("unknown option {}", value))),
        }
    }
}

/// Option reply types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOptionReply {
    /// Option handled
    Ack = 1,
    /// One export name (reply to List)
    Server = 2,
    /// Export description (reply to Info/Go)
    Info = 3,
    /// Option not supported
    ErrUnsup = (1 << 31) | 1,
    /// Export unknown
    ErrUnknown = (1 << 31) | 6,
}

/// Transmission command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    /// Read a byte range
    Read = 0,
    /// Write a byte range
    Write = 1,
    /// Disconnect
    Disc = 2,
    /// Flush acknowledged writes
    Flush = 3,
    /// Discard a range (advisory here)
    Trim = 4,
    /// Advisory cache hint
    Cache = 5,
    /// Write a range of zeros
    WriteZeroes = 6,
}

impl TryFrom<u16> for NbdCommand {
    type Error = BlockError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            2 => Ok(Self::Disc),
            3 => Ok(Self::Flush),
            4 => Ok(Self::Trim),
            5 => Ok(Self::Cache),
            6 => Ok(Self::WriteZeroes),
            _ => Err(BlockError::Protocol(format!("unknown command {}", value))),
        }
    }
}

/// Command flags on a transmission request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// Force unit access: flush before acknowledging
    pub const FUA: u16 = 1 << 0;

    /// Wrap a raw wire value
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Whether FUA is requested
    pub fn has_fua(&self) -> bool {
        self.0 & Self::FUA != 0
    }
}

/// A parsed transmission request
#[derive(Debug, Clone)]
pub struct NbdRequest {
    /// Command flags
    pub flags: CommandFlags,
    /// Command type
    pub command: NbdCommand,
    /// Cookie echoed in the reply
    pub handle: u64,
    /// Byte offset
    pub offset: u64,
    /// Byte length
    pub length: u32,
}

impl NbdRequest {
    /// Request header size on the wire
    pub const SIZE: usize = 28;

    /// Parse a request header
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("request header too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(BlockError::Protocol(format!(
                "bad request magic {:08x}",
                magic
            )));
        }

        let flags = CommandFlags::new(buf.get_u16());
        let command = NbdCommand::try_from(buf.get_u16())?;
        let handle = buf.get_u64();
        let offset = buf.get_u64();
        let length = buf.get_u32();

        Ok(Self {
            flags,
            command,
            handle,
            offset,
            length,
        })
    }
}

/// A simple transmission reply
#[derive(Debug, Clone)]
pub struct NbdReply {
    /// Errno reported to the client
    pub errno: NbdErrno,
    /// Cookie from the request
    pub handle: u64,
}

impl NbdReply {
    /// Reply size on the wire
    pub const SIZE: usize = 16;

    /// Reply for a failed request
    pub fn new(handle: u64, errno: NbdErrno) -> Self {
        Self { errno, handle }
    }

    /// Reply for a successful request
    pub fn ok(handle: u64) -> Self {
        Self::new(handle, NbdErrno::Ok)
    }

    /// Append the wire encoding to `buf`
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REPLY_MAGIC);
        buf.put_u32(self.errno.code());
        buf.put_u64(self.handle);
    }
}

/// Export metadata announced during negotiation
#[derive(Debug, Clone)]
pub struct ExportInfo {
    /// Export name
    pub name: String,
    /// Device size in bytes
    pub size: u64,
    /// Transmission flags
    pub flags: TransmissionFlags,
    /// Preferred request size, the device's block size
    pub preferred_block_size: u32,
}

impl ExportInfo {
    /// Export info for a writable device
    pub fn new(name: impl Into<String>, size: u64, preferred_block_size: u32) -> Self {
        Self {
            name: name.into(),
            size,
            flags: TransmissionFlags::writable(),
            preferred_block_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_request(command: u16, handle: u64, offset: u64, length: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(NbdRequest::SIZE);
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(0);
        buf.put_u16(command);
        buf.put_u64(handle);
        buf.put_u64(offset);
        buf.put_u32(length);
        buf
    }

    #[test]
    fn requests_parse_from_the_wire() {
        let buf = encode_request(1, 0xDEAD, 4096, 512);
        let request = NbdRequest::parse(&buf).unwrap();

        assert_eq!(request.command, NbdCommand::Write);
        assert_eq!(request.handle, 0xDEAD);
        assert_eq!(request.offset, 4096);
        assert_eq!(request.length, 512);
        assert!(!request.flags.has_fua());
    }

    #[test]
    fn bad_magic_is_a_protocol_error() {
        let mut buf = encode_request(0, 1, 0, 0);
        buf[0] = 0xFF;
        assert!(matches!(
            NbdRequest::parse(&buf),
            Err(BlockError::Protocol(_))
        ));
    }

    #[test]
    fn unknown_commands_are_rejected() {
        let buf = encode_request(99, 1, 0, 0);
        assert!(NbdRequest::parse(&buf).is_err());
    }

    #[test]
    fn replies_encode_errno_and_handle() {
        let reply = NbdReply::new(7, NbdErrno::Inval);
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);

        assert_eq!(buf.len(), NbdReply::SIZE);
        assert_eq!(&buf[0..4], &NBD_REPLY_MAGIC.to_be_bytes());
        assert_eq!(&buf[4..8], &22u32.to_be_bytes());
        assert_eq!(&buf[8..16], &7u64.to_be_bytes());
    }

    #[test]
    fn writable_exports_accept_flush_and_zeroes() {
        let info = ExportInfo::new("disk", 1 << 30, 4096);
        let bits = info.flags.bits();
        assert_ne!(bits & TransmissionFlags::HAS_FLAGS, 0);
        assert_ne!(bits & TransmissionFlags::SEND_FLUSH, 0);
        assert_ne!(bits & TransmissionFlags::SEND_WRITE_ZEROES, 0);
    }
}
