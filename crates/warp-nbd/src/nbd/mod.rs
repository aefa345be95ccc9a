//! NBD (Network Block Device) protocol implementation
//!
//! Implements the fixed-newstyle subset of the NBD protocol as specified in:
//! https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md
//!
//! Only `NBD_OPT_EXPORT_NAME` and `NBD_OPT_ABORT` are understood during
//! negotiation; every other option is refused with `NBD_REP_ERR_UNSUP`.

pub mod codec;
pub mod connection;

pub use codec::{Frame, decode_frame};
pub use connection::{ConnectionState, NbdConnection};

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{BlockError, BlockResult, NbdError};

/// NBD magic numbers
pub const NBD_INIT_MAGIC: u64 = 0x4e42444d41474943; // "NBDMAGIC"
pub const NBD_OPTS_MAGIC: u64 = 0x49484156454F5054; // "IHAVEOPT"
pub const NBD_REP_MAGIC: u64 = 0x0003e889045565a9;
pub const NBD_REQUEST_MAGIC: u32 = 0x25609513;
pub const NBD_REPLY_MAGIC: u32 = 0x67446698;

/// Option reply: option not supported
pub const NBD_REP_ERR_UNSUP: u32 = (1 << 31) | 1;

/// Largest read or write a client may request
pub const MAX_REQUEST_LENGTH: u32 = 32 * 1024 * 1024;

/// Largest option payload accepted during negotiation
pub const MAX_OPTION_LENGTH: u32 = 64 * 1024;

/// NBD protocol flags (global)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalFlags(u16);

impl GlobalFlags {
    /// Fixed newstyle negotiation
    pub const FIXED_NEWSTYLE: u16 = 1 << 0;

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Default flags for server
    pub fn server_default() -> Self {
        Self(Self::FIXED_NEWSTYLE)
    }
}

/// NBD client flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientFlags(u32);

impl ClientFlags {
    /// Fixed newstyle
    pub const FIXED_NEWSTYLE: u32 = 1 << 0;

    /// Create new flags
    pub fn new(flags: u32) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// Whether the client acknowledged fixed newstyle negotiation
    pub fn has_fixed_newstyle(&self) -> bool {
        self.0 & Self::FIXED_NEWSTYLE != 0
    }
}

/// NBD transmission flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransmissionFlags(u16);

impl TransmissionFlags {
    /// Has flags (always set)
    pub const HAS_FLAGS: u16 = 1 << 0;
    /// Send FLUSH command
    pub const SEND_FLUSH: u16 = 1 << 2;
    /// Send FUA (Force Unit Access)
    pub const SEND_FUA: u16 = 1 << 3;

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Default flags for a writable export
    pub fn default_rw() -> Self {
        Self(Self::HAS_FLAGS | Self::SEND_FLUSH | Self::SEND_FUA)
    }
}

/// NBD option codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NbdOption {
    /// Export name
    ExportName = 1,
    /// Abort
    Abort = 2,
}

impl TryFrom<u32> for NbdOption {
    type Error = BlockError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::ExportName),
            2 => Ok(Self::Abort),
            _ => Err(BlockError::Unsupported(format!("option {}", value))),
        }
    }
}

/// NBD command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NbdCommand {
    /// Read
    Read = 0,
    /// Write
    Write = 1,
    /// Disconnect
    Disc = 2,
    /// Flush
    Flush = 3,
    /// Trim
    Trim = 4,
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
            _ => Err(BlockError::Protocol(format!("Unknown command: {}", value))),
        }
    }
}

/// NBD command flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandFlags(u16);

impl CommandFlags {
    /// Force unit access (write-through)
    pub const FUA: u16 = 1 << 0;

    /// Create new flags
    pub fn new(flags: u16) -> Self {
        Self(flags)
    }

    /// Get raw value
    pub fn bits(&self) -> u16 {
        self.0
    }

    /// Check FUA flag
    pub fn has_fua(&self) -> bool {
        self.0 & Self::FUA != 0
    }
}

/// NBD request
#[derive(Debug, Clone)]
pub struct NbdRequest {
    /// Command flags
    pub flags: CommandFlags,
    /// Command type
    pub command: NbdCommand,
    /// Handle (cookie for matching reply)
    pub handle: u64,
    /// Offset
    pub offset: u64,
    /// Length
    pub length: u32,
}

impl NbdRequest {
    /// Parse from bytes
    pub fn parse(data: &[u8]) -> BlockResult<Self> {
        if data.len() < Self::SIZE {
            return Err(BlockError::Protocol("Request too short".to_string()));
        }

        let mut buf = data;
        let magic = buf.get_u32();
        if magic != NBD_REQUEST_MAGIC {
            return Err(BlockError::Protocol(format!(
                "Invalid request magic: {:08x}",
                magic
            )));
        }

        let flags = CommandFlags::new(buf.get_u16());
        let cmd_type = buf.get_u16();
        let command = NbdCommand::try_from(cmd_type)?;
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

    /// Encode to bytes (client side)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REQUEST_MAGIC);
        buf.put_u16(self.flags.bits());
        buf.put_u16(self.command as u16);
        buf.put_u64(self.handle);
        buf.put_u64(self.offset);
        buf.put_u32(self.length);
    }

    /// Number of payload bytes following the header
    pub fn payload_len(&self) -> usize {
        match self.command {
            NbdCommand::Write => self.length as usize,
            _ => 0,
        }
    }

    /// Request size (always 28 bytes)
    pub const SIZE: usize = 28;
}

/// NBD simple reply
#[derive(Debug, Clone)]
pub struct NbdReply {
    /// Error code
    pub error: NbdError,
    /// Handle (matches request)
    pub handle: u64,
}

impl NbdReply {
    /// Create a new reply
    pub fn new(handle: u64, error: NbdError) -> Self {
        Self { error, handle }
    }

    /// Create a success reply
    pub fn ok(handle: u64) -> Self {
        Self {
            error: NbdError::Ok,
            handle,
        }
    }

    /// Encode to bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(NBD_REPLY_MAGIC);
        buf.put_u32(self.error.code());
        buf.put_u64(self.handle);
    }

    /// Reply size (always 16 bytes)
    pub const SIZE: usize = 16;
}

/// Option reply sent during negotiation
#[derive(Debug, Clone)]
pub struct OptionReply {
    /// Option being answered
    pub option: u32,
    /// Reply type
    pub reply_type: u32,
}

impl OptionReply {
    /// Refuse an option
    pub fn unsupported(option: u32) -> Self {
        Self {
            option,
            reply_type: NBD_REP_ERR_UNSUP,
        }
    }

    /// Encode to bytes (no reply data)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(NBD_REP_MAGIC);
        buf.put_u32(self.option);
        buf.put_u32(self.reply_type);
        buf.put_u32(0);
    }

    /// Reply size without data (always 20 bytes)
    pub const SIZE: usize = 20;
}

/// Export information
#[derive(Debug, Clone)]
pub struct ExportInfo {
    /// Export name
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Transmission flags
    pub flags: TransmissionFlags,
}

impl ExportInfo {
    /// Create new export info
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            flags: TransmissionFlags::default_rw(),
        }
    }

    /// Encode the `NBD_OPT_EXPORT_NAME` reply: size, flags, 124 zero bytes
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.size);
        buf.put_u16(self.flags.bits());
        buf.put_bytes(0, 124);
    }

    /// Check that `[offset, offset + length)` lies within the export
    pub fn check_range(&self, offset: u64, length: u32) -> BlockResult<()> {
        match offset.checked_add(length as u64) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(BlockError::InvalidOffset {
                offset,
                length: length as u64,
                size: self.size,
            }),
        }
    }

    /// Export reply size (always 134 bytes)
    pub const SIZE: usize = 8 + 2 + 124;
}

/// Encode the server greeting (fixed newstyle)
pub fn encode_greeting(buf: &mut BytesMut) {
    buf.put_u64(NBD_INIT_MAGIC);
    buf.put_u64(NBD_OPTS_MAGIC);
    buf.put_u16(GlobalFlags::server_default().bits());
}

/// Greeting size (always 18 bytes)
pub const GREETING_SIZE: usize = 18;
