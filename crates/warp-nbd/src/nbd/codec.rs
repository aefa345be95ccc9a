//! Incremental frame decoder
//!
//! Client bytes arrive in arbitrary pieces. `decode_frame` looks at what is
//! buffered, and only when a complete unit for the current connection state
//! is present does it split that unit off the buffer. Otherwise it leaves
//! the buffer untouched and returns `Ok(None)`.
//!
//! ```text
//! PostInit              client flags     4 bytes
//! AwaitingOptions       option           8 magic + 4 code + 4 len + len
//! PerformingOperations  request          28 bytes (+ length for WRITE)
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::connection::ConnectionState;
use super::{ClientFlags, MAX_OPTION_LENGTH, MAX_REQUEST_LENGTH, NBD_OPTS_MAGIC, NbdRequest};
use crate::error::{BlockError, BlockResult};

/// Option header: magic + option code + data length
const OPTION_HEADER_SIZE: usize = 16;

/// One complete client frame
#[derive(Debug, Clone)]
pub enum Frame {
    /// Client flags sent in reply to the greeting
    ClientFlags(ClientFlags),
    /// Negotiation option
    Option {
        /// Option code
        code: u32,
        /// Option data
        data: Bytes,
    },
    /// Transmission request, with its payload for writes
    Request {
        /// Parsed request header
        request: NbdRequest,
        /// Write payload (empty for other commands)
        payload: Bytes,
    },
}

/// Decode the next complete frame for `state` from `buf`
///
/// Consumes bytes only when a whole frame is available. Malformed input
/// yields `BlockError::Protocol`.
pub fn decode_frame(state: ConnectionState, buf: &mut BytesMut) -> BlockResult<Option<Frame>> {
    match state {
        ConnectionState::PostInit => decode_client_flags(buf),
        ConnectionState::AwaitingOptions => decode_option(buf),
        ConnectionState::PerformingOperations => decode_request(buf),
        // Nothing is expected from the client before the greeting or after close
        ConnectionState::PreInit | ConnectionState::Closed => Ok(None),
    }
}

fn decode_client_flags(buf: &mut BytesMut) -> BlockResult<Option<Frame>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    Ok(Some(Frame::ClientFlags(ClientFlags::new(buf.get_u32()))))
}

fn decode_option(buf: &mut BytesMut) -> BlockResult<Option<Frame>> {
    if buf.len() < OPTION_HEADER_SIZE {
        return Ok(None);
    }

    let mut header = &buf[..OPTION_HEADER_SIZE];
    let magic = header.get_u64();
    let code = header.get_u32();
    let data_len = header.get_u32();

    if magic != NBD_OPTS_MAGIC {
        return Err(BlockError::Protocol(format!(
            "Invalid option magic: {:016x}",
            magic
        )));
    }

    if data_len > MAX_OPTION_LENGTH {
        return Err(BlockError::Protocol(format!(
            "Option {} data too long: {} bytes",
            code, data_len
        )));
    }

    let total = OPTION_HEADER_SIZE + data_len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    buf.advance(OPTION_HEADER_SIZE);
    let data = buf.split_to(data_len as usize).freeze();
    Ok(Some(Frame::Option { code, data }))
}

fn decode_request(buf: &mut BytesMut) -> BlockResult<Option<Frame>> {
    if buf.len() < NbdRequest::SIZE {
        return Ok(None);
    }

    let request = NbdRequest::parse(&buf[..NbdRequest::SIZE])?;
    if request.length > MAX_REQUEST_LENGTH {
        return Err(BlockError::Protocol(format!(
            "Request length {} exceeds maximum of {}",
            request.length, MAX_REQUEST_LENGTH
        )));
    }

    let total = NbdRequest::SIZE + request.payload_len();
    if buf.len() < total {
        // Leave room for the rest of the payload so the next read lands in place
        buf.reserve(total - buf.len());
        return Ok(None);
    }

    buf.advance(NbdRequest::SIZE);
    let payload = buf.split_to(request.payload_len()).freeze();
    Ok(Some(Frame::Request { request, payload }))
}
