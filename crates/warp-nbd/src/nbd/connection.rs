//! NBD connection handler
//!
//! Handles the NBD protocol for a single client connection.
//!
//! The connection task owns the socket. It decodes whatever complete frames
//! are buffered, dispatches commands to the backend as independent tasks,
//! and writes replies as those tasks finish. It never waits on storage
//! itself, so replies can leave in a different order than requests came in;
//! clients match them by handle.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::codec::{Frame, decode_frame};
use super::{
    ExportInfo, GREETING_SIZE, NbdCommand, NbdOption, NbdReply, NbdRequest, OptionReply,
    encode_greeting,
};
use crate::backend::BlockBackend;
use crate::error::{BlockError, BlockResult};

/// Initial read buffer capacity
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// NBD connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Greeting not sent yet
    PreInit,
    /// Greeting sent, waiting for client flags
    PostInit,
    /// Option negotiation phase
    AwaitingOptions,
    /// Transmission phase - handling commands
    PerformingOperations,
    /// Connection closed
    Closed,
}

/// What the read loop does after a frame
enum Flow {
    /// Keep decoding
    Continue,
    /// A reply for one request is owed
    Dispatched,
    /// Stop reading, close once owed replies are written
    Drain,
    /// Close immediately
    Close,
}

/// NBD connection handler
pub struct NbdConnection<S, B: ?Sized> {
    stream: S,
    backend: Arc<B>,
    state: ConnectionState,
    export: Option<ExportInfo>,
    read_buf: BytesMut,
    peer: String,
}

impl<S, B> NbdConnection<S, B>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
    B: BlockBackend + ?Sized,
{
    /// Create a new connection handler
    pub fn new(stream: S, backend: Arc<B>) -> Self {
        Self {
            stream,
            backend,
            state: ConnectionState::PreInit,
            export: None,
            read_buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            peer: "unknown".to_string(),
        }
    }

    /// Label the connection in logs
    pub fn with_peer(mut self, peer: impl Display) -> Self {
        self.peer = peer.to_string();
        self
    }

    /// Get connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Get the negotiated export
    pub fn export(&self) -> Option<&ExportInfo> {
        self.export.as_ref()
    }

    /// Run the connection until the client leaves or breaks the protocol
    pub async fn run(mut self) -> BlockResult<()> {
        let result = self.serve().await;
        self.state = ConnectionState::Closed;
        result
    }

    async fn serve(&mut self) -> BlockResult<()> {
        self.send_server_greeting().await?;
        self.state = ConnectionState::PostInit;

        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
        let mut in_flight = 0usize;
        let mut draining = false;

        loop {
            while !draining {
                let Some(frame) = decode_frame(self.state, &mut self.read_buf)? else {
                    break;
                };
                match self.handle_frame(frame, &reply_tx).await? {
                    Flow::Continue => {}
                    Flow::Dispatched => in_flight += 1,
                    Flow::Drain => {
                        debug!(peer = %self.peer, in_flight, "Client requested disconnect");
                        draining = true;
                    }
                    Flow::Close => return Ok(()),
                }
            }

            if draining && in_flight == 0 {
                return Ok(());
            }

            tokio::select! {
                read = self.stream.read_buf(&mut self.read_buf), if !draining => {
                    if read? == 0 {
                        debug!(peer = %self.peer, in_flight, "Client disconnected");
                        return Ok(());
                    }
                }
                Some(reply) = reply_rx.recv() => {
                    in_flight -= 1;
                    self.stream.write_all(&reply).await?;
                }
            }
        }
    }

    /// Send server greeting (fixed newstyle negotiation)
    async fn send_server_greeting(&mut self) -> BlockResult<()> {
        let mut buf = BytesMut::with_capacity(GREETING_SIZE);
        encode_greeting(&mut buf);
        self.send(&buf).await?;
        debug!(peer = %self.peer, "Sent server greeting");
        Ok(())
    }

    async fn handle_frame(
        &mut self,
        frame: Frame,
        replies: &mpsc::UnboundedSender<Bytes>,
    ) -> BlockResult<Flow> {
        match frame {
            Frame::ClientFlags(flags) => {
                debug!(peer = %self.peer, "Received client flags: {:08x}", flags.bits());
                if !flags.has_fixed_newstyle() {
                    warn!(peer = %self.peer, "Client did not acknowledge fixed newstyle");
                }
                self.state = ConnectionState::AwaitingOptions;
                Ok(Flow::Continue)
            }
            Frame::Option { code, data } => self.handle_option(code, data).await,
            Frame::Request { request, payload } => self.handle_request(request, payload, replies),
        }
    }

    /// Handle an option request
    async fn handle_option(&mut self, code: u32, data: Bytes) -> BlockResult<Flow> {
        trace!(peer = %self.peer, "Received option: {} (data len: {})", code, data.len());

        match NbdOption::try_from(code) {
            Ok(NbdOption::ExportName) => {
                let name = String::from_utf8(data.to_vec())
                    .map_err(|_| BlockError::Protocol("Export name is not UTF-8".to_string()))?;
                self.handle_export_name(name).await
            }
            Ok(NbdOption::Abort) => {
                debug!(peer = %self.peer, "Client requested abort");
                Ok(Flow::Close)
            }
            Err(_) => {
                let mut buf = BytesMut::with_capacity(OptionReply::SIZE);
                OptionReply::unsupported(code).encode(&mut buf);
                self.send(&buf).await?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Handle NBD_OPT_EXPORT_NAME
    async fn handle_export_name(&mut self, name: String) -> BlockResult<Flow> {
        match self.backend.exists(&name).await {
            Ok(true) => {}
            Ok(false) => {
                info!(peer = %self.peer, export = %name, "Unknown export requested");
                return Ok(Flow::Close);
            }
            Err(e) => {
                warn!(peer = %self.peer, export = %name, error = %e, "Export lookup failed");
                return Ok(Flow::Close);
            }
        }

        let size = match self.backend.size(&name).await {
            Ok(size) => size,
            Err(e) => {
                warn!(peer = %self.peer, export = %name, error = %e, "Export size lookup failed");
                return Ok(Flow::Close);
            }
        };

        let export = ExportInfo::new(name, size);
        let mut buf = BytesMut::with_capacity(ExportInfo::SIZE);
        export.encode(&mut buf);
        self.send(&buf).await?;

        info!(peer = %self.peer, export = %export.name, size, "Client connected to export");
        self.export = Some(export);
        self.state = ConnectionState::PerformingOperations;
        Ok(Flow::Continue)
    }

    /// Dispatch a command; its reply arrives on `replies`
    fn handle_request(
        &self,
        request: NbdRequest,
        payload: Bytes,
        replies: &mpsc::UnboundedSender<Bytes>,
    ) -> BlockResult<Flow> {
        let export = self
            .export
            .as_ref()
            .ok_or_else(|| BlockError::Protocol("Request before export selection".to_string()))?;

        trace!(
            "Request: {:?} handle={:x} offset={} len={}",
            request.command, request.handle, request.offset, request.length
        );

        let handle = request.handle;
        let replies = replies.clone();

        match request.command {
            NbdCommand::Disc => return Ok(Flow::Drain),
            NbdCommand::Read => {
                let (offset, length) = (request.offset, request.length);
                match export.check_range(offset, length) {
                    Ok(()) => {
                        let read = self.backend.read(&export.name, offset, length);
                        spawn_reply(replies, handle, async move {
                            let data = read.await?;
                            if data.len() != length as usize {
                                return Err(BlockError::InvalidLength {
                                    length: data.len() as u32,
                                });
                            }
                            Ok(Some(data))
                        });
                    }
                    Err(e) => send_reply(&replies, handle, Err(e)),
                }
            }
            NbdCommand::Write => match export.check_range(request.offset, request.length) {
                Ok(()) => {
                    let write = self.backend.write(&export.name, request.offset, payload);
                    let flush = request
                        .flags
                        .has_fua()
                        .then(|| self.backend.flush(&export.name));
                    spawn_reply(replies, handle, async move {
                        write.await?;
                        if let Some(flush) = flush {
                            flush.await?;
                        }
                        Ok(None)
                    });
                }
                Err(e) => send_reply(&replies, handle, Err(e)),
            },
            NbdCommand::Flush => {
                let flush = self.backend.flush(&export.name);
                spawn_reply(replies, handle, async move {
                    flush.await?;
                    Ok(None)
                });
            }
            NbdCommand::Trim => send_reply(
                &replies,
                handle,
                Err(BlockError::Unsupported("trim".to_string())),
            ),
        }

        Ok(Flow::Dispatched)
    }

    async fn send(&mut self, buf: &[u8]) -> BlockResult<()> {
        self.stream.write_all(buf).await?;
        self.stream.flush().await?;
        Ok(())
    }
}

/// Run `op` as its own task and queue its reply
fn spawn_reply<F>(replies: mpsc::UnboundedSender<Bytes>, handle: u64, op: F)
where
    F: Future<Output = BlockResult<Option<Bytes>>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = match tokio::spawn(op).await {
            Ok(result) => result,
            Err(e) => Err(BlockError::Task(e.to_string())),
        };
        send_reply(&replies, handle, result);
    });
}

/// Encode and queue a reply
fn send_reply(
    replies: &mpsc::UnboundedSender<Bytes>,
    handle: u64,
    result: BlockResult<Option<Bytes>>,
) {
    let reply = match result {
        Ok(data) => {
            let data = data.unwrap_or_default();
            let mut buf = BytesMut::with_capacity(NbdReply::SIZE + data.len());
            NbdReply::ok(handle).encode(&mut buf);
            buf.put_slice(&data);
            buf.freeze()
        }
        Err(e) => {
            warn!(handle, error = %e, "Command failed");
            let mut buf = BytesMut::with_capacity(NbdReply::SIZE);
            NbdReply::new(handle, e.to_nbd_error()).encode(&mut buf);
            buf.freeze()
        }
    };

    // The connection may already be gone; the operation still ran to completion
    let _ = replies.send(reply);
}
