//! NBD client implementing [`common::target::BlockTarget`]
//!
//! Requests are pipelined: submissions go through an unbounded channel to a writer task which
//! owns the socket's write half, and replies are decoded in place from the read half when the
//! engine waits for the next event.

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use common::target::{BlockTarget, Capacity, Completion, Outcome, TargetError, TargetEvent};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument, trace, warn};

use crate::protocol::{self, Command, Reply, ReplyCodec, Request, RequestCodec};
use crate::TargetUrl;

const DEFAULT_BLOCK_SIZE: u32 = 512;

/// What the server told us about the export during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportInfo {
    pub size: u64,
    pub transmission_flags: u16,
    pub preferred_block_size: Option<u32>,
}

impl ExportInfo {
    #[must_use]
    pub fn capacity(&self) -> Capacity {
        let block_size = self
            .preferred_block_size
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_BLOCK_SIZE);
        Capacity {
            block_size,
            block_count: self.size / u64::from(block_size),
        }
    }
}

fn handshake_error(url: &TargetUrl, reason: impl std::fmt::Display) -> TargetError {
    TargetError::Connect {
        target: url.to_string(),
        reason: reason.to_string(),
    }
}

async fn send_option<S: AsyncWrite + Unpin>(
    stream: &mut S,
    option: u32,
    data: &[u8],
) -> std::io::Result<()> {
    stream.write_u64(protocol::IHAVEOPT).await?;
    stream.write_u32(option).await?;
    stream.write_u32(data.len() as u32).await?;
    stream.write_all(data).await?;
    stream.flush().await
}

struct OptionReply {
    reply_type: u32,
    data: Vec<u8>,
}

async fn recv_option_reply<S: AsyncRead + Unpin>(
    stream: &mut S,
    option: u32,
) -> anyhow::Result<OptionReply> {
    let magic = stream.read_u64().await?;
    if magic != protocol::OPTION_REPLY_MAGIC {
        anyhow::bail!("bad option reply magic {:#x}", magic);
    }
    let replied_to = stream.read_u32().await?;
    if replied_to != option {
        anyhow::bail!("reply to option {} while waiting for {}", replied_to, option);
    }
    let reply_type = stream.read_u32().await?;
    let len = stream.read_u32().await? as usize;
    let mut data = vec![0u8; len];
    stream.read_exact(&mut data).await?;
    Ok(OptionReply { reply_type, data })
}

/// `NBD_OPT_GO`: returns `None` if the server doesn't know the option.
async fn negotiate_go<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    export: &str,
) -> anyhow::Result<Option<ExportInfo>> {
    let mut data = Vec::with_capacity(8 + export.len());
    data.extend_from_slice(&(export.len() as u32).to_be_bytes());
    data.extend_from_slice(export.as_bytes());
    data.extend_from_slice(&1u16.to_be_bytes());
    data.extend_from_slice(&protocol::INFO_BLOCK_SIZE.to_be_bytes());
    send_option(stream, protocol::OPT_GO, &data).await?;
    let mut export_info: Option<(u64, u16)> = None;
    let mut preferred_block_size = None;
    loop {
        let reply = recv_option_reply(stream, protocol::OPT_GO).await?;
        match reply.reply_type {
            protocol::REP_ACK => break,
            protocol::REP_INFO => {
                let mut info = reply.data.as_slice();
                if info.len() < 2 {
                    anyhow::bail!("truncated info reply");
                }
                let info_type = u16::from_be_bytes([info[0], info[1]]);
                info = &info[2..];
                match info_type {
                    protocol::INFO_EXPORT if info.len() >= 10 => {
                        let mut size = [0u8; 8];
                        size.copy_from_slice(&info[..8]);
                        export_info =
                            Some((u64::from_be_bytes(size), u16::from_be_bytes([info[8], info[9]])));
                    }
                    protocol::INFO_BLOCK_SIZE if info.len() >= 12 => {
                        let mut preferred = [0u8; 4];
                        preferred.copy_from_slice(&info[4..8]);
                        preferred_block_size = Some(u32::from_be_bytes(preferred));
                    }
                    other => trace!("ignoring info {} ({} bytes)", other, info.len()),
                }
            }
            protocol::REP_ERR_UNSUP => return Ok(None),
            error if error & protocol::REP_FLAG_ERROR != 0 => {
                let message = String::from_utf8_lossy(&reply.data);
                anyhow::bail!("export {:?} refused ({:#x}): {}", export, error, message);
            }
            other => trace!("ignoring option reply {:#x}", other),
        }
    }
    let Some((size, transmission_flags)) = export_info else {
        anyhow::bail!("server didn't describe export {:?}", export);
    };
    Ok(Some(ExportInfo {
        size,
        transmission_flags,
        preferred_block_size,
    }))
}

async fn negotiate_export_name<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    export: &str,
    no_zeroes: bool,
) -> anyhow::Result<ExportInfo> {
    send_option(stream, protocol::OPT_EXPORT_NAME, export.as_bytes()).await?;
    let size = stream.read_u64().await?;
    let transmission_flags = stream.read_u16().await?;
    if !no_zeroes {
        let mut padding = [0u8; protocol::EXPORT_NAME_PADDING];
        stream.read_exact(&mut padding).await?;
    }
    Ok(ExportInfo {
        size,
        transmission_flags,
        preferred_block_size: None,
    })
}

/// Fixed newstyle handshake up to the start of the transmission phase.
pub async fn handshake<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    export: &str,
) -> anyhow::Result<ExportInfo> {
    if stream.read_u64().await? != protocol::NBD_MAGIC {
        anyhow::bail!("not an NBD server");
    }
    if stream.read_u64().await? != protocol::IHAVEOPT {
        anyhow::bail!("server doesn't speak the newstyle protocol");
    }
    let server_flags = stream.read_u16().await?;
    if server_flags & protocol::FLAG_FIXED_NEWSTYLE == 0 {
        anyhow::bail!("server doesn't support the fixed newstyle handshake");
    }
    let no_zeroes = server_flags & protocol::FLAG_NO_ZEROES != 0;
    let mut client_flags = protocol::CLIENT_FIXED_NEWSTYLE;
    if no_zeroes {
        client_flags |= protocol::CLIENT_NO_ZEROES;
    }
    stream.write_u32(client_flags).await?;
    match negotiate_go(stream, export).await? {
        Some(info) => Ok(info),
        None => {
            debug!("server doesn't support NBD_OPT_GO, falling back to NBD_OPT_EXPORT_NAME");
            negotiate_export_name(stream, export, no_zeroes).await
        }
    }
}

async fn write_requests(
    mut sink: FramedWrite<OwnedWriteHalf, RequestCodec>,
    mut requests: tokio::sync::mpsc::UnboundedReceiver<Request>,
) -> std::io::Result<()> {
    while let Some(request) = requests.recv().await {
        sink.feed(request).await?;
        while let Ok(request) = requests.try_recv() {
            sink.feed(request).await?;
        }
        sink.flush().await?;
    }
    sink.close().await
}

/// One established transmission phase connection.
#[derive(Debug)]
struct Connection {
    replies: FramedRead<OwnedReadHalf, ReplyCodec>,
    /// `None` once the connection is being closed.
    requests: Option<tokio::sync::mpsc::UnboundedSender<Request>>,
    writer: tokio::task::JoinHandle<std::io::Result<()>>,
    writer_alive: bool,
}

impl Connection {
    #[instrument]
    async fn open(url: &TargetUrl) -> Result<(Self, ExportInfo), TargetError> {
        let mut stream = TcpStream::connect((url.host.as_str(), url.port))
            .await
            .map_err(|error| handshake_error(url, error))?;
        stream
            .set_nodelay(true)
            .map_err(|error| handshake_error(url, error))?;
        let info = handshake(&mut stream, &url.export)
            .await
            .map_err(|error| handshake_error(url, format!("{error:#}")))?;
        debug!("{}: {:?}", url, info);
        let (read_half, write_half) = stream.into_split();
        let (requests, receiver) = tokio::sync::mpsc::unbounded_channel();
        let writer = tokio::spawn(write_requests(
            FramedWrite::new(write_half, RequestCodec),
            receiver,
        ));
        let connection = Self {
            replies: FramedRead::new(read_half, ReplyCodec::default()),
            requests: Some(requests),
            writer,
            writer_alive: true,
        };
        Ok((connection, info))
    }

    /// Queue `request`; a read's payload is decoded into `read_buf`.
    fn send(&mut self, request: Request, read_buf: Option<BytesMut>) {
        if let Some(buf) = read_buf {
            self.replies
                .decoder_mut()
                .expect_read(request.handle, request.length, buf);
        }
        // a dead writer is reported by the next call to `next_event`
        let sent = self
            .requests
            .as_ref()
            .is_some_and(|requests| requests.send(request).is_ok());
        if !sent {
            trace!("request dropped, writer is gone");
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    command: Command,
    offset: u64,
}

/// Client side of one NBD export.
#[derive(Debug)]
pub struct NbdTarget {
    url: TargetUrl,
    name: String,
    capacity: Capacity,
    read_only: bool,
    connection: Connection,
    in_flight: HashMap<u64, InFlight>,
}

impl NbdTarget {
    pub async fn connect(url: TargetUrl) -> Result<Self, TargetError> {
        let (connection, info) = Connection::open(&url).await?;
        let capacity = info.capacity();
        if info.size % u64::from(capacity.block_size) != 0 {
            warn!(
                "{}: size {} isn't a multiple of the block size {}, the tail is ignored",
                url, info.size, capacity.block_size
            );
        }
        Ok(Self {
            name: url.to_string(),
            url,
            capacity,
            read_only: info.transmission_flags & protocol::TRANSMISSION_FLAG_READ_ONLY != 0,
            connection,
            in_flight: HashMap::new(),
        })
    }

    fn submit(&mut self, request: Request, read_buf: Option<BytesMut>) {
        self.in_flight.insert(
            request.handle,
            InFlight {
                command: request.command,
                offset: request.offset,
            },
        );
        self.connection.send(request, read_buf);
    }

    fn byte_offset(&self, lba: u64) -> u64 {
        lba * u64::from(self.capacity.block_size)
    }

    fn on_reply(&mut self, reply: Reply) -> Result<TargetEvent, TargetError> {
        let Some(request) = self.in_flight.remove(&reply.handle) else {
            return Err(TargetError::Protocol(format!(
                "{}: reply for unknown handle {}",
                self.name, reply.handle
            )));
        };
        let outcome = if reply.error != 0 {
            let reason = format!(
                "{} at offset {} failed: {} ({})",
                request.command,
                request.offset,
                protocol::error_name(reply.error),
                reply.error
            );
            if protocol::is_fatal_error(reply.error) {
                return Err(TargetError::Rejected(format!("{}: {}", self.name, reason)));
            }
            Outcome::Failed(reason)
        } else {
            match request.command {
                Command::Read => Outcome::Read(reply.data.unwrap_or_default()),
                Command::Write | Command::Disconnect => Outcome::Written,
            }
        };
        Ok(TargetEvent::Completed(Completion {
            tag: reply.handle,
            outcome,
        }))
    }
}

impl BlockTarget for NbdTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Capacity {
        self.capacity
    }

    fn submit_read(
        &mut self,
        tag: u64,
        lba: u64,
        blocks: u32,
        buf: BytesMut,
    ) -> Result<(), TargetError> {
        let length = blocks * self.capacity.block_size;
        let request = Request::read(tag, self.byte_offset(lba), length);
        self.submit(request, Some(buf));
        Ok(())
    }

    fn submit_write(&mut self, tag: u64, lba: u64, data: Bytes) -> Result<(), TargetError> {
        if self.read_only {
            return Err(TargetError::Rejected(format!("{}: export is read-only", self.name)));
        }
        let request = Request::write(tag, self.byte_offset(lba), data);
        self.submit(request, None);
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TargetEvent, TargetError> {
        let writer_alive = self.connection.writer_alive;
        tokio::select! {
            reply = self.connection.replies.next() => match reply {
                Some(Ok(reply)) => self.on_reply(reply),
                Some(Err(error)) if error.kind() == std::io::ErrorKind::InvalidData => {
                    Err(TargetError::Protocol(format!("{}: {}", self.name, error)))
                }
                Some(Err(error)) => {
                    Ok(TargetEvent::Disconnected(format!("{}: {}", self.name, error)))
                }
                None => Ok(TargetEvent::Disconnected(format!(
                    "{}: connection closed by the server",
                    self.name
                ))),
            },
            result = &mut self.connection.writer, if writer_alive => {
                self.connection.writer_alive = false;
                let reason = match result {
                    Ok(Ok(())) => "request stream closed".to_string(),
                    Ok(Err(error)) => error.to_string(),
                    Err(error) => error.to_string(),
                };
                Ok(TargetEvent::Disconnected(format!("{}: {}", self.name, reason)))
            }
        }
    }

    async fn reconnect(&mut self) -> Result<(), TargetError> {
        self.connection.writer.abort();
        let (connection, info) = Connection::open(&self.url).await?;
        let capacity = info.capacity();
        if capacity != self.capacity {
            return Err(TargetError::Protocol(format!(
                "{}: export changed from {:?} to {:?} across reconnect",
                self.name, self.capacity, capacity
            )));
        }
        self.connection = connection;
        self.in_flight.clear();
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TargetError> {
        self.connection.send(Request::disconnect(), None);
        // without a sender left the writer flushes, shuts the socket down and finishes
        self.connection.requests = None;
        if self.connection.writer_alive {
            self.connection.writer_alive = false;
            match (&mut self.connection.writer).await {
                Ok(result) => result?,
                Err(error) => {
                    return Err(TargetError::Protocol(format!(
                        "{}: writer failed: {}",
                        self.name, error
                    )));
                }
            }
        }
        self.in_flight.clear();
        Ok(())
    }
}
