//! Transfer endpoints: a remote block device or a local file
//!
//! A [`RemoteEndpoint`] wraps any [`BlockTarget`] and adds what the scheduler needs on top of the
//! raw capability: a per-endpoint ceiling on outstanding requests, the mapping from request tags
//! back to chunks, and degradation of the ceiling after connection errors.
//!
//! Local files are plain [`std::fs::File`]s. A source is read block by block by a [`LocalReader`]
//! task, a sink implements [`BlockSink`] and is written with vectored writes.

use std::collections::HashMap;
use std::io::{IoSlice, Seek};
use std::os::fd::AsFd;

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::batcher::BlockSink;
use crate::chunk::ChunkId;
use crate::target::{BlockTarget, Capacity, Outcome, TargetError, TargetEvent};

/// Smallest block size the engine works with.
pub const MIN_BLOCK_SIZE: u32 = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Source,
    Destination,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Source => write!(f, "source"),
            Role::Destination => write!(f, "destination"),
        }
    }
}

/// One side of a transfer, before any data is moved.
#[derive(Debug)]
pub enum Endpoint<T> {
    Remote(RemoteEndpoint<T>),
    Local(LocalPath),
}

impl<T: BlockTarget> Endpoint<T> {
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self, Endpoint::Local(_))
    }
}

/// Local file named on the command line, `None` meaning standard input or output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPath {
    pub path: Option<std::path::PathBuf>,
}

impl LocalPath {
    #[must_use]
    pub fn new(path: Option<std::path::PathBuf>) -> Self {
        // "-" is the customary spelling of stdio
        let path = path.filter(|path| path.as_os_str() != "-");
        Self { path }
    }

    #[must_use]
    pub fn is_stdio(&self) -> bool {
        self.path.is_none()
    }
}

impl std::fmt::Display for LocalPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.path {
            Some(path) => write!(f, "{}", path.display()),
            None => write!(f, "(stdio)"),
        }
    }
}

/// Completion of a request issued through a [`RemoteEndpoint`].
#[derive(Debug)]
pub enum EndpointEvent {
    Completed { chunk: ChunkId, outcome: Outcome },
    /// The connection broke. Every chunk in flight on it must be recovered with
    /// [`RemoteEndpoint::abandon_in_flight`].
    Disconnected(String),
}

#[derive(Debug)]
pub struct RemoteEndpoint<T> {
    role: Role,
    target: T,
    block_size: u32,
    block_count: u64,
    /// Target blocks per engine block, above 1 only when the target reported a tiny block size.
    scale: u32,
    max_requests: u32,
    in_flight: HashMap<u64, ChunkId>,
    next_tag: u64,
}

impl<T: BlockTarget> RemoteEndpoint<T> {
    /// Wrap a connected target and query its capacity.
    pub fn new(role: Role, target: T, max_requests: u32) -> Self {
        let Capacity {
            block_size: reported,
            block_count,
        } = target.capacity();
        let (block_size, block_count, scale) = if reported < MIN_BLOCK_SIZE {
            warn!(
                "{} target reported blocksize={}, using {}",
                role, reported, MIN_BLOCK_SIZE
            );
            if reported > 0 && MIN_BLOCK_SIZE % reported == 0 {
                let scale = MIN_BLOCK_SIZE / reported;
                (MIN_BLOCK_SIZE, block_count / u64::from(scale), scale)
            } else {
                (MIN_BLOCK_SIZE, block_count, 1)
            }
        } else {
            (reported, block_count, 1)
        };
        info!(
            "{} target: blocksize={}, nblocks={}",
            role, block_size, block_count
        );
        Self {
            role,
            target,
            block_size,
            block_count,
            scale,
            max_requests: max_requests.max(1),
            in_flight: HashMap::new(),
            next_tag: 0,
        }
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn name(&self) -> &str {
        self.target.name()
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.block_count
    }

    #[must_use]
    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.max_requests as usize
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
    }

    fn register(&mut self, chunk: ChunkId) -> u64 {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1);
        self.in_flight.insert(tag, chunk);
        tag
    }

    /// Read one block into `buf` on behalf of `chunk`. The caller checks
    /// [`RemoteEndpoint::has_capacity`] first.
    pub fn issue_read(
        &mut self,
        lba: u64,
        chunk: ChunkId,
        buf: BytesMut,
    ) -> Result<(), TargetError> {
        debug_assert!(self.has_capacity(), "{} ceiling exceeded", self.role);
        let tag = self.register(chunk);
        trace!("{}: read lba {} (tag {})", self.role, lba, tag);
        self.target
            .submit_read(tag, lba * u64::from(self.scale), self.scale, buf)
    }

    /// Write `data` (whole blocks) at `lba` on behalf of `chunk`, same contract as
    /// [`RemoteEndpoint::issue_read`].
    pub fn issue_write(
        &mut self,
        lba: u64,
        chunk: ChunkId,
        data: Bytes,
    ) -> Result<(), TargetError> {
        debug_assert!(self.has_capacity(), "{} ceiling exceeded", self.role);
        let tag = self.register(chunk);
        trace!("{}: write lba {} (tag {})", self.role, lba, tag);
        self.target
            .submit_write(tag, lba * u64::from(self.scale), data)
    }

    /// Wait for the next completion of a request issued through this endpoint.
    ///
    /// Cancel-safe as long as the target's `next_event` is.
    pub async fn next_event(&mut self) -> Result<EndpointEvent, TargetError> {
        loop {
            match self.target.next_event().await? {
                TargetEvent::Completed(completion) => {
                    match self.in_flight.remove(&completion.tag) {
                        Some(chunk) => {
                            return Ok(EndpointEvent::Completed {
                                chunk,
                                outcome: completion.outcome,
                            });
                        }
                        None => warn!(
                            "{} target: completion for unknown request {} ignored",
                            self.role, completion.tag
                        ),
                    }
                }
                TargetEvent::Disconnected(reason) => {
                    return Ok(EndpointEvent::Disconnected(reason));
                }
            }
        }
    }

    /// Forget every outstanding request, returning their chunks in issue order.
    pub fn abandon_in_flight(&mut self) -> Vec<ChunkId> {
        let mut lost: Vec<_> = self.in_flight.drain().collect();
        lost.sort_unstable_by_key(|(tag, _)| *tag);
        lost.into_iter().map(|(_, chunk)| chunk).collect()
    }

    /// Re-establish the connection. Outstanding requests must have been abandoned first.
    pub async fn reconnect(&mut self) -> Result<(), TargetError> {
        debug_assert!(self.in_flight.is_empty());
        info!("{} target: reconnecting to {}", self.role, self.name());
        self.target.reconnect().await
    }

    /// Reduce the ceiling to `percent`% of its current value.
    ///
    /// The ceiling never grows and never drops below 1, and every effective reduction lowers it by
    /// at least one. Returns the new ceiling if it changed.
    pub fn degrade(&mut self, percent: u32) -> Option<u32> {
        if percent >= 100 || self.max_requests <= 1 {
            return None;
        }
        let old = self.max_requests;
        let mut new = (u64::from(old) * u64::from(percent) / 100) as u32;
        if new == 0 {
            new = 1;
        } else if new == old {
            new -= 1;
        }
        self.max_requests = new;
        info!(
            "{} target: number of maximal outstanding requests reduced to {}",
            self.role, new
        );
        Some(new)
    }

    /// Orderly logout, only used after a successful transfer.
    pub async fn disconnect(&mut self) -> Result<(), TargetError> {
        debug!("{} target: logging out of {}", self.role, self.name());
        self.target.disconnect().await
    }

    /// Access to the wrapped target.
    pub fn target(&self) -> &T {
        &self.target
    }
}

/// Local file or standard input read sequentially, one chunk at a time.
#[derive(Debug)]
pub struct LocalSource {
    name: String,
    file: tokio::fs::File,
}

impl LocalSource {
    pub fn open(path: &LocalPath) -> std::io::Result<Self> {
        let file = match &path.path {
            Some(path) => std::fs::File::open(path)?,
            None => std::fs::File::from(std::io::stdin().as_fd().try_clone_to_owned()?),
        };
        Ok(Self::from_file(path.to_string(), file))
    }

    #[must_use]
    pub fn from_file(name: String, file: std::fs::File) -> Self {
        Self {
            name,
            file: tokio::fs::File::from_std(file),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fill `buf` from the file. Returns the number of bytes read, which is less than the buffer
    /// size only at end of file.
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read(&mut buf[filled..]).await {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => {}
                Err(error) => return Err(error),
            }
        }
        Ok(filled)
    }
}

#[derive(Debug)]
struct ReadRequest {
    chunk: Option<ChunkId>,
    buf: BytesMut,
    len: usize,
}

/// A read completed by the [`LocalReader`].
#[derive(Debug)]
pub struct LocalRead {
    /// Chunk the read was requested for, `None` for a look-ahead past the last block.
    pub chunk: Option<ChunkId>,
    /// The requested length, zero padded past `filled`.
    pub data: Bytes,
    /// Bytes actually read; less than requested only at end of input.
    pub filled: usize,
}

/// [`LocalSource`] read on a task of its own, so that waiting for input never holds up the
/// remote side of the transfer. Reads complete in the order they were requested.
#[derive(Debug)]
pub struct LocalReader {
    name: String,
    requests: mpsc::Sender<ReadRequest>,
    reads: mpsc::Receiver<std::io::Result<LocalRead>>,
    pending: usize,
    task: tokio::task::JoinHandle<()>,
}

impl LocalReader {
    /// Start reading `source`; at most `depth` reads may be outstanding.
    #[must_use]
    pub fn spawn(source: LocalSource, depth: usize) -> Self {
        let depth = depth.max(1);
        let (requests, request_rx) = mpsc::channel(depth);
        let (read_tx, reads) = mpsc::channel(depth);
        let name = source.name().to_string();
        let task = tokio::spawn(serve_reads(source, request_rx, read_tx));
        Self {
            name,
            requests,
            reads,
            pending: 0,
            task,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reads requested and not returned by [`LocalReader::next_read`] yet.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Queue a read of the next `len` bytes into `buf`.
    pub fn request(
        &mut self,
        chunk: Option<ChunkId>,
        buf: BytesMut,
        len: usize,
    ) -> std::io::Result<()> {
        self.requests
            .try_send(ReadRequest { chunk, buf, len })
            .map_err(|error| std::io::Error::other(format!("{}: {}", self.name, error)))?;
        self.pending += 1;
        Ok(())
    }

    /// Wait for the oldest outstanding read.
    ///
    /// Cancel-safe: a read is only taken off the channel once this completes.
    pub async fn next_read(&mut self) -> std::io::Result<LocalRead> {
        let read = self.reads.recv().await.ok_or_else(|| {
            std::io::Error::other(format!("{}: reader task stopped", self.name))
        })?;
        self.pending -= 1;
        read
    }
}

impl Drop for LocalReader {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_reads(
    mut source: LocalSource,
    mut requests: mpsc::Receiver<ReadRequest>,
    reads: mpsc::Sender<std::io::Result<LocalRead>>,
) {
    while let Some(ReadRequest { chunk, mut buf, len }) = requests.recv().await {
        // zeroed, so that a short last block comes out padded
        buf.clear();
        buf.resize(len, 0);
        let result = source.read_chunk(&mut buf).await;
        trace!("{}: read {:?} of {} bytes", source.name(), result, len);
        let failed = result.is_err();
        let read = result.map(|filled| LocalRead {
            chunk,
            data: buf.freeze(),
            filled,
        });
        if reads.send(read).await.is_err() || failed {
            break;
        }
    }
}

/// Local file or standard output, written by the output batcher.
#[derive(Debug)]
pub struct LocalSink {
    name: String,
    file: std::fs::File,
    seekable: bool,
}

impl LocalSink {
    /// Open the destination and, when it is seekable, preallocate `expected_len` bytes so that
    /// positioned writes can land anywhere in it.
    pub fn open(path: &LocalPath, overwrite: bool, expected_len: u64) -> std::io::Result<Self> {
        let file = match &path.path {
            Some(path) => {
                let mut options = std::fs::OpenOptions::new();
                options.write(true);
                if overwrite {
                    options.create(true).truncate(true);
                } else {
                    options.create_new(true);
                }
                options.open(path)?
            }
            None => std::fs::File::from(std::io::stdout().as_fd().try_clone_to_owned()?),
        };
        Self::from_file(path.to_string(), file, expected_len)
    }

    pub fn from_file(
        name: String,
        mut file: std::fs::File,
        expected_len: u64,
    ) -> std::io::Result<Self> {
        let seekable = file.stream_position().is_ok();
        if seekable {
            file.set_len(expected_len)?;
        }
        debug!("{}: seekable={}", name, seekable);
        Ok(Self {
            name,
            file,
            seekable,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

fn off_t(offset: u64) -> std::io::Result<i64> {
    i64::try_from(offset).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("offset {offset} out of range"),
        )
    })
}

impl BlockSink for LocalSink {
    fn is_seekable(&self) -> bool {
        self.seekable
    }

    fn write_run(&mut self, offset: u64, run: &[Bytes]) -> std::io::Result<()> {
        let mut slices: Vec<IoSlice<'_>> = run.iter().map(|data| IoSlice::new(data)).collect();
        let mut remaining = &mut slices[..];
        let mut position = offset;
        while !remaining.is_empty() {
            let result = if self.seekable {
                nix::sys::uio::pwritev(self.file.as_fd(), remaining, off_t(position)?)
            } else {
                nix::sys::uio::writev(self.file.as_fd(), remaining)
            };
            match result {
                Ok(0) => {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::WriteZero,
                        format!("{}: short write at offset {}", self.name, position),
                    ));
                }
                Ok(n) => {
                    position += n as u64;
                    IoSlice::advance_slices(&mut remaining, n);
                }
                Err(nix::errno::Errno::EINTR) => {}
                Err(errno) => return Err(errno.into()),
            }
        }
        Ok(())
    }
}
