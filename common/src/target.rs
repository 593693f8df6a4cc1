//! Remote block device capability
//!
//! The engine never speaks a wire protocol itself. Anything that can reach a remote block device
//! (see the `remote` crate for the NBD client) plugs in by implementing [`BlockTarget`].
//!
//! # Contract
//!
//! - Submissions ([`BlockTarget::submit_read`], [`BlockTarget::submit_write`]) never block. They
//!   queue a request tagged with a caller-chosen `tag`; an `Err` means the target is unusable and
//!   the transfer must be aborted.
//! - [`BlockTarget::next_event`] waits for the connection to make progress and yields one event.
//!   It must be cancel-safe: the driver polls it inside `tokio::select!` and may drop it at any
//!   time without losing a completion.
//! - After [`TargetEvent::Disconnected`] no completion for a request submitted before it will ever
//!   be delivered; the caller reissues those requests after [`BlockTarget::reconnect`].

use std::future::Future;

/// Size of a remote device as reported when connecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub block_size: u32,
    pub block_count: u64,
}

/// Result of a single request.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// A read finished, carrying the block's contents.
    Read(bytes::Bytes),
    /// A write finished.
    Written,
    /// The request failed but may succeed if reissued (I/O error, non-fatal check condition).
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub tag: u64,
    pub outcome: Outcome,
}

#[derive(Debug, Clone)]
pub enum TargetEvent {
    Completed(Completion),
    /// The connection itself broke; all outstanding requests are lost.
    Disconnected(String),
}

/// Unrecoverable target failure: malformed response, authorization failure, resource exhaustion.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("connect to {target} failed: {reason}")]
    Connect { target: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub trait BlockTarget {
    /// Human readable identity used in diagnostics, e.g. `nbd://host:10809/disk`.
    fn name(&self) -> &str;

    fn capacity(&self) -> Capacity;

    /// Queue a read of `blocks` blocks starting at `lba`.
    ///
    /// `buf` is empty with room for the whole read. A successful completion carries it back,
    /// filled and frozen, as [`Outcome::Read`]; a failed one drops it.
    fn submit_read(
        &mut self,
        tag: u64,
        lba: u64,
        blocks: u32,
        buf: bytes::BytesMut,
    ) -> Result<(), TargetError>;

    /// Queue a write of `data` (a whole number of blocks) starting at `lba`.
    fn submit_write(&mut self, tag: u64, lba: u64, data: bytes::Bytes)
    -> Result<(), TargetError>;

    fn next_event(&mut self) -> impl Future<Output = Result<TargetEvent, TargetError>>;

    /// Drop the current connection and establish a new one to the same target.
    fn reconnect(&mut self) -> impl Future<Output = Result<(), TargetError>>;

    /// Orderly logout. Only called after a successful transfer.
    fn disconnect(&mut self) -> impl Future<Output = Result<(), TargetError>>;
}
