//! Request scheduling
//!
//! The [`Scheduler`] owns the chunk pool and drives every chunk through its life cycle:
//!
//! ```text
//! Unused -> ReadInFlight -> ReadDone -> WriteInFlight -> Unused
//!                |                           |
//!                +--------> Failed <---------+
//!                             |
//!                             +--> (after the retry delay) ReadInFlight | WriteInFlight
//! ```
//!
//! Transient failures never leave the scheduler: the chunk waits on the failed list for
//! `retry_delay` and is then reissued, re-read if it holds no data yet, rewritten otherwise. Since
//! the delay is a constant, appending to the failed list keeps it ordered by deadline.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::chunk::{ChunkId, ChunkPool, Phase};
use crate::config::TransferConfig;
use crate::endpoint::RemoteEndpoint;
use crate::progress::Progress;
use crate::target::{BlockTarget, Outcome, TargetError};
use crate::transfer::Summary;

#[derive(Debug)]
pub struct Scheduler {
    pool: ChunkPool,
    /// Chunks in [`Phase::Failed`], oldest deadline first.
    failed: VecDeque<ChunkId>,
    /// Chunks in [`Phase::ReadDone`] waiting for the destination to accept another write.
    ready: VecDeque<ChunkId>,
    next_block: u64,
    total_blocks: u64,
    /// Destination blocks per source block.
    lba_ratio: u64,
    config: TransferConfig,
    prog_track: &'static Progress,
    summary: Summary,
}

impl Scheduler {
    /// Schedule `total_blocks` source blocks of `block_size` bytes through `pool_size` chunks.
    pub fn new(
        pool_size: usize,
        block_size: usize,
        total_blocks: u64,
        config: TransferConfig,
        prog_track: &'static Progress,
    ) -> Self {
        debug!(
            "creating {} chunks of {} bytes for {} blocks",
            pool_size, block_size, total_blocks
        );
        Self {
            pool: ChunkPool::new(pool_size, block_size),
            failed: VecDeque::new(),
            ready: VecDeque::new(),
            next_block: 0,
            total_blocks,
            lba_ratio: 1,
            config,
            prog_track,
            summary: Summary::default(),
        }
    }

    /// Write source block `n` at destination block `n * ratio`.
    #[must_use]
    pub fn with_lba_ratio(mut self, ratio: u64) -> Self {
        self.lba_ratio = ratio.max(1);
        self
    }

    #[must_use]
    pub fn pool(&self) -> &ChunkPool {
        &self.pool
    }

    #[must_use]
    pub fn summary(&self) -> Summary {
        self.summary
    }

    #[must_use]
    pub fn next_block(&self) -> u64 {
        self.next_block
    }

    #[must_use]
    pub fn has_unread_blocks(&self) -> bool {
        self.next_block < self.total_blocks
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// No chunk is in use: nothing is in flight, failed or waiting to be written.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.failed.is_empty()
            && self.ready.is_empty()
            && self.pool.unused_count() == self.pool.len()
    }

    fn block_of(&self, id: ChunkId) -> u64 {
        self.pool.get(id).block.unwrap_or_default()
    }

    /// Issue reads of new source blocks while chunks, source capacity and unread blocks last.
    pub fn start_read_requests<S: BlockTarget>(
        &mut self,
        src: &mut RemoteEndpoint<S>,
    ) -> Result<usize, TargetError> {
        let mut issued = 0;
        while self.has_unread_blocks() && src.has_capacity() {
            let Some(id) = self.pool.acquire() else {
                break;
            };
            let block = self.next_block;
            trace!("reading source block {}", block);
            let chunk = self.pool.get_mut(id);
            chunk.block = Some(block);
            chunk.phase = Phase::ReadInFlight;
            let buf = self.pool.lend_buffer(id);
            src.issue_read(block, id, buf)?;
            self.next_block += 1;
            issued += 1;
        }
        Ok(issued)
    }

    /// Claim a chunk for the next block of a local source, handing out the buffer to read it
    /// into. `None` once every block was claimed or no chunk is free.
    pub fn start_local_read(&mut self) -> Option<(ChunkId, BytesMut)> {
        if !self.has_unread_blocks() {
            return None;
        }
        let id = self.pool.acquire()?;
        let block = self.next_block;
        self.next_block += 1;
        trace!("reading source block {}", block);
        let chunk = self.pool.get_mut(id);
        chunk.block = Some(block);
        chunk.phase = Phase::ReadInFlight;
        Some((id, self.pool.lend_buffer(id)))
    }

    /// Take the block read from a local source into `id` and queue it for writing. Returns the
    /// block index.
    pub fn accept_block(&mut self, id: ChunkId, data: Bytes) -> u64 {
        let block = self.block_of(id);
        self.summary.blocks_read += 1;
        self.summary.bytes_read += data.len() as u64;
        self.prog_track.blocks_read.inc();
        self.prog_track.bytes_read.add(data.len() as u64);
        let chunk = self.pool.get_mut(id);
        debug_assert_eq!(chunk.phase, Phase::ReadInFlight);
        chunk.data = Some(data);
        chunk.phase = Phase::ReadDone;
        self.ready.push_back(id);
        block
    }

    /// Issue writes of chunks waiting in the ready queue while the destination has capacity.
    pub fn start_write_requests<D: BlockTarget>(
        &mut self,
        dst: &mut RemoteEndpoint<D>,
    ) -> Result<usize, TargetError> {
        let mut issued = 0;
        while dst.has_capacity() {
            let Some(id) = self.ready.pop_front() else {
                break;
            };
            let block = self.block_of(id);
            let chunk = self.pool.get_mut(id);
            let data = chunk.data.clone().unwrap_or_default();
            chunk.phase = Phase::WriteInFlight;
            dst.issue_write(block * self.lba_ratio, id, data)?;
            issued += 1;
        }
        Ok(issued)
    }

    /// Record the outcome of a read. On success the chunk is [`Phase::ReadDone`] and its block
    /// index and data are returned; the caller either queues the chunk for writing with
    /// [`Scheduler::queue_write`] or hands the data on and [`Scheduler::release`]s it.
    pub fn complete_read(&mut self, id: ChunkId, outcome: Outcome) -> Option<(u64, Bytes)> {
        let block = self.block_of(id);
        match outcome {
            Outcome::Read(data) => {
                if self.config.read_progress > 0 && block % self.config.read_progress == 0 {
                    info!("source block {} read", block);
                }
                self.summary.blocks_read += 1;
                self.summary.bytes_read += data.len() as u64;
                self.prog_track.blocks_read.inc();
                self.prog_track.bytes_read.add(data.len() as u64);
                let chunk = self.pool.get_mut(id);
                chunk.data = Some(data.clone());
                chunk.phase = Phase::ReadDone;
                Some((block, data))
            }
            Outcome::Written => {
                warn!("source block {}: read completed as a write, retrying", block);
                self.fail(id, "unexpected completion");
                None
            }
            Outcome::Failed(reason) => {
                self.fail(id, &reason);
                None
            }
        }
    }

    pub fn queue_write(&mut self, id: ChunkId) {
        debug_assert_eq!(self.pool.get(id).phase, Phase::ReadDone);
        self.ready.push_back(id);
    }

    pub fn release(&mut self, id: ChunkId) {
        self.pool.release(id);
    }

    /// Record the outcome of a write; a successful write frees the chunk.
    pub fn complete_write(&mut self, id: ChunkId, outcome: Outcome) -> bool {
        let block = self.block_of(id);
        match outcome {
            Outcome::Written => {
                let bytes = self
                    .pool
                    .get(id)
                    .data
                    .as_ref()
                    .map_or(0, |data| data.len() as u64);
                self.record_written(block, 1, bytes);
                self.pool.release(id);
                true
            }
            Outcome::Read(_) => {
                warn!("source block {}: write completed as a read, retrying", block);
                self.fail(id, "unexpected completion");
                false
            }
            Outcome::Failed(reason) => {
                self.fail(id, &reason);
                false
            }
        }
    }

    /// Account for `count` source blocks starting at `first` having reached the destination.
    pub fn record_written(&mut self, first: u64, count: u64, bytes: u64) {
        if self.config.write_progress > 0 {
            for block in first..first + count {
                if block % self.config.write_progress == 0 {
                    info!("source block {} copied", block);
                }
            }
        }
        self.summary.blocks_written += count;
        self.summary.bytes_written += bytes;
        self.prog_track.blocks_written.add(count);
        self.prog_track.bytes_written.add(bytes);
    }

    /// Park a chunk whose request failed until the retry delay passes.
    pub fn fail(&mut self, id: ChunkId, reason: &str) {
        let block = self.block_of(id);
        let chunk = self.pool.get_mut(id);
        debug!(
            "source block {}: {} failed: {}",
            block,
            if chunk.data.is_some() { "write" } else { "read" },
            reason
        );
        chunk.phase = Phase::Failed;
        chunk.retry_at = Some(Instant::now() + self.config.retry_delay);
        self.failed.push_back(id);
        self.summary.retries += 1;
        self.prog_track.retries.inc();
    }

    /// Deadline of the oldest failed chunk still waiting for its retry time.
    ///
    /// Failed chunks already due but still queued are only waiting for their endpoint to finish
    /// a request, so they don't need a timer.
    #[must_use]
    pub fn next_retry_deadline(&self) -> Option<Instant> {
        let now = Instant::now();
        self.failed
            .iter()
            .filter_map(|id| self.pool.get(*id).retry_at)
            .find(|at| *at > now)
    }

    /// Reissue failed requests whose retry time has come.
    ///
    /// A due chunk whose endpoint is at its ceiling keeps its place and the pass goes on with the
    /// next one; the pass ends at the first chunk which isn't due yet.
    pub fn restart_requests<S: BlockTarget, D: BlockTarget>(
        &mut self,
        mut src: Option<&mut RemoteEndpoint<S>>,
        mut dst: Option<&mut RemoteEndpoint<D>>,
    ) -> Result<usize, TargetError> {
        let now = Instant::now();
        let mut reissued = 0;
        let mut index = 0;
        while index < self.failed.len() {
            let id = self.failed[index];
            let chunk = self.pool.get(id);
            if chunk.retry_at.is_some_and(|at| at > now) {
                break;
            }
            let block = self.block_of(id);
            let phase = match chunk.data.clone() {
                None => match src.as_deref_mut() {
                    Some(src) if src.has_capacity() => {
                        debug!("re-reading source block {}", block);
                        let buf = self.pool.lend_buffer(id);
                        src.issue_read(block, id, buf)?;
                        Phase::ReadInFlight
                    }
                    _ => Phase::Failed,
                },
                Some(data) => match dst.as_deref_mut() {
                    Some(dst) if dst.has_capacity() => {
                        debug!("rewriting source block {}", block);
                        dst.issue_write(block * self.lba_ratio, id, data)?;
                        Phase::WriteInFlight
                    }
                    _ => Phase::Failed,
                },
            };
            if phase == Phase::Failed {
                index += 1;
            } else {
                self.failed.remove(index);
                let chunk = self.pool.get_mut(id);
                chunk.phase = phase;
                chunk.retry_at = None;
                reissued += 1;
            }
        }
        Ok(reissued)
    }

    /// Recover from a broken connection: every request in flight on it fails, the endpoint
    /// reconnects with a lower ceiling and surplus chunks are freed.
    pub async fn connection_lost<T: BlockTarget>(
        &mut self,
        endpoint: &mut RemoteEndpoint<T>,
        reason: &str,
        other_ceiling: u32,
    ) -> Result<(), TargetError> {
        warn!("{} target: connection error: {}", endpoint.role(), reason);
        for id in endpoint.abandon_in_flight() {
            self.fail(id, "connection lost");
        }
        endpoint.reconnect().await?;
        self.summary.reconnects += 1;
        self.prog_track.reconnects.inc();
        endpoint.degrade(self.config.degradation_percent);
        self.shrink_pool(endpoint.max_requests() + other_ceiling);
        Ok(())
    }

    /// Free unused chunks beyond the sum of the current ceilings.
    pub fn shrink_pool(&mut self, ceilings: u32) {
        let freed = self.pool.shrink_to(ceilings as usize);
        if freed > 0 {
            debug!("freed {} surplus chunks, {} left", freed, self.pool.len());
        }
    }
}
