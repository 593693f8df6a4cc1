//! Output batching for local destinations
//!
//! Reads complete in any order, but a local file is best written in long contiguous runs, and a
//! pipe can only be written strictly in order. The [`OutputBatcher`] keeps completed blocks
//! sorted by index and decides when a run is worth a single vectored write:
//!
//! - a run reaching `max_batch` blocks is always written,
//! - a run which can't grow anymore is written once it has `min_batch` blocks, or unconditionally
//!   when no more input is expected,
//! - on a seekable destination a run which is too small is left queued and the scan continues with
//!   the next run further ahead; on a non-seekable one output stops at the first gap.
//!
//! The runs themselves are written by a [`SinkWriter`] on the blocking thread pool, one batch at a
//! time, so that a slow disk or a stalled pipe never keeps the driver from serving the source.

use std::collections::BTreeMap;
use std::ops::Range;

use bytes::Bytes;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Destination of batched output.
pub trait BlockSink {
    /// Whether runs may be written at arbitrary offsets.
    fn is_seekable(&self) -> bool;

    /// Write `run` back to back starting at byte `offset`. Non-seekable sinks ignore `offset`; the
    /// batcher guarantees it equals the number of bytes written so far.
    fn write_run(&mut self, offset: u64, run: &[Bytes]) -> std::io::Result<()>;
}

/// Contiguous blocks taken out of the queue, written with a single vectored write.
#[derive(Debug)]
pub struct Run {
    pub blocks: Range<u64>,
    /// Byte offset of the first block.
    pub offset: u64,
    pub data: Vec<Bytes>,
}

impl Run {
    fn write_to(&self, sink: &mut impl BlockSink) -> std::io::Result<()> {
        debug!(
            "writing blocks {}..{} at offset {}",
            self.blocks.start, self.blocks.end, self.offset
        );
        sink.write_run(self.offset, &self.data)
    }
}

#[derive(Debug)]
pub struct OutputBatcher {
    block_size: u64,
    min_batch: usize,
    max_batch: usize,
    queue: BTreeMap<u64, Bytes>,
    /// Lowest block index not taken for writing yet.
    next_contiguous_block: u64,
    /// Runs taken past `next_contiguous_block`, start -> end.
    written_ahead: BTreeMap<u64, u64>,
}

impl OutputBatcher {
    #[must_use]
    pub fn new(block_size: u32, min_batch: usize, max_batch: usize) -> Self {
        let min_batch = min_batch.max(1);
        Self {
            block_size: u64::from(block_size),
            min_batch,
            max_batch: max_batch.max(min_batch),
            queue: BTreeMap::new(),
            next_contiguous_block: 0,
            written_ahead: BTreeMap::new(),
        }
    }

    pub fn enqueue(&mut self, block: u64, data: Bytes) {
        debug_assert!(block >= self.next_contiguous_block);
        let previous = self.queue.insert(block, data);
        debug_assert!(previous.is_none(), "block {block} enqueued twice");
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn next_contiguous_block(&self) -> u64 {
        self.next_contiguous_block
    }

    /// Take out the runs the batching rules allow writing now, in the order they must be written.
    /// Calling it again without new input takes nothing.
    pub fn take_runs(&mut self, seekable: bool, more_input_expected: bool) -> Vec<Run> {
        let mut runs = Vec::new();
        // a pass may skip small runs to reach a flushable one further ahead, and once those are
        // gone the skipped runs may become flushable as well
        loop {
            let before = runs.len();
            self.take_pass(seekable, more_input_expected, &mut runs);
            if runs.len() == before {
                return runs;
            }
        }
    }

    fn take_pass(&mut self, seekable: bool, more_input_expected: bool, runs: &mut Vec<Run>) {
        let blocks: Vec<u64> = self.queue.keys().copied().collect();
        let mut first = self.next_contiguous_block;
        let mut len = 0u64;
        let mut next = 0;
        loop {
            if len as usize >= self.max_batch {
                // full batch
            } else if next == blocks.len() {
                if (len as usize) < self.min_batch && more_input_expected {
                    break;
                }
            } else if blocks[next] == first + len {
                len += 1;
                next += 1;
                continue;
            } else if len as usize >= self.min_batch {
                // run ended and is large enough
            } else if seekable {
                trace!(
                    "leaving {} block(s) from {} queued, next run starts at {}",
                    len, first, blocks[next]
                );
                first = blocks[next];
                len = 1;
                next += 1;
                continue;
            } else {
                break;
            }
            if len == 0 {
                break;
            }
            runs.push(self.take(first..first + len));
            first += len;
            len = 0;
        }
    }

    fn take(&mut self, blocks: Range<u64>) -> Run {
        let data: Vec<Bytes> = blocks
            .clone()
            .filter_map(|block| self.queue.remove(&block))
            .collect();
        debug_assert_eq!(data.len() as u64, blocks.end - blocks.start);
        if blocks.start == self.next_contiguous_block {
            let mut cursor = blocks.end;
            while let Some(end) = self.written_ahead.remove(&cursor) {
                cursor = end;
            }
            self.next_contiguous_block = cursor;
        } else {
            self.written_ahead.insert(blocks.start, blocks.end);
        }
        Run {
            offset: self.block_size * blocks.start,
            blocks,
            data,
        }
    }
}

/// Blocking task writing a batch of runs, giving the sink back when done.
type WriteTask<K> = JoinHandle<(K, std::io::Result<Vec<Range<u64>>>)>;

/// Owner of a [`BlockSink`] whose writes run on the blocking thread pool.
///
/// At most one batch is written at a time. While it is, the sink lives in the blocking task and
/// comes back through [`SinkWriter::finished`].
#[derive(Debug)]
pub struct SinkWriter<K> {
    sink: Option<K>,
    seekable: bool,
    writing: Option<WriteTask<K>>,
}

impl<K: BlockSink + Send + 'static> SinkWriter<K> {
    pub fn new(sink: K) -> Self {
        Self {
            seekable: sink.is_seekable(),
            sink: Some(sink),
            writing: None,
        }
    }

    #[must_use]
    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.writing.is_some()
    }

    /// Write `runs` in order on the blocking thread pool. Fails if a batch is already being
    /// written.
    pub fn start(&mut self, runs: Vec<Run>) -> std::io::Result<()> {
        let mut sink = self
            .sink
            .take()
            .ok_or_else(|| std::io::Error::other("sink is still busy with the previous batch"))?;
        self.writing = Some(tokio::task::spawn_blocking(move || {
            let mut written = Vec::with_capacity(runs.len());
            for run in runs {
                if let Err(error) = run.write_to(&mut sink) {
                    return (sink, Err(error));
                }
                written.push(run.blocks);
            }
            (sink, Ok(written))
        }));
        Ok(())
    }

    /// Wait for the batch in progress and return the block ranges it wrote. Never completes while
    /// idle.
    ///
    /// Cancel-safe: dropping the future leaves the batch running.
    pub async fn finished(&mut self) -> std::io::Result<Vec<Range<u64>>> {
        let Some(writing) = self.writing.as_mut() else {
            return std::future::pending().await;
        };
        let joined = writing.await;
        self.writing = None;
        let (sink, result) = joined.map_err(std::io::Error::other)?;
        self.sink = Some(sink);
        result
    }

    /// Give the sink back, once idle.
    pub fn into_inner(self) -> Option<K> {
        self.sink
    }
}
