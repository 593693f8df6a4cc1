//! Reusable transfer units
//!
//! A [`Chunk`] carries one source block through the pipeline. Chunks live in a [`ChunkPool`], an
//! index-based slab: the rest of the engine only holds [`ChunkId`]s, so handing a chunk from one
//! stage to the next is a move of an id, and every live chunk is always in exactly one [`Phase`].
//!
//! Each chunk also owns the memory its block is read into. The buffer is lent out with
//! [`ChunkPool::lend_buffer`] and comes back as the frozen block data; once every copy of that data
//! is dropped, the next lend reuses the allocation instead of making a new one.

use bytes::BytesMut;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Unused,
    ReadInFlight,
    /// Holds source data which hasn't been handed to the destination yet.
    ReadDone,
    WriteInFlight,
    /// Waiting for `retry_at` before the failed request is reissued.
    Failed,
}

#[derive(Debug)]
pub struct Chunk {
    /// Index of the source block carried by this chunk.
    pub block: Option<u64>,
    /// Source data, present from the moment the block was read until it is written.
    pub data: Option<bytes::Bytes>,
    pub retry_at: Option<Instant>,
    pub phase: Phase,
    /// Owner of the block memory, empty while the memory is lent out.
    buf: BytesMut,
}

impl Chunk {
    fn new(block_size: usize) -> Self {
        Self {
            block: None,
            data: None,
            retry_at: None,
            phase: Phase::Unused,
            buf: BytesMut::with_capacity(block_size),
        }
    }

    fn reset(&mut self) {
        self.block = None;
        self.data = None;
        self.retry_at = None;
        self.phase = Phase::Unused;
    }
}

/// Number of live chunks in each phase.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PhaseCounts {
    pub unused: usize,
    pub read_in_flight: usize,
    pub read_done: usize,
    pub write_in_flight: usize,
    pub failed: usize,
}

impl PhaseCounts {
    #[must_use]
    pub fn total(&self) -> usize {
        self.unused + self.read_in_flight + self.read_done + self.write_in_flight + self.failed
    }
}

#[derive(Debug)]
pub struct ChunkPool {
    slots: Vec<Chunk>,
    unused: Vec<ChunkId>,
    block_size: usize,
    /// Slots freed by [`ChunkPool::shrink_to`]; their ids are never handed out again.
    retired: usize,
}

impl ChunkPool {
    /// Create `size` unused chunks with a `block_size` buffer each. They are recycled for the
    /// whole transfer.
    #[must_use]
    pub fn new(size: usize, block_size: usize) -> Self {
        let slots = (0..size).map(|_| Chunk::new(block_size)).collect();
        // reversed so that acquire() hands out chunk 0 first
        let unused = (0..size).rev().map(ChunkId).collect();
        Self {
            slots,
            unused,
            block_size,
            retired: 0,
        }
    }

    /// Lend out the chunk's block buffer: empty, with room for one block.
    ///
    /// The previous loan is reclaimed when nothing else refers to it anymore; while the old block
    /// is still shared (queued for output, held by a target) a fresh buffer is allocated.
    pub fn lend_buffer(&mut self, id: ChunkId) -> BytesMut {
        let block_size = self.block_size;
        let buf = &mut self.get_mut(id).buf;
        buf.clear();
        buf.reserve(block_size);
        buf.split_off(0)
    }

    /// Take an unused chunk, if any is left.
    ///
    /// This is the primary admission control point: no new work may be started without a chunk.
    pub fn acquire(&mut self) -> Option<ChunkId> {
        self.unused.pop()
    }

    /// Return a chunk to the unused set, dropping whatever it carried.
    pub fn release(&mut self, id: ChunkId) {
        let chunk = self.get_mut(id);
        debug_assert!(chunk.phase != Phase::Unused, "chunk {id:?} released twice");
        chunk.reset();
        self.unused.push(id);
    }

    /// Free unused chunks until at most `n` chunks are alive. Chunks in use are never freed, so
    /// the pool may stay above `n` until they are released.
    pub fn shrink_to(&mut self, n: usize) -> usize {
        let mut freed = 0;
        while self.len() > n {
            if self.unused.pop().is_none() {
                break;
            }
            self.retired += 1;
            freed += 1;
        }
        freed
    }

    #[must_use]
    pub fn has_unused(&self) -> bool {
        !self.unused.is_empty()
    }

    #[must_use]
    pub fn unused_count(&self) -> usize {
        self.unused.len()
    }

    /// Number of live chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len() - self.retired
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, id: ChunkId) -> &Chunk {
        &self.slots[id.0]
    }

    pub fn get_mut(&mut self, id: ChunkId) -> &mut Chunk {
        &mut self.slots[id.0]
    }

    #[must_use]
    pub fn phase_counts(&self) -> PhaseCounts {
        let mut counts = PhaseCounts::default();
        for chunk in &self.slots {
            match chunk.phase {
                Phase::Unused => counts.unused += 1,
                Phase::ReadInFlight => counts.read_in_flight += 1,
                Phase::ReadDone => counts.read_done += 1,
                Phase::WriteInFlight => counts.write_in_flight += 1,
                Phase::Failed => counts.failed += 1,
            }
        }
        counts.unused -= self.retired;
        counts
    }
}
