use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};

use crate::target::{BlockTarget, Capacity, Completion, Outcome, TargetError, TargetEvent};

/// Deterministic, block-dependent content so that misplaced blocks are detectable.
pub fn pattern(block_size: u32, block_count: u64) -> Vec<u8> {
    let len = block_size as usize * block_count as usize;
    (0..len)
        .map(|i| {
            let block = i / block_size as usize;
            ((block * 31 + i % 251) % 256) as u8
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Read,
    Write,
}

/// Order in which queued requests complete.
#[derive(Debug, Clone)]
pub enum CompletionOrder {
    Fifo,
    Lifo,
    /// Complete the request for these LBAs in this order; requests for LBAs which aren't next in
    /// the script, or come after it ran out, complete in FIFO order once nothing scripted is
    /// pending.
    Scripted(VecDeque<u64>),
}

/// Everything a [`MemoryTarget`] did, shared with the test after the target was moved away.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    pub reconnects: usize,
    pub logged_out: bool,
    pub max_in_flight: usize,
    /// LBAs of successfully completed reads, in completion order.
    pub reads: Vec<u64>,
    /// LBAs of successfully completed writes, in completion order.
    pub writes: Vec<u64>,
    pub injected_failures: usize,
}

#[derive(Debug)]
struct Request {
    tag: u64,
    op: Op,
    lba: u64,
    blocks: u32,
    /// Buffer a read fills.
    buf: Option<BytesMut>,
    data: Option<Bytes>,
}

/// In-memory block device with fault injection.
#[derive(Debug)]
pub struct MemoryTarget {
    name: String,
    block_size: u32,
    disk: Arc<Mutex<Vec<u8>>>,
    journal: Arc<Mutex<Journal>>,
    pending: Vec<Request>,
    order: CompletionOrder,
    failures: HashMap<(Op, u64), u32>,
    disconnect_after: Option<usize>,
    fatal_lba: Option<u64>,
    completed: usize,
}

impl MemoryTarget {
    pub fn new(name: &str, block_size: u32, contents: Vec<u8>) -> Self {
        Self {
            name: name.to_string(),
            block_size,
            disk: Arc::new(Mutex::new(contents)),
            journal: Arc::default(),
            pending: Vec::new(),
            order: CompletionOrder::Fifo,
            failures: HashMap::new(),
            disconnect_after: None,
            fatal_lba: None,
            completed: 0,
        }
    }

    pub fn with_pattern(name: &str, block_size: u32, block_count: u64) -> Self {
        Self::new(name, block_size, pattern(block_size, block_count))
    }

    pub fn blank(name: &str, block_size: u32, block_count: u64) -> Self {
        Self::new(
            name,
            block_size,
            vec![0; block_size as usize * block_count as usize],
        )
    }

    pub fn order(mut self, order: CompletionOrder) -> Self {
        self.order = order;
        self
    }

    /// Let the request for `lba` fail `times` times before it succeeds.
    pub fn fail(mut self, op: Op, lba: u64, times: u32) -> Self {
        self.failures.insert((op, lba), times);
        self
    }

    /// Break the connection once, after `completions` requests completed.
    pub fn disconnect_after(mut self, completions: usize) -> Self {
        self.disconnect_after = Some(completions);
        self
    }

    /// Any request touching `lba` is a fatal error.
    pub fn fatal_at(mut self, lba: u64) -> Self {
        self.fatal_lba = Some(lba);
        self
    }

    pub fn disk(&self) -> Arc<Mutex<Vec<u8>>> {
        self.disk.clone()
    }

    pub fn journal_handle(&self) -> Arc<Mutex<Journal>> {
        self.journal.clone()
    }

    pub fn journal(&self) -> Journal {
        self.journal.lock().unwrap().clone()
    }

    fn push(&mut self, request: Request) {
        self.pending.push(request);
        let mut journal = self.journal.lock().unwrap();
        journal.max_in_flight = journal.max_in_flight.max(self.pending.len());
    }

    fn pick(&mut self) -> usize {
        match &mut self.order {
            CompletionOrder::Fifo => 0,
            CompletionOrder::Lifo => self.pending.len() - 1,
            CompletionOrder::Scripted(script) => {
                if let Some(next) = script.front().copied() {
                    if let Some(index) = self.pending.iter().position(|r| r.lba == next) {
                        script.pop_front();
                        return index;
                    }
                }
                // hold scripted requests back until their turn unless nothing else is pending
                let index = self
                    .pending
                    .iter()
                    .position(|r| !script.contains(&r.lba))
                    .unwrap_or(0);
                let lba = self.pending[index].lba;
                script.retain(|scripted| *scripted != lba);
                index
            }
        }
    }

    fn complete(&mut self, request: Request) -> Result<Outcome, TargetError> {
        if self.fatal_lba == Some(request.lba) {
            return Err(TargetError::Rejected(format!(
                "{}: lba {} is poisoned",
                self.name, request.lba
            )));
        }
        if let Some(left) = self.failures.get_mut(&(request.op, request.lba)) {
            if *left > 0 {
                *left -= 1;
                self.journal.lock().unwrap().injected_failures += 1;
                return Ok(Outcome::Failed(format!("injected failure at lba {}", request.lba)));
            }
        }
        let bs = self.block_size as usize;
        let start = request.lba as usize * bs;
        let mut disk = self.disk.lock().unwrap();
        match request.op {
            Op::Read => {
                let end = start + request.blocks as usize * bs;
                if end > disk.len() {
                    return Err(TargetError::Protocol(format!(
                        "{}: read beyond end at lba {}",
                        self.name, request.lba
                    )));
                }
                let mut buf = request.buf.unwrap_or_default();
                buf.extend_from_slice(&disk[start..end]);
                self.journal.lock().unwrap().reads.push(request.lba);
                Ok(Outcome::Read(buf.freeze()))
            }
            Op::Write => {
                let data = request.data.unwrap_or_default();
                let end = start + data.len();
                if end > disk.len() {
                    return Err(TargetError::Protocol(format!(
                        "{}: write beyond end at lba {}",
                        self.name, request.lba
                    )));
                }
                disk[start..end].copy_from_slice(&data);
                self.journal.lock().unwrap().writes.push(request.lba);
                Ok(Outcome::Written)
            }
        }
    }
}

impl BlockTarget for MemoryTarget {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Capacity {
        let len = self.disk.lock().unwrap().len() as u64;
        Capacity {
            block_size: self.block_size,
            block_count: len / u64::from(self.block_size.max(1)),
        }
    }

    fn submit_read(
        &mut self,
        tag: u64,
        lba: u64,
        blocks: u32,
        buf: BytesMut,
    ) -> Result<(), TargetError> {
        self.push(Request {
            tag,
            op: Op::Read,
            lba,
            blocks,
            buf: Some(buf),
            data: None,
        });
        Ok(())
    }

    fn submit_write(&mut self, tag: u64, lba: u64, data: Bytes) -> Result<(), TargetError> {
        self.push(Request {
            tag,
            op: Op::Write,
            lba,
            blocks: 0,
            buf: None,
            data: Some(data),
        });
        Ok(())
    }

    async fn next_event(&mut self) -> Result<TargetEvent, TargetError> {
        if self.disconnect_after == Some(self.completed) {
            self.disconnect_after = None;
            self.pending.clear();
            return Ok(TargetEvent::Disconnected(format!(
                "{}: injected connection reset",
                self.name
            )));
        }
        if self.pending.is_empty() {
            return std::future::pending().await;
        }
        let index = self.pick();
        let request = self.pending.remove(index);
        let tag = request.tag;
        let outcome = self.complete(request)?;
        self.completed += 1;
        Ok(TargetEvent::Completed(Completion { tag, outcome }))
    }

    async fn reconnect(&mut self) -> Result<(), TargetError> {
        self.pending.clear();
        self.journal.lock().unwrap().reconnects += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TargetError> {
        self.journal.lock().unwrap().logged_out = true;
        Ok(())
    }
}
