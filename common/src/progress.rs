use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{event, instrument, Level};

/// Monotonic counter shared between the transfer loop and the progress reporter thread.
#[derive(Debug, Default)]
pub struct Counter {
    count: AtomicU64,
}

impl Counter {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
        }
    }

    pub fn add(&self, value: u64) {
        self.count.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Status {
    pub read: u64,
    pub written: u64,
}

#[derive(Debug)]
pub struct Progress {
    pub blocks_read: Counter,
    pub blocks_written: Counter,
    pub bytes_read: Counter,
    pub bytes_written: Counter,
    pub retries: Counter,
    pub reconnects: Counter,
    /// Total number of blocks to move, 0 while unknown (e.g. reading from a pipe).
    pub blocks_total: Counter,
    start_time: std::time::Instant,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Self {
            blocks_read: Counter::new(),
            blocks_written: Counter::new(),
            bytes_read: Counter::new(),
            bytes_written: Counter::new(),
            retries: Counter::new(),
            reconnects: Counter::new(),
            blocks_total: Counter::new(),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    #[instrument]
    pub fn status(&self) -> Status {
        let mut status = Status {
            read: self.blocks_read.get(),
            written: self.blocks_written.get(),
        };
        if status.written > status.read {
            // local sources count reads after the write was queued
            event!(
                Level::TRACE,
                "Progress inversion - read: {}, written {}",
                status.read,
                status.written
            );
            status.read = status.written;
        }
        status
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ProgressPrinter<'a> {
    progress: &'a Progress,
    last_blocks: u64,
    last_bytes: u64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(progress: &'a Progress) -> Self {
        Self {
            progress,
            last_blocks: progress.blocks_written.get(),
            last_bytes: progress.bytes_written.get(),
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let status = self.progress.status();
        let total_duration_secs = self.progress.get_duration().as_secs_f64();
        let curr_duration_secs = (time_now - self.last_update).as_secs_f64();
        let average_blocks_rate = status.written as f64 / total_duration_secs;
        let current_blocks_rate =
            (status.written - self.last_blocks) as f64 / curr_duration_secs;
        let bytes = self.progress.bytes_written.get();
        let average_bytes_rate = bytes as f64 / total_duration_secs;
        let current_bytes_rate = (bytes - self.last_bytes) as f64 / curr_duration_secs;
        self.last_blocks = status.written;
        self.last_bytes = bytes;
        self.last_update = time_now;
        let total = self.progress.blocks_total.get();
        Ok(format!(
            "---------------------\n\
            BLOCKS:\n\
            read:      {:>10}\n\
            written:   {:>10}\n\
            total:     {:>10}\n\
            in flight: {:>10}\n\
            average:   {:>10.2} blocks/s\n\
            current:   {:>10.2} blocks/s\n\
            -----------------------\n\
            COPIED:\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            -----------------------\n\
            retries:    {:>10}\n\
            reconnects: {:>10}",
            status.read,
            status.written,
            if total > 0 {
                total.to_string()
            } else {
                "?".to_string()
            },
            status.read - status.written,
            average_blocks_rate,
            current_blocks_rate,
            bytesize::ByteSize(average_bytes_rate as u64),
            bytesize::ByteSize(current_bytes_rate as u64),
            bytesize::ByteSize(bytes),
            self.progress.retries.get(),
            self.progress.reconnects.get(),
        ))
    }
}
