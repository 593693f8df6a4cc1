use std::ops::Range;

use anyhow::{anyhow, Context};
use bytes::BytesMut;
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::batcher::{BlockSink, OutputBatcher, SinkWriter};
use crate::config::TransferConfig;
use crate::endpoint::{
    Endpoint, EndpointEvent, LocalPath, LocalRead, LocalReader, LocalSink, LocalSource,
    RemoteEndpoint,
};
use crate::progress;
use crate::scheduler::Scheduler;
use crate::target::BlockTarget;

/// Error type for transfers that preserves the transfer summary even on failure.
///
/// # Logging Convention
/// The Display implementation automatically shows the full error chain, so you can log it
/// with any format specifier:
/// ```ignore
/// tracing::error!("transfer failed: {}", &error);   // ✅ Shows full chain
/// tracing::error!("transfer failed: {:#}", &error); // ✅ Shows full chain
/// ```
#[derive(Debug, thiserror::Error)]
#[error("{source:#}")]
pub struct Error {
    #[source]
    pub source: anyhow::Error,
    pub summary: Summary,
}

impl Error {
    #[must_use]
    pub fn new(source: anyhow::Error, summary: Summary) -> Self {
        Error { source, summary }
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Summary {
    pub blocks_read: u64,
    pub bytes_read: u64,
    pub blocks_written: u64,
    pub bytes_written: u64,
    pub retries: u64,
    pub reconnects: u64,
    /// Ceiling of the source at the end of the transfer, 0 for a local file.
    pub src_max_requests: u32,
    /// Ceiling of the destination at the end of the transfer, 0 for a local file.
    pub dst_max_requests: u32,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            blocks_read: self.blocks_read + other.blocks_read,
            bytes_read: self.bytes_read + other.bytes_read,
            blocks_written: self.blocks_written + other.blocks_written,
            bytes_written: self.bytes_written + other.bytes_written,
            retries: self.retries + other.retries,
            reconnects: self.reconnects + other.reconnects,
            src_max_requests: self.src_max_requests.max(other.src_max_requests),
            dst_max_requests: self.dst_max_requests.max(other.dst_max_requests),
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "blocks read: {}\n\
            bytes read: {}\n\
            blocks written: {}\n\
            bytes written: {}\n\
            retries: {}\n\
            reconnects: {}\n\
            source max requests: {}\n\
            destination max requests: {}",
            self.blocks_read,
            bytesize::ByteSize(self.bytes_read),
            self.blocks_written,
            bytesize::ByteSize(self.bytes_written),
            self.retries,
            self.reconnects,
            self.src_max_requests,
            self.dst_max_requests,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    LocalToRemote,
    RemoteToLocal,
    RemoteToRemote,
}

impl Direction {
    /// Decide the kind of transfer from the kinds of its endpoints.
    pub fn of(src_is_local: bool, dst_is_local: bool) -> anyhow::Result<Self> {
        match (src_is_local, dst_is_local) {
            (true, false) => Ok(Direction::LocalToRemote),
            (false, true) => Ok(Direction::RemoteToLocal),
            (false, false) => Ok(Direction::RemoteToRemote),
            (true, true) => Err(anyhow!(
                "at least one of the source and the destination must be a remote target"
            )),
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Direction::LocalToRemote => write!(f, "local -> remote"),
            Direction::RemoteToLocal => write!(f, "remote -> local"),
            Direction::RemoteToRemote => write!(f, "remote -> remote"),
        }
    }
}

/// What woke up the transfer loop.
enum Wake {
    Source(EndpointEvent),
    Destination(EndpointEvent),
    LocalRead(std::io::Result<LocalRead>),
    LocalWritten(std::io::Result<Vec<Range<u64>>>),
    Retry,
}

async fn sleep_until_retry(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn logout<T: BlockTarget>(endpoint: &mut RemoteEndpoint<T>) {
    if let Err(error) = endpoint.disconnect().await {
        warn!("{} target: logout failed: {:#}", endpoint.role(), error);
    }
}

fn summarize(scheduler: &Scheduler, src_max_requests: u32, dst_max_requests: u32) -> Summary {
    Summary {
        src_max_requests,
        dst_max_requests,
        ..scheduler.summary()
    }
}

/// Copy all blocks from `src` to `dst`.
///
/// Remote endpoints are logged out of after a successful transfer; after a failure they are left
/// as they are.
#[instrument(skip(prog_track, src, dst))]
pub async fn transfer<S: BlockTarget, D: BlockTarget>(
    prog_track: &'static progress::Progress,
    src: Endpoint<S>,
    dst: Endpoint<D>,
    config: &TransferConfig,
) -> Result<Summary, Error> {
    let direction = Direction::of(src.is_local(), dst.is_local())
        .map_err(|error| Error::new(error, Summary::default()))?;
    info!("transfer: {}", direction);
    match (src, dst) {
        (Endpoint::Local(src), Endpoint::Remote(dst)) => {
            local_to_remote(prog_track, &src, dst, config).await
        }
        (Endpoint::Remote(src), Endpoint::Local(dst)) => {
            remote_to_local(prog_track, src, &dst, config).await
        }
        (Endpoint::Remote(src), Endpoint::Remote(dst)) => {
            remote_to_remote(prog_track, src, dst, config).await
        }
        (Endpoint::Local(_), Endpoint::Local(_)) => Err(Error::new(
            anyhow!("cannot copy between two local files"),
            Summary::default(),
        )),
    }
}

#[instrument(skip(prog_track, dst, config))]
async fn local_to_remote<D: BlockTarget>(
    prog_track: &'static progress::Progress,
    src: &LocalPath,
    mut dst: RemoteEndpoint<D>,
    config: &TransferConfig,
) -> Result<Summary, Error> {
    let capacity = dst.block_count();
    prog_track.blocks_total.add(capacity);
    let mut scheduler = Scheduler::new(
        dst.max_requests() as usize,
        dst.block_size() as usize,
        capacity,
        *config,
        prog_track,
    );
    if config.dry_run {
        logout(&mut dst).await;
        return Ok(summarize(&scheduler, 0, dst.max_requests()));
    }
    let source = match LocalSource::open(src) {
        Ok(source) => source,
        Err(error) => {
            return Err(Error::new(
                anyhow!(error).context(format!("cannot open {src} for reading")),
                summarize(&scheduler, 0, dst.max_requests()),
            ));
        }
    };
    // one read per chunk plus the look-ahead past the last block
    let mut reader = LocalReader::spawn(source, scheduler.pool().len() + 1);
    let result = local_to_remote_loop(&mut scheduler, &mut reader, &mut dst).await;
    let summary = summarize(&scheduler, 0, dst.max_requests());
    match result {
        Ok(()) => {
            logout(&mut dst).await;
            info!("{} blocks copied to {}", summary.blocks_written, dst.name());
            Ok(summary)
        }
        Err(error) => Err(Error::new(error, summary)),
    }
}

async fn local_to_remote_loop<D: BlockTarget>(
    scheduler: &mut Scheduler,
    reader: &mut LocalReader,
    dst: &mut RemoteEndpoint<D>,
) -> anyhow::Result<()> {
    let block_size = dst.block_size() as usize;
    let capacity = dst.block_count();
    let mut eof = false;
    let mut overflow = false;
    let mut looked_ahead = false;
    loop {
        scheduler.restart_requests(None::<&mut RemoteEndpoint<D>>, Some(&mut *dst))?;
        scheduler.start_write_requests(dst)?;
        while !eof && !looked_ahead {
            if scheduler.has_unread_blocks() {
                let Some((chunk, buf)) = scheduler.start_local_read() else {
                    break;
                };
                reader.request(Some(chunk), buf, block_size)?;
            } else {
                // the destination is full, find out whether anything was left out
                reader.request(None, BytesMut::with_capacity(1), 1)?;
                looked_ahead = true;
            }
        }
        scheduler.shrink_pool(dst.max_requests());
        if (eof || overflow) && reader.pending() == 0 && scheduler.is_idle() {
            break;
        }
        let deadline = scheduler.next_retry_deadline();
        let wake = tokio::select! {
            event = dst.next_event() => Wake::Destination(event?),
            read = reader.next_read(), if reader.pending() > 0 => Wake::LocalRead(read),
            () = sleep_until_retry(deadline) => Wake::Retry,
        };
        match wake {
            Wake::LocalRead(read) => {
                let read = read.with_context(|| format!("failed reading {}", reader.name()))?;
                match read.chunk {
                    None => {
                        eof = read.filled == 0;
                        overflow = read.filled > 0;
                    }
                    Some(chunk) if read.filled == 0 => {
                        eof = true;
                        scheduler.release(chunk);
                    }
                    Some(chunk) => {
                        let block = scheduler.accept_block(chunk, read.data);
                        if read.filled < block_size {
                            eof = true;
                            // the buffer is zeroed already
                            warn!("source block {} padded with zeroes", block);
                        }
                        scheduler.start_write_requests(dst)?;
                    }
                }
            }
            Wake::Destination(EndpointEvent::Completed { chunk, outcome }) => {
                scheduler.complete_write(chunk, outcome);
            }
            Wake::Destination(EndpointEvent::Disconnected(reason)) => {
                scheduler.connection_lost(dst, &reason, 0).await?;
            }
            Wake::Source(_) | Wake::LocalWritten(_) | Wake::Retry => {}
        }
    }
    if overflow {
        return Err(anyhow!(
            "destination {} is too small: {} blocks ({}) written, the source has more data",
            dst.name(),
            capacity,
            bytesize::ByteSize(capacity * block_size as u64)
        ));
    }
    Ok(())
}

#[instrument(skip(prog_track, src, config))]
async fn remote_to_local<S: BlockTarget>(
    prog_track: &'static progress::Progress,
    mut src: RemoteEndpoint<S>,
    dst: &LocalPath,
    config: &TransferConfig,
) -> Result<Summary, Error> {
    if config.dry_run {
        logout(&mut src).await;
        return Ok(Summary {
            src_max_requests: src.max_requests(),
            ..Default::default()
        });
    }
    let expected_len = u64::from(src.block_size()) * src.block_count();
    let sink = match LocalSink::open(dst, config.overwrite, expected_len) {
        Ok(sink) => sink,
        Err(error) => {
            return Err(Error::new(
                anyhow!(error).context(format!("cannot open {dst} for writing")),
                Summary {
                    src_max_requests: src.max_requests(),
                    ..Default::default()
                },
            ));
        }
    };
    let name = sink.name().to_string();
    let mut writer = SinkWriter::new(sink);
    let result = copy_to_sink(prog_track, src, &mut writer, config).await;
    result.map_err(|error| {
        let source = error.source.context(format!("copy to {name} failed"));
        Error::new(source, error.summary)
    })
}

/// Read every block of `src` and write it out through `writer`.
async fn copy_to_sink<S: BlockTarget, K: BlockSink + Send + 'static>(
    prog_track: &'static progress::Progress,
    mut src: RemoteEndpoint<S>,
    writer: &mut SinkWriter<K>,
    config: &TransferConfig,
) -> Result<Summary, Error> {
    prog_track.blocks_total.add(src.block_count());
    let mut scheduler = Scheduler::new(
        src.max_requests() as usize,
        src.block_size() as usize,
        src.block_count(),
        *config,
        prog_track,
    );
    let mut batcher = OutputBatcher::new(src.block_size(), config.min_batch, config.max_batch);
    let result = copy_to_sink_loop(&mut scheduler, &mut src, writer, &mut batcher).await;
    let summary = summarize(&scheduler, src.max_requests(), 0);
    match result {
        Ok(()) => {
            logout(&mut src).await;
            info!("{} blocks copied from {}", summary.blocks_written, src.name());
            Ok(summary)
        }
        Err(error) => Err(Error::new(error, summary)),
    }
}

async fn copy_to_sink_loop<S: BlockTarget, K: BlockSink + Send + 'static>(
    scheduler: &mut Scheduler,
    src: &mut RemoteEndpoint<S>,
    writer: &mut SinkWriter<K>,
    batcher: &mut OutputBatcher,
) -> anyhow::Result<()> {
    let block_size = u64::from(src.block_size());
    loop {
        scheduler.restart_requests(Some(&mut *src), None::<&mut RemoteEndpoint<S>>)?;
        scheduler.start_read_requests(src)?;
        let more_input_expected = scheduler.has_unread_blocks() || !scheduler.is_idle();
        if !writer.is_busy() {
            let runs = batcher.take_runs(writer.is_seekable(), more_input_expected);
            if !runs.is_empty() {
                writer.start(runs)?;
            }
        }
        if !more_input_expected && !writer.is_busy() {
            if !batcher.is_empty() {
                return Err(anyhow!(
                    "{} blocks from {} couldn't be written",
                    batcher.len(),
                    batcher.next_contiguous_block()
                ));
            }
            break;
        }
        scheduler.shrink_pool(src.max_requests());
        let deadline = scheduler.next_retry_deadline();
        let wake = tokio::select! {
            event = src.next_event() => Wake::Source(event?),
            written = writer.finished(), if writer.is_busy() => Wake::LocalWritten(written),
            () = sleep_until_retry(deadline) => Wake::Retry,
        };
        match wake {
            Wake::Source(EndpointEvent::Completed { chunk, outcome }) => {
                if let Some((block, data)) = scheduler.complete_read(chunk, outcome) {
                    batcher.enqueue(block, data);
                    scheduler.release(chunk);
                }
            }
            Wake::Source(EndpointEvent::Disconnected(reason)) => {
                scheduler.connection_lost(src, &reason, 0).await?;
            }
            Wake::LocalWritten(written) => {
                for run in written.context("writing output failed")? {
                    let blocks = run.end - run.start;
                    scheduler.record_written(run.start, blocks, blocks * block_size);
                }
            }
            Wake::Destination(_) | Wake::LocalRead(_) | Wake::Retry => {}
        }
    }
    Ok(())
}

#[instrument(skip(prog_track, src, dst, config))]
async fn remote_to_remote<S: BlockTarget, D: BlockTarget>(
    prog_track: &'static progress::Progress,
    mut src: RemoteEndpoint<S>,
    mut dst: RemoteEndpoint<D>,
    config: &TransferConfig,
) -> Result<Summary, Error> {
    let mut summary = Summary {
        src_max_requests: src.max_requests(),
        dst_max_requests: dst.max_requests(),
        ..Default::default()
    };
    // blocks can't be split or merged
    if dst.block_size() > src.block_size() {
        return Err(Error::new(
            anyhow!(
                "source target's blocksize ({}) must be at least as large as the destination's ({})",
                src.block_size(),
                dst.block_size()
            ),
            summary,
        ));
    }
    if src.block_size() % dst.block_size() != 0 {
        return Err(Error::new(
            anyhow!(
                "source target's blocksize ({}) must be a multiple of the destination's ({})",
                src.block_size(),
                dst.block_size()
            ),
            summary,
        ));
    }
    let ratio = u64::from(src.block_size() / dst.block_size());
    let fitting = dst.block_count() / ratio;
    let total = src.block_count().min(fitting);
    if config.dry_run {
        logout(&mut src).await;
        logout(&mut dst).await;
        return Ok(summary);
    }
    prog_track.blocks_total.add(total);
    let mut scheduler = Scheduler::new(
        (src.max_requests() + dst.max_requests()) as usize,
        src.block_size() as usize,
        total,
        *config,
        prog_track,
    )
    .with_lba_ratio(ratio);
    let result = remote_to_remote_loop(&mut scheduler, &mut src, &mut dst).await;
    summary = summarize(&scheduler, src.max_requests(), dst.max_requests());
    if let Err(error) = result {
        return Err(Error::new(error, summary));
    }
    if total < src.block_count() {
        return Err(Error::new(
            anyhow!(
                "destination {} is too small: {} of {} source blocks ({}) written",
                dst.name(),
                total,
                src.block_count(),
                bytesize::ByteSize(summary.bytes_written)
            ),
            summary,
        ));
    }
    logout(&mut src).await;
    logout(&mut dst).await;
    info!(
        "{} blocks copied from {} to {}",
        summary.blocks_written,
        src.name(),
        dst.name()
    );
    Ok(summary)
}

async fn remote_to_remote_loop<S: BlockTarget, D: BlockTarget>(
    scheduler: &mut Scheduler,
    src: &mut RemoteEndpoint<S>,
    dst: &mut RemoteEndpoint<D>,
) -> anyhow::Result<()> {
    loop {
        scheduler.restart_requests(Some(&mut *src), Some(&mut *dst))?;
        scheduler.start_write_requests(dst)?;
        scheduler.start_read_requests(src)?;
        if !scheduler.has_unread_blocks() && scheduler.is_idle() {
            break;
        }
        scheduler.shrink_pool(src.max_requests() + dst.max_requests());
        let deadline = scheduler.next_retry_deadline();
        let wake = tokio::select! {
            event = src.next_event() => Wake::Source(event?),
            event = dst.next_event() => Wake::Destination(event?),
            () = sleep_until_retry(deadline) => Wake::Retry,
        };
        match wake {
            Wake::Source(EndpointEvent::Completed { chunk, outcome }) => {
                if scheduler.complete_read(chunk, outcome).is_some() {
                    scheduler.queue_write(chunk);
                }
            }
            Wake::Source(EndpointEvent::Disconnected(reason)) => {
                let other = dst.max_requests();
                scheduler.connection_lost(src, &reason, other).await?;
            }
            Wake::Destination(EndpointEvent::Completed { chunk, outcome }) => {
                scheduler.complete_write(chunk, outcome);
            }
            Wake::Destination(EndpointEvent::Disconnected(reason)) => {
                let other = src.max_requests();
                scheduler.connection_lost(dst, &reason, other).await?;
            }
            Wake::LocalRead(_) | Wake::LocalWritten(_) | Wake::Retry => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Role;
    use crate::testutils::{pattern, CompletionOrder, MemoryTarget, Op};
    use bytes::Bytes;
    use std::collections::VecDeque;
    use std::io::Write;
    use std::sync::{Arc, Condvar, Mutex};
    use std::time::Duration;
    use tracing_test::traced_test;

    static PROGRESS: std::sync::LazyLock<progress::Progress> =
        std::sync::LazyLock::new(progress::Progress::new);

    fn config(max_src_requests: u32, max_dst_requests: u32) -> TransferConfig {
        TransferConfig {
            max_src_requests,
            max_dst_requests,
            ..Default::default()
        }
    }

    fn remote(role: Role, target: MemoryTarget, max_requests: u32) -> Endpoint<MemoryTarget> {
        Endpoint::Remote(RemoteEndpoint::new(role, target, max_requests))
    }

    /// Non-seekable sink which checks that output is strictly sequential.
    #[derive(Debug, Default)]
    struct PipeSink {
        data: Vec<u8>,
        runs: Vec<(u64, usize)>,
    }

    impl BlockSink for PipeSink {
        fn is_seekable(&self) -> bool {
            false
        }

        fn write_run(&mut self, offset: u64, run: &[Bytes]) -> std::io::Result<()> {
            assert_eq!(offset, self.data.len() as u64);
            for data in run {
                self.data.extend_from_slice(data);
            }
            self.runs.push((offset, run.len()));
            Ok(())
        }
    }

    /// Pipe-like sink whose writes block until the test opens the gate.
    #[derive(Debug)]
    struct GatedSink {
        gate: Arc<(Mutex<bool>, Condvar)>,
        inner: PipeSink,
    }

    impl BlockSink for GatedSink {
        fn is_seekable(&self) -> bool {
            false
        }

        fn write_run(&mut self, offset: u64, run: &[Bytes]) -> std::io::Result<()> {
            let (open, opened) = &*self.gate;
            let mut open = open.lock().unwrap();
            while !*open {
                open = opened.wait(open).unwrap();
            }
            self.inner.write_run(offset, run)
        }
    }

    async fn wait_until(what: &str, done: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting until {what}"));
    }

    #[tokio::test]
    #[traced_test]
    async fn remote_to_seekable_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        let target = MemoryTarget::with_pattern("src", 512, 10).order(CompletionOrder::Lifo);
        let journal = target.journal_handle();
        let summary = transfer(
            &PROGRESS,
            remote(Role::Source, target, 4),
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some(path.clone()))),
            &config(4, 4),
        )
        .await
        .unwrap();
        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), 5120);
        assert_eq!(written, pattern(512, 10));
        assert_eq!(summary.blocks_written, 10);
        assert_eq!(summary.bytes_written, 5120);
        let journal = journal.lock().unwrap();
        assert!(journal.max_in_flight <= 4);
        assert!(journal.logged_out);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn connection_error_reconnects_and_degrades() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        let target = MemoryTarget::with_pattern("src", 512, 10).disconnect_after(3);
        let journal = target.journal_handle();
        let summary = transfer(
            &PROGRESS,
            remote(Role::Source, target, 4),
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some(path.clone()))),
            &config(4, 4),
        )
        .await
        .unwrap();
        assert_eq!(journal.lock().unwrap().reconnects, 1);
        assert_eq!(summary.reconnects, 1);
        assert_eq!(summary.src_max_requests, 2);
        assert_eq!(std::fs::read(&path).unwrap(), pattern(512, 10));
        assert!(logs_contain("number of maximal outstanding requests reduced to 2"));
        assert!(logs_contain("re-reading source block"));
    }

    #[tokio::test]
    #[traced_test]
    async fn local_source_overflowing_destination() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("input");
        let input: Vec<u8> = (0..3000u32).map(|i| (i % 253) as u8).collect();
        std::fs::write(&path, &input).unwrap();
        let target = MemoryTarget::blank("dst", 512, 4);
        let disk = target.disk();
        let error = transfer(
            &PROGRESS,
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some(path))),
            remote(Role::Destination, target, 4),
            &config(4, 4),
        )
        .await
        .unwrap_err();
        assert!(format!("{error}").contains("too small"));
        assert_eq!(error.summary.bytes_written, 2048);
        assert_eq!(*disk.lock().unwrap(), input[..2048].to_vec());
    }

    #[tokio::test]
    #[traced_test]
    async fn local_source_short_block_is_padded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("input");
        std::fs::write(&path, vec![0xaau8; 1000]).unwrap();
        let target = MemoryTarget::new("dst", 512, vec![0xff; 2048]);
        let disk = target.disk();
        let journal = target.journal_handle();
        let summary = transfer(
            &PROGRESS,
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some(path))),
            remote(Role::Destination, target, 2),
            &config(4, 2),
        )
        .await
        .unwrap();
        assert_eq!(summary.blocks_written, 2);
        assert_eq!(summary.blocks_read, 2);
        assert_eq!(summary.bytes_read, 1024);
        let disk = disk.lock().unwrap();
        assert!(disk[..1000].iter().all(|b| *b == 0xaa));
        assert!(disk[1000..1024].iter().all(|b| *b == 0));
        assert!(disk[1024..].iter().all(|b| *b == 0xff));
        assert!(journal.lock().unwrap().logged_out);
        assert!(logs_contain("source block 1 padded with zeroes"));
    }

    #[tokio::test]
    async fn pipe_output_stays_in_block_order() {
        let target = MemoryTarget::with_pattern("src", 512, 3)
            .order(CompletionOrder::Scripted(VecDeque::from([0, 2, 1])));
        let src = RemoteEndpoint::new(Role::Source, target, 3);
        let mut writer = SinkWriter::new(PipeSink::default());
        let config = TransferConfig {
            min_batch: 1,
            ..config(3, 3)
        };
        let summary = copy_to_sink(&PROGRESS, src, &mut writer, &config)
            .await
            .unwrap();
        let sink = writer.into_inner().unwrap();
        // block 2 waited for block 1, then both went out in one write
        assert_eq!(sink.runs, vec![(0, 1), (512, 2)]);
        assert_eq!(sink.data, pattern(512, 3));
        assert_eq!(summary.blocks_written, 3);
    }

    #[tokio::test]
    #[traced_test]
    async fn stalled_local_source_does_not_hold_back_retries() {
        let input: Vec<u8> = (0..1536u32).map(|i| (i % 251) as u8).collect();
        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        let mut feed = std::fs::File::from(write_end);
        // a block and a half, then the writer goes quiet
        feed.write_all(&input[..768]).unwrap();
        let target = MemoryTarget::blank("dst", 512, 4).fail(Op::Write, 0, 1);
        let disk = target.disk();
        let journal = target.journal_handle();
        let mut dst = RemoteEndpoint::new(Role::Destination, target, 2);
        let config = TransferConfig {
            retry_delay: Duration::from_millis(20),
            ..config(2, 2)
        };
        let mut scheduler = Scheduler::new(2, 512, dst.block_count(), config, &PROGRESS);
        let source = LocalSource::from_file("pipe".into(), std::fs::File::from(read_end));
        let mut reader = LocalReader::spawn(source, 3);
        let tail = input[768..].to_vec();
        let resume = async move {
            // block 1 is still incomplete here
            wait_until("block 0 was rewritten", || {
                !journal.lock().unwrap().writes.is_empty()
            })
            .await;
            assert_eq!(journal.lock().unwrap().writes, vec![0]);
            feed.write_all(&tail).unwrap();
        };
        let (result, ()) = tokio::join!(
            local_to_remote_loop(&mut scheduler, &mut reader, &mut dst),
            resume
        );
        result.unwrap();
        assert!(logs_contain("rewriting source block 0"));
        let summary = scheduler.summary();
        assert_eq!(summary.blocks_written, 3);
        assert_eq!(summary.retries, 1);
        let disk = disk.lock().unwrap();
        assert_eq!(disk[..1536], input[..]);
        assert!(disk[1536..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn stalled_output_does_not_hold_back_reads() {
        let target = MemoryTarget::with_pattern("src", 512, 6).fail(Op::Read, 3, 1);
        let journal = target.journal_handle();
        let src = RemoteEndpoint::new(Role::Source, target, 2);
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let mut writer = SinkWriter::new(GatedSink {
            gate: gate.clone(),
            inner: PipeSink::default(),
        });
        let config = TransferConfig {
            min_batch: 1,
            retry_delay: Duration::from_millis(20),
            ..config(2, 2)
        };
        let release = async {
            // the first write is stuck behind the gate the whole time
            wait_until("every block was read", || {
                journal.lock().unwrap().reads.len() == 6
            })
            .await;
            let (open, opened) = &*gate;
            *open.lock().unwrap() = true;
            opened.notify_all();
        };
        let (summary, ()) = tokio::join!(
            copy_to_sink(&PROGRESS, src, &mut writer, &config),
            release
        );
        let summary = summary.unwrap();
        assert_eq!(summary.retries, 1);
        assert_eq!(summary.blocks_written, 6);
        let sink = writer.into_inner().unwrap();
        assert_eq!(sink.inner.data, pattern(512, 6));
        assert_eq!(sink.inner.runs[0], (0, 1));
    }

    #[tokio::test]
    async fn remote_to_remote_maps_block_addresses() {
        let src_target = MemoryTarget::with_pattern("src", 1024, 6).order(CompletionOrder::Lifo);
        let dst_target = MemoryTarget::blank("dst", 512, 12).order(CompletionOrder::Lifo);
        let src_journal = src_target.journal_handle();
        let dst_journal = dst_target.journal_handle();
        let disk = dst_target.disk();
        let summary = transfer(
            &PROGRESS,
            remote(Role::Source, src_target, 3),
            remote(Role::Destination, dst_target, 2),
            &config(3, 2),
        )
        .await
        .unwrap();
        assert_eq!(*disk.lock().unwrap(), pattern(1024, 6));
        assert_eq!(summary.blocks_written, 6);
        assert!(src_journal.lock().unwrap().max_in_flight <= 3);
        assert!(dst_journal.lock().unwrap().max_in_flight <= 2);
        let mut writes = dst_journal.lock().unwrap().writes.clone();
        writes.sort_unstable();
        assert_eq!(writes, vec![0, 2, 4, 6, 8, 10]);
    }

    #[tokio::test]
    async fn remote_to_remote_rejects_larger_destination_blocks() {
        let error = transfer(
            &PROGRESS,
            remote(Role::Source, MemoryTarget::with_pattern("src", 512, 4), 2),
            remote(Role::Destination, MemoryTarget::blank("dst", 1024, 4), 2),
            &config(2, 2),
        )
        .await
        .unwrap_err();
        assert!(format!("{error}").contains("at least as large"));
    }

    #[tokio::test]
    async fn remote_to_remote_copies_what_fits() {
        let dst_target = MemoryTarget::blank("dst", 512, 3);
        let disk = dst_target.disk();
        let dst_journal = dst_target.journal_handle();
        let error = transfer(
            &PROGRESS,
            remote(Role::Source, MemoryTarget::with_pattern("src", 512, 5), 2),
            remote(Role::Destination, dst_target, 2),
            &config(2, 2),
        )
        .await
        .unwrap_err();
        assert!(format!("{error}").contains("too small"));
        assert_eq!(error.summary.blocks_written, 3);
        assert_eq!(*disk.lock().unwrap(), pattern(512, 5)[..1536].to_vec());
        assert!(!dst_journal.lock().unwrap().logged_out);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn failed_requests_are_retried_until_they_succeed() {
        let src_target = MemoryTarget::with_pattern("src", 512, 8).fail(Op::Read, 5, 2);
        let dst_target = MemoryTarget::blank("dst", 512, 8).fail(Op::Write, 2, 3);
        let disk = dst_target.disk();
        let summary = transfer(
            &PROGRESS,
            remote(Role::Source, src_target, 2),
            remote(Role::Destination, dst_target, 2),
            &config(2, 2),
        )
        .await
        .unwrap();
        assert_eq!(summary.retries, 5);
        assert_eq!(summary.blocks_written, 8);
        assert_eq!(*disk.lock().unwrap(), pattern(512, 8));
        assert!(logs_contain("rewriting source block 2"));
    }

    #[tokio::test]
    async fn fatal_error_aborts_without_logout() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        let target = MemoryTarget::with_pattern("src", 512, 8).fatal_at(2);
        let journal = target.journal_handle();
        let error = transfer(
            &PROGRESS,
            remote(Role::Source, target, 2),
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some(path))),
            &config(2, 2),
        )
        .await
        .unwrap_err();
        assert!(format!("{error}").contains("poisoned"));
        assert!(error.summary.blocks_read >= 2);
        assert!(!journal.lock().unwrap().logged_out);
    }

    #[tokio::test]
    async fn dry_run_moves_no_data() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("disk.img");
        let target = MemoryTarget::with_pattern("src", 512, 8);
        let journal = target.journal_handle();
        let config = TransferConfig {
            dry_run: true,
            ..config(4, 4)
        };
        let summary = transfer(
            &PROGRESS,
            remote(Role::Source, target, 4),
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some(path.clone()))),
            &config,
        )
        .await
        .unwrap();
        assert_eq!(summary.blocks_written, 0);
        assert_eq!(summary.src_max_requests, 4);
        assert!(!path.exists());
        assert!(journal.lock().unwrap().reads.is_empty());
    }

    #[tokio::test]
    async fn two_local_files_are_rejected() {
        let error = transfer(
            &PROGRESS,
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some("a".into()))),
            Endpoint::<MemoryTarget>::Local(LocalPath::new(Some("b".into()))),
            &config(1, 1),
        )
        .await
        .unwrap_err();
        assert!(format!("{error}").contains("remote"));
    }

    #[test]
    fn direction_follows_endpoint_kinds() {
        assert_eq!(Direction::of(true, false).unwrap(), Direction::LocalToRemote);
        assert_eq!(Direction::of(false, true).unwrap(), Direction::RemoteToLocal);
        assert_eq!(Direction::of(false, false).unwrap(), Direction::RemoteToRemote);
        assert!(Direction::of(true, true).is_err());
    }

    #[test]
    fn summaries_add_up() {
        let a = Summary {
            blocks_written: 2,
            bytes_written: 1024,
            retries: 1,
            src_max_requests: 4,
            ..Default::default()
        };
        let b = Summary {
            blocks_written: 3,
            bytes_written: 1536,
            reconnects: 1,
            src_max_requests: 2,
            ..Default::default()
        };
        let sum = a + b;
        assert_eq!(sum.blocks_written, 5);
        assert_eq!(sum.bytes_read, 0);
        assert_eq!(sum.bytes_written, 2560);
        assert_eq!(sum.retries, 1);
        assert_eq!(sum.reconnects, 1);
        assert!(format!("{sum}").contains("reconnects: 1"));
    }
}
