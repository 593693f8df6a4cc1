//! Common engine for the `rdd` block copy tool
//!
//! This crate moves the blocks of one disk image to another, where at least one side is a remote
//! block device reached through a [`target::BlockTarget`] implementation (see the `remote` crate)
//! and the other side may be a local file, a pipe or another remote device.
//!
//! # Architecture
//!
//! - [`endpoint`] wraps each side of the transfer: a remote target with its request ceiling and
//!   in-flight table, or a local file read on a task of its own.
//! - [`chunk`] is the fixed pool of chunks every request travels in. Each chunk owns a block-sized
//!   buffer which reads fill in place and which is reused once the block has been written.
//! - [`scheduler`] issues reads and writes up to each endpoint's ceiling, parks failed requests
//!   for the retry delay and recovers from broken connections by reconnecting with a lower
//!   ceiling.
//! - [`batcher`] gathers blocks read out of order into long contiguous writes to a local
//!   destination, performed on the blocking thread pool.
//! - [`transfer`] runs one of three loops (local to remote, remote to local, remote to remote)
//!   on a single-threaded tokio runtime. Local reads and writes complete as events of the loop
//!   like remote completions, so a slow local file never delays a remote request or a retry.
//!
//! # Error Handling
//!
//! Transient request failures never leave the scheduler. Connection errors are handled by the
//! endpoint that saw them. Everything else ends the transfer with a [`transfer::Error`], which
//! carries the [`transfer::Summary`] of whatever was copied up to that point.
//!
//! # Logging
//!
//! All logging goes through `tracing` to stderr, as stdout may be the destination of the copy.
//! [`run`] installs the subscriber according to [`OutputConfig`] and [`TracingConfig`].

use std::future::Future;
use std::io::IsTerminal;

use tracing_subscriber::prelude::*;

pub mod batcher;
pub mod chunk;
pub mod config;
pub mod endpoint;
pub mod progress;
pub mod scheduler;
pub mod target;
pub mod transfer;

#[cfg(test)]
pub mod testutils;

pub use config::{OutputConfig, TransferConfig};

/// Process-wide transfer counters, read by the progress reporter thread.
pub static PROGRESS: std::sync::LazyLock<progress::Progress> =
    std::sync::LazyLock::new(progress::Progress::new);

#[must_use]
pub fn get_progress() -> &'static progress::Progress {
    &PROGRESS
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProgressType {
    #[default]
    #[value(name = "auto", alias = "Auto")]
    Auto,
    #[value(name = "ProgressBar", alias = "progress-bar")]
    ProgressBar,
    #[value(name = "TextUpdates", alias = "text-updates")]
    TextUpdates,
}

#[derive(Debug, Clone, Default)]
pub struct ProgressSettings {
    pub progress_type: ProgressType,
    /// Human readable delay between updates, e.g. "200ms" or "10s".
    pub progress_delay: Option<String>,
}

/// Extra log sinks.
#[derive(Debug, Clone, Default)]
pub struct TracingConfig {
    /// Also write DEBUG level logs to this file, independently of the verbosity.
    pub debug_log_file: Option<std::path::PathBuf>,
}

const PROGRESS_BAR_DELAY: std::time::Duration = std::time::Duration::from_millis(200);
const TEXT_UPDATES_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

struct ProgressTracker {
    stop: std::sync::mpsc::Sender<()>,
    handle: std::thread::JoinHandle<()>,
}

impl ProgressTracker {
    fn start(settings: &ProgressSettings) -> anyhow::Result<Self> {
        let progress_type = match settings.progress_type {
            ProgressType::Auto if std::io::stderr().is_terminal() => ProgressType::ProgressBar,
            ProgressType::Auto => ProgressType::TextUpdates,
            other => other,
        };
        let delay = match &settings.progress_delay {
            Some(delay) => humantime::parse_duration(delay)?,
            None if progress_type == ProgressType::ProgressBar => PROGRESS_BAR_DELAY,
            None => TEXT_UPDATES_DELAY,
        };
        let (stop, stopped) = std::sync::mpsc::channel();
        let handle = std::thread::Builder::new()
            .name("progress".to_string())
            .spawn(move || {
                if progress_type == ProgressType::ProgressBar {
                    show_progress_bar(&stopped, delay);
                } else {
                    show_text_updates(&stopped, delay);
                }
            })?;
        Ok(Self { stop, handle })
    }

    fn finish(self) {
        // the thread may be gone already
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            tracing::error!("progress thread panicked");
        }
    }
}

fn show_progress_bar(stopped: &std::sync::mpsc::Receiver<()>, delay: std::time::Duration) {
    let prog_track = get_progress();
    let bar = indicatif::ProgressBar::new(prog_track.blocks_total.get());
    let style = indicatif::ProgressStyle::with_template(
        "{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len} blocks ({per_sec}) {msg}",
    )
    .unwrap_or_else(|_| indicatif::ProgressStyle::default_bar());
    bar.set_style(style);
    loop {
        let status = prog_track.status();
        bar.set_length(prog_track.blocks_total.get().max(status.written));
        bar.set_position(status.written);
        bar.set_message(format!(
            "{} copied, {} in flight, {} retries, {} reconnects",
            bytesize::ByteSize(prog_track.bytes_written.get()),
            status.read - status.written,
            prog_track.retries.get(),
            prog_track.reconnects.get(),
        ));
        if stopped.recv_timeout(delay) != Err(std::sync::mpsc::RecvTimeoutError::Timeout) {
            break;
        }
    }
    bar.finish_and_clear();
}

fn show_text_updates(stopped: &std::sync::mpsc::Receiver<()>, delay: std::time::Duration) {
    let mut printer = progress::ProgressPrinter::new(get_progress());
    loop {
        if stopped.recv_timeout(delay) != Err(std::sync::mpsc::RecvTimeoutError::Timeout) {
            break;
        }
        match printer.print() {
            Ok(text) => eprintln!("{text}"),
            Err(error) => tracing::error!("failed to print progress: {:#}", error),
        }
    }
}

fn log_level(output: &OutputConfig) -> &'static str {
    match output.verbose {
        0 if output.quiet => "off",
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn install_tracing(output: &OutputConfig, tracing_config: &TracingConfig) -> anyhow::Result<()> {
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(tracing_subscriber::EnvFilter::new(log_level(output)));
    let file_layer = match &tracing_config.debug_log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(std::sync::Mutex::new(file))
                    .with_filter(tracing_subscriber::EnvFilter::new("debug")),
            )
        }
        None => None,
    };
    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()?;
    Ok(())
}

/// Run a transfer on a fresh single-threaded runtime.
///
/// Installs logging, optionally shows progress while `func` runs, and reports the outcome on
/// stderr. Returns `None` if the transfer (or the setup) failed; the caller is expected to exit
/// with a non-zero code in that case.
pub fn run<Fut>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    tracing_config: TracingConfig,
    func: impl FnOnce() -> Fut,
) -> Option<transfer::Summary>
where
    Fut: Future<Output = Result<transfer::Summary, transfer::Error>>,
{
    if let Err(error) = install_tracing(&output, &tracing_config) {
        eprintln!("failed to initialize logging: {error:#}");
        return None;
    }
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to create the runtime: {:#}", error);
            return None;
        }
    };
    let tracker = match progress.as_ref().map(ProgressTracker::start).transpose() {
        Ok(tracker) => tracker,
        Err(error) => {
            tracing::error!("failed to start progress reporting: {:#}", error);
            return None;
        }
    };
    let res = runtime.block_on(func());
    if let Some(tracker) = tracker {
        tracker.finish();
    }
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                eprintln!("{summary}");
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{}", error);
            if output.print_summary || output.verbose > 0 {
                eprintln!("{}", error.summary);
            }
            None
        }
    }
}
