use anyhow::{anyhow, Context};
use clap::Parser;
use common::config::{
    TransferConfig, DEFAULT_DEGRADATION_PERCENT, DEFAULT_MAX_BATCH, DEFAULT_MAX_REQUESTS,
    DEFAULT_MIN_BATCH,
};
use common::endpoint::{Endpoint, LocalPath, RemoteEndpoint, Role};
use common::transfer::{Direction, Error, Summary};
use tracing::instrument;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "rdd",
    version,
    about = "Copy disk images from, to and between remote block devices",
    long_about = "`rdd` copies a whole block device. At least one side is a remote target
(nbd://host[:port]/export); the other may be a local file, a pipe or another remote target.
Failed requests are retried, broken connections are re-established with fewer outstanding
requests.

EXAMPLES:
    # Dump an export into a local image
    rdd -s nbd://storage:10809/disk0 -D disk0.img

    # Stream an export to stdout
    rdd -s nbd://storage/disk0 | gzip > disk0.img.gz

    # Restore an image
    rdd -S disk0.img -d nbd://storage/disk0

    # Clone one export to another
    rdd -s nbd://old/disk0 -d nbd://new/disk0"
)]
struct Args {
    // Source
    /// Remote source target
    #[arg(short = 's', long = "source", value_name = "URL", conflicts_with = "source_file", help_heading = "Source")]
    source: Option<String>,

    /// Local source file, "-" for standard input (the default without --source)
    #[arg(short = 'S', long = "source-file", value_name = "PATH", help_heading = "Source")]
    source_file: Option<std::path::PathBuf>,

    /// Report every N-th source block read, 0 means never
    #[arg(short = 'p', long = "read-progress", value_name = "N", default_value = "0", help_heading = "Source")]
    read_progress: u64,

    /// Maximum number of outstanding reads from the source target
    #[arg(short = 'm', long = "max-src-requests", value_name = "N", default_value_t = DEFAULT_MAX_REQUESTS, help_heading = "Source")]
    max_src_requests: u32,

    // Destination
    /// Remote destination target
    #[arg(short = 'd', long = "destination", value_name = "URL", conflicts_with = "destination_file", help_heading = "Destination")]
    destination: Option<String>,

    /// Local destination file, "-" for standard output (the default without --destination)
    #[arg(short = 'D', long = "destination-file", value_name = "PATH", help_heading = "Destination")]
    destination_file: Option<std::path::PathBuf>,

    /// Overwrite an existing local destination file
    #[arg(short = 'O', long = "overwrite", help_heading = "Destination")]
    overwrite: bool,

    /// Report every N-th source block written, 0 means never
    #[arg(short = 'P', long = "write-progress", value_name = "N", default_value = "0", help_heading = "Destination")]
    write_progress: u64,

    /// Maximum number of outstanding writes to the destination target
    #[arg(short = 'M', long = "max-dst-requests", value_name = "N", default_value_t = DEFAULT_MAX_REQUESTS, help_heading = "Destination")]
    max_dst_requests: u32,

    // Error recovery
    /// Milliseconds to wait before a failed request is retried
    #[arg(short = 'r', long = "retry-delay", value_name = "MS", default_value = "3000", help_heading = "Error recovery")]
    retry_delay: u64,

    /// After a connection error reduce the maximum outstanding requests to this percentage
    ///
    /// 100 keeps the maximum unchanged.
    #[arg(short = 'R', long = "degradation", value_name = "PERCENT", default_value_t = DEFAULT_DEGRADATION_PERCENT, help_heading = "Error recovery")]
    degradation: u32,

    // Output batching
    /// Minimum number of contiguous blocks written to a local destination at once
    #[arg(short = 'b', long = "min-batch", value_name = "N", default_value_t = DEFAULT_MIN_BATCH, help_heading = "Output batching")]
    min_batch: usize,

    /// Number of contiguous blocks which are always written to a local destination at once
    #[arg(short = 'B', long = "max-batch", value_name = "N", default_value_t = DEFAULT_MAX_BATCH, help_heading = "Output batching")]
    max_batch: usize,

    /// Connect and check the targets without copying anything
    #[arg(short = 'N', long = "dry-run")]
    dry_run: bool,

    // Progress & output
    /// Show progress
    #[arg(long, help_heading = "Progress & output")]
    progress: bool,

    /// Toggles the type of progress to show
    ///
    /// If specified, --progress flag is implied.
    ///
    /// Options are: `ProgressBar` (animated progress bar), `TextUpdates` (appropriate for logging), Auto (default, will
    /// choose between `ProgressBar` or `TextUpdates` depending on the type of terminal attached to stderr)
    #[arg(long, value_name = "TYPE", help_heading = "Progress & output")]
    progress_type: Option<common::ProgressType>,

    /// Sets the delay between progress updates
    ///
    /// - For the interactive (--progress-type=ProgressBar), the default is 200ms.
    /// - For the non-interactive (--progress-type=TextUpdates), the default is 10s.
    ///
    /// If specified, --progress flag is implied.
    ///
    /// This option accepts a human readable duration, e.g. "200ms", "10s", "5min" etc.
    #[arg(long, value_name = "DELAY", help_heading = "Progress & output")]
    progress_delay: Option<String>,

    /// Verbose level (implies "summary"): -v INFO / -vv DEBUG / -vvv TRACE (default: ERROR)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, help_heading = "Progress & output")]
    verbose: u8,

    /// Print summary at the end
    #[arg(long, help_heading = "Progress & output")]
    summary: bool,

    /// Quiet mode, don't report errors
    #[arg(short = 'q', long = "quiet", help_heading = "Progress & output")]
    quiet: bool,

    /// Also write DEBUG level logs to this file
    #[arg(long, value_name = "PATH", help_heading = "Progress & output")]
    debug_log_file: Option<std::path::PathBuf>,
}

impl Args {
    fn transfer_config(&self) -> Result<TransferConfig, String> {
        TransferConfig {
            max_src_requests: self.max_src_requests,
            max_dst_requests: self.max_dst_requests,
            min_batch: self.min_batch,
            max_batch: self.max_batch,
            retry_delay: std::time::Duration::from_millis(self.retry_delay),
            degradation_percent: self.degradation,
            overwrite: self.overwrite,
            dry_run: self.dry_run,
            read_progress: self.read_progress,
            write_progress: self.write_progress,
        }
        .validate()
    }
}

async fn open_endpoint(
    role: Role,
    url: Option<&str>,
    path: Option<&std::path::PathBuf>,
    max_requests: u32,
) -> anyhow::Result<Endpoint<remote::NbdTarget>> {
    match url {
        Some(url) => {
            let target = remote::connect(url)
                .await
                .with_context(|| format!("cannot connect to the {role} target"))?;
            Ok(Endpoint::Remote(RemoteEndpoint::new(
                role,
                target,
                max_requests,
            )))
        }
        None => {
            if let Some(path) = path.and_then(|path| path.to_str()) {
                if remote::is_remote(path) {
                    return Err(anyhow!(
                        "{path:?} looks like a remote target, use --{} instead",
                        if role == Role::Source { "source" } else { "destination" }
                    ));
                }
            }
            Ok(Endpoint::Local(LocalPath::new(path.cloned())))
        }
    }
}

#[instrument]
async fn async_main(args: Args) -> Result<Summary, Error> {
    let usage_error = |error: anyhow::Error| Error::new(error, Summary::default());
    let config = args
        .transfer_config()
        .map_err(|error| usage_error(anyhow!(error)))?;
    Direction::of(args.source.is_none(), args.destination.is_none()).map_err(usage_error)?;
    let src = open_endpoint(
        Role::Source,
        args.source.as_deref(),
        args.source_file.as_ref(),
        config.max_src_requests,
    )
    .await
    .map_err(usage_error)?;
    let dst = open_endpoint(
        Role::Destination,
        args.destination.as_deref(),
        args.destination_file.as_ref(),
        config.max_dst_requests,
    )
    .await
    .map_err(usage_error)?;
    common::transfer::transfer(common::get_progress(), src, dst, &config).await
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let func = {
        let args = args.clone();
        || async_main(args)
    };
    // block progress messages are logged at INFO
    let verbose = if args.read_progress > 0 || args.write_progress > 0 {
        args.verbose.max(1)
    } else {
        args.verbose
    };
    let output = common::OutputConfig {
        quiet: args.quiet,
        verbose,
        print_summary: args.summary,
    };
    let tracing = common::TracingConfig {
        debug_log_file: args.debug_log_file.clone(),
    };
    let res = common::run(
        if args.progress || args.progress_type.is_some() || args.progress_delay.is_some() {
            Some(common::ProgressSettings {
                progress_type: args.progress_type.unwrap_or_default(),
                progress_delay: args.progress_delay,
            })
        } else {
            None
        },
        output,
        tracing,
        func,
    );
    if res.is_none() {
        std::process::exit(1);
    }
    Ok(())
}
