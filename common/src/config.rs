//! Configuration types for transfers and output settings

/// Default number of outstanding requests per remote endpoint.
pub const DEFAULT_MAX_REQUESTS: u32 = 32;
/// Default number of chunks after which a local output batch is always flushed.
pub const DEFAULT_MAX_BATCH: usize = DEFAULT_MAX_REQUESTS as usize * 2;
/// Default number of contiguous chunks collected before a local output batch is flushed.
pub const DEFAULT_MIN_BATCH: usize = DEFAULT_MAX_BATCH / 2;
/// Default delay before a failed request is reissued.
pub const DEFAULT_RETRY_DELAY: std::time::Duration = std::time::Duration::from_millis(3000);
/// Default percentage the request ceiling is reduced to after a connection error.
pub const DEFAULT_DEGRADATION_PERCENT: u32 = 50;

/// Tunables of a single transfer session
///
/// Built once (usually from the command line), validated, and then shared read-only by the
/// scheduler, the output batcher and the drivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferConfig {
    /// Maximum outstanding reads against a remote source
    pub max_src_requests: u32,
    /// Maximum outstanding writes against a remote destination
    pub max_dst_requests: u32,
    /// Minimum number of contiguous chunks to collect before writing a local output batch
    pub min_batch: usize,
    /// Number of contiguous chunks which always triggers writing a local output batch
    pub max_batch: usize,
    /// Delay before a failed read or write is retried
    pub retry_delay: std::time::Duration,
    /// After a connection error the ceiling is reduced to this percentage (100 = never reduce)
    pub degradation_percent: u32,
    /// Overwrite an existing local destination file
    pub overwrite: bool,
    /// Connect and query capacities only, don't move any data
    pub dry_run: bool,
    /// Report every N-th source block read (0 = off)
    pub read_progress: u64,
    /// Report every N-th source block written (0 = off)
    pub write_progress: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_src_requests: DEFAULT_MAX_REQUESTS,
            max_dst_requests: DEFAULT_MAX_REQUESTS,
            min_batch: DEFAULT_MIN_BATCH,
            max_batch: DEFAULT_MAX_BATCH,
            retry_delay: DEFAULT_RETRY_DELAY,
            degradation_percent: DEFAULT_DEGRADATION_PERCENT,
            overwrite: false,
            dry_run: false,
            read_progress: 0,
            write_progress: 0,
        }
    }
}

impl TransferConfig {
    /// Validate configuration and return a normalized copy
    ///
    /// Zero ceilings fall back to the default, `min_batch` is at least 1 and `max_batch` is never
    /// below `min_batch`. A degradation over 100% is rejected, 0% is treated as 1%.
    pub fn validate(&self) -> Result<Self, String> {
        if self.degradation_percent > 100 {
            return Err(format!(
                "maximum requests degradation must be at most 100%, got {}%",
                self.degradation_percent
            ));
        }
        let mut config = *self;
        if config.max_src_requests == 0 {
            config.max_src_requests = DEFAULT_MAX_REQUESTS;
        }
        if config.max_dst_requests == 0 {
            config.max_dst_requests = DEFAULT_MAX_REQUESTS;
        }
        config.min_batch = config.min_batch.max(1);
        config.max_batch = config.max_batch.max(config.min_batch);
        config.degradation_percent = config.degradation_percent.max(1);
        Ok(config)
    }
}

/// Output and logging configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct OutputConfig {
    /// Suppress error output
    pub quiet: bool,
    /// Verbosity level: 0=ERROR, 1=INFO, 2=DEBUG, 3=TRACE
    pub verbose: u8,
    /// Print summary statistics at the end
    pub print_summary: bool,
}
