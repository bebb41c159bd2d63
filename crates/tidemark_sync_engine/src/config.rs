//! Configuration for the sync engine.

use crate::conflict::ConflictResolutionPolicy;
use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default batch part size: 2 MiB of encoded rows.
pub const DEFAULT_BATCH_SIZE: usize = 2 * 1024 * 1024;

/// Upper bound on tables scanned at the same time.
pub const MAX_CONCURRENT_TABLE_SCANS: usize = 16;

/// What to do when a row cannot be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorResolutionPolicy {
    /// Fail the apply.
    #[default]
    Throw,
    /// Count the row as failed and keep going.
    ContinueOnError,
}

/// Transaction granularity of an apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    /// One transaction for the whole batch.
    #[default]
    AllOrNothing,
    /// One transaction per batch part.
    PerBatchPart,
}

/// Options shared by local and remote orchestrators.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Root directory for batch directories.
    pub batch_directory: PathBuf,
    /// Target encoded size of a batch part; zero keeps parts in memory.
    pub batch_size: usize,
    /// Requested table scan parallelism.
    pub max_concurrent_table_scans: usize,
    /// Built-in conflict policy, used when no resolver is set.
    pub conflict_resolution_policy: ConflictResolutionPolicy,
    /// Row failure handling.
    pub error_resolution_policy: ErrorResolutionPolicy,
    /// Transaction granularity of an apply.
    pub transaction_mode: TransactionMode,
    /// Write rows through `execute_rows` chunks.
    pub use_bulk_operations: bool,
    /// Rows per bulk chunk.
    pub bulk_batch_max_rows: usize,
    /// Delete received batches once applied.
    pub clean_folder: bool,
    /// Retry behavior for transport calls.
    pub retry: RetryConfig,
}

impl SyncOptions {
    /// Creates options with defaults.
    pub fn new() -> Self {
        Self {
            batch_directory: std::env::temp_dir().join("tidemark"),
            batch_size: DEFAULT_BATCH_SIZE,
            max_concurrent_table_scans: 8,
            conflict_resolution_policy: ConflictResolutionPolicy::ServerWins,
            error_resolution_policy: ErrorResolutionPolicy::Throw,
            transaction_mode: TransactionMode::AllOrNothing,
            use_bulk_operations: false,
            bulk_batch_max_rows: 500,
            clean_folder: true,
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch root directory.
    #[must_use]
    pub fn with_batch_directory(mut self, dir: impl AsRef<Path>) -> Self {
        self.batch_directory = dir.as_ref().to_path_buf();
        self
    }

    /// Sets the batch part size; zero keeps every part in memory.
    #[must_use]
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the requested table scan parallelism.
    #[must_use]
    pub fn with_max_concurrent_table_scans(mut self, scans: usize) -> Self {
        self.max_concurrent_table_scans = scans;
        self
    }

    /// Sets the built-in conflict policy.
    #[must_use]
    pub fn with_conflict_resolution_policy(mut self, policy: ConflictResolutionPolicy) -> Self {
        self.conflict_resolution_policy = policy;
        self
    }

    /// Sets the row failure handling.
    #[must_use]
    pub fn with_error_resolution_policy(mut self, policy: ErrorResolutionPolicy) -> Self {
        self.error_resolution_policy = policy;
        self
    }

    /// Sets the transaction granularity.
    #[must_use]
    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Enables chunked writes of `rows` rows.
    #[must_use]
    pub fn with_bulk_operations(mut self, rows: usize) -> Self {
        self.use_bulk_operations = true;
        self.bulk_batch_max_rows = rows.max(1);
        self
    }

    /// Keeps received batches on disk after apply.
    #[must_use]
    pub fn keep_batches(mut self) -> Self {
        self.clean_folder = false;
        self
    }

    /// Sets the retry configuration.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Number of tables to scan at once for a store.
    ///
    /// Stores without multiple active result sets scan one table at a time.
    pub fn table_scan_concurrency(&self, multiple_active_result_sets: bool) -> usize {
        if multiple_active_result_sets {
            self.max_concurrent_table_scans
                .clamp(1, MAX_CONCURRENT_TABLE_SCANS)
        } else {
            1
        }
    }
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts, the first one included.
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    #[must_use]
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    #[must_use]
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
