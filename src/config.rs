//! Queue configuration.
//!
//! Built programmatically with chained `with_*` setters; loading from files
//! or the environment is the host's concern.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::backoff::BackoffStrategy;
use crate::events::EventKind;
use crate::QueueError;

/// Which storage back-end the queue persists to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// No persistence; state dies with the process.
    Memory,
    /// Append-only JSON log at `path`, with a sibling dead-letter log.
    File { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retry ceiling stamped onto every job at enqueue time.
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

/// Caps jobs entering `processing` to `max` per `duration` window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub max: u32,
    pub duration: Duration,
}

/// Contract data for an external webhook adapter. The queue itself performs
/// no HTTP delivery; an adapter subscribes to the event stream and forwards
/// the listed kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookConfig {
    pub url: String,
    pub events: Vec<EventKind>,
    pub headers: HashMap<String, String>,
}

/// How worker child processes are spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Binary to execute; defaults to the current executable re-entered in
    /// worker mode.
    pub program: Option<PathBuf>,
    pub args: Vec<String>,
}

pub const DEFAULT_STALLED_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub storage: StorageConfig,
    /// Upper bound on concurrently `processing` jobs.
    pub concurrency: usize,
    pub retry: RetryConfig,
    pub rate_limit: Option<RateLimitConfig>,
    pub webhooks: Vec<WebhookConfig>,
    pub stalled_interval: Duration,
    pub worker: WorkerConfig,
}

impl QueueConfig {
    pub fn new(storage: StorageConfig, concurrency: usize) -> Self {
        Self {
            storage,
            concurrency,
            retry: RetryConfig::default(),
            rate_limit: None,
            webhooks: Vec::new(),
            stalled_interval: DEFAULT_STALLED_INTERVAL,
            worker: WorkerConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn with_webhook(mut self, webhook: WebhookConfig) -> Self {
        self.webhooks.push(webhook);
        self
    }

    pub fn with_stalled_interval(mut self, stalled_interval: Duration) -> Self {
        self.stalled_interval = stalled_interval;
        self
    }

    pub fn with_worker(mut self, worker: WorkerConfig) -> Self {
        self.worker = worker;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), QueueError> {
        if self.concurrency == 0 {
            return Err(QueueError::ConfigInvalid(
                "concurrency must be greater than 0".to_owned(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(QueueError::ConfigInvalid(
                "retry.max_attempts must be greater than 0".to_owned(),
            ));
        }
        if let StorageConfig::File { path } = &self.storage {
            if path.as_os_str().is_empty() {
                return Err(QueueError::ConfigInvalid(
                    "file storage requires a non-empty path".to_owned(),
                ));
            }
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.max == 0 {
                return Err(QueueError::ConfigInvalid(
                    "rate_limit.max must be greater than 0".to_owned(),
                ));
            }
            if rate_limit.duration.is_zero() {
                return Err(QueueError::ConfigInvalid(
                    "rate_limit.duration must be greater than 0".to_owned(),
                ));
            }
        }
        if self.stalled_interval.is_zero() {
            return Err(QueueError::ConfigInvalid(
                "stalled_interval must be greater than 0".to_owned(),
            ));
        }
        Ok(())
    }
}
