//! One import for the common surface of the crate.
//!
//! ```
//! # #![allow(unused_imports)]
//! use duroq::prelude::*;
//! ```

pub use crate::backoff::BackoffStrategy;
pub use crate::config::{
    QueueConfig, RateLimitConfig, RetryConfig, StorageConfig, WebhookConfig, WorkerConfig,
};
pub use crate::events::{EventKind, QueueEvent};
pub use crate::job::{Job, JobId, JobOptions, JobStatus, RepeatConfig};
pub use crate::queue::{Queue, QueueStats};
pub use crate::worker::{JobContext, Processor, ProcessorRegistry};
pub use crate::QueueError;
