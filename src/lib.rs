//! An embeddable, single-node durable job queue.
//!
//! Producers enqueue opaque JSON payloads; a worker pool executes them in
//! isolated child processes with controlled concurrency, automatic retry
//! with backoff, scheduling (delay, intervals, cron), dependency ordering,
//! rate limiting, stalled-job detection and a dead-letter queue.
//! Persistence is an append-only log: any job found mid-flight on restart
//! is re-armed for another attempt.
//!
//! # Example
//!
//! ```no_run
//! use duroq::prelude::*;
//! use std::path::PathBuf;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ProcessorRegistry::new().register_fn("resize-image", |ctx| async move {
//!         let width = ctx.payload()["width"].as_u64().unwrap_or(0);
//!         ctx.update_progress(100);
//!         Ok(serde_json::json!({"resized_to": width}))
//!     });
//!     // Worker children re-enter `main`; hand them off before anything else.
//!     if duroq::worker::is_worker_process() {
//!         duroq::worker::child_entrypoint(registry).await?;
//!         return Ok(());
//!     }
//!
//!     let config = QueueConfig::new(
//!         StorageConfig::File {
//!             path: PathBuf::from("jobs.log"),
//!         },
//!         4,
//!     );
//!     let queue = Queue::new(config).await?;
//!     queue.process("resize-image").await;
//!
//!     let id = queue
//!         .add(serde_json::json!({"width": 800}), JobOptions::default())
//!         .await?;
//!     println!("enqueued {id}");
//!
//!     queue.drain().await?;
//!     queue.shutdown().await?;
//!     Ok(())
//! }
//! ```

use thiserror::Error;

pub mod backoff;
pub mod config;
pub mod cron;
pub mod dead_letter;
pub mod events;
pub mod job;
pub mod prelude;
pub mod rate_limit;
pub mod storage;
pub mod worker;

mod queue;
mod repeat;
mod scheduler;

pub use config::{
    QueueConfig, RateLimitConfig, RetryConfig, StorageConfig, WebhookConfig, WorkerConfig,
};
pub use events::{EventKind, QueueEvent};
pub use job::{Job, JobId, JobOptions, JobStatus, RepeatConfig};
pub use queue::{Queue, QueueStats};

#[derive(Debug, Error)]
pub enum QueueError {
    /// Construction-time validation failure; fatal to construction.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error(transparent)]
    Storage(#[from] storage::StorageError),
    #[error(transparent)]
    InvalidCron(#[from] cron::InvalidCron),
    #[error(transparent)]
    Worker(#[from] worker::WorkerError),
    /// Returned by `add` while the queue is closing.
    #[error("queue is shutting down")]
    ShuttingDown,
}
