//! The durable job store.
//!
//! Two interchangeable back-ends implement the same contract:
//! [`memory::MemoryStorage`] for ephemeral queues and tests, and
//! [`file::FileStorage`], an append-only JSON log with a sibling dead-letter
//! log and crash recovery on load.
//!
//! Storage is the single shared mutable resource: it owns the authoritative
//! job record, and exactly one queue instance writes to it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobId};

pub mod file;
pub mod memory;
#[cfg(test)]
pub(crate) mod testing;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {0} already exists")]
    AlreadyExists(JobId),
    #[error("storage is closed")]
    Closed,
    #[error("storage in bad state")]
    BadState,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// Contract shared by every back-end.
///
/// Reads return defensive snapshots: concurrent mutation never tears a
/// returned job. Main store and dead-letter store are disjoint; a job id
/// lives in at most one of them at any instant.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Opens the back-end. For the file back-end this replays the logs and
    /// runs crash recovery, re-arming any record left in `processing`.
    async fn initialize(&self) -> Result<(), StorageError>;

    /// Inserts a new record; fails with [`StorageError::AlreadyExists`] if
    /// the id is taken.
    async fn add_job(&self, job: &Job) -> Result<(), StorageError>;

    /// Replaces an existing record; fails with [`StorageError::NotFound`]
    /// if the id is absent.
    async fn update_job(&self, job: &Job) -> Result<(), StorageError>;

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StorageError>;

    /// All main-store jobs with `status = pending` and `next_run_at <= now`,
    /// ordered by ascending `next_run_at`.
    async fn get_pending_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError>;

    /// Removes a record from the main store. Returns whether it existed.
    async fn remove_job(&self, id: JobId) -> Result<bool, StorageError>;

    /// Atomically removes the record from the main store and inserts it
    /// into the dead-letter store.
    async fn move_to_dead_letter(&self, job: &Job) -> Result<(), StorageError>;

    async fn get_failed_jobs(&self) -> Result<Vec<Job>, StorageError>;

    /// Removes and returns a dead-letter record, if present.
    async fn remove_from_dead_letter(&self, id: JobId) -> Result<Option<Job>, StorageError>;

    /// Flushes and releases resources. Subsequent writes fail with
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}
