//! Dead-letter queue view.
//!
//! A thin projection over [`Storage`] for jobs that exhausted their retry
//! attempts: read, remove-for-reprocess and clear.

use std::sync::Arc;

use chrono::Utc;

use crate::job::{Job, JobId};
use crate::storage::{Storage, StorageError};

#[derive(Clone)]
pub struct DeadLetter {
    storage: Arc<dyn Storage>,
}

impl DeadLetter {
    pub(crate) fn new(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Moves a job that exhausted its attempts out of the main store.
    pub(crate) async fn add(&self, job: &Job) -> Result<(), StorageError> {
        self.storage.move_to_dead_letter(job).await
    }

    /// Removes the record and returns a copy reset for re-enqueueing:
    /// `attempts = 0`, `pending`, `next_run_at = now`, progress and
    /// outcome cleared.
    pub async fn remove(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let Some(mut job) = self.storage.remove_from_dead_letter(id).await? else {
            return Ok(None);
        };
        job.reset_for_reprocess(Utc::now());
        Ok(Some(job))
    }

    pub async fn jobs(&self) -> Result<Vec<Job>, StorageError> {
        self.storage.get_failed_jobs().await
    }

    pub async fn count(&self) -> Result<usize, StorageError> {
        Ok(self.storage.get_failed_jobs().await?.len())
    }

    pub async fn clear(&self) -> Result<(), StorageError> {
        for job in self.storage.get_failed_jobs().await? {
            self.storage.remove_from_dead_letter(job.id).await?;
        }
        Ok(())
    }
}
