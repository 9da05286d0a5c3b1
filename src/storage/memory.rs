//! In-memory implementation of [`Storage`].
//!
//! Same semantics as the file back-end without persistence; `initialize`
//! and `close` are no-ops. Useful for ephemeral queues and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{Storage, StorageError};
use crate::job::{Job, JobId, JobStatus};

#[derive(Debug, Default)]
struct Stores {
    jobs: HashMap<JobId, Job>,
    dead: HashMap<JobId, Job>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    inner: Arc<RwLock<Stores>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        Ok(())
    }

    async fn add_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut stores = self.inner.write().map_err(|_| StorageError::BadState)?;
        if stores.jobs.contains_key(&job.id) {
            return Err(StorageError::AlreadyExists(job.id));
        }
        stores.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut stores = self.inner.write().map_err(|_| StorageError::BadState)?;
        if !stores.jobs.contains_key(&job.id) {
            return Err(StorageError::NotFound(job.id));
        }
        stores.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let stores = self.inner.read().map_err(|_| StorageError::BadState)?;
        Ok(stores.jobs.get(&id).cloned())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let stores = self.inner.read().map_err(|_| StorageError::BadState)?;
        Ok(stores.jobs.values().cloned().collect())
    }

    async fn get_pending_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let stores = self.inner.read().map_err(|_| StorageError::BadState)?;
        let mut pending: Vec<Job> = stores
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.next_run_at <= now)
            .cloned()
            .collect();
        pending.sort_by_key(|job| job.next_run_at);
        Ok(pending)
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, StorageError> {
        let mut stores = self.inner.write().map_err(|_| StorageError::BadState)?;
        Ok(stores.jobs.remove(&id).is_some())
    }

    async fn move_to_dead_letter(&self, job: &Job) -> Result<(), StorageError> {
        let mut stores = self.inner.write().map_err(|_| StorageError::BadState)?;
        stores.jobs.remove(&job.id);
        stores.dead.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_failed_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let stores = self.inner.read().map_err(|_| StorageError::BadState)?;
        Ok(stores.dead.values().cloned().collect())
    }

    async fn remove_from_dead_letter(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let mut stores = self.inner.write().map_err(|_| StorageError::BadState)?;
        Ok(stores.dead.remove(&id))
    }

    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::storage::testing::storage_test_suite!(for: MemoryStorage::new());

    #[tokio::test]
    async fn snapshots_are_defensive_copies() {
        let storage = MemoryStorage::new();
        let job = crate::storage::testing::pending_job();
        storage.add_job(&job).await.unwrap();

        let mut snapshot = storage.get_job(job.id).await.unwrap().unwrap();
        snapshot.priority = 99;

        let fresh = storage.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(fresh.priority, job.priority);
    }
}
