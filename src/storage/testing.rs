//! Shared test suite for [`Storage`] implementations.
//!
//! Both back-ends run the same contract tests via
//! [`storage_test_suite!`](crate::storage::testing::storage_test_suite).

use chrono::{TimeDelta, Utc};
use serde_json::json;

use super::*;
use crate::job::{JobOptions, JobStatus};

pub(crate) fn pending_job() -> Job {
    Job::new(json!({"payload": "data"}), JobOptions::default(), 3, Utc::now())
}

impl Job {
    pub(crate) fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub(crate) fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub(crate) fn with_next_run_at(mut self, next_run_at: chrono::DateTime<Utc>) -> Self {
        self.next_run_at = next_run_at;
        self
    }
}

macro_rules! storage_test_suite {
    (for: $storage:expr) => {
        $crate::storage::testing::storage_test_suite!(setup: (), storage: $storage);
    };
    (setup: $setup:stmt, storage: $storage:expr) => {
        #[tokio::test]
        async fn add_and_get_round_trip() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::add_and_get_round_trip(storage).await;
        }
        #[tokio::test]
        async fn add_duplicate_id_fails() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::add_duplicate_id_fails(storage).await;
        }
        #[tokio::test]
        async fn update_replaces_record() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::update_replaces_record(storage).await;
        }
        #[tokio::test]
        async fn update_unknown_id_fails() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::update_unknown_id_fails(storage).await;
        }
        #[tokio::test]
        async fn pending_jobs_filtered_by_status_and_time() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::pending_jobs_filtered_by_status_and_time(storage).await;
        }
        #[tokio::test]
        async fn pending_jobs_ordered_by_next_run_at() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::pending_jobs_ordered_by_next_run_at(storage).await;
        }
        #[tokio::test]
        async fn dead_letter_move_is_exclusive() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::dead_letter_move_is_exclusive(storage).await;
        }
        #[tokio::test]
        async fn remove_from_dead_letter_returns_record() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::remove_from_dead_letter_returns_record(storage).await;
        }
        #[tokio::test]
        async fn remove_job_reports_presence() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::remove_job_reports_presence(storage).await;
        }
        #[tokio::test]
        async fn get_all_jobs_excludes_dead_letter() {
            $setup;
            let storage = $storage;
            $crate::storage::testing::get_all_jobs_excludes_dead_letter(storage).await;
        }
    };
}

pub(crate) use storage_test_suite;

pub(crate) async fn add_and_get_round_trip(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let job = pending_job();
    storage.add_job(&job).await.unwrap();

    let loaded = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, job.id);
    assert_eq!(loaded.payload, job.payload);
    assert_eq!(loaded.status, JobStatus::Pending);

    assert!(storage.get_job(crate::job::JobId::random()).await.unwrap().is_none());
}

pub(crate) async fn add_duplicate_id_fails(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let job = pending_job();
    storage.add_job(&job).await.unwrap();

    let err = storage.add_job(&job).await.unwrap_err();
    assert!(matches!(err, StorageError::AlreadyExists(id) if id == job.id));
}

pub(crate) async fn update_replaces_record(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let mut job = pending_job();
    storage.add_job(&job).await.unwrap();

    job.priority = 42;
    job.status = JobStatus::Processing;
    storage.update_job(&job).await.unwrap();

    let loaded = storage.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(loaded.priority, 42);
    assert_eq!(loaded.status, JobStatus::Processing);
}

pub(crate) async fn update_unknown_id_fails(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let job = pending_job();
    let err = storage.update_job(&job).await.unwrap_err();
    assert!(matches!(err, StorageError::NotFound(id) if id == job.id));
}

pub(crate) async fn pending_jobs_filtered_by_status_and_time(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let now = Utc::now();

    let ready = pending_job();
    let future = pending_job().with_next_run_at(now + TimeDelta::hours(1));
    let processing = pending_job().with_status(JobStatus::Processing);
    let waiting = pending_job().with_status(JobStatus::Waiting);
    for job in [&ready, &future, &processing, &waiting] {
        storage.add_job(job).await.unwrap();
    }

    let pending = storage.get_pending_jobs(now).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, ready.id);
}

pub(crate) async fn pending_jobs_ordered_by_next_run_at(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let now = Utc::now();

    let second = pending_job().with_next_run_at(now - TimeDelta::seconds(10));
    let first = pending_job().with_next_run_at(now - TimeDelta::seconds(20));
    let third = pending_job().with_next_run_at(now - TimeDelta::seconds(5));
    for job in [&second, &first, &third] {
        storage.add_job(job).await.unwrap();
    }

    let pending = storage.get_pending_jobs(now).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|job| job.id).collect();
    assert_eq!(ids, vec![first.id, second.id, third.id]);
}

pub(crate) async fn dead_letter_move_is_exclusive(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let mut job = pending_job();
    storage.add_job(&job).await.unwrap();

    job.status = JobStatus::Failed;
    storage.move_to_dead_letter(&job).await.unwrap();

    // A job id lives in at most one of the two stores.
    assert!(storage.get_job(job.id).await.unwrap().is_none());
    let failed = storage.get_failed_jobs().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, job.id);
    assert_eq!(failed[0].status, JobStatus::Failed);
}

pub(crate) async fn remove_from_dead_letter_returns_record(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let mut job = pending_job();
    storage.add_job(&job).await.unwrap();
    job.status = JobStatus::Failed;
    storage.move_to_dead_letter(&job).await.unwrap();

    let removed = storage.remove_from_dead_letter(job.id).await.unwrap();
    assert_eq!(removed.map(|j| j.id), Some(job.id));
    assert!(storage.get_failed_jobs().await.unwrap().is_empty());

    assert!(storage.remove_from_dead_letter(job.id).await.unwrap().is_none());
}

pub(crate) async fn remove_job_reports_presence(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let job = pending_job();
    storage.add_job(&job).await.unwrap();

    assert!(storage.remove_job(job.id).await.unwrap());
    assert!(storage.get_job(job.id).await.unwrap().is_none());
    assert!(!storage.remove_job(job.id).await.unwrap());
}

pub(crate) async fn get_all_jobs_excludes_dead_letter(storage: impl Storage) {
    storage.initialize().await.unwrap();
    let kept = pending_job();
    let mut dead = pending_job();
    storage.add_job(&kept).await.unwrap();
    storage.add_job(&dead).await.unwrap();

    dead.status = JobStatus::Failed;
    storage.move_to_dead_letter(&dead).await.unwrap();

    let all = storage.get_all_jobs().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].id, kept.id);
}
