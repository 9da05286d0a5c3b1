//! The job record and its lifecycle.
//!
//! A [`Job`] is the unit of work: an opaque JSON payload plus the state the
//! queue needs to schedule, retry and order it. Storage owns the
//! authoritative record; the runtime only holds transient copies while a job
//! is in flight.

use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod builder;

pub use builder::JobOptions;

/// Stable unique identifier for a job.
///
/// Either supplied by the caller via [`JobOptions::with_job_id`] or generated
/// as a random 128-bit id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::from_str(s)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Blocked on unfinished dependencies.
    Waiting,
    /// Scheduled for a future instant.
    Delayed,
    /// Ready to be dispatched.
    Pending,
    /// Currently executing on a worker.
    Processing,
    /// Finished successfully.
    Completed,
    /// Exhausted its attempts and moved to the dead-letter queue.
    Failed,
    /// Observed in `processing` for longer than the stalled threshold.
    Stalled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Stalled => "stalled",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Recurrence specification: either a fixed interval or a 5-field cron
/// pattern, optionally bounded by a count limit and a date window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatConfig {
    /// Interval between occurrences in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<i64>,
    /// 5-field cron pattern (`minute hour dom month dow`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    /// Maximum number of recurrence instances.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub end_date: Option<DateTime<Utc>>,
}

impl RepeatConfig {
    pub fn every(interval: TimeDelta) -> Self {
        Self {
            every: Some(interval.num_milliseconds()),
            pattern: None,
            limit: None,
            start_date: None,
            end_date: None,
        }
    }

    pub fn pattern(pattern: impl Into<String>) -> Self {
        Self {
            every: None,
            pattern: Some(pattern.into()),
            limit: None,
            start_date: None,
            end_date: None,
        }
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_start_date(mut self, start_date: DateTime<Utc>) -> Self {
        self.start_date = Some(start_date);
        self
    }

    pub fn with_end_date(mut self, end_date: DateTime<Utc>) -> Self {
        self.end_date = Some(end_date);
        self
    }
}

/// A full job record.
///
/// Serialises to one JSON object per log line; `None` fields are omitted and
/// timestamps are milliseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    /// Higher runs earlier.
    #[serde(default)]
    pub priority: i32,
    /// Completed executions that ended in failure.
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    /// 0..=100.
    #[serde(default)]
    pub progress: u8,
    /// Earliest instant at which this job may run.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub next_run_at: DateTime<Utc>,
    /// Initial delay at creation time, in milliseconds.
    #[serde(default)]
    pub delay: i64,
    /// Ids that must be `completed` before this job may dispatch.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat: Option<RepeatConfig>,
    #[serde(default)]
    pub repeat_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "chrono::serde::ts_milliseconds_option"
    )]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Constructs a job with its initial status: `delayed` when a delay is
    /// set, `waiting` when it has dependencies, `pending` otherwise.
    pub(crate) fn new(
        payload: serde_json::Value,
        options: JobOptions,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = options.delay();
        let status = if delay > TimeDelta::zero() {
            JobStatus::Delayed
        } else if !options.depends_on().is_empty() {
            JobStatus::Waiting
        } else {
            JobStatus::Pending
        };
        Self {
            id: options.job_id().unwrap_or_else(JobId::random),
            payload,
            status,
            priority: options.priority(),
            attempts: 0,
            max_attempts,
            progress: 0,
            next_run_at: now + delay,
            delay: delay.num_milliseconds(),
            depends_on: options.depends_on().to_vec(),
            repeat: options.repeat().cloned(),
            repeat_count: 0,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, result: Option<serde_json::Value>, now: DateTime<Utc>) {
        self.status = JobStatus::Completed;
        self.progress = 100;
        self.result = result;
        self.error = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Records a failed execution: consumes one attempt and either arms the
    /// retry (`pending` with a backed-off `next_run_at`) or, once the ceiling
    /// is reached, marks the job `failed`.
    pub(crate) fn record_failure(
        &mut self,
        error: String,
        next_run_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) {
        self.attempts += 1;
        self.error = Some(error);
        self.updated_at = now;
        if self.attempts >= self.max_attempts {
            self.status = JobStatus::Failed;
        } else {
            self.status = JobStatus::Pending;
            self.next_run_at = next_run_at;
        }
    }

    pub(crate) fn mark_stalled(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Stalled;
        self.updated_at = now;
    }

    pub(crate) fn mark_pending(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.updated_at = now;
    }

    pub(crate) fn set_progress(&mut self, progress: u8, now: DateTime<Utc>) {
        self.progress = progress.min(100);
        self.updated_at = now;
    }

    /// Re-arms a record that was found mid-flight on restart.
    pub(crate) fn recover(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts += 1;
        self.next_run_at = now;
        self.started_at = None;
        self.updated_at = now;
    }

    /// Resets a dead-letter record so it can be re-enqueued from scratch.
    pub(crate) fn reset_for_reprocess(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempts = 0;
        self.progress = 0;
        self.next_run_at = now;
        self.result = None;
        self.error = None;
        self.started_at = None;
        self.completed_at = None;
        self.updated_at = now;
    }

    /// Clones this record as the next recurrence instance.
    pub(crate) fn repeat_instance(&self, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::random(),
            status: JobStatus::Pending,
            attempts: 0,
            progress: 0,
            next_run_at: now,
            repeat_count: self.repeat_count + 1,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            ..self.clone()
        }
    }

    pub(crate) fn dependencies_satisfied(&self, completed: &HashSet<JobId>) -> bool {
        self.depends_on.iter().all(|id| completed.contains(id))
    }
}
