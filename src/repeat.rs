//! The repeating-job engine.
//!
//! Each job with a [`RepeatConfig`] gets one in-memory task that sleeps
//! until the next occurrence, persists a fresh clone of the job, and arms
//! the following occurrence from the clone. All chains hang off a single
//! cancellation token so shutdown can stop them at once.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::cron::{CronSchedule, InvalidCron};
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, RepeatConfig};
use crate::storage::Storage;

/// The next occurrence after `from`, clamped into the config's date window.
/// `None` means the recurrence is exhausted.
pub(crate) fn next_occurrence(
    config: &RepeatConfig,
    from: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, InvalidCron> {
    let mut next = if let Some(pattern) = &config.pattern {
        match CronSchedule::parse(pattern)?.next_after(from) {
            Some(next) => next,
            None => return Ok(None),
        }
    } else if let Some(every) = config.every {
        from + TimeDelta::milliseconds(every)
    } else {
        return Ok(None);
    };
    if let Some(start_date) = config.start_date {
        if next < start_date {
            next = start_date;
        }
    }
    if let Some(end_date) = config.end_date {
        if next > end_date {
            return Ok(None);
        }
    }
    Ok(Some(next))
}

pub(crate) struct RepeatRunner {
    storage: Arc<dyn Storage>,
    events: EventBus,
    cancellation: CancellationToken,
    chains: Mutex<Vec<JoinHandle<()>>>,
}

impl RepeatRunner {
    pub(crate) fn new(storage: Arc<dyn Storage>, events: EventBus) -> Self {
        Self {
            storage,
            events,
            cancellation: CancellationToken::new(),
            chains: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the recurrence chain for a job. The job's config must already
    /// be validated; an exhausted or empty config spawns nothing.
    pub(crate) fn arm(&self, job: &Job) {
        let Some(config) = job.repeat.clone() else {
            return;
        };
        let storage = self.storage.clone();
        let events = self.events.clone();
        let token = self.cancellation.clone();
        let mut current = job.clone();

        let handle = tokio::spawn(async move {
            loop {
                if let Some(limit) = config.limit {
                    if current.repeat_count >= limit {
                        break;
                    }
                }
                let next = match next_occurrence(&config, Utc::now()) {
                    Ok(Some(next)) => next,
                    Ok(None) => break,
                    Err(err) => {
                        // The pattern was validated at enqueue time, so this
                        // is unreachable in practice.
                        events.emit(QueueEvent::Error(err.to_string()));
                        break;
                    }
                };
                let delay = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                let clone = current.repeat_instance(Utc::now());
                if let Err(err) = storage.add_job(&clone).await {
                    tracing::warn!(%err, job_id = %clone.id, "failed to persist repeat instance");
                    events.emit(QueueEvent::Error(err.to_string()));
                    break;
                }
                tracing::debug!(
                    job_id = %clone.id,
                    repeat_count = clone.repeat_count,
                    "armed repeat instance"
                );
                current = clone;
            }
        });

        self.chains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Cancels every chain and waits for the tasks to wind down.
    pub(crate) async fn shutdown(&self) {
        self.cancellation.cancel();
        let handles: Vec<_> = self
            .chains
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        futures::future::join_all(handles).await;
    }
}
