//! The periodic ticker that offers ready jobs to the runtime.
//!
//! Every tick the scheduler queries storage for pending jobs whose
//! `next_run_at` has passed, sorts them by priority (then earliest
//! `next_run_at`) and offers each one over an internal channel. Admission is
//! the runtime's business: an offer may be dropped there without the
//! scheduler caring. Storage failures surface as an `error` event and the
//! ticker carries on.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::{EventBus, QueueEvent};
use crate::job::Job;
use crate::storage::Storage;

pub(crate) const TICK_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) struct Scheduler {
    storage: Arc<dyn Storage>,
    events: EventBus,
    offers: mpsc::UnboundedSender<Job>,
    ticker: Mutex<Option<CancellationToken>>,
}

impl Scheduler {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        events: EventBus,
        offers: mpsc::UnboundedSender<Job>,
    ) -> Self {
        Self {
            storage,
            events,
            offers,
            ticker: Mutex::new(None),
        }
    }

    /// Starts the ticker. Calling it while running is a no-op.
    pub(crate) fn start(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if ticker.is_some() {
            return;
        }
        let token = CancellationToken::new();
        ticker.replace(token.clone());

        let storage = self.storage.clone();
        let events = self.events.clone();
        let offers = self.offers.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TICK_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => tick(&storage, &events, &offers).await,
                }
            }
            tracing::debug!("scheduler ticker stopped");
        });
    }

    /// Stops the ticker. Calling it while stopped is a no-op.
    pub(crate) fn stop(&self) {
        let mut ticker = self.ticker.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(token) = ticker.take() {
            token.cancel();
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

async fn tick(
    storage: &Arc<dyn Storage>,
    events: &EventBus,
    offers: &mpsc::UnboundedSender<Job>,
) {
    promote_due_delayed(storage, events).await;
    match storage.get_pending_jobs(Utc::now()).await {
        Ok(mut ready) => {
            ready.sort_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.next_run_at.cmp(&b.next_run_at))
            });
            for job in ready {
                if offers.send(job).is_err() {
                    // Runtime is gone; the next stop() call cleans us up.
                    return;
                }
            }
        }
        Err(err) => {
            tracing::warn!(%err, "failed to query pending jobs");
            events.emit(QueueEvent::Error(err.to_string()));
        }
    }
}

/// Flips `delayed` jobs whose instant has arrived to `pending` so the
/// pending query picks them up on this same tick.
async fn promote_due_delayed(storage: &Arc<dyn Storage>, events: &EventBus) {
    let now = Utc::now();
    let jobs = match storage.get_all_jobs().await {
        Ok(jobs) => jobs,
        Err(err) => {
            events.emit(QueueEvent::Error(err.to_string()));
            return;
        }
    };
    for mut job in jobs {
        if job.status == crate::job::JobStatus::Delayed && job.next_run_at <= now {
            job.mark_pending(now);
            if let Err(err) = storage.update_job(&job).await {
                tracing::warn!(%err, job_id = %job.id, "failed to promote delayed job");
                events.emit(QueueEvent::Error(err.to_string()));
            }
        }
    }
}
