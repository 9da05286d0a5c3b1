//! Lifecycle events emitted by the queue runtime.
//!
//! Events fan out over a [`tokio::sync::broadcast`] channel: every
//! subscriber sees every event, and a slow subscriber that falls more than
//! the channel capacity behind loses the oldest events first. Dropping
//! `progress` events under lag is acceptable; terminal events are protected
//! by a generous capacity.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::job::Job;

/// Discriminant for [`QueueEvent`], used by adapters (for example a webhook
/// sender) to subscribe to a subset of the catalogue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Waiting,
    Delayed,
    Active,
    Progress,
    Completed,
    Failed,
    Stalled,
    Drained,
    Error,
}

#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// A job was added with unmet dependencies.
    Waiting(Job),
    /// A job was added with an initial delay.
    Delayed(Job),
    /// A job transitioned to `processing`.
    Active(Job),
    /// A processor reported progress.
    Progress { job: Job, progress: u8 },
    /// A job finished successfully.
    Completed {
        job: Job,
        result: Option<serde_json::Value>,
    },
    /// A job exhausted its attempts and moved to the dead-letter queue.
    Failed { job: Job, error: String },
    /// A `processing` job exceeded the stalled threshold.
    Stalled(Job),
    /// No runnable or in-flight work remains.
    Drained,
    /// A runtime error that is not attributable to a single job.
    Error(String),
}

impl QueueEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Waiting(_) => EventKind::Waiting,
            Self::Delayed(_) => EventKind::Delayed,
            Self::Active(_) => EventKind::Active,
            Self::Progress { .. } => EventKind::Progress,
            Self::Completed { .. } => EventKind::Completed,
            Self::Failed { .. } => EventKind::Failed,
            Self::Stalled(_) => EventKind::Stalled,
            Self::Drained => EventKind::Drained,
            Self::Error(_) => EventKind::Error,
        }
    }

    /// The job snapshot carried by the event, if any.
    pub fn job(&self) -> Option<&Job> {
        match self {
            Self::Waiting(job)
            | Self::Delayed(job)
            | Self::Active(job)
            | Self::Stalled(job)
            | Self::Progress { job, .. }
            | Self::Completed { job, .. }
            | Self::Failed { job, .. } => Some(job),
            Self::Drained | Self::Error(_) => None,
        }
    }
}

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    /// Emitting with no subscribers is not an error.
    pub(crate) fn emit(&self, event: QueueEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use chrono::Utc;
    use serde_json::json;

    fn job() -> Job {
        Job::new(json!(null), JobOptions::default(), 3, Utc::now())
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new();
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        bus.emit(QueueEvent::Active(job()));
        bus.emit(QueueEvent::Drained);

        assert_eq!(first.recv().await.unwrap().kind(), EventKind::Active);
        assert_eq!(first.recv().await.unwrap().kind(), EventKind::Drained);
        assert_eq!(second.recv().await.unwrap().kind(), EventKind::Active);
        assert_eq!(second.recv().await.unwrap().kind(), EventKind::Drained);
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_a_no_op() {
        let bus = EventBus::new();
        bus.emit(QueueEvent::Error("nobody listening".to_owned()));
    }

    #[test]
    fn event_exposes_its_job_snapshot() {
        let job = job();
        let event = QueueEvent::Completed {
            job: job.clone(),
            result: Some(json!(1)),
        };
        assert_eq!(event.job().map(|j| j.id), Some(job.id));
        assert_eq!(QueueEvent::Drained.job(), None);
    }
}
