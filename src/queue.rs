//! The queue runtime.
//!
//! [`Queue`] orchestrates everything: it accepts jobs, runs the scheduler
//! and the stalled sweeper, admits offers against the concurrency,
//! dependency and rate-limit rules, drives executions on the worker pool
//! and applies the retry/backoff + dead-letter state machine to their
//! results.
//!
//! Shared runtime state (`active`, `completed`, the idle worker pool, the
//! rate limiter) lives behind one mutex, and offers are admitted by a
//! single dispatch task, so the admission checks are race-free.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::{QueueConfig, StorageConfig};
use crate::cron::CronSchedule;
use crate::dead_letter::DeadLetter;
use crate::events::{EventBus, QueueEvent};
use crate::job::{Job, JobId, JobOptions, JobStatus, RepeatConfig};
use crate::rate_limit::RateLimiter;
use crate::repeat::RepeatRunner;
use crate::scheduler::Scheduler;
use crate::storage::file::FileStorage;
use crate::storage::memory::MemoryStorage;
use crate::storage::Storage;
use crate::worker::{ExecutionResult, ProcessWorkerFactory, WorkerFactory, WorkerHandle};
use crate::QueueError;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counts per status plus dead-letter size and in-flight jobs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub waiting: usize,
    pub delayed: usize,
    pub pending: usize,
    pub processing: usize,
    pub stalled: usize,
    pub completed: usize,
    /// Jobs preserved in the dead-letter queue.
    pub failed: usize,
    /// Jobs currently held by workers.
    pub active: usize,
}

struct RuntimeState {
    active: HashSet<JobId>,
    completed: HashSet<JobId>,
    idle_workers: Vec<Box<dyn WorkerHandle>>,
    limiter: Option<RateLimiter>,
    handler: Option<String>,
    paused: bool,
    shutting_down: bool,
}

struct Inner {
    config: QueueConfig,
    storage: Arc<dyn Storage>,
    events: EventBus,
    scheduler: Scheduler,
    repeat: RepeatRunner,
    dead_letter: DeadLetter,
    factory: Arc<dyn WorkerFactory>,
    state: Mutex<RuntimeState>,
    progress: mpsc::UnboundedSender<(JobId, u8)>,
    cancellation: CancellationToken,
}

/// A durable, single-node job queue.
///
/// Cloning is cheap; clones share the same runtime.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<Inner>,
}

impl Queue {
    /// Opens the configured storage (running crash recovery for the file
    /// back-end), starts the scheduler and the stalled sweeper, and returns
    /// a queue executing jobs in child processes.
    pub async fn new(config: QueueConfig) -> Result<Self, QueueError> {
        let factory = Arc::new(ProcessWorkerFactory::new(config.worker.clone()));
        Self::with_worker_factory(config, factory).await
    }

    /// Like [`Queue::new`] but with a caller-supplied worker factory, e.g.
    /// [`crate::worker::local::LocalWorkerFactory`] for in-process
    /// execution.
    pub async fn with_worker_factory(
        config: QueueConfig,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self, QueueError> {
        config.validate()?;
        let storage: Arc<dyn Storage> = match &config.storage {
            StorageConfig::Memory => Arc::new(MemoryStorage::new()),
            StorageConfig::File { path } => Arc::new(FileStorage::new(path.clone())),
        };
        Self::build(config, storage, factory).await
    }

    async fn build(
        config: QueueConfig,
        storage: Arc<dyn Storage>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Result<Self, QueueError> {
        storage.initialize().await?;

        // Dependency checks run against ids completed in past runs too.
        let completed: HashSet<JobId> = storage
            .get_all_jobs()
            .await?
            .iter()
            .filter(|job| job.status == JobStatus::Completed)
            .map(|job| job.id)
            .collect();

        let events = EventBus::new();
        let (offers_tx, offers_rx) = mpsc::unbounded_channel();
        let (progress_tx, progress_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            scheduler: Scheduler::new(storage.clone(), events.clone(), offers_tx),
            repeat: RepeatRunner::new(storage.clone(), events.clone()),
            dead_letter: DeadLetter::new(storage.clone()),
            state: Mutex::new(RuntimeState {
                active: HashSet::new(),
                completed,
                idle_workers: Vec::new(),
                limiter: config
                    .rate_limit
                    .map(|limit| RateLimiter::new(limit.max, limit.duration)),
                handler: None,
                paused: false,
                shutting_down: false,
            }),
            progress: progress_tx,
            cancellation: CancellationToken::new(),
            config,
            storage,
            events,
            factory,
        });

        // A waiting job whose dependencies completed before a restart would
        // otherwise never be released.
        inner.release_dependents().await;

        tokio::spawn(dispatch_loop(inner.clone(), offers_rx));
        tokio::spawn(progress_loop(inner.clone(), progress_rx));
        inner.clone().spawn_stalled_sweeper();
        inner.scheduler.start();

        Ok(Self { inner })
    }

    /// Selects the registered handler workers will run jobs with. Dispatch
    /// does not start until a processor is set.
    pub async fn process(&self, handler: impl Into<String>) {
        self.inner.state.lock().await.handler = Some(handler.into());
    }

    /// Persists a job and returns its id. The job becomes `delayed`,
    /// `waiting` or `pending` per its options.
    pub async fn add(
        &self,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<JobId, QueueError> {
        if self.inner.state.lock().await.shutting_down {
            return Err(QueueError::ShuttingDown);
        }
        if let Some(repeat) = options.repeat() {
            validate_repeat(repeat)?;
        }

        let job = Job::new(
            payload,
            options,
            self.inner.config.retry.max_attempts,
            Utc::now(),
        );
        self.inner.storage.add_job(&job).await?;

        match job.status {
            JobStatus::Waiting => self.inner.events.emit(QueueEvent::Waiting(job.clone())),
            JobStatus::Delayed => self.inner.events.emit(QueueEvent::Delayed(job.clone())),
            _ => {}
        }
        if job.repeat.is_some() {
            self.inner.repeat.arm(&job);
        }

        let state = self.inner.state.lock().await;
        if !state.paused && !state.shutting_down {
            self.inner.scheduler.start();
        }
        Ok(job.id)
    }

    /// Latest committed state of a main-store job.
    pub async fn get_job(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        Ok(self.inner.storage.get_job(id).await?)
    }

    pub async fn get_all_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.inner.storage.get_all_jobs().await?)
    }

    /// Snapshot of the dead-letter queue.
    pub async fn get_failed_jobs(&self) -> Result<Vec<Job>, QueueError> {
        Ok(self.inner.dead_letter.jobs().await?)
    }

    pub async fn remove_job(&self, id: JobId) -> Result<bool, QueueError> {
        let removed = self.inner.storage.remove_job(id).await?;
        if removed {
            self.inner.state.lock().await.completed.remove(&id);
        }
        Ok(removed)
    }

    /// Pulls a job out of the dead-letter queue and re-enqueues it with a
    /// clean slate. Returns whether the id was found there.
    pub async fn reprocess_failed(&self, id: JobId) -> Result<bool, QueueError> {
        let Some(reset) = self.inner.dead_letter.remove(id).await? else {
            return Ok(false);
        };
        self.inner.storage.add_job(&reset).await?;
        Ok(true)
    }

    /// Stops dispatching; in-flight work continues.
    pub async fn pause(&self) {
        self.inner.state.lock().await.paused = true;
        self.inner.scheduler.stop();
    }

    pub async fn resume(&self) {
        let mut state = self.inner.state.lock().await;
        if state.shutting_down {
            return;
        }
        state.paused = false;
        self.inner.scheduler.start();
    }

    /// Resolves once no job is runnable (`pending`, `waiting` or `delayed`)
    /// and nothing is in flight, then emits `drained`.
    pub async fn drain(&self) -> Result<(), QueueError> {
        loop {
            if self.inner.state.lock().await.active.is_empty() {
                let jobs = self.inner.storage.get_all_jobs().await?;
                let none_runnable = jobs.iter().all(|job| {
                    !matches!(
                        job.status,
                        JobStatus::Pending | JobStatus::Waiting | JobStatus::Delayed
                    )
                });
                if none_runnable && self.inner.state.lock().await.active.is_empty() {
                    self.inner.events.emit(QueueEvent::Drained);
                    return Ok(());
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Physically removes `completed` jobs older than `max_age`. Returns
    /// how many were removed.
    pub async fn clean(&self, max_age: Duration) -> Result<usize, QueueError> {
        let now = Utc::now();
        let max_age = TimeDelta::from_std(max_age).unwrap_or(TimeDelta::MAX);
        let mut removed = 0;
        for job in self.inner.storage.get_all_jobs().await? {
            let expired = job.status == JobStatus::Completed
                && job.completed_at.is_some_and(|at| now - at > max_age);
            if expired && self.inner.storage.remove_job(job.id).await? {
                self.inner.state.lock().await.completed.remove(&job.id);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let mut stats = QueueStats::default();
        for job in self.inner.storage.get_all_jobs().await? {
            match job.status {
                JobStatus::Waiting => stats.waiting += 1,
                JobStatus::Delayed => stats.delayed += 1,
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Stalled => stats.stalled += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => {}
            }
        }
        stats.failed = self.inner.dead_letter.count().await?;
        stats.active = self.inner.state.lock().await.active.len();
        Ok(stats)
    }

    /// Subscribes to the lifecycle event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Stops scheduling, cancels recurrence timers, waits for in-flight
    /// jobs, terminates workers and closes storage. Safe to call more than
    /// once; afterwards `add` fails with [`QueueError::ShuttingDown`].
    pub async fn shutdown(&self) -> Result<(), QueueError> {
        self.inner.state.lock().await.shutting_down = true;
        self.inner.scheduler.stop();
        self.inner.repeat.shutdown().await;

        loop {
            if self.inner.state.lock().await.active.is_empty() {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        self.inner.cancellation.cancel();

        let workers: Vec<_> = {
            let mut state = self.inner.state.lock().await;
            state.idle_workers.drain(..).collect()
        };
        futures::future::join_all(workers.into_iter().map(|worker| worker.terminate())).await;

        self.inner.storage.close().await?;
        tracing::debug!("queue shut down");
        Ok(())
    }
}

fn validate_repeat(config: &RepeatConfig) -> Result<(), QueueError> {
    match (&config.pattern, config.every) {
        (Some(pattern), _) => {
            CronSchedule::parse(pattern)?;
            Ok(())
        }
        (None, Some(every)) if every > 0 => Ok(()),
        (None, Some(_)) => Err(QueueError::ConfigInvalid(
            "repeat.every must be positive".to_owned(),
        )),
        (None, None) => Err(QueueError::ConfigInvalid(
            "repeat requires either `every` or `pattern`".to_owned(),
        )),
    }
}

async fn dispatch_loop(inner: Arc<Inner>, mut offers: mpsc::UnboundedReceiver<Job>) {
    loop {
        tokio::select! {
            _ = inner.cancellation.cancelled() => break,
            offer = offers.recv() => match offer {
                Some(job) => inner.clone().try_dispatch(job).await,
                None => break,
            }
        }
    }
}

async fn progress_loop(inner: Arc<Inner>, mut updates: mpsc::UnboundedReceiver<(JobId, u8)>) {
    loop {
        tokio::select! {
            _ = inner.cancellation.cancelled() => break,
            update = updates.recv() => match update {
                Some((id, value)) => inner.record_progress(id, value).await,
                None => break,
            }
        }
    }
}

impl Inner {
    /// Applies the admission rules to one scheduler offer. Any veto simply
    /// leaves the job `pending` for a later tick.
    async fn try_dispatch(self: Arc<Self>, offer: Job) {
        // The offer is a snapshot; work from the latest committed record.
        let mut job = match self.storage.get_job(offer.id).await {
            Ok(Some(job)) if job.status == JobStatus::Pending => job,
            Ok(_) => return,
            Err(err) => {
                self.events.emit(QueueEvent::Error(err.to_string()));
                return;
            }
        };

        let handler;
        {
            let mut state = self.state.lock().await;
            if state.shutting_down {
                return;
            }
            if state.active.len() >= self.config.concurrency {
                return;
            }
            if state.active.contains(&job.id) {
                return;
            }
            handler = match &state.handler {
                Some(handler) => handler.clone(),
                None => return,
            };
            if !job.dependencies_satisfied(&state.completed) {
                return;
            }
            if let Some(limiter) = state.limiter.as_mut() {
                if !limiter.consume() {
                    return;
                }
            }
            state.active.insert(job.id);
        }

        job.mark_processing(Utc::now());
        if let Err(err) = self.storage.update_job(&job).await {
            tracing::warn!(%err, job_id = %job.id, "failed to persist dispatch");
            self.events.emit(QueueEvent::Error(err.to_string()));
            self.state.lock().await.active.remove(&job.id);
            return;
        }
        self.events.emit(QueueEvent::Active(job.clone()));

        let worker = self.state.lock().await.idle_workers.pop();
        let inner = self.clone();
        tokio::spawn(async move { inner.run_job(job, worker, handler).await });
    }

    async fn run_job(
        self: Arc<Self>,
        job: Job,
        worker: Option<Box<dyn WorkerHandle>>,
        handler: String,
    ) {
        let mut worker = match worker {
            Some(worker) => worker,
            None => match self.factory.create(&handler).await {
                Ok(worker) => worker,
                Err(err) => {
                    // Init failures consume a retry attempt like any other
                    // execution failure.
                    tracing::warn!(%err, job_id = %job.id, "failed to initialise worker");
                    self.finish_job(job, ExecutionResult::failure(err.to_string()))
                        .await;
                    return;
                }
            },
        };

        let result = worker.execute(&job, self.progress.clone()).await;

        if worker.is_initialized() {
            self.state.lock().await.idle_workers.push(worker);
        } else {
            worker.terminate().await;
        }
        self.finish_job(job, result).await;
    }

    async fn finish_job(&self, job: Job, result: ExecutionResult) {
        let now = Utc::now();
        // Progress updates may have bumped the record since dispatch.
        let mut current = match self.storage.get_job(job.id).await {
            Ok(Some(latest)) => latest,
            _ => job,
        };

        if result.success {
            current.mark_completed(result.value.clone(), now);
            if let Err(err) = self.storage.update_job(&current).await {
                tracing::warn!(%err, job_id = %current.id, "failed to persist completion");
                self.events.emit(QueueEvent::Error(err.to_string()));
            }
            {
                let mut state = self.state.lock().await;
                state.active.remove(&current.id);
                state.completed.insert(current.id);
            }
            self.events.emit(QueueEvent::Completed {
                job: current.clone(),
                result: result.value,
            });
            self.release_dependents().await;
        } else {
            let error = result
                .error
                .unwrap_or_else(|| "unknown execution error".to_owned());
            let retry_at = self
                .config
                .retry
                .backoff
                .next_run_at(current.attempts + 1, now);
            current.record_failure(error.clone(), retry_at, now);

            if current.status == JobStatus::Failed {
                tracing::warn!(job_id = %current.id, attempts = current.attempts, %error, "job exhausted its attempts");
                if let Err(err) = self.dead_letter.add(&current).await {
                    tracing::warn!(%err, job_id = %current.id, "failed to move job to dead letter");
                    self.events.emit(QueueEvent::Error(err.to_string()));
                }
                self.events.emit(QueueEvent::Failed {
                    job: current.clone(),
                    error,
                });
            } else {
                tracing::debug!(job_id = %current.id, attempts = current.attempts, retry_at = %retry_at, "retry armed");
                if let Err(err) = self.storage.update_job(&current).await {
                    tracing::warn!(%err, job_id = %current.id, "failed to persist retry");
                    self.events.emit(QueueEvent::Error(err.to_string()));
                }
            }
            self.state.lock().await.active.remove(&current.id);
        }
    }

    /// Flips `waiting` jobs whose dependency set is now satisfied.
    async fn release_dependents(&self) {
        let completed = self.state.lock().await.completed.clone();
        let jobs = match self.storage.get_all_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                self.events.emit(QueueEvent::Error(err.to_string()));
                return;
            }
        };
        let now = Utc::now();
        for mut job in jobs {
            if job.status == JobStatus::Waiting && job.dependencies_satisfied(&completed) {
                job.mark_pending(now);
                if let Err(err) = self.storage.update_job(&job).await {
                    tracing::warn!(%err, job_id = %job.id, "failed to release dependent job");
                    self.events.emit(QueueEvent::Error(err.to_string()));
                }
            }
        }
    }

    async fn record_progress(&self, id: JobId, value: u8) {
        if let Ok(Some(mut job)) = self.storage.get_job(id).await {
            // A late update must not clobber a terminal record.
            if job.status.is_terminal() {
                return;
            }
            job.set_progress(value, Utc::now());
            if self.storage.update_job(&job).await.is_ok() {
                self.events.emit(QueueEvent::Progress {
                    progress: job.progress,
                    job,
                });
            }
        }
    }

    fn spawn_stalled_sweeper(self: Arc<Self>) {
        let token = self.cancellation.clone();
        let interval = self.config.stalled_interval;
        let inner = self;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick of an interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => inner.sweep_stalled().await,
                }
            }
        });
    }

    /// Marks `processing` jobs older than the stalled threshold. This is
    /// observational: the worker keeps running and the eventual result
    /// still lands through the normal path.
    async fn sweep_stalled(&self) {
        let now = Utc::now();
        let threshold =
            TimeDelta::from_std(self.config.stalled_interval).unwrap_or(TimeDelta::MAX);
        let jobs = match self.storage.get_all_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                self.events.emit(QueueEvent::Error(err.to_string()));
                return;
            }
        };
        for mut job in jobs {
            let stalled = job.status == JobStatus::Processing
                && job.started_at.is_some_and(|at| now - at > threshold);
            if stalled {
                job.mark_stalled(now);
                if let Err(err) = self.storage.update_job(&job).await {
                    tracing::warn!(%err, job_id = %job.id, "failed to persist stall");
                    self.events.emit(QueueEvent::Error(err.to_string()));
                    continue;
                }
                tracing::warn!(job_id = %job.id, "job stalled");
                self.events.emit(QueueEvent::Stalled(job));
            }
        }
    }
}
