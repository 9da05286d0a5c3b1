use chrono::TimeDelta;

use super::{JobId, RepeatConfig};

/// Per-job options supplied at enqueue time.
///
/// # Example
///
/// ```
/// # use duroq::job::{JobOptions, RepeatConfig};
/// # use chrono::TimeDelta;
/// let options = JobOptions::default()
///     .with_priority(10)
///     .with_delay(TimeDelta::seconds(30))
///     .with_repeat(RepeatConfig::every(TimeDelta::minutes(5)).with_limit(12));
/// ```
#[derive(Debug, Clone)]
pub struct JobOptions {
    priority: i32,
    delay: TimeDelta,
    repeat: Option<RepeatConfig>,
    depends_on: Vec<JobId>,
    job_id: Option<JobId>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            priority: 0,
            delay: TimeDelta::zero(),
            repeat: None,
            depends_on: Vec::new(),
            job_id: None,
        }
    }
}

impl JobOptions {
    /// Higher-priority jobs are dispatched before lower-priority ones.
    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    /// Holds the job in `delayed` until the delay has elapsed.
    pub fn with_delay(self, delay: TimeDelta) -> Self {
        Self { delay, ..self }
    }

    pub fn with_repeat(self, repeat: RepeatConfig) -> Self {
        Self {
            repeat: Some(repeat),
            ..self
        }
    }

    /// The job stays in `waiting` until every listed job has completed.
    pub fn with_dependencies(self, depends_on: Vec<JobId>) -> Self {
        Self { depends_on, ..self }
    }

    pub fn add_dependency(self, id: JobId) -> Self {
        let mut depends_on = self.depends_on;
        depends_on.push(id);
        Self { depends_on, ..self }
    }

    /// Uses an explicit id instead of a generated one.
    pub fn with_job_id(self, job_id: JobId) -> Self {
        Self {
            job_id: Some(job_id),
            ..self
        }
    }

    pub(crate) fn priority(&self) -> i32 {
        self.priority
    }

    pub(crate) fn delay(&self) -> TimeDelta {
        self.delay
    }

    pub(crate) fn repeat(&self) -> Option<&RepeatConfig> {
        self.repeat.as_ref()
    }

    pub(crate) fn depends_on(&self) -> &[JobId] {
        &self.depends_on
    }

    pub(crate) fn job_id(&self) -> Option<JobId> {
        self.job_id
    }
}
