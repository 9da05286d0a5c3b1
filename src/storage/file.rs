//! Append-only file implementation of [`Storage`].
//!
//! Two logs sit side by side: the main log at the configured path and a
//! dead-letter log at `<path>-dead-letter.log` (a trailing `.log` is
//! stripped before suffixing). Every record is one JSON object per line;
//! `add_job` and `update_job` both simply append, and on load later records
//! supersede earlier ones with the same id. An in-memory index holds the
//! latest version of each record; the file is the durable replay log.
//!
//! On `initialize` the logs are replayed line by line (unparseable lines are
//! skipped, not fatal), records found in `processing` are re-armed for
//! another attempt, and the main log is compacted. The main log is also
//! compacted whenever a record leaves it (`move_to_dead_letter`,
//! `remove_job`); the dead-letter log on `remove_from_dead_letter`.

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::Mutex;

use super::{Storage, StorageError};
use crate::job::{Job, JobId, JobStatus};

#[derive(Default)]
struct State {
    jobs: HashMap<JobId, Job>,
    dead: HashMap<JobId, Job>,
    main_log: Option<BufWriter<File>>,
    dead_log: Option<BufWriter<File>>,
    open: bool,
}

pub struct FileStorage {
    path: PathBuf,
    dead_path: PathBuf,
    inner: Mutex<State>,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let dead_path = dead_letter_path(&path);
        Self {
            path,
            dead_path,
            inner: Mutex::new(State::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dead_letter_path(&self) -> &Path {
        &self.dead_path
    }

    /// Rewrites the main log from the index and reopens the append stream.
    async fn compact_main(&self, state: &mut State) -> Result<(), StorageError> {
        rewrite_log(&self.path, state.jobs.values()).await?;
        state.main_log = Some(open_append(&self.path).await?);
        Ok(())
    }

    async fn compact_dead(&self, state: &mut State) -> Result<(), StorageError> {
        rewrite_log(&self.dead_path, state.dead.values()).await?;
        state.dead_log = Some(open_append(&self.dead_path).await?);
        Ok(())
    }
}

fn dead_letter_path(path: &Path) -> PathBuf {
    let raw = path.as_os_str().to_string_lossy();
    let stem = raw.strip_suffix(".log").unwrap_or(&raw);
    PathBuf::from(format!("{stem}-dead-letter.log"))
}

async fn load_log(path: &Path) -> Result<HashMap<JobId, Job>, StorageError> {
    let mut records = HashMap::new();
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(records),
        Err(err) => return Err(err.into()),
    };
    let mut lines = BufReader::new(file).lines();
    let mut line_number = 0usize;
    while let Some(line) = lines.next_line().await? {
        line_number += 1;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Job>(&line) {
            // Later records supersede earlier ones with the same id.
            Ok(job) => {
                records.insert(job.id, job);
            }
            Err(err) => {
                tracing::warn!(
                    %err,
                    line = line_number,
                    path = %path.display(),
                    "skipping unparseable record"
                );
            }
        }
    }
    Ok(records)
}

async fn rewrite_log<'a>(
    path: &Path,
    jobs: impl Iterator<Item = &'a Job>,
) -> Result<(), StorageError> {
    let mut contents = String::new();
    for job in jobs {
        contents.push_str(&serde_json::to_string(job)?);
        contents.push('\n');
    }
    fs::write(path, contents).await?;
    Ok(())
}

async fn open_append(path: &Path) -> Result<BufWriter<File>, StorageError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(BufWriter::new(file))
}

/// A write is durable once the stream has accepted the line.
async fn append(writer: &mut BufWriter<File>, job: &Job) -> Result<(), StorageError> {
    let mut line = serde_json::to_string(job)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[async_trait]
impl Storage for FileStorage {
    async fn initialize(&self) -> Result<(), StorageError> {
        let mut state = self.inner.lock().await;
        if state.open {
            return Ok(());
        }
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        state.jobs = load_log(&self.path).await?;
        state.dead = load_log(&self.dead_path).await?;

        let now = Utc::now();
        let mut recovered = 0usize;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Processing {
                job.recover(now);
                recovered += 1;
            }
        }
        if recovered > 0 {
            tracing::info!(recovered, "re-armed jobs found mid-flight on startup");
        }

        // Compacting on load keeps the replay log bounded.
        self.compact_main(&mut state).await?;
        state.dead_log = Some(open_append(&self.dead_path).await?);
        state.open = true;
        Ok(())
    }

    async fn add_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut state = self.inner.lock().await;
        if state.jobs.contains_key(&job.id) || state.dead.contains_key(&job.id) {
            return Err(StorageError::AlreadyExists(job.id));
        }
        let writer = state.main_log.as_mut().ok_or(StorageError::Closed)?;
        append(writer, job).await?;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<(), StorageError> {
        let mut state = self.inner.lock().await;
        if !state.jobs.contains_key(&job.id) {
            return Err(StorageError::NotFound(job.id));
        }
        let writer = state.main_log.as_mut().ok_or(StorageError::Closed)?;
        append(writer, job).await?;
        state.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let state = self.inner.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn get_all_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let state = self.inner.lock().await;
        Ok(state.jobs.values().cloned().collect())
    }

    async fn get_pending_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let state = self.inner.lock().await;
        let mut pending: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Pending && job.next_run_at <= now)
            .cloned()
            .collect();
        pending.sort_by_key(|job| job.next_run_at);
        Ok(pending)
    }

    async fn remove_job(&self, id: JobId) -> Result<bool, StorageError> {
        let mut state = self.inner.lock().await;
        if !state.open {
            return Err(StorageError::Closed);
        }
        if state.jobs.remove(&id).is_none() {
            return Ok(false);
        }
        self.compact_main(&mut state).await?;
        Ok(true)
    }

    async fn move_to_dead_letter(&self, job: &Job) -> Result<(), StorageError> {
        let mut state = self.inner.lock().await;
        if !state.open {
            return Err(StorageError::Closed);
        }
        let writer = state.dead_log.as_mut().ok_or(StorageError::Closed)?;
        append(writer, job).await?;
        state.dead.insert(job.id, job.clone());
        state.jobs.remove(&job.id);
        self.compact_main(&mut state).await?;
        Ok(())
    }

    async fn get_failed_jobs(&self) -> Result<Vec<Job>, StorageError> {
        let state = self.inner.lock().await;
        Ok(state.dead.values().cloned().collect())
    }

    async fn remove_from_dead_letter(&self, id: JobId) -> Result<Option<Job>, StorageError> {
        let mut state = self.inner.lock().await;
        if !state.open {
            return Err(StorageError::Closed);
        }
        let removed = state.dead.remove(&id);
        if removed.is_some() {
            self.compact_dead(&mut state).await?;
        }
        Ok(removed)
    }

    async fn close(&self) -> Result<(), StorageError> {
        let mut state = self.inner.lock().await;
        if !state.open {
            return Ok(());
        }
        if let Some(mut writer) = state.main_log.take() {
            writer.flush().await?;
        }
        if let Some(mut writer) = state.dead_log.take() {
            writer.flush().await?;
        }
        state.open = false;
        Ok(())
    }
}
