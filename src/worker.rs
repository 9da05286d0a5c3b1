//! Process-isolated job execution.
//!
//! Each worker owns one long-lived child process: the host binary
//! re-executed with [`WORKER_ENV`] set, speaking the line-oriented JSON
//! protocol in [`ipc`]. Isolating user code this way means an uncaught
//! panic, runaway allocation or infinite loop only degrades one worker; a
//! crashed child surfaces as an ordinary failed execution and flows through
//! the same retry path as a processor error.
//!
//! The runtime acquires workers through the [`WorkerFactory`] seam.
//! Production uses [`ProcessWorkerFactory`]; [`local::LocalWorkerFactory`]
//! runs processors on the host runtime instead, for tests and hosts that
//! accept losing process isolation.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;

use crate::config::WorkerConfig;
use crate::job::{Job, JobId};

pub mod child;
pub(crate) mod ipc;
pub mod local;

pub use child::{
    child_entrypoint, JobContext, Processor, ProcessorError, ProcessorRegistry,
};
pub use ipc::ExecutionResult;

use ipc::{ChildMessage, ParentMessage};

/// Set in a child's environment to make the host binary enter worker mode.
pub const WORKER_ENV: &str = "DUROQ_WORKER";

/// Whether the current process was spawned as a worker child.
pub fn is_worker_process() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

pub(crate) const INIT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const TERMINATE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker failed to become ready within {}s", INIT_TIMEOUT.as_secs())]
    InitTimeout,
    #[error("worker crashed: code={code:?}, signal={signal:?}")]
    Crashed {
        code: Option<i32>,
        signal: Option<i32>,
    },
    #[error("worker channel closed")]
    ChannelClosed,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
}

/// One worker as the runtime sees it: executes a single job at a time and
/// can be terminated. Implementations fold crashes into failed
/// [`ExecutionResult`]s and flag themselves uninitialised instead of
/// erroring.
#[async_trait]
pub trait WorkerHandle: Send {
    async fn execute(
        &mut self,
        job: &Job,
        progress: mpsc::UnboundedSender<(JobId, u8)>,
    ) -> ExecutionResult;

    fn is_initialized(&self) -> bool;

    fn is_busy(&self) -> bool;

    async fn terminate(self: Box<Self>);
}

/// Creates workers on demand; the runtime grows its pool lazily up to the
/// configured concurrency.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    async fn create(&self, handler: &str) -> Result<Box<dyn WorkerHandle>, WorkerError>;
}

/// Parent half of the worker protocol, generic over the transport.
pub(crate) struct WorkerConnection<R, W> {
    lines: Lines<BufReader<R>>,
    writer: W,
}

impl<R, W> WorkerConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub(crate) fn new(reader: R, writer: W) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            writer,
        }
    }

    async fn send(&mut self, message: &ParentMessage) -> Result<(), WorkerError> {
        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// `None` means the child closed its end of the pipe.
    async fn recv(&mut self) -> Result<Option<ChildMessage>, WorkerError> {
        while let Some(line) = self.lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(&line) {
                Ok(message) => return Ok(Some(message)),
                // Processor code may print to stdout; skip anything that is
                // not a protocol message.
                Err(err) => tracing::debug!(%err, "skipping non-protocol line on worker stdout"),
            }
        }
        Ok(None)
    }

    pub(crate) async fn initialize(&mut self, handler: &str) -> Result<(), WorkerError> {
        self.initialize_with_timeout(handler, INIT_TIMEOUT).await
    }

    async fn initialize_with_timeout(
        &mut self,
        handler: &str,
        timeout: Duration,
    ) -> Result<(), WorkerError> {
        tokio::time::timeout(timeout, async {
            loop {
                match self.recv().await? {
                    Some(ChildMessage::Ready) => return Ok(()),
                    Some(_) => continue,
                    None => return Err(WorkerError::ChannelClosed),
                }
            }
        })
        .await
        .map_err(|_| WorkerError::InitTimeout)??;

        self.send(&ParentMessage::SetProcessor {
            handler: handler.to_owned(),
        })
        .await
    }

    pub(crate) async fn execute(
        &mut self,
        job: &Job,
        progress: &mpsc::UnboundedSender<(JobId, u8)>,
    ) -> Result<ExecutionResult, WorkerError> {
        self.send(&ParentMessage::Execute { job: job.clone() })
            .await?;
        loop {
            match self.recv().await? {
                Some(ChildMessage::Progress {
                    job_id,
                    progress: value,
                }) => {
                    let _ = progress.send((job_id, value));
                }
                Some(ChildMessage::Result { job_id, result }) if job_id == job.id => {
                    return Ok(result);
                }
                Some(message) => {
                    tracing::debug!(?message, "ignoring stale worker message");
                }
                None => return Err(WorkerError::ChannelClosed),
            }
        }
    }

    async fn send_terminate(&mut self) -> Result<(), WorkerError> {
        self.send(&ParentMessage::Terminate).await
    }
}

/// A worker backed by a real child process.
pub(crate) struct ProcessWorker {
    child: Child,
    conn: WorkerConnection<ChildStdout, ChildStdin>,
    initialized: bool,
    busy: bool,
}

impl ProcessWorker {
    /// Forks the worker child and completes the init handshake: wait for
    /// `ready` (5 second deadline), then select the handler.
    pub(crate) async fn spawn(config: &WorkerConfig, handler: &str) -> Result<Self, WorkerError> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe()?,
        };
        let mut child = Command::new(program)
            .args(&config.args)
            .env(WORKER_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // Worker logs stay on the host's stderr.
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or(WorkerError::ChannelClosed)?;
        let stdout = child.stdout.take().ok_or(WorkerError::ChannelClosed)?;
        let mut conn = WorkerConnection::new(stdout, stdin);

        match conn.initialize(handler).await {
            Ok(()) => Ok(Self {
                child,
                conn,
                initialized: true,
                busy: false,
            }),
            Err(err) => {
                let _ = child.start_kill();
                let status = child.wait().await.ok();
                Err(match err {
                    // The child exiting during init reads as a crash, not a
                    // protocol error.
                    WorkerError::ChannelClosed | WorkerError::Io(_) => crashed(status),
                    other => other,
                })
            }
        }
    }
}

fn crashed(status: Option<std::process::ExitStatus>) -> WorkerError {
    #[cfg(unix)]
    let signal = {
        use std::os::unix::process::ExitStatusExt;
        status.and_then(|s| s.signal())
    };
    #[cfg(not(unix))]
    let signal = None;
    WorkerError::Crashed {
        code: status.and_then(|s| s.code()),
        signal,
    }
}

#[async_trait]
impl WorkerHandle for ProcessWorker {
    async fn execute(
        &mut self,
        job: &Job,
        progress: mpsc::UnboundedSender<(JobId, u8)>,
    ) -> ExecutionResult {
        self.busy = true;
        let result = match self.conn.execute(job, &progress).await {
            Ok(result) => result,
            Err(err) => {
                // The child went away mid-job. Resolve the execution as a
                // failure and mark this worker dead; the runtime will not
                // reuse it.
                self.initialized = false;
                let _ = self.child.start_kill();
                let status = self.child.wait().await.ok();
                let crash = match err {
                    WorkerError::ChannelClosed | WorkerError::Io(_) => crashed(status),
                    other => other,
                };
                tracing::warn!(job_id = %job.id, %crash, "worker died while executing");
                ExecutionResult::failure(crash.to_string())
            }
        };
        self.busy = false;
        result
    }

    fn is_initialized(&self) -> bool {
        self.initialized
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    /// Graceful kill, then a hard kill after five seconds.
    async fn terminate(mut self: Box<Self>) {
        if !self.initialized {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
            return;
        }
        let _ = self.conn.send_terminate().await;
        if tokio::time::timeout(TERMINATE_GRACE, self.child.wait())
            .await
            .is_err()
        {
            tracing::warn!("worker ignored graceful kill; killing hard");
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }
    }
}

pub(crate) struct ProcessWorkerFactory {
    config: WorkerConfig,
}

impl ProcessWorkerFactory {
    pub(crate) fn new(config: WorkerConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn create(&self, handler: &str) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        Ok(Box::new(ProcessWorker::spawn(&self.config, handler).await?))
    }
}
