//! The worker-side half of the execution protocol.
//!
//! A worker child is the host binary re-executed with
//! [`WORKER_ENV`](crate::worker::WORKER_ENV) set. The host builds a
//! [`ProcessorRegistry`] of named handlers and calls [`child_entrypoint`]
//! first thing in `main`; no code ever ships over the wire, the runtime
//! only selects a handler by name.
//!
//! ```no_run
//! use duroq::worker::{child_entrypoint, is_worker_process, ProcessorRegistry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = ProcessorRegistry::new().register_fn("send-email", |ctx| async move {
//!         ctx.update_progress(50);
//!         Ok(serde_json::json!({"sent": true}))
//!     });
//!     if is_worker_process() {
//!         child_entrypoint(registry).await?;
//!         return Ok(());
//!     }
//!     // ... construct and drive the queue ...
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use super::ipc::{ChildMessage, ExecutionResult, ParentMessage};
use super::WorkerError;
use crate::job::Job;

/// Error type processors report; the message is captured into `job.error`.
pub type ProcessorError = Box<dyn std::error::Error + Send + Sync>;

/// User-supplied job logic, executed inside a worker process.
///
/// An uncaught panic tears down the whole child; the runtime observes the
/// crash and routes it through the ordinary retry path.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, ProcessorError>;
}

struct FnProcessor<F>(F);

#[async_trait]
impl<F, Fut> Processor for FnProcessor<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, ProcessorError>> + Send,
{
    async fn process(&self, ctx: JobContext) -> Result<serde_json::Value, ProcessorError> {
        (self.0)(ctx).await
    }
}

/// The named handlers a worker binary was built with.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    handlers: HashMap<String, Arc<dyn Processor>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, processor: impl Processor) -> Self {
        self.handlers.insert(name.into(), Arc::new(processor));
        self
    }

    /// Registers a closure as a handler.
    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ProcessorError>> + Send,
    {
        self.register(name, FnProcessor(f))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Processor>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }
}

/// The job facade handed to a processor.
#[derive(Clone)]
pub struct JobContext {
    job: Job,
    outbound: mpsc::UnboundedSender<ChildMessage>,
}

impl JobContext {
    pub(crate) fn new(job: Job, outbound: mpsc::UnboundedSender<ChildMessage>) -> Self {
        Self { job, outbound }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Reports progress back to the runtime; clamped to 0..=100.
    pub fn update_progress(&self, progress: u8) {
        let _ = self.outbound.send(ChildMessage::Progress {
            job_id: self.job.id,
            progress: progress.min(100),
        });
    }

    /// Worker logs go to the child's stderr, which the runtime leaves
    /// connected to the host's.
    pub fn log(&self, message: &str) {
        eprintln!("[job {}] {message}", self.job.id);
    }
}

/// Runs the worker loop over the child's stdio. Returns when the runtime
/// sends `terminate` or closes the pipe.
pub async fn child_entrypoint(registry: ProcessorRegistry) -> Result<(), WorkerError> {
    run_child_loop(tokio::io::stdin(), tokio::io::stdout(), registry).await
}

/// Protocol loop, generic over the transport so it can be exercised
/// in-process.
pub(crate) async fn run_child_loop<R, W>(
    reader: R,
    writer: W,
    registry: ProcessorRegistry,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbound, rx) = mpsc::unbounded_channel();
    // A single writer task serialises result and progress lines.
    let writer_task = tokio::spawn(write_loop(writer, rx));

    let _ = outbound.send(ChildMessage::Ready);

    let mut processor: Option<Arc<dyn Processor>> = None;
    let mut handler_name = String::new();
    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let message = match serde_json::from_str::<ParentMessage>(&line) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(%err, "worker received unparseable message");
                continue;
            }
        };
        match message {
            ParentMessage::SetProcessor { handler } => {
                processor = registry.get(&handler);
                if processor.is_none() {
                    tracing::warn!(handler, "no registered processor with this name");
                }
                handler_name = handler;
            }
            ParentMessage::Execute { job } => {
                let job_id = job.id;
                let result = match &processor {
                    Some(processor) => {
                        let ctx = JobContext::new(job, outbound.clone());
                        match processor.process(ctx).await {
                            Ok(value) => ExecutionResult::success(value),
                            Err(err) => ExecutionResult::failure(err.to_string()),
                        }
                    }
                    None => {
                        ExecutionResult::failure(format!("unknown handler `{handler_name}`"))
                    }
                };
                if outbound
                    .send(ChildMessage::Result { job_id, result })
                    .is_err()
                {
                    break;
                }
            }
            ParentMessage::Terminate => break,
        }
    }

    drop(outbound);
    writer_task.await.map_err(|_| WorkerError::ChannelClosed)??;
    Ok(())
}

async fn write_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<ChildMessage>,
) -> Result<(), WorkerError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use chrono::Utc;
    use serde_json::json;

    fn job(payload: serde_json::Value) -> Job {
        Job::new(payload, JobOptions::default(), 3, Utc::now())
    }

    async fn next_message<R: AsyncRead + Unpin>(
        lines: &mut tokio::io::Lines<BufReader<R>>,
    ) -> ChildMessage {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &ParentMessage) {
        let mut line = serde_json::to_string(message).unwrap();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
        writer.flush().await.unwrap();
    }

    fn echo_registry() -> ProcessorRegistry {
        ProcessorRegistry::new().register_fn("echo", |ctx| async move {
            Ok(json!({"echo": ctx.payload().clone()}))
        })
    }

    #[tokio::test]
    async fn emits_ready_then_executes_and_reports_result() {
        let (parent_io, child_io) = tokio::io::duplex(4096);
        let (child_read, child_write) = tokio::io::split(child_io);
        let loop_task = tokio::spawn(run_child_loop(child_read, child_write, echo_registry()));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut lines = BufReader::new(parent_read).lines();

        assert_eq!(next_message(&mut lines).await, ChildMessage::Ready);

        send(
            &mut parent_write,
            &ParentMessage::SetProcessor {
                handler: "echo".to_owned(),
            },
        )
        .await;
        let job = job(json!({"v": 1}));
        let job_id = job.id;
        send(&mut parent_write, &ParentMessage::Execute { job }).await;

        match next_message(&mut lines).await {
            ChildMessage::Result { job_id: id, result } => {
                assert_eq!(id, job_id);
                assert!(result.success);
                assert_eq!(result.value.unwrap()["echo"]["v"], 1);
            }
            other => panic!("unexpected message: {other:?}"),
        }

        send(&mut parent_write, &ParentMessage::Terminate).await;
        loop_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn progress_messages_flow_during_execution() {
        let registry = ProcessorRegistry::new().register_fn("steps", |ctx| async move {
            ctx.update_progress(30);
            ctx.update_progress(250);
            Ok(json!(null))
        });

        let (parent_io, child_io) = tokio::io::duplex(4096);
        let (child_read, child_write) = tokio::io::split(child_io);
        let loop_task = tokio::spawn(run_child_loop(child_read, child_write, registry));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut lines = BufReader::new(parent_read).lines();
        assert_eq!(next_message(&mut lines).await, ChildMessage::Ready);

        send(
            &mut parent_write,
            &ParentMessage::SetProcessor {
                handler: "steps".to_owned(),
            },
        )
        .await;
        let job = job(json!(null));
        let job_id = job.id;
        send(&mut parent_write, &ParentMessage::Execute { job }).await;

        assert_eq!(
            next_message(&mut lines).await,
            ChildMessage::Progress {
                job_id,
                progress: 30
            }
        );
        // Progress beyond 100 is clamped at the facade.
        assert_eq!(
            next_message(&mut lines).await,
            ChildMessage::Progress {
                job_id,
                progress: 100
            }
        );
        assert!(matches!(
            next_message(&mut lines).await,
            ChildMessage::Result { .. }
        ));

        send(&mut parent_write, &ParentMessage::Terminate).await;
        loop_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn processor_error_becomes_failed_result() {
        let registry = ProcessorRegistry::new()
            .register_fn("fails", |_ctx| async move { Err("payload rejected".into()) });

        let (parent_io, child_io) = tokio::io::duplex(4096);
        let (child_read, child_write) = tokio::io::split(child_io);
        tokio::spawn(run_child_loop(child_read, child_write, registry));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut lines = BufReader::new(parent_read).lines();
        assert_eq!(next_message(&mut lines).await, ChildMessage::Ready);

        send(
            &mut parent_write,
            &ParentMessage::SetProcessor {
                handler: "fails".to_owned(),
            },
        )
        .await;
        send(&mut parent_write, &ParentMessage::Execute { job: job(json!(null)) }).await;

        match next_message(&mut lines).await {
            ChildMessage::Result { result, .. } => {
                assert!(!result.success);
                assert_eq!(result.error.as_deref(), Some("payload rejected"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_handler_fails_execution_without_crashing() {
        let (parent_io, child_io) = tokio::io::duplex(4096);
        let (child_read, child_write) = tokio::io::split(child_io);
        tokio::spawn(run_child_loop(child_read, child_write, echo_registry()));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut lines = BufReader::new(parent_read).lines();
        assert_eq!(next_message(&mut lines).await, ChildMessage::Ready);

        send(
            &mut parent_write,
            &ParentMessage::SetProcessor {
                handler: "no-such-handler".to_owned(),
            },
        )
        .await;
        send(&mut parent_write, &ParentMessage::Execute { job: job(json!(null)) }).await;

        match next_message(&mut lines).await {
            ChildMessage::Result { result, .. } => {
                assert!(!result.success);
                assert!(result.error.unwrap().contains("no-such-handler"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn junk_lines_are_skipped() {
        let (parent_io, child_io) = tokio::io::duplex(4096);
        let (child_read, child_write) = tokio::io::split(child_io);
        let loop_task = tokio::spawn(run_child_loop(child_read, child_write, echo_registry()));

        let (parent_read, mut parent_write) = tokio::io::split(parent_io);
        let mut lines = BufReader::new(parent_read).lines();
        assert_eq!(next_message(&mut lines).await, ChildMessage::Ready);

        parent_write.write_all(b"not json\n\n").await.unwrap();
        send(&mut parent_write, &ParentMessage::Terminate).await;
        loop_task.await.unwrap().unwrap();
    }
}
