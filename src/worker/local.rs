//! In-process workers.
//!
//! [`LocalWorkerFactory`] runs processors directly on the host's runtime
//! instead of forking a child. A panicking processor no longer takes down
//! an isolated process (only its own task), so this is primarily for tests
//! and for hosts that knowingly trade isolation for simplicity.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::child::{JobContext, Processor, ProcessorRegistry};
use super::ipc::{ChildMessage, ExecutionResult};
use super::{WorkerError, WorkerFactory, WorkerHandle};
use crate::job::{Job, JobId};

pub struct LocalWorkerFactory {
    registry: ProcessorRegistry,
}

impl LocalWorkerFactory {
    pub fn new(registry: ProcessorRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl WorkerFactory for LocalWorkerFactory {
    async fn create(&self, handler: &str) -> Result<Box<dyn WorkerHandle>, WorkerError> {
        Ok(Box::new(LocalWorker {
            processor: self.registry.get(handler),
            handler: handler.to_owned(),
            busy: false,
        }))
    }
}

struct LocalWorker {
    processor: Option<Arc<dyn Processor>>,
    handler: String,
    busy: bool,
}

#[async_trait]
impl WorkerHandle for LocalWorker {
    async fn execute(
        &mut self,
        job: &Job,
        progress: mpsc::UnboundedSender<(JobId, u8)>,
    ) -> ExecutionResult {
        let Some(processor) = self.processor.clone() else {
            return ExecutionResult::failure(format!("unknown handler `{}`", self.handler));
        };
        self.busy = true;

        // Bridge the job facade's progress messages to the runtime channel.
        let (outbound, mut rx) = mpsc::unbounded_channel();
        let forwarder = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let ChildMessage::Progress {
                    job_id,
                    progress: value,
                } = message
                {
                    let _ = progress.send((job_id, value));
                }
            }
        });

        let ctx = JobContext::new(job.clone(), outbound);
        // Run on a separate task so a panic is contained like a crashed
        // child would be.
        let outcome = tokio::spawn(async move { processor.process(ctx).await }).await;
        let result = match outcome {
            Ok(Ok(value)) => ExecutionResult::success(value),
            Ok(Err(err)) => ExecutionResult::failure(err.to_string()),
            Err(join_error) => ExecutionResult::failure(panic_message(join_error)),
        };

        let _ = forwarder.await;
        self.busy = false;
        result
    }

    fn is_initialized(&self) -> bool {
        true
    }

    fn is_busy(&self) -> bool {
        self.busy
    }

    async fn terminate(self: Box<Self>) {}
}

fn panic_message(error: tokio::task::JoinError) -> String {
    let fallback = error.to_string();
    match error.try_into_panic() {
        Ok(panic) => panic
            .downcast_ref::<&str>()
            .map(ToString::to_string)
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or(fallback),
        Err(_) => fallback,
    }
}
