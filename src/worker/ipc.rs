//! IPC framing between the runtime and worker child processes.
//!
//! One JSON message per line over the child's stdin/stdout. The parent
//! sends [`ParentMessage`]s, the child answers with [`ChildMessage`]s.

use serde::{Deserialize, Serialize};

use crate::job::{Job, JobId};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ParentMessage {
    /// Selects the registered handler the worker will run jobs with.
    SetProcessor { handler: String },
    Execute { job: Job },
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub(crate) enum ChildMessage {
    Ready,
    Progress {
        #[serde(rename = "jobId")]
        job_id: JobId,
        progress: u8,
    },
    Result {
        #[serde(rename = "jobId")]
        job_id: JobId,
        result: ExecutionResult,
    },
}

/// Outcome of one job execution on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(value: serde_json::Value) -> Self {
        Self {
            success: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            value: None,
            error: Some(error.into()),
        }
    }
}
