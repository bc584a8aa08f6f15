//! IPC protocol between the pool and its worker processes.
//!
//! Messages are JSON-serialized and newline-delimited. Every job-related
//! response carries the job id so results can be matched without relying on
//! pipe ordering.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request from parent to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkRequest {
    /// Run a registered task.
    #[serde(rename = "run")]
    Run {
        job_id: u64,
        /// Name the task was registered under.
        task: String,
        args: Value,
    },

    /// Graceful shutdown request.
    #[serde(rename = "exit")]
    Exit,
}

/// Response from worker to parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkResponse {
    /// Worker finished initialization and accepts jobs.
    #[serde(rename = "ready")]
    Ready { pid: i32 },

    /// The initializer failed; the worker exits right after sending this.
    #[serde(rename = "init_failed")]
    InitFailed { message: String },

    /// Task completed successfully.
    #[serde(rename = "result")]
    Result { job_id: u64, value: Value },

    /// Task raised an error, or the request could not be understood
    /// (in which case there is no job id).
    #[serde(rename = "error")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<u64>,
        message: String,
    },
}

impl WorkRequest {
    pub fn run(job_id: u64, task: impl Into<String>, args: Value) -> Self {
        Self::Run {
            job_id,
            task: task.into(),
            args,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkRequest serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}

impl WorkResponse {
    pub fn result(job_id: u64, value: Value) -> Self {
        Self::Result { job_id, value }
    }

    pub fn error(job_id: Option<u64>, message: impl Into<String>) -> Self {
        Self::Error {
            job_id,
            message: message.into(),
        }
    }

    /// Job id the response refers to, if any.
    pub fn job_id(&self) -> Option<u64> {
        match self {
            Self::Result { job_id, .. } => Some(*job_id),
            Self::Error { job_id, .. } => *job_id,
            Self::Ready { .. } | Self::InitFailed { .. } => None,
        }
    }

    /// Serialize to JSON line (with newline).
    pub fn to_line(&self) -> String {
        let mut json = serde_json::to_string(self).expect("WorkResponse serialization failed");
        json.push('\n');
        json
    }

    /// Deserialize from JSON line.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }
}
