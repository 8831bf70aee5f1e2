pub mod health;
pub mod output;
pub mod process;
pub mod supervisor;
pub mod worker;

pub use health::{classify_worker_health, WorkerHealth};
pub use output::{truncate_captured, CapturedOutput, OUTPUT_TRUNCATION_MARKER};
pub use supervisor::{ExecutionReport, ExecutionSupervisor, JobInputPayload};
pub use worker::{HealthAlert, WorkerPool};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("sandbox io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Ipc(#[from] crate::ipc::IpcError),
    #[error("sandbox binary `{binary}` not found")]
    MissingBinary { binary: String },
    #[error("failed to spawn sandbox process `{binary}`: {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed job payload: {reason}")]
    MalformedJob { reason: String },
    #[error(
        "worker for `{conversation_key}` hit the crash loop threshold \
         ({restarts} restarts in window); manual intervention required"
    )]
    CrashLoop {
        conversation_key: String,
        restarts: u32,
    },
}

/// How a batch is executed: a fresh process per run, or a long-lived worker
/// reused across runs for the same conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    #[default]
    OneShot,
    Persistent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecStatus {
    Queued,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

impl ExecStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Running)
    }
}
