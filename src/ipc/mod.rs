pub mod channel;
pub mod paths;

pub use channel::{IpcChannel, POLL_INTERVAL_MS};
pub use paths::ChannelPaths;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("ipc io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid ipc envelope in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    JobInput,
    JobResult,
    OutgoingEvent,
    Request,
    Response,
    Heartbeat,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::JobInput => "job_input",
            Self::JobResult => "job_result",
            Self::OutgoingEvent => "outgoing_event",
            Self::Request => "request",
            Self::Response => "response",
            Self::Heartbeat => "heartbeat",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpcEnvelope {
    pub kind: EnvelopeKind,
    pub correlation_id: String,
    pub payload: Value,
    pub timestamp: i64,
}

/// Worker-side activity states mirrored into `status.json`. The sandbox
/// overwrites this record; the host only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerActivity {
    Starting,
    Idle,
    Processing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    pub activity: WorkerActivity,
    #[serde(default)]
    pub request_started_at: Option<i64>,
    pub updated_at: i64,
}
