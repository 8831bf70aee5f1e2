use super::{EnvelopeKind, IpcError};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory layout of one host/sandbox channel. Every execution or
/// persistent worker owns exactly one channel root at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPaths {
    pub root: PathBuf,
}

impl ChannelPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn inbox(&self) -> PathBuf {
        self.root.join("inbox")
    }

    pub fn outbox(&self) -> PathBuf {
        self.root.join("outbox")
    }

    pub fn requests(&self) -> PathBuf {
        self.root.join("requests")
    }

    pub fn snapshots(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    pub fn heartbeat_file(&self) -> PathBuf {
        self.root.join("heartbeat.json")
    }

    pub fn status_file(&self) -> PathBuf {
        self.root.join("status.json")
    }

    pub fn dir_for(&self, kind: EnvelopeKind) -> PathBuf {
        match kind {
            EnvelopeKind::JobInput => self.inbox(),
            EnvelopeKind::JobResult | EnvelopeKind::OutgoingEvent => self.outbox(),
            EnvelopeKind::Request | EnvelopeKind::Response => self.requests(),
            EnvelopeKind::Heartbeat => self.root.clone(),
        }
    }

    pub fn bootstrap(&self) -> Result<(), IpcError> {
        for dir in [
            self.inbox(),
            self.outbox(),
            self.requests(),
            self.snapshots(),
        ] {
            fs::create_dir_all(&dir).map_err(|source| IpcError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

pub(super) fn io_err(path: &Path, source: std::io::Error) -> IpcError {
    IpcError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(super) fn parse_err(path: &Path, source: serde_json::Error) -> IpcError {
    IpcError::Parse {
        path: path.display().to_string(),
        source,
    }
}
