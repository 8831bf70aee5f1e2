use super::paths::{io_err, parse_err};
use super::{ChannelPaths, EnvelopeKind, IpcEnvelope, IpcError, StatusRecord};
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::sanitize_component;
use crate::shared::time::{now_millis, now_secs};
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant, SystemTime};

pub const POLL_INTERVAL_MS: u64 = 25;

/// File-based request/response and fire-and-forget protocol between the host
/// and one sandboxed execution. Envelope files become visible atomically and
/// are consumed exactly once; heartbeat/status files are overwritten in place
/// and read without consumption.
#[derive(Debug, Clone)]
pub struct IpcChannel {
    paths: ChannelPaths,
}

impl IpcChannel {
    pub fn new(paths: ChannelPaths) -> Self {
        Self { paths }
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self, IpcError> {
        let paths = ChannelPaths::new(root);
        paths.bootstrap()?;
        Ok(Self { paths })
    }

    pub fn paths(&self) -> &ChannelPaths {
        &self.paths
    }

    /// Writes a new envelope file. Heartbeats overwrite the single heartbeat
    /// file instead of accumulating.
    pub fn send(
        &self,
        kind: EnvelopeKind,
        correlation_id: &str,
        payload: Value,
    ) -> Result<PathBuf, IpcError> {
        let envelope = IpcEnvelope {
            kind,
            correlation_id: correlation_id.to_string(),
            payload,
            timestamp: now_millis(),
        };
        let body = serde_json::to_vec_pretty(&envelope)
            .map_err(|source| parse_err(&self.paths.root, source))?;

        let path = if kind == EnvelopeKind::Heartbeat {
            self.paths.heartbeat_file()
        } else {
            self.paths.dir_for(kind).join(envelope_filename(
                kind,
                correlation_id,
                envelope.timestamp,
            ))
        };
        atomic_write_file(&path, &body).map_err(|source| io_err(&path, source))?;
        Ok(path)
    }

    /// Polls for the oldest envelope of `kind` until `timeout` elapses.
    /// Returns `Ok(None)` on timeout; a malformed envelope is quarantined and
    /// surfaced as an error.
    pub fn poll(
        &self,
        kind: EnvelopeKind,
        timeout: Duration,
    ) -> Result<Option<IpcEnvelope>, IpcError> {
        self.poll_where(kind, timeout, |_| true)
    }

    /// Polls for the envelope of `kind` correlated with `correlation_id`,
    /// leaving other envelopes unconsumed.
    pub fn poll_matching(
        &self,
        kind: EnvelopeKind,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<IpcEnvelope>, IpcError> {
        let wanted = format!("{}_{}_", kind.as_str(), sanitize_component(correlation_id));
        self.poll_where(kind, timeout, move |name| name.starts_with(&wanted))
    }

    pub fn poll_response(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<IpcEnvelope>, IpcError> {
        self.poll_matching(EnvelopeKind::Response, correlation_id, timeout)
    }

    fn poll_where(
        &self,
        kind: EnvelopeKind,
        timeout: Duration,
        matches: impl Fn(&str) -> bool,
    ) -> Result<Option<IpcEnvelope>, IpcError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(envelope) = self.consume_oldest(kind, &matches)? {
                return Ok(Some(envelope));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(Duration::from_millis(POLL_INTERVAL_MS));
        }
    }

    fn consume_oldest(
        &self,
        kind: EnvelopeKind,
        matches: &impl Fn(&str) -> bool,
    ) -> Result<Option<IpcEnvelope>, IpcError> {
        let prefix = format!("{}_", kind.as_str());
        for path in sorted_envelope_paths(&self.paths.dir_for(kind))? {
            let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            if !name.starts_with(&prefix) || !matches(name) {
                continue;
            }

            // Claim by rename so two consumers can never read one envelope.
            let claimed = path.with_extension("json.claim");
            match fs::rename(&path, &claimed) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(io_err(&path, err)),
            }

            let raw = match fs::read_to_string(&claimed) {
                Ok(raw) => raw,
                Err(err) => return Err(io_err(&claimed, err)),
            };
            match serde_json::from_str::<IpcEnvelope>(&raw) {
                Ok(envelope) => {
                    fs::remove_file(&claimed).map_err(|err| io_err(&claimed, err))?;
                    return Ok(Some(envelope));
                }
                Err(err) => {
                    let _ = fs::rename(&claimed, path.with_extension("json.bad"));
                    return Err(parse_err(&path, err));
                }
            }
        }
        Ok(None)
    }

    /// Host-pushed state consumed read-only by the sandbox. Last write wins;
    /// no acknowledgment is expected.
    pub fn publish_snapshot(&self, name: &str, payload: &Value) -> Result<PathBuf, IpcError> {
        let path = self
            .paths
            .snapshots()
            .join(format!("{}.json", sanitize_component(name)));
        let body =
            serde_json::to_vec_pretty(payload).map_err(|source| parse_err(&path, source))?;
        atomic_write_file(&path, &body).map_err(|source| io_err(&path, source))?;
        Ok(path)
    }

    pub fn read_snapshot(&self, name: &str) -> Result<Option<Value>, IpcError> {
        let path = self
            .paths
            .snapshots()
            .join(format!("{}.json", sanitize_component(name)));
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| parse_err(&path, source))
    }

    /// Latest heartbeat timestamp, read without consuming.
    pub fn read_heartbeat(&self) -> Result<Option<i64>, IpcError> {
        let path = self.paths.heartbeat_file();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
        let envelope: IpcEnvelope =
            serde_json::from_str(&raw).map_err(|source| parse_err(&path, source))?;
        Ok(Some(envelope.timestamp))
    }

    pub fn write_status(&self, record: &StatusRecord) -> Result<(), IpcError> {
        let path = self.paths.status_file();
        let body = serde_json::to_vec_pretty(record).map_err(|source| parse_err(&path, source))?;
        atomic_write_file(&path, &body).map_err(|source| io_err(&path, source))
    }

    pub fn read_status(&self) -> Result<Option<StatusRecord>, IpcError> {
        let path = self.paths.status_file();
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).map_err(|source| io_err(&path, source))?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|source| parse_err(&path, source))
    }

    pub fn write_heartbeat_now(&self) -> Result<(), IpcError> {
        self.send(
            EnvelopeKind::Heartbeat,
            "heartbeat",
            serde_json::json!({ "at": now_secs() }),
        )?;
        Ok(())
    }
}

fn envelope_filename(kind: EnvelopeKind, correlation_id: &str, timestamp: i64) -> String {
    format!(
        "{}_{}_{}_{}.json",
        kind.as_str(),
        sanitize_component(correlation_id),
        timestamp,
        crate::shared::ids::random_suffix()
    )
}

fn sorted_envelope_paths(dir: &std::path::Path) -> Result<Vec<PathBuf>, IpcError> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|v| v.to_str()) != Some("json") {
            continue;
        }
        let metadata = entry.metadata().map_err(|e| io_err(&path, e))?;
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push((modified, path));
    }

    entries.sort_by(|(a_time, a_path), (b_time, b_path)| {
        a_time
            .cmp(b_time)
            .then_with(|| a_path.file_name().cmp(&b_path.file_name()))
    });

    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::WorkerActivity;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn send_then_poll_consumes_exactly_once() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");

        channel
            .send(EnvelopeKind::JobInput, "exec-1", json!({"text": "hi"}))
            .expect("send");

        let first = channel
            .poll(EnvelopeKind::JobInput, Duration::from_millis(50))
            .expect("poll")
            .expect("envelope");
        assert_eq!(first.correlation_id, "exec-1");
        assert_eq!(first.payload, json!({"text": "hi"}));

        let second = channel
            .poll(EnvelopeKind::JobInput, Duration::from_millis(50))
            .expect("poll again");
        assert!(second.is_none());
    }

    #[test]
    fn poll_timeout_returns_none_not_error() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");
        let polled = channel
            .poll(EnvelopeKind::JobResult, Duration::from_millis(30))
            .expect("poll");
        assert!(polled.is_none());
    }

    #[test]
    fn poll_response_only_consumes_matching_correlation() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");
        channel
            .send(EnvelopeKind::Response, "exec-other", json!({"n": 1}))
            .expect("send other");
        channel
            .send(EnvelopeKind::Response, "exec-42", json!({"n": 2}))
            .expect("send wanted");

        let matched = channel
            .poll_response("exec-42", Duration::from_millis(50))
            .expect("poll")
            .expect("envelope");
        assert_eq!(matched.payload, json!({"n": 2}));

        let other = channel
            .poll_response("exec-other", Duration::from_millis(50))
            .expect("poll other")
            .expect("other still present");
        assert_eq!(other.payload, json!({"n": 1}));
    }

    #[test]
    fn snapshots_are_last_write_wins() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");
        channel
            .publish_snapshot("tasks", &json!({"rev": 1}))
            .expect("publish");
        channel
            .publish_snapshot("tasks", &json!({"rev": 2}))
            .expect("publish again");
        let read = channel
            .read_snapshot("tasks")
            .expect("read")
            .expect("snapshot");
        assert_eq!(read, json!({"rev": 2}));
    }

    #[test]
    fn heartbeat_is_overwritten_and_read_without_consumption() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");
        channel.write_heartbeat_now().expect("heartbeat");
        let first = channel.read_heartbeat().expect("read").expect("timestamp");
        channel.write_heartbeat_now().expect("heartbeat again");
        let second = channel.read_heartbeat().expect("read").expect("timestamp");
        assert!(second >= first);
        // Still readable after two reads.
        assert!(channel.read_heartbeat().expect("read").is_some());
    }

    #[test]
    fn malformed_envelope_is_quarantined_not_looped() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");
        let bogus = channel.paths().inbox().join("job_input_x_1_00.json");
        std::fs::write(&bogus, "{not-json}").expect("write bogus");

        let err = channel
            .poll(EnvelopeKind::JobInput, Duration::from_millis(30))
            .expect_err("must surface parse failure");
        assert!(err.to_string().contains("invalid ipc envelope"));

        let after = channel
            .poll(EnvelopeKind::JobInput, Duration::from_millis(30))
            .expect("second poll");
        assert!(after.is_none());
    }

    #[test]
    fn status_record_round_trips() {
        let dir = tempdir().expect("tempdir");
        let channel = IpcChannel::open(dir.path()).expect("open channel");
        channel
            .write_status(&StatusRecord {
                activity: WorkerActivity::Processing,
                request_started_at: Some(100),
                updated_at: 101,
            })
            .expect("write status");
        let read = channel.read_status().expect("read").expect("status");
        assert_eq!(read.activity, WorkerActivity::Processing);
        assert_eq!(read.request_started_at, Some(100));
    }
}
