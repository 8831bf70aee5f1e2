use super::output::{truncate_captured, CapturedOutput};
use super::worker::spawn_sandbox_process;
use super::{ExecMode, ExecStatus, SandboxError, WorkerPool};
use crate::config::SandboxSettings;
use crate::ipc::{EnvelopeKind, IpcChannel};
use crate::queue::Batch;
use crate::shared::ids::sanitize_component;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// The structured payload a sandbox receives as its job input envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInputPayload {
    pub execution_id: String,
    pub conversation_key: String,
    pub mode: ExecMode,
    pub messages: Vec<JobMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMessage {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionReport {
    pub execution_id: String,
    pub status: ExecStatus,
    pub payload: Option<Value>,
    pub output: Option<CapturedOutput>,
    pub error: Option<String>,
    pub retryable: bool,
    pub started_at: i64,
    pub ended_at: i64,
}

/// Owns the lifecycle of sandboxed execution processes. One-shot mode spawns
/// a fresh process per run and always tears it down; persistent mode reuses a
/// pooled worker per conversation and exchanges envelopes with it.
#[derive(Debug)]
pub struct ExecutionSupervisor {
    channels_root: PathBuf,
    settings: SandboxSettings,
    pool: WorkerPool,
}

impl ExecutionSupervisor {
    pub fn new(channels_root: impl Into<PathBuf>, settings: SandboxSettings) -> Self {
        let channels_root = channels_root.into();
        Self {
            pool: WorkerPool::new(&channels_root, settings.clone()),
            channels_root,
            settings,
        }
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn run(
        &self,
        execution_id: &str,
        batch: &Batch,
        cancel: &AtomicBool,
    ) -> Result<ExecutionReport, SandboxError> {
        if batch.items.is_empty() {
            return Err(SandboxError::MalformedJob {
                reason: "batch has no items".to_string(),
            });
        }
        match self.settings.mode {
            ExecMode::OneShot => self.run_one_shot(execution_id, batch, cancel),
            ExecMode::Persistent => self.run_persistent(execution_id, batch, cancel),
        }
    }

    fn run_one_shot(
        &self,
        execution_id: &str,
        batch: &Batch,
        cancel: &AtomicBool,
    ) -> Result<ExecutionReport, SandboxError> {
        let started_at = now_secs();
        let root = self
            .channels_root
            .join(format!("exec-{}", sanitize_component(execution_id)));
        let channel = IpcChannel::open(&root)?;
        channel.send(
            EnvelopeKind::JobInput,
            execution_id,
            job_payload(execution_id, batch, ExecMode::OneShot),
        )?;

        let mut child = spawn_sandbox_process(&self.settings, &root, ExecMode::OneShot)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_err(&root, std::io::Error::other("missing stdout pipe")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_err(&root, std::io::Error::other("missing stderr pipe")))?;
        let stdout_reader = thread::spawn(move || read_stream(stdout));
        let stderr_reader = thread::spawn(move || read_stream(stderr));

        let deadline = Instant::now() + Duration::from_secs(self.settings.execution_timeout_secs);
        let exit_status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if cancel.load(Ordering::Relaxed) {
                        let _ = child.kill();
                        let _ = child.wait();
                        let output = self.collect(stdout_reader, stderr_reader, None);
                        cleanup_channel_dir(&root);
                        return Ok(report(
                            execution_id,
                            ExecStatus::Cancelled,
                            None,
                            Some(output),
                            Some("execution cancelled".to_string()),
                            false,
                            started_at,
                        ));
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let status = child.wait().map_err(|e| io_err(&root, e))?;
                        let output = self.collect(stdout_reader, stderr_reader, status.code());
                        cleanup_channel_dir(&root);
                        return Ok(report(
                            execution_id,
                            ExecStatus::TimedOut,
                            None,
                            Some(output),
                            Some(format!(
                                "execution exceeded deadline of {}s",
                                self.settings.execution_timeout_secs
                            )),
                            true,
                            started_at,
                        ));
                    }
                    thread::sleep(Duration::from_millis(10));
                }
                Err(err) => return Err(io_err(&root, err)),
            }
        };

        let output = self.collect(stdout_reader, stderr_reader, exit_status.code());
        cleanup_channel_dir(&root);

        if exit_status.success() {
            let payload = json!({ "output": output.stdout });
            Ok(report(
                execution_id,
                ExecStatus::Completed,
                Some(payload),
                Some(output),
                None,
                false,
                started_at,
            ))
        } else {
            let error = format!(
                "sandbox exited with code {}: {}",
                exit_status.code().unwrap_or(-1),
                output.stderr.trim()
            );
            Ok(report(
                execution_id,
                ExecStatus::Failed,
                None,
                Some(output),
                Some(error),
                true,
                started_at,
            ))
        }
    }

    fn run_persistent(
        &self,
        execution_id: &str,
        batch: &Batch,
        cancel: &AtomicBool,
    ) -> Result<ExecutionReport, SandboxError> {
        let started_at = now_secs();
        let channel = self.pool.channel_for(&batch.conversation_key)?;
        channel.send(
            EnvelopeKind::JobInput,
            execution_id,
            job_payload(execution_id, batch, ExecMode::Persistent),
        )?;

        let deadline = Instant::now() + Duration::from_secs(self.settings.execution_timeout_secs);
        loop {
            if let Some(envelope) = channel.poll_matching(
                EnvelopeKind::JobResult,
                execution_id,
                Duration::from_millis(100),
            )? {
                self.pool.touch(&batch.conversation_key);
                return Ok(result_from_envelope(execution_id, envelope.payload, started_at));
            }

            if cancel.load(Ordering::Relaxed) {
                self.interrupt(&channel, execution_id)?;
                return Ok(report(
                    execution_id,
                    ExecStatus::Cancelled,
                    None,
                    None,
                    Some("execution cancelled".to_string()),
                    false,
                    started_at,
                ));
            }
            if Instant::now() >= deadline {
                // Only the current request is torn down; the worker itself is
                // left to the health loop.
                self.interrupt(&channel, execution_id)?;
                return Ok(report(
                    execution_id,
                    ExecStatus::TimedOut,
                    None,
                    None,
                    Some(format!(
                        "execution exceeded deadline of {}s",
                        self.settings.execution_timeout_secs
                    )),
                    true,
                    started_at,
                ));
            }
        }
    }

    fn interrupt(&self, channel: &IpcChannel, execution_id: &str) -> Result<(), SandboxError> {
        channel.send(
            EnvelopeKind::Request,
            execution_id,
            json!({ "action": "interrupt" }),
        )?;
        Ok(())
    }

    fn collect(
        &self,
        stdout_reader: thread::JoinHandle<String>,
        stderr_reader: thread::JoinHandle<String>,
        exit_code: Option<i32>,
    ) -> CapturedOutput {
        let raw_stdout = stdout_reader.join().unwrap_or_default();
        let raw_stderr = stderr_reader.join().unwrap_or_default();
        let (stdout, stdout_truncated) =
            truncate_captured(&raw_stdout, self.settings.output_max_bytes);
        let (stderr, stderr_truncated) =
            truncate_captured(&raw_stderr, self.settings.output_max_bytes);
        CapturedOutput {
            stdout,
            stderr,
            exit_code,
            truncated: stdout_truncated || stderr_truncated,
        }
    }
}

/// Transient failures are worth a retry; deterministic and fatal ones are
/// not.
pub fn error_is_retryable(error: &SandboxError) -> bool {
    match error {
        SandboxError::Io { .. } | SandboxError::Ipc(_) | SandboxError::Spawn { .. } => true,
        SandboxError::MissingBinary { .. }
        | SandboxError::MalformedJob { .. }
        | SandboxError::CrashLoop { .. } => false,
    }
}

fn job_payload(execution_id: &str, batch: &Batch, mode: ExecMode) -> Value {
    let messages: Vec<JobMessage> = batch
        .items
        .iter()
        .flat_map(|item| {
            item.fragments.iter().map(|fragment| JobMessage {
                text: fragment.text.clone(),
                attachments: fragment.attachments.clone(),
                timestamp: item.timestamp,
            })
        })
        .collect();
    serde_json::to_value(JobInputPayload {
        execution_id: execution_id.to_string(),
        conversation_key: batch.conversation_key.to_string(),
        mode,
        messages,
    })
    .unwrap_or_else(|_| json!({ "executionId": execution_id }))
}

fn result_from_envelope(execution_id: &str, payload: Value, started_at: i64) -> ExecutionReport {
    let status = payload.get("status").and_then(Value::as_str);
    match status {
        Some("ok") => report(
            execution_id,
            ExecStatus::Completed,
            payload.get("output").cloned(),
            None,
            None,
            false,
            started_at,
        ),
        Some("error") => {
            let error = payload
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("sandbox reported failure")
                .to_string();
            report(
                execution_id,
                ExecStatus::Failed,
                None,
                None,
                Some(error),
                true,
                started_at,
            )
        }
        _ => report(
            execution_id,
            ExecStatus::Failed,
            None,
            None,
            Some("sandbox result missing `status` field".to_string()),
            false,
            started_at,
        ),
    }
}

fn report(
    execution_id: &str,
    status: ExecStatus,
    payload: Option<Value>,
    output: Option<CapturedOutput>,
    error: Option<String>,
    retryable: bool,
    started_at: i64,
) -> ExecutionReport {
    ExecutionReport {
        execution_id: execution_id.to_string(),
        status,
        payload,
        output,
        error,
        retryable,
        started_at,
        ended_at: now_secs(),
    }
}

fn read_stream(mut stream: impl Read) -> String {
    let mut buf = String::new();
    let _ = stream.read_to_string(&mut buf);
    buf
}

fn cleanup_channel_dir(root: &std::path::Path) {
    let _ = fs::remove_dir_all(root);
}

fn io_err(path: &std::path::Path, source: std::io::Error) -> SandboxError {
    SandboxError::Io {
        path: path.display().to_string(),
        source,
    }
}
