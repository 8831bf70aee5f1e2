use super::ConfigError;
use crate::sandbox::ExecMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub queue: QueueSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueSettings {
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,
    #[serde(default = "default_batch_max_items")]
    pub batch_max_items: usize,
    #[serde(default = "default_stalled_after_secs")]
    pub stalled_after_secs: u64,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            batch_window_ms: default_batch_window_ms(),
            batch_max_items: default_batch_max_items(),
            stalled_after_secs: default_stalled_after_secs(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DispatchSettings {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// 0 means a batch waits for admission indefinitely.
    #[serde(default)]
    pub queue_wait_timeout_ms: u64,
    #[serde(default)]
    pub interrupt_on_new_message: bool,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            queue_wait_timeout_ms: 0,
            interrupt_on_new_message: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SandboxSettings {
    #[serde(default)]
    pub mode: ExecMode,
    #[serde(default = "default_sandbox_binary")]
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_execution_timeout_secs")]
    pub execution_timeout_secs: u64,
    #[serde(default = "default_output_max_bytes")]
    pub output_max_bytes: usize,
    #[serde(default = "default_heartbeat_max_age_secs")]
    pub heartbeat_max_age_secs: u64,
    #[serde(default = "default_idle_worker_timeout_secs")]
    pub idle_worker_timeout_secs: u64,
    #[serde(default = "default_restart_window_secs")]
    pub restart_window_secs: u64,
    #[serde(default = "default_max_restarts_in_window")]
    pub max_restarts_in_window: u32,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            mode: ExecMode::default(),
            binary: default_sandbox_binary(),
            args: Vec::new(),
            execution_timeout_secs: default_execution_timeout_secs(),
            output_max_bytes: default_output_max_bytes(),
            heartbeat_max_age_secs: default_heartbeat_max_age_secs(),
            idle_worker_timeout_secs: default_idle_worker_timeout_secs(),
            restart_window_secs: default_restart_window_secs(),
            max_restarts_in_window: default_max_restarts_in_window(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerSettings {
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    #[serde(default = "default_task_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,
    #[serde(default = "default_task_retry_max_delay_secs")]
    pub retry_max_delay_secs: u64,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            retry_base_delay_secs: default_task_retry_base_delay_secs(),
            retry_max_delay_secs: default_task_retry_max_delay_secs(),
        }
    }
}

fn default_batch_window_ms() -> u64 {
    2000
}

fn default_batch_max_items() -> usize {
    50
}

fn default_stalled_after_secs() -> u64 {
    300
}

fn default_retry_base_delay_ms() -> u64 {
    3000
}

fn default_retry_max_delay_ms() -> u64 {
    60_000
}

fn default_max_retries() -> u32 {
    4
}

fn default_max_concurrency() -> usize {
    4
}

fn default_sandbox_binary() -> String {
    "agent-run".to_string()
}

fn default_execution_timeout_secs() -> u64 {
    600
}

fn default_output_max_bytes() -> usize {
    65_536
}

fn default_heartbeat_max_age_secs() -> u64 {
    30
}

fn default_idle_worker_timeout_secs() -> u64 {
    600
}

fn default_restart_window_secs() -> u64 {
    300
}

fn default_max_restarts_in_window() -> u32 {
    3
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_tick_interval_secs() -> u64 {
    60
}

fn default_task_retry_base_delay_secs() -> u64 {
    30
}

fn default_task_retry_max_delay_secs() -> u64 {
    3600
}
