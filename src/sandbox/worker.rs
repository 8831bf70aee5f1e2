use super::process::{is_process_alive, terminate_gracefully};
use super::{classify_worker_health, ExecMode, SandboxError, WorkerHealth};
use crate::config::SandboxSettings;
use crate::ipc::{IpcChannel, WorkerActivity};
use crate::shared::ids::{sanitize_component, ConversationKey};
use crate::shared::time::now_secs;
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug)]
struct PersistentWorker {
    child: Child,
    channel: IpcChannel,
    spawned_at: i64,
    last_used_at: i64,
    restarts_in_window: u32,
    window_started_at: i64,
}

impl PersistentWorker {
    fn pid(&self) -> u32 {
        self.child.id()
    }
}

/// Health-loop findings that the runtime logs; `CrashLoop` is fatal and
/// requires manual intervention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAlert {
    Restarted {
        conversation_key: ConversationKey,
        restarts_in_window: u32,
    },
    RestartFailed {
        conversation_key: ConversationKey,
        error: String,
    },
    IdleStopped {
        conversation_key: ConversationKey,
    },
    CrashLoop {
        conversation_key: ConversationKey,
        restarts_in_window: u32,
    },
}

impl HealthAlert {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::CrashLoop { .. })
    }
}

/// One long-lived sandbox process per conversation key, reused across
/// executions. The pool owns spawn, reuse, restart accounting, and teardown;
/// health classification itself lives in `health`.
#[derive(Debug)]
pub struct WorkerPool {
    channels_root: PathBuf,
    settings: SandboxSettings,
    workers: Mutex<BTreeMap<ConversationKey, PersistentWorker>>,
    /// Keys refused further restarts; blocked until `clear_crash_loop`.
    crash_looped: Mutex<BTreeMap<ConversationKey, u32>>,
}

impl WorkerPool {
    pub fn new(channels_root: impl Into<PathBuf>, settings: SandboxSettings) -> Self {
        Self {
            channels_root: channels_root.into(),
            settings,
            workers: Mutex::new(BTreeMap::new()),
            crash_looped: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn worker_channel_root(&self, key: &ConversationKey) -> PathBuf {
        self.channels_root
            .join(format!("worker-{}", sanitize_component(key.as_str())))
    }

    /// Returns the IPC channel of a live worker for `key`, starting or
    /// restarting the process as needed. A worker that died since last use is
    /// restarted under crash-loop accounting; a key that already tripped the
    /// crash loop stays refused until `clear_crash_loop`.
    pub fn channel_for(&self, key: &ConversationKey) -> Result<IpcChannel, SandboxError> {
        let now = now_secs();
        if let Some(restarts) = lock(&self.crash_looped).get(key) {
            return Err(SandboxError::CrashLoop {
                conversation_key: key.to_string(),
                restarts: *restarts,
            });
        }
        let mut workers = lock(&self.workers);

        if let Some(worker) = workers.get_mut(key) {
            if is_process_alive(worker.pid()) {
                worker.last_used_at = now;
                return Ok(worker.channel.clone());
            }
            let mut dead = workers.remove(key).unwrap_or_else(|| unreachable!());
            let _ = dead.child.wait();
            let (restarts, window_started_at) = match next_restart_count(
                &self.settings,
                key,
                dead.restarts_in_window,
                dead.window_started_at,
                now,
            ) {
                Ok(granted) => granted,
                Err(error) => {
                    if let SandboxError::CrashLoop { restarts, .. } = &error {
                        lock(&self.crash_looped).insert(key.clone(), *restarts);
                    }
                    return Err(error);
                }
            };
            let replacement = self.spawn_worker(key, now, restarts, window_started_at)?;
            let channel = replacement.channel.clone();
            workers.insert(key.clone(), replacement);
            return Ok(channel);
        }

        let worker = self.spawn_worker(key, now, 0, now)?;
        let channel = worker.channel.clone();
        workers.insert(key.clone(), worker);
        Ok(channel)
    }

    /// Operator acknowledgment after a crash loop: unblocks the key so the
    /// next use may start a fresh worker with a clean restart budget.
    pub fn clear_crash_loop(&self, key: &ConversationKey) -> bool {
        lock(&self.crash_looped).remove(key).is_some()
    }

    pub fn touch(&self, key: &ConversationKey) {
        let mut workers = lock(&self.workers);
        if let Some(worker) = workers.get_mut(key) {
            worker.last_used_at = now_secs();
        }
    }

    /// One periodic health pass: restart dead workers (bounded by the crash
    /// loop window), stop idle ones past their idle timeout.
    pub fn check_health(&self, now: i64) -> Vec<HealthAlert> {
        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        let mut alerts = Vec::new();
        let mut workers = lock(&self.workers);
        let keys: Vec<ConversationKey> = workers.keys().cloned().collect();

        for key in keys {
            let Some(worker) = workers.get_mut(&key) else {
                continue;
            };

            let process_dead = !is_process_alive(worker.pid());
            let health = if process_dead {
                WorkerHealth::Dead
            } else {
                let heartbeat_at = worker.channel.read_heartbeat().ok().flatten();
                let status = worker.channel.read_status().ok().flatten();
                classify_worker_health(
                    heartbeat_at.map(millis_to_secs),
                    worker.spawned_at,
                    status.as_ref(),
                    now,
                    self.settings.heartbeat_max_age_secs,
                    self.settings.execution_timeout_secs,
                )
            };

            match health {
                WorkerHealth::Busy => {}
                WorkerHealth::Healthy => {
                    let idle_for = now.saturating_sub(worker.last_used_at);
                    let is_idle = worker
                        .channel
                        .read_status()
                        .ok()
                        .flatten()
                        .map(|record| record.activity != WorkerActivity::Processing)
                        .unwrap_or(true);
                    if is_idle && idle_for > self.settings.idle_worker_timeout_secs as i64 {
                        let mut stopped =
                            workers.remove(&key).unwrap_or_else(|| unreachable!());
                        terminate_gracefully(&mut stopped.child, grace);
                        alerts.push(HealthAlert::IdleStopped {
                            conversation_key: key.clone(),
                        });
                    }
                }
                WorkerHealth::Dead => {
                    let mut dead = workers.remove(&key).unwrap_or_else(|| unreachable!());
                    if !process_dead {
                        terminate_gracefully(&mut dead.child, grace);
                    } else {
                        let _ = dead.child.wait();
                    }
                    match next_restart_count(
                        &self.settings,
                        &key,
                        dead.restarts_in_window,
                        dead.window_started_at,
                        now,
                    ) {
                        Ok((restarts, window_started_at)) => {
                            match self.spawn_worker(&key, now, restarts, window_started_at) {
                                Ok(replacement) => {
                                    workers.insert(key.clone(), replacement);
                                    alerts.push(HealthAlert::Restarted {
                                        conversation_key: key.clone(),
                                        restarts_in_window: restarts,
                                    });
                                }
                                Err(error) => {
                                    alerts.push(HealthAlert::RestartFailed {
                                        conversation_key: key.clone(),
                                        error: error.to_string(),
                                    });
                                }
                            }
                        }
                        Err(SandboxError::CrashLoop { restarts, .. }) => {
                            lock(&self.crash_looped).insert(key.clone(), restarts);
                            alerts.push(HealthAlert::CrashLoop {
                                conversation_key: key.clone(),
                                restarts_in_window: restarts,
                            });
                        }
                        Err(_) => {}
                    }
                }
            }
        }

        alerts
    }

    /// Graceful shutdown of every worker: TERM, grace period, then KILL.
    pub fn shutdown(&self) {
        let grace = Duration::from_secs(self.settings.shutdown_grace_secs);
        let mut workers = lock(&self.workers);
        for (_, mut worker) in std::mem::take(&mut *workers) {
            terminate_gracefully(&mut worker.child, grace);
        }
    }

    pub fn active_worker_count(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Channels of currently live workers, for host-pushed snapshots.
    pub fn active_channels(&self) -> Vec<(ConversationKey, IpcChannel)> {
        lock(&self.workers)
            .iter()
            .map(|(key, worker)| (key.clone(), worker.channel.clone()))
            .collect()
    }

    fn spawn_worker(
        &self,
        key: &ConversationKey,
        now: i64,
        restarts_in_window: u32,
        window_started_at: i64,
    ) -> Result<PersistentWorker, SandboxError> {
        let root = self.worker_channel_root(key);
        let channel = IpcChannel::open(&root)?;
        // A restarted worker must not inherit its predecessor's liveness
        // files.
        let _ = fs::remove_file(channel.paths().heartbeat_file());
        let _ = fs::remove_file(channel.paths().status_file());

        let child = spawn_sandbox_process(&self.settings, &root, ExecMode::Persistent)?;
        Ok(PersistentWorker {
            child,
            channel,
            spawned_at: now,
            last_used_at: now,
            restarts_in_window,
            window_started_at,
        })
    }
}

/// Restart accounting inside a sliding window: a restart past the threshold
/// is refused with `CrashLoop` instead of being granted.
fn next_restart_count(
    settings: &SandboxSettings,
    key: &ConversationKey,
    restarts_in_window: u32,
    window_started_at: i64,
    now: i64,
) -> Result<(u32, i64), SandboxError> {
    let (mut restarts, mut window_started_at) = (restarts_in_window, window_started_at);
    if now.saturating_sub(window_started_at) > settings.restart_window_secs as i64 {
        restarts = 0;
        window_started_at = now;
    }
    restarts += 1;
    if restarts > settings.max_restarts_in_window {
        return Err(SandboxError::CrashLoop {
            conversation_key: key.to_string(),
            restarts,
        });
    }
    Ok((restarts, window_started_at))
}

pub(super) fn spawn_sandbox_process(
    settings: &SandboxSettings,
    channel_root: &std::path::Path,
    mode: ExecMode,
) -> Result<Child, SandboxError> {
    let mode_flag = match mode {
        ExecMode::OneShot => "one_shot",
        ExecMode::Persistent => "persistent",
    };
    let mut command = Command::new(&settings.binary);
    command
        .args(&settings.args)
        .arg("--channel-dir")
        .arg(channel_root)
        .arg("--mode")
        .arg(mode_flag);

    match mode {
        ExecMode::OneShot => {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        ExecMode::Persistent => {
            command.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    command.spawn().map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            SandboxError::MissingBinary {
                binary: settings.binary.clone(),
            }
        } else {
            SandboxError::Spawn {
                binary: settings.binary.clone(),
                source: err,
            }
        }
    })
}

fn millis_to_secs(millis: i64) -> i64 {
    millis.div_euclid(1000)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
