use super::loops::{build_loop_specs, run_loop, LoopRunContext};
use super::recovery::{dedupe_batch_members, recover_dispatched_batches};
use super::registry::{apply_loop_event, LoopEvent, LoopHealth};
use super::{append_runtime_log, bootstrap_state_root, RuntimeError, StatePaths};
use crate::config::Settings;
use crate::dispatch::OutboxNotifier;
use crate::sandbox::ExecutionSupervisor;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::time::now_secs;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct SupervisorState {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<i64>,
    pub stopped_at: Option<i64>,
    pub loops: BTreeMap<String, LoopHealth>,
    pub last_error: Option<String>,
}

/// Boots the state root, recovers orphaned in-flight work, then runs the
/// control loops (batcher, dispatcher, stalled sweep, scheduler, and the
/// worker health loop in persistent mode) until the stop signal file appears.
pub fn run_supervisor(state_root: &Path, settings: Settings) -> Result<(), RuntimeError> {
    let paths = StatePaths::new(state_root);
    bootstrap_state_root(&paths)?;
    reserve_start_lock(&paths)?;

    let stop_path = paths.stop_signal_path();
    if stop_path.exists() {
        let _ = fs::remove_file(&stop_path);
    }

    match recover_dispatched_batches(state_root) {
        Ok(recovered) => {
            for path in recovered {
                append_runtime_log(
                    &paths,
                    "info",
                    "queue.recovered",
                    &format!("re-readied {}", path.display()),
                );
            }
        }
        Err(error) => append_runtime_log(&paths, "warn", "queue.recovery.error", &error),
    }
    match dedupe_batch_members(state_root) {
        Ok(removed) if removed > 0 => append_runtime_log(
            &paths,
            "info",
            "queue.recovery.deduped",
            &format!("removed {removed} duplicate member items"),
        ),
        Ok(_) => {}
        Err(error) => append_runtime_log(&paths, "warn", "queue.recovery.error", &error),
    }

    let supervisor = Arc::new(ExecutionSupervisor::new(
        paths.channels_dir(),
        settings.sandbox.clone(),
    ));
    let notifier = Arc::new(OutboxNotifier::new(state_root));

    let specs = build_loop_specs(&settings);
    let mut state = SupervisorState {
        running: true,
        pid: Some(std::process::id()),
        started_at: Some(now_secs()),
        stopped_at: None,
        loops: BTreeMap::new(),
        last_error: None,
    };
    for spec in &specs {
        state.loops.insert(spec.id.clone(), LoopHealth::default());
    }
    save_supervisor_state(&paths, &state)?;
    append_runtime_log(
        &paths,
        "info",
        "supervisor.started",
        &format!("pid={} loops={}", std::process::id(), specs.len()),
    );

    let stop = Arc::new(AtomicBool::new(false));
    let (events_tx, events_rx) = mpsc::channel::<LoopEvent>();
    let mut handles = Vec::new();
    let mut active = BTreeSet::new();

    for spec in specs {
        active.insert(spec.id.clone());
        let context = LoopRunContext {
            state_root: state_root.to_path_buf(),
            settings: settings.clone(),
            supervisor: Arc::clone(&supervisor),
            notifier: notifier.clone(),
            stop: Arc::clone(&stop),
            events: events_tx.clone(),
        };
        handles.push(thread::spawn(move || run_loop(spec, context)));
    }
    drop(events_tx);

    while !stop.load(Ordering::Relaxed) {
        if paths.stop_signal_path().exists() {
            stop.store(true, Ordering::Relaxed);
            append_runtime_log(&paths, "info", "supervisor.stop.signal", "stop file detected");
        }

        match events_rx.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => handle_loop_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let deadline = std::time::Instant::now() + shutdown_wait_timeout();
    while !active.is_empty() && std::time::Instant::now() < deadline {
        match events_rx.recv_timeout(Duration::from_millis(25)) {
            Ok(event) => handle_loop_event(&paths, &mut state, &mut active, event),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    if !active.is_empty() {
        let message = format!(
            "shutdown timeout waiting for loops: {}",
            active.iter().cloned().collect::<Vec<_>>().join(",")
        );
        state.last_error = Some(message.clone());
        append_runtime_log(&paths, "warn", "supervisor.shutdown.timeout", &message);
    }

    for handle in handles {
        let _ = handle.join();
    }

    // Loops are down; stop every persistent worker with the TERM-then-KILL
    // grace sequence.
    supervisor.pool().shutdown();

    state.running = false;
    state.pid = None;
    state.stopped_at = Some(now_secs());
    save_supervisor_state(&paths, &state)?;

    clear_start_lock(&paths);
    let _ = fs::remove_file(paths.stop_signal_path());
    append_runtime_log(&paths, "info", "supervisor.stopped", "runtime stopped cleanly");
    Ok(())
}

fn handle_loop_event(
    paths: &StatePaths,
    state: &mut SupervisorState,
    active: &mut BTreeSet<String>,
    event: LoopEvent,
) {
    if let Some(log) = apply_loop_event(&mut state.loops, active, event) {
        append_runtime_log(paths, log.level, log.event, &log.message);
    }
    let _ = save_supervisor_state(paths, state);
}

fn shutdown_wait_timeout() -> Duration {
    let seconds = std::env::var("RELAYD_SHUTDOWN_TIMEOUT_SECONDS")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(5);
    Duration::from_secs(seconds)
}

pub fn load_supervisor_state(paths: &StatePaths) -> Result<SupervisorState, RuntimeError> {
    let path = paths.supervisor_state_path();
    if !path.exists() {
        return Ok(SupervisorState::default());
    }
    let raw = fs::read_to_string(&path).map_err(|source| RuntimeError::ReadState {
        path: path.display().to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })
}

pub fn save_supervisor_state(
    paths: &StatePaths,
    state: &SupervisorState,
) -> Result<(), RuntimeError> {
    let path = paths.supervisor_state_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }
    let encoded = serde_json::to_vec_pretty(state).map_err(|source| RuntimeError::ParseState {
        path: path.display().to_string(),
        source,
    })?;
    atomic_write_file(&path, &encoded).map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}

/// Exclusive start lock: a second supervisor on the same state root is
/// rejected while the first holds the lock. A lock left by a dead pid is
/// cleaned up and retaken.
pub fn reserve_start_lock(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.supervisor_lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| RuntimeError::CreateDir {
            path: parent.display().to_string(),
            source,
        })?;
    }

    match try_create_lock(&path) {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == std::io::ErrorKind::AlreadyExists => {
            let holder = fs::read_to_string(&path)
                .ok()
                .and_then(|raw| raw.trim().parse::<u32>().ok());
            if let Some(pid) = holder {
                if crate::sandbox::process::is_process_alive(pid) {
                    return Err(RuntimeError::AlreadyRunning { pid });
                }
            }
            let _ = fs::remove_file(&path);
            try_create_lock(&path).map_err(|source| RuntimeError::WriteLock {
                path: path.display().to_string(),
                source,
            })
        }
        Err(source) => Err(RuntimeError::WriteLock {
            path: path.display().to_string(),
            source,
        }),
    }
}

fn try_create_lock(path: &Path) -> std::io::Result<()> {
    fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .and_then(|mut file| file.write_all(std::process::id().to_string().as_bytes()))
}

pub fn clear_start_lock(paths: &StatePaths) {
    let _ = fs::remove_file(paths.supervisor_lock_path());
}

/// Requests a running supervisor to stop by dropping the signal file it
/// watches.
pub fn signal_stop(paths: &StatePaths) -> Result<(), RuntimeError> {
    let path = paths.stop_signal_path();
    fs::write(&path, b"stop").map_err(|source| RuntimeError::WriteState {
        path: path.display().to_string(),
        source,
    })
}
