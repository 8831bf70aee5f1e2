use super::{append_runtime_log, LoopEvent, StatePaths};
use crate::config::Settings;
use crate::dispatch::{CompletionNotifier, DispatchController};
use crate::queue::{sweep_stalled, Batcher, ItemStore, QueuePaths};
use crate::sandbox::{ExecMode, ExecutionSupervisor, HealthAlert};
use crate::sched::{TaskScheduler, TaskStore};
use crate::shared::time::{now_millis, now_secs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LoopRuntime {
    Batcher,
    Dispatcher,
    WorkerHealth,
    StalledSweep,
    Scheduler,
}

#[derive(Debug, Clone)]
pub struct LoopSpec {
    pub id: String,
    pub(crate) runtime: LoopRuntime,
    pub interval: Duration,
}

/// Everything a control loop needs, passed explicitly at spawn; the loops
/// share the execution supervisor so the dispatcher and the health loop see
/// the same worker pool.
#[derive(Clone)]
pub(crate) struct LoopRunContext {
    pub(crate) state_root: PathBuf,
    pub(crate) settings: Settings,
    pub(crate) supervisor: Arc<ExecutionSupervisor>,
    pub(crate) notifier: Arc<dyn CompletionNotifier>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) events: Sender<LoopEvent>,
}

pub(crate) fn build_loop_specs(settings: &Settings) -> Vec<LoopSpec> {
    let mut specs = vec![
        LoopSpec {
            id: "batcher".to_string(),
            runtime: LoopRuntime::Batcher,
            interval: Duration::from_millis(250),
        },
        LoopSpec {
            id: "dispatcher".to_string(),
            runtime: LoopRuntime::Dispatcher,
            interval: Duration::from_millis(100),
        },
        LoopSpec {
            id: "stalled_sweep".to_string(),
            runtime: LoopRuntime::StalledSweep,
            interval: Duration::from_secs(60),
        },
        LoopSpec {
            id: "scheduler".to_string(),
            runtime: LoopRuntime::Scheduler,
            interval: Duration::from_secs(settings.scheduler.tick_interval_secs),
        },
    ];

    if settings.sandbox.mode == ExecMode::Persistent {
        specs.push(LoopSpec {
            id: "worker_health".to_string(),
            runtime: LoopRuntime::WorkerHealth,
            interval: Duration::from_secs((settings.sandbox.heartbeat_max_age_secs / 3).max(1)),
        });
    }

    specs
}

pub(crate) fn run_loop(spec: LoopSpec, context: LoopRunContext) {
    let _ = context.events.send(LoopEvent::Started {
        loop_id: spec.id.clone(),
        at: now_secs(),
    });

    if spec.runtime == LoopRuntime::Dispatcher {
        run_dispatcher_loop(&spec, &context);
    } else {
        run_tick_loop(&spec, &context);
    }

    let _ = context.events.send(LoopEvent::Stopped {
        loop_id: spec.id,
        at: now_secs(),
    });
}

fn run_tick_loop(spec: &LoopSpec, context: &LoopRunContext) {
    let paths = StatePaths::new(&context.state_root);
    let store = ItemStore::new(QueuePaths::from_state_root(&context.state_root));
    let mut batcher = Batcher::new(&context.settings.queue);
    let mut scheduler = TaskScheduler::new(
        &context.state_root,
        TaskStore::new(&context.state_root),
        store.clone(),
        context.settings.scheduler.clone(),
    );

    loop {
        if context.stop.load(Ordering::Relaxed) {
            break;
        }

        let tick = match spec.runtime {
            LoopRuntime::Batcher => batcher
                .tick(&store, now_millis())
                .map(|closed| {
                    for batch in &closed {
                        append_runtime_log(
                            &paths,
                            "info",
                            "queue.batch.closed",
                            &format!("{} items={}", batch.id, batch.items.len()),
                        );
                    }
                })
                .map_err(|e| e.to_string()),
            LoopRuntime::StalledSweep => {
                sweep_stalled(&store, &context.settings.queue, now_millis())
                    .map(|report| {
                        if report.requeued > 0 {
                            append_runtime_log(
                                &paths,
                                "warn",
                                "queue.stalled.requeued",
                                &format!("requeued {} stalled items", report.requeued),
                            );
                        }
                        for item_id in &report.failed_item_ids {
                            append_runtime_log(
                                &paths,
                                "error",
                                "queue.item.failed",
                                &format!("{item_id} exhausted retries"),
                            );
                        }
                    })
                    .map_err(|e| e.to_string())
            }
            LoopRuntime::Scheduler => scheduler
                .tick(now_secs())
                .map(|fired| {
                    for trigger in &fired {
                        append_runtime_log(
                            &paths,
                            "info",
                            "scheduler.fired",
                            &format!("{} item={}", trigger.task_id, trigger.item_id),
                        );
                    }
                    if context.settings.sandbox.mode == ExecMode::Persistent {
                        publish_task_snapshot(&paths, &context.supervisor, &scheduler);
                    }
                })
                .map_err(|e| e.to_string()),
            LoopRuntime::WorkerHealth => {
                tick_worker_health(&paths, &context.supervisor);
                Ok(())
            }
            LoopRuntime::Dispatcher => Ok(()),
        };

        match tick {
            Ok(()) => {
                let _ = context.events.send(LoopEvent::Heartbeat {
                    loop_id: spec.id.clone(),
                    at: now_secs(),
                });
            }
            Err(message) => {
                let _ = context.events.send(LoopEvent::Error {
                    loop_id: spec.id.clone(),
                    at: now_secs(),
                    message,
                    fatal: false,
                });
            }
        }

        if !sleep_with_stop(&context.stop, spec.interval) {
            break;
        }
    }
}

fn run_dispatcher_loop(spec: &LoopSpec, context: &LoopRunContext) {
    let store = ItemStore::new(QueuePaths::from_state_root(&context.state_root));
    let mut controller = match DispatchController::new(
        &context.state_root,
        context.settings.queue.clone(),
        context.settings.dispatch.clone(),
        context.settings.sandbox.mode,
        store,
        Arc::clone(&context.supervisor),
        Arc::clone(&context.notifier),
    ) {
        Ok(controller) => controller,
        Err(error) => {
            let _ = context.events.send(LoopEvent::Error {
                loop_id: spec.id.clone(),
                at: now_secs(),
                message: error.to_string(),
                fatal: true,
            });
            return;
        }
    };

    loop {
        if context.stop.load(Ordering::Relaxed) {
            let grace =
                Duration::from_secs(context.settings.sandbox.shutdown_grace_secs.max(1));
            if let Err(error) = controller.drain(grace) {
                let _ = context.events.send(LoopEvent::Error {
                    loop_id: spec.id.clone(),
                    at: now_secs(),
                    message: error.to_string(),
                    fatal: false,
                });
            }
            break;
        }

        match controller.pump(now_millis()) {
            Ok(_) => {
                let _ = context.events.send(LoopEvent::Heartbeat {
                    loop_id: spec.id.clone(),
                    at: now_secs(),
                });
            }
            Err(error) => {
                let _ = context.events.send(LoopEvent::Error {
                    loop_id: spec.id.clone(),
                    at: now_secs(),
                    message: error.to_string(),
                    fatal: false,
                });
            }
        }

        if !sleep_with_stop(&context.stop, spec.interval) {
            let grace =
                Duration::from_secs(context.settings.sandbox.shutdown_grace_secs.max(1));
            let _ = controller.drain(grace);
            break;
        }
    }
}

/// Mirrors the current schedule into every live worker's snapshot directory
/// so the sandbox can see what is planned without asking. Last write wins;
/// delivery failures only cost a log line.
fn publish_task_snapshot(
    paths: &StatePaths,
    supervisor: &ExecutionSupervisor,
    scheduler: &TaskScheduler,
) {
    let tasks = match scheduler.store().list_all() {
        Ok(tasks) => tasks,
        Err(error) => {
            append_runtime_log(paths, "warn", "scheduler.snapshot.error", &error.to_string());
            return;
        }
    };
    let Ok(payload) = serde_json::to_value(&tasks) else {
        return;
    };
    for (key, channel) in supervisor.pool().active_channels() {
        if let Err(error) = channel.publish_snapshot("scheduled_tasks", &payload) {
            append_runtime_log(
                paths,
                "warn",
                "scheduler.snapshot.error",
                &format!("{key}: {error}"),
            );
        }
    }
}

fn tick_worker_health(paths: &StatePaths, supervisor: &ExecutionSupervisor) {
    for alert in supervisor.pool().check_health(now_secs()) {
        match alert {
            HealthAlert::Restarted {
                conversation_key,
                restarts_in_window,
            } => append_runtime_log(
                paths,
                "warn",
                "worker.restarted",
                &format!("{conversation_key} restarts_in_window={restarts_in_window}"),
            ),
            HealthAlert::RestartFailed {
                conversation_key,
                error,
            } => append_runtime_log(
                paths,
                "error",
                "worker.restart.failed",
                &format!("{conversation_key}: {error}"),
            ),
            HealthAlert::IdleStopped { conversation_key } => append_runtime_log(
                paths,
                "info",
                "worker.idle_stopped",
                &conversation_key.to_string(),
            ),
            HealthAlert::CrashLoop {
                conversation_key,
                restarts_in_window,
            } => append_runtime_log(
                paths,
                "error",
                "worker.crash_loop",
                &format!(
                    "{conversation_key} refused restart {restarts_in_window}; \
                     manual intervention required"
                ),
            ),
        }
    }
}

pub(crate) fn sleep_with_stop(stop: &AtomicBool, total: Duration) -> bool {
    let mut remaining = total;
    while remaining > Duration::from_millis(0) {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        let step = remaining.min(Duration::from_millis(25));
        thread::sleep(step);
        remaining = remaining.saturating_sub(step);
    }
    !stop.load(Ordering::Relaxed)
}
