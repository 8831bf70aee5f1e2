use crate::ipc::{StatusRecord, WorkerActivity};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Healthy,
    /// Heartbeat is stale but the worker's own status says it is mid-request
    /// and still inside the execution deadline. Tolerated, not restarted.
    Busy,
    Dead,
}

/// Classifies a persistent worker from its heartbeat age and status record.
/// The heartbeat emitter runs independently of request work, so a fresh
/// heartbeat always wins; a stale one is only forgiven while the worker is
/// demonstrably processing within its deadline.
pub fn classify_worker_health(
    heartbeat_at: Option<i64>,
    spawned_at: i64,
    status: Option<&StatusRecord>,
    now: i64,
    heartbeat_max_age_secs: u64,
    execution_timeout_secs: u64,
) -> WorkerHealth {
    // A worker that has not written its first heartbeat yet is judged from
    // its spawn time.
    let reference = heartbeat_at.unwrap_or(spawned_at);
    let age = now.saturating_sub(reference);
    if age <= heartbeat_max_age_secs as i64 {
        return WorkerHealth::Healthy;
    }

    if let Some(status) = status {
        if status.activity == WorkerActivity::Processing {
            let busy_for = status
                .request_started_at
                .map(|started| now.saturating_sub(started))
                .unwrap_or(age);
            if busy_for < execution_timeout_secs as i64 {
                return WorkerHealth::Busy;
            }
        }
    }

    WorkerHealth::Dead
}
