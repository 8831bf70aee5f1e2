use super::task::{compute_next_fire, ScheduleSpec, ScheduledTask, TaskStatus, TaskStore};
use super::SchedError;
use crate::config::SchedulerSettings;
use crate::queue::{ItemStore, NewWorkItem};
use crate::shared::logging::append_events_log_line;
use serde_json::json;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTask {
    pub task_id: String,
    pub item_id: String,
    pub fired_at: i64,
}

/// Fires due scheduled tasks into the ingestion queue. Every fire failure
/// backs off exponentially; exhausting a task's retries trips its circuit
/// breaker into `paused` until an operator resumes it.
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    state_root: PathBuf,
    store: TaskStore,
    items: ItemStore,
    settings: SchedulerSettings,
}

impl TaskScheduler {
    pub fn new(
        state_root: impl AsRef<Path>,
        store: TaskStore,
        items: ItemStore,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            state_root: state_root.as_ref().to_path_buf(),
            store,
            items,
            settings,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Evaluates every active task whose fire time has elapsed. Does not
    /// suspend; invoked on a fixed interval by the runtime.
    pub fn tick(&mut self, now: i64) -> Result<Vec<FiredTask>, SchedError> {
        let mut fired = Vec::new();

        for mut task in self.store.list_all()? {
            if task.status != TaskStatus::Active {
                continue;
            }
            let Some(next_fire_at) = task.next_fire_at else {
                continue;
            };
            if next_fire_at > now {
                continue;
            }

            match self.enqueue_trigger(&task, now) {
                Ok(item_id) => {
                    self.apply_success(&mut task, next_fire_at, now)?;
                    self.log_event(
                        "scheduler.task.fired",
                        &task,
                        Some(json!({ "itemId": item_id })),
                    );
                    fired.push(FiredTask {
                        task_id: task.task_id.clone(),
                        item_id,
                        fired_at: now,
                    });
                }
                Err(error) => {
                    self.apply_failure(&mut task, now, &error.to_string())?;
                }
            }
        }

        Ok(fired)
    }

    /// Outcome feedback from the dispatch layer for a fired trigger: success
    /// resets the retry budget, failure consumes it.
    pub fn report_outcome(
        &mut self,
        task_id: &str,
        succeeded: bool,
        now: i64,
    ) -> Result<ScheduledTask, SchedError> {
        let mut task = self.store.load(task_id)?;
        if succeeded {
            task.retry_count = 0;
            task.last_result = Some("succeeded".to_string());
            task.updated_at = now;
            self.store.persist(&task)?;
        } else {
            self.apply_failure(&mut task, now, "execution reported failure")?;
        }
        Ok(task)
    }

    pub fn resume(&mut self, task_id: &str, now: i64) -> Result<ScheduledTask, SchedError> {
        let task = self.store.resume(task_id, now)?;
        self.log_event("scheduler.task.resumed", &task, None);
        Ok(task)
    }

    fn enqueue_trigger(&self, task: &ScheduledTask, now: i64) -> Result<String, SchedError> {
        let item = self.items.enqueue(NewWorkItem::message(
            task.conversation_key.clone(),
            &task.payload,
            now.saturating_mul(1000),
        ))?;
        Ok(item.id)
    }

    fn apply_success(
        &self,
        task: &mut ScheduledTask,
        fired_for: i64,
        now: i64,
    ) -> Result<(), SchedError> {
        task.retry_count = 0;
        task.last_fired_at = Some(now);
        task.last_result = Some("fired".to_string());
        match task.schedule {
            ScheduleSpec::Once { .. } => {
                task.next_fire_at = None;
                task.status = TaskStatus::Cancelled;
                task.last_result = Some("completed".to_string());
            }
            _ => {
                task.next_fire_at = compute_next_fire(&task.schedule, now, Some(fired_for))?;
            }
        }
        task.updated_at = now;
        self.store.persist(task)
    }

    fn apply_failure(
        &self,
        task: &mut ScheduledTask,
        now: i64,
        error: &str,
    ) -> Result<(), SchedError> {
        task.retry_count = task.retry_count.saturating_add(1);
        task.last_result = Some(format!("failed: {error}"));
        task.updated_at = now;

        if task.retry_count > task.max_retries {
            task.status = TaskStatus::Paused;
            task.next_fire_at = None;
            self.store.persist(task)?;
            self.log_event(
                "scheduler.task.paused",
                task,
                Some(json!({ "error": error, "retryCount": task.retry_count })),
            );
            return Ok(());
        }

        let delay = retry_backoff_secs(
            task.retry_count,
            self.settings.retry_base_delay_secs,
            self.settings.retry_max_delay_secs,
        );
        task.next_fire_at = Some(now.saturating_add(delay as i64));
        self.store.persist(task)?;
        self.log_event(
            "scheduler.task.retry",
            task,
            Some(json!({ "error": error, "retryCount": task.retry_count, "delaySecs": delay })),
        );
        Ok(())
    }

    fn log_event(&self, event: &str, task: &ScheduledTask, extra: Option<serde_json::Value>) {
        let mut payload = json!({
            "event": event,
            "taskId": task.task_id,
            "conversationKey": task.conversation_key.as_str(),
            "timestamp": task.updated_at,
        });
        if let (Some(map), Some(serde_json::Value::Object(extra_map))) =
            (payload.as_object_mut(), extra)
        {
            for (field, value) in extra_map {
                map.insert(field, value);
            }
        }
        if let Ok(line) = serde_json::to_string(&payload) {
            let _ = append_events_log_line(&self.state_root, &line);
        }
    }
}

fn retry_backoff_secs(retry_count: u32, base_secs: u64, max_secs: u64) -> u64 {
    let exponent = retry_count.saturating_sub(1).min(20);
    base_secs
        .saturating_mul(1u64 << exponent)
        .min(max_secs)
        .max(base_secs.min(max_secs))
}
