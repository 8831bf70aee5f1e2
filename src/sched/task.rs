use super::cron::{parse_timezone, CronSchedule};
use super::SchedError;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{random_suffix, sanitize_component, ConversationKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Once {
        run_at: i64,
    },
    Interval {
        every_seconds: u64,
        #[serde(default)]
        anchor_at: Option<i64>,
    },
    Cron {
        expression: String,
        timezone: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Active,
    Paused,
    Cancelled,
}

impl TaskStatus {
    fn name(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
        }
    }
}

/// A recurring or one-off trigger that feeds synthetic work into the
/// ingestion queue. Mutated only by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub task_id: String,
    pub conversation_key: ConversationKey,
    pub schedule: ScheduleSpec,
    /// Message text of the synthetic WorkItem enqueued on each fire.
    pub payload: String,
    pub next_fire_at: Option<i64>,
    #[serde(default)]
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: TaskStatus,
    #[serde(default)]
    pub last_fired_at: Option<i64>,
    #[serde(default)]
    pub last_result: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub conversation_key: ConversationKey,
    pub schedule: ScheduleSpec,
    pub payload: String,
    pub max_retries: u32,
}

/// One JSON file per task under `tasks/`.
#[derive(Debug, Clone)]
pub struct TaskStore {
    root: PathBuf,
}

impl TaskStore {
    pub fn new(state_root: impl AsRef<Path>) -> Self {
        Self {
            root: state_root.as_ref().join("tasks"),
        }
    }

    pub fn create(&self, input: NewTask, now: i64) -> Result<ScheduledTask, SchedError> {
        validate_schedule(&input.schedule)?;
        let next_fire_at = compute_next_fire(&input.schedule, now, None)?;
        let task = ScheduledTask {
            task_id: format!(
                "task-{}-{}",
                sanitize_component(input.conversation_key.as_str()),
                random_suffix()
            ),
            conversation_key: input.conversation_key,
            schedule: input.schedule,
            payload: input.payload,
            next_fire_at,
            retry_count: 0,
            max_retries: input.max_retries,
            status: TaskStatus::Active,
            last_fired_at: None,
            last_result: None,
            created_at: now,
            updated_at: now,
        };
        self.persist(&task)?;
        Ok(task)
    }

    pub fn load(&self, task_id: &str) -> Result<ScheduledTask, SchedError> {
        let path = self.task_path(task_id);
        if !path.exists() {
            return Err(SchedError::UnknownTask {
                task_id: task_id.to_string(),
            });
        }
        let raw = fs::read_to_string(&path).map_err(|source| SchedError::Io {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| SchedError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn list_all(&self) -> Result<Vec<ScheduledTask>, SchedError> {
        let mut tasks = Vec::new();
        if !self.root.exists() {
            return Ok(tasks);
        }
        for entry in fs::read_dir(&self.root).map_err(|source| SchedError::Io {
            path: self.root.display().to_string(),
            source,
        })? {
            let path = entry
                .map_err(|source| SchedError::Io {
                    path: self.root.display().to_string(),
                    source,
                })?
                .path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|source| SchedError::Io {
                path: path.display().to_string(),
                source,
            })?;
            let task: ScheduledTask =
                serde_json::from_str(&raw).map_err(|source| SchedError::Parse {
                    path: path.display().to_string(),
                    source,
                })?;
            tasks.push(task);
        }
        tasks.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        Ok(tasks)
    }

    pub fn persist(&self, task: &ScheduledTask) -> Result<(), SchedError> {
        fs::create_dir_all(&self.root).map_err(|source| SchedError::Io {
            path: self.root.display().to_string(),
            source,
        })?;
        let path = self.task_path(&task.task_id);
        let body = serde_json::to_vec_pretty(task).map_err(|source| SchedError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        atomic_write_file(&path, &body).map_err(|source| SchedError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn pause(&self, task_id: &str, now: i64) -> Result<ScheduledTask, SchedError> {
        self.transition(task_id, TaskStatus::Paused, now)
    }

    /// Explicit operator action; the only way out of `paused`. Retry state is
    /// cleared and the original schedule resumes from now.
    pub fn resume(&self, task_id: &str, now: i64) -> Result<ScheduledTask, SchedError> {
        let mut task = self.transition(task_id, TaskStatus::Active, now)?;
        task.retry_count = 0;
        task.next_fire_at = compute_next_fire(&task.schedule, now, task.last_fired_at)?;
        task.updated_at = now;
        self.persist(&task)?;
        Ok(task)
    }

    pub fn cancel(&self, task_id: &str, now: i64) -> Result<ScheduledTask, SchedError> {
        self.transition(task_id, TaskStatus::Cancelled, now)
    }

    fn transition(
        &self,
        task_id: &str,
        to: TaskStatus,
        now: i64,
    ) -> Result<ScheduledTask, SchedError> {
        let mut task = self.load(task_id)?;
        if !valid_transition(task.status, to) {
            return Err(SchedError::InvalidTransition {
                task_id: task_id.to_string(),
                from: task.status.name(),
                to: to.name(),
            });
        }
        task.status = to;
        task.updated_at = now;
        self.persist(&task)?;
        Ok(task)
    }

    fn task_path(&self, task_id: &str) -> PathBuf {
        self.root
            .join(format!("{}.json", sanitize_component(task_id)))
    }
}

fn valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    match from {
        TaskStatus::Active => matches!(to, TaskStatus::Paused | TaskStatus::Cancelled),
        TaskStatus::Paused => matches!(to, TaskStatus::Active | TaskStatus::Cancelled),
        TaskStatus::Cancelled => false,
    }
}

pub fn validate_schedule(schedule: &ScheduleSpec) -> Result<(), SchedError> {
    match schedule {
        ScheduleSpec::Once { .. } => Ok(()),
        ScheduleSpec::Interval { every_seconds, .. } => {
            if *every_seconds == 0 {
                return Err(SchedError::InvalidSchedule {
                    message: "interval.every_seconds must be >= 1".to_string(),
                });
            }
            if *every_seconds > 31_536_000 {
                return Err(SchedError::InvalidSchedule {
                    message: "interval.every_seconds must be <= 31536000".to_string(),
                });
            }
            Ok(())
        }
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            CronSchedule::parse(expression)?;
            parse_timezone(timezone)?;
            Ok(())
        }
    }
}

/// Next fire time for a schedule, `None` when a one-off already ran.
pub fn compute_next_fire(
    schedule: &ScheduleSpec,
    now: i64,
    last_fired_at: Option<i64>,
) -> Result<Option<i64>, SchedError> {
    match schedule {
        ScheduleSpec::Once { run_at } => {
            if last_fired_at.is_some() {
                Ok(None)
            } else {
                Ok(Some(*run_at))
            }
        }
        ScheduleSpec::Interval {
            every_seconds,
            anchor_at,
        } => {
            let base = last_fired_at
                .or(*anchor_at)
                .unwrap_or(now)
                .saturating_add(*every_seconds as i64);
            Ok(Some(base))
        }
        ScheduleSpec::Cron {
            expression,
            timezone,
        } => {
            let tz = parse_timezone(timezone)?;
            let cron = CronSchedule::parse(expression)?;
            cron.next_after(last_fired_at.unwrap_or(now), &tz).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn key(raw: &str) -> ConversationKey {
        ConversationKey::parse(raw).expect("valid key")
    }

    fn interval_task(every_seconds: u64) -> NewTask {
        NewTask {
            conversation_key: key("c1"),
            schedule: ScheduleSpec::Interval {
                every_seconds,
                anchor_at: None,
            },
            payload: "daily check".to_string(),
            max_retries: 3,
        }
    }

    #[test]
    fn create_computes_first_fire_and_persists() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::new(dir.path());
        let task = store.create(interval_task(60), 1000).expect("create");
        assert_eq!(task.status, TaskStatus::Active);
        assert_eq!(task.next_fire_at, Some(1060));

        let loaded = store.load(&task.task_id).expect("load");
        assert_eq!(loaded, task);
    }

    #[test]
    fn one_off_next_fire_is_consumed_by_first_run() {
        let schedule = ScheduleSpec::Once { run_at: 500 };
        assert_eq!(
            compute_next_fire(&schedule, 100, None).expect("next"),
            Some(500)
        );
        assert_eq!(
            compute_next_fire(&schedule, 600, Some(500)).expect("next"),
            None
        );
    }

    #[test]
    fn transitions_enforce_the_task_state_machine() {
        let dir = tempdir().expect("tempdir");
        let store = TaskStore::new(dir.path());
        let task = store.create(interval_task(60), 1000).expect("create");

        let paused = store.pause(&task.task_id, 1100).expect("pause");
        assert_eq!(paused.status, TaskStatus::Paused);

        let resumed = store.resume(&task.task_id, 1200).expect("resume");
        assert_eq!(resumed.status, TaskStatus::Active);
        assert_eq!(resumed.retry_count, 0);

        let cancelled = store.cancel(&task.task_id, 1300).expect("cancel");
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        let err = store.resume(&task.task_id, 1400).expect_err("no way back");
        assert!(err.to_string().contains("invalid task transition"));
    }

    #[test]
    fn rejects_invalid_schedules() {
        assert!(validate_schedule(&ScheduleSpec::Interval {
            every_seconds: 0,
            anchor_at: None,
        })
        .is_err());
        assert!(validate_schedule(&ScheduleSpec::Cron {
            expression: "bad".to_string(),
            timezone: "UTC".to_string(),
        })
        .is_err());
        assert!(validate_schedule(&ScheduleSpec::Cron {
            expression: "0 * * * *".to_string(),
            timezone: "UTC".to_string(),
        })
        .is_ok());
    }
}
