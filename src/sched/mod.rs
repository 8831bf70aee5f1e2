pub mod cron;
pub mod scheduler;
pub mod task;

pub use cron::CronSchedule;
pub use scheduler::{FiredTask, TaskScheduler};
pub use task::{
    compute_next_fire, NewTask, ScheduleSpec, ScheduledTask, TaskStatus, TaskStore,
};

#[derive(Debug, thiserror::Error)]
pub enum SchedError {
    #[error("scheduler io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid task record in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid schedule: {message}")]
    InvalidSchedule { message: String },
    #[error("unknown task `{task_id}`")]
    UnknownTask { task_id: String },
    #[error("invalid task transition `{from}` -> `{to}` for `{task_id}`")]
    InvalidTransition {
        task_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
}
