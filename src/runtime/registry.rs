use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub enum LoopEvent {
    Started {
        loop_id: String,
        at: i64,
    },
    Heartbeat {
        loop_id: String,
        at: i64,
    },
    Error {
        loop_id: String,
        at: i64,
        message: String,
        fatal: bool,
    },
    Stopped {
        loop_id: String,
        at: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    #[default]
    Stopped,
    Running,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LoopHealth {
    pub state: LoopState,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub last_heartbeat_at: Option<i64>,
    #[serde(default)]
    pub stopped_at: Option<i64>,
    #[serde(default)]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoopLogRecord {
    pub level: &'static str,
    pub event: &'static str,
    pub message: String,
}

/// Folds one control-loop event into the registry. Returns a log record when
/// the event is worth a runtime-log line.
pub fn apply_loop_event(
    loops: &mut BTreeMap<String, LoopHealth>,
    active: &mut BTreeSet<String>,
    event: LoopEvent,
) -> Option<LoopLogRecord> {
    match event {
        LoopEvent::Started { loop_id, at } => {
            let health = loops.entry(loop_id.clone()).or_default();
            health.state = LoopState::Running;
            health.started_at = Some(at);
            health.last_error = None;
            Some(LoopLogRecord {
                level: "info",
                event: "loop.started",
                message: loop_id,
            })
        }
        LoopEvent::Heartbeat { loop_id, at } => {
            let health = loops.entry(loop_id).or_default();
            health.last_heartbeat_at = Some(at);
            None
        }
        LoopEvent::Error {
            loop_id,
            at,
            message,
            fatal,
        } => {
            let health = loops.entry(loop_id.clone()).or_default();
            health.last_error = Some(message.clone());
            health.last_heartbeat_at = Some(at);
            if fatal {
                health.state = LoopState::Error;
            }
            Some(LoopLogRecord {
                level: if fatal { "error" } else { "warn" },
                event: if fatal { "loop.failed" } else { "loop.error" },
                message: format!("{loop_id}: {message}"),
            })
        }
        LoopEvent::Stopped { loop_id, at } => {
            active.remove(&loop_id);
            let health = loops.entry(loop_id.clone()).or_default();
            if health.state != LoopState::Error {
                health.state = LoopState::Stopped;
            }
            health.stopped_at = Some(at);
            Some(LoopLogRecord {
                level: "info",
                event: "loop.stopped",
                message: loop_id,
            })
        }
    }
}
