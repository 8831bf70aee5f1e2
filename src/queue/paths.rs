use super::QueueError;
use crate::shared::ids::sanitize_component;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePaths {
    /// Pending and batched WorkItems, one JSON file each.
    pub items: PathBuf,
    /// Closed batches awaiting dispatch.
    pub ready: PathBuf,
    /// Batches claimed by the dispatcher, in flight.
    pub dispatched: PathBuf,
    /// Items whose retries are exhausted; kept for operator inspection.
    pub failed: PathBuf,
}

impl QueuePaths {
    pub fn from_state_root(state_root: &Path) -> Self {
        Self {
            items: state_root.join("queue/items"),
            ready: state_root.join("queue/ready"),
            dispatched: state_root.join("queue/dispatched"),
            failed: state_root.join("queue/failed"),
        }
    }

    pub fn bootstrap(&self) -> Result<(), QueueError> {
        for dir in [&self.items, &self.ready, &self.dispatched, &self.failed] {
            fs::create_dir_all(dir).map_err(|source| QueueError::Io {
                path: dir.display().to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

pub fn item_filename(timestamp: i64, item_id: &str) -> String {
    format!("{}_{}.json", timestamp, sanitize_component(item_id))
}

pub fn batch_filename(batch_id: &str) -> String {
    format!("{}.json", sanitize_component(batch_id))
}

pub fn is_valid_queue_json_filename(filename: &str) -> bool {
    let path = Path::new(filename);
    if path.extension().and_then(|v| v.to_str()) != Some("json") {
        return false;
    }
    path.file_stem()
        .and_then(|v| v.to_str())
        .map(|stem| !stem.trim().is_empty())
        .unwrap_or(false)
}
