use super::paths::{is_valid_queue_json_filename, item_filename};
use super::{NewWorkItem, QueueError, QueuePaths, WorkItem, WorkItemStatus};
use crate::config::QueueSettings;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{random_suffix, sanitize_component};
use crate::shared::time::now_millis;
use std::fs;
use std::path::{Path, PathBuf};

/// Durable WorkItem store: one JSON file per item under `queue/items`.
/// Enqueue persists atomically before returning, so a host restart cannot
/// lose an accepted item.
#[derive(Debug, Clone)]
pub struct ItemStore {
    paths: QueuePaths,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueOutcome {
    Requeued,
    RetriesExhausted,
}

impl ItemStore {
    pub fn new(paths: QueuePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &QueuePaths {
        &self.paths
    }

    /// Persists a new pending item. Fails only when the backing store does;
    /// that failure is fatal to the caller and must not be swallowed.
    pub fn enqueue(&self, new: NewWorkItem) -> Result<WorkItem, QueueError> {
        let item = WorkItem {
            id: format!(
                "item-{}-{}",
                sanitize_component(new.conversation_key.as_str()),
                random_suffix()
            ),
            conversation_key: new.conversation_key,
            fragments: new.fragments,
            timestamp: new.timestamp,
            status: WorkItemStatus::Pending,
            retry_count: 0,
            not_before: None,
        };
        self.write_item(&item)?;
        Ok(item)
    }

    /// All stored items in arrival order, regardless of status or backoff
    /// gates. Callers filter for what they can act on.
    pub fn list_items(&self) -> Result<Vec<WorkItem>, QueueError> {
        let mut items = Vec::new();
        for path in sorted_json_paths(&self.paths.items)? {
            let raw = fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
            let item: WorkItem = serde_json::from_str(&raw).map_err(|e| parse_err(&path, e))?;
            items.push(item);
        }
        items.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(items)
    }

    pub fn write_item(&self, item: &WorkItem) -> Result<(), QueueError> {
        let path = self.item_path(item);
        let body = serde_json::to_vec_pretty(item).map_err(|e| parse_err(&path, e))?;
        atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))
    }

    pub fn remove_item(&self, item: &WorkItem) -> Result<(), QueueError> {
        let path = self.item_path(item);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_err(&path, err)),
        }
    }

    /// Applies the retry policy to a failed or stalled item: bump the retry
    /// count and either re-enqueue it behind an exponential backoff gate or,
    /// once retries are exhausted, surface it under `queue/failed`.
    pub fn requeue_with_backoff(
        &self,
        item: &WorkItem,
        settings: &QueueSettings,
    ) -> Result<RequeueOutcome, QueueError> {
        let mut updated = item.clone();
        updated.retry_count = updated.retry_count.saturating_add(1);

        if updated.retry_count > settings.max_retries {
            updated.status = WorkItemStatus::Failed;
            updated.not_before = None;
            self.write_failed(&updated)?;
            self.remove_item(item)?;
            return Ok(RequeueOutcome::RetriesExhausted);
        }

        let delay = backoff_delay_ms(
            updated.retry_count,
            settings.retry_base_delay_ms,
            settings.retry_max_delay_ms,
        );
        updated.status = WorkItemStatus::Pending;
        updated.not_before = Some(now_millis().saturating_add(delay as i64));
        self.write_item(&updated)?;
        Ok(RequeueOutcome::Requeued)
    }

    /// Re-materializes a batch member after a dispatch failure. The member no
    /// longer has an item file (batch closure consumed it), so this always
    /// writes a fresh one.
    pub fn restore_member(&self, member: &WorkItem) -> Result<(), QueueError> {
        let mut restored = member.clone();
        restored.status = WorkItemStatus::Pending;
        self.write_item(&restored)
    }

    fn write_failed(&self, item: &WorkItem) -> Result<(), QueueError> {
        let path = self
            .paths
            .failed
            .join(item_filename(item.timestamp, &item.id));
        let body = serde_json::to_vec_pretty(item).map_err(|e| parse_err(&path, e))?;
        atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))
    }

    fn item_path(&self, item: &WorkItem) -> PathBuf {
        self.paths.items.join(item_filename(item.timestamp, &item.id))
    }
}

pub fn backoff_delay_ms(retry_count: u32, base_ms: u64, max_ms: u64) -> u64 {
    let exponent = retry_count.saturating_sub(1).min(20);
    base_ms
        .saturating_mul(1u64 << exponent)
        .min(max_ms)
        .max(base_ms.min(max_ms))
}

pub(super) fn sorted_json_paths(dir: &Path) -> Result<Vec<PathBuf>, QueueError> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| io_err(dir, e))? {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
            if !is_valid_queue_json_filename(name) {
                continue;
            }
        }
        entries.push(path);
    }
    entries.sort();
    Ok(entries)
}

pub(super) fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

pub(super) fn parse_err(path: &Path, source: serde_json::Error) -> QueueError {
    QueueError::Parse {
        path: path.display().to_string(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_base_and_caps() {
        assert_eq!(backoff_delay_ms(1, 3000, 60_000), 3000);
        assert_eq!(backoff_delay_ms(2, 3000, 60_000), 6000);
        assert_eq!(backoff_delay_ms(3, 3000, 60_000), 12_000);
        assert_eq!(backoff_delay_ms(5, 3000, 60_000), 48_000);
        assert_eq!(backoff_delay_ms(6, 3000, 60_000), 60_000);
        assert_eq!(backoff_delay_ms(30, 3000, 60_000), 60_000);
    }
}
