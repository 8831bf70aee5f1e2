use crate::queue::{Batch, QueuePaths};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Returns batches orphaned in `queue/dispatched` by a crash back to
/// `queue/ready` so they are re-delivered instead of lost.
pub fn recover_dispatched_batches(state_root: &Path) -> Result<Vec<PathBuf>, String> {
    let queue_paths = QueuePaths::from_state_root(state_root);
    let mut recovered = Vec::new();
    let mut entries = Vec::new();

    for entry in fs::read_dir(&queue_paths.dispatched).map_err(|e| e.to_string())? {
        let entry = entry.map_err(|e| e.to_string())?;
        let path = entry.path();
        if path.is_file() {
            entries.push(path);
        }
    }
    entries.sort();

    for (index, dispatched_path) in entries.into_iter().enumerate() {
        let name = dispatched_path
            .file_name()
            .and_then(|v| v.to_str())
            .filter(|v| !v.trim().is_empty())
            .unwrap_or("batch.json");
        let target = queue_paths
            .ready
            .join(recovered_batch_filename(index, name));
        fs::rename(&dispatched_path, &target).map_err(|e| {
            format!(
                "failed to recover dispatched batch {}: {}",
                dispatched_path.display(),
                e
            )
        })?;
        recovered.push(target);
    }

    Ok(recovered)
}

/// A crash between batch closure and member-file deletion leaves items both
/// inside a persisted batch and loose under `queue/items`. Dropping the loose
/// copies keeps re-delivery from duplicating work.
pub fn dedupe_batch_members(state_root: &Path) -> Result<usize, String> {
    let queue_paths = QueuePaths::from_state_root(state_root);
    let mut member_ids: BTreeSet<String> = BTreeSet::new();

    for dir in [&queue_paths.ready, &queue_paths.dispatched] {
        if !dir.exists() {
            continue;
        }
        for entry in fs::read_dir(dir).map_err(|e| e.to_string())? {
            let path = entry.map_err(|e| e.to_string())?.path();
            if path.extension().and_then(|v| v.to_str()) != Some("json") {
                continue;
            }
            let Ok(raw) = fs::read_to_string(&path) else {
                continue;
            };
            let Ok(batch) = serde_json::from_str::<Batch>(&raw) else {
                continue;
            };
            member_ids.extend(batch.items.into_iter().map(|item| item.id));
        }
    }

    if member_ids.is_empty() {
        return Ok(0);
    }

    let mut removed = 0usize;
    for entry in fs::read_dir(&queue_paths.items).map_err(|e| e.to_string())? {
        let path = entry.map_err(|e| e.to_string())?.path();
        if path.extension().and_then(|v| v.to_str()) != Some("json") {
            continue;
        }
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let Ok(item) = serde_json::from_str::<crate::queue::WorkItem>(&raw) else {
            continue;
        };
        if member_ids.contains(&item.id) {
            fs::remove_file(&path).map_err(|e| e.to_string())?;
            removed += 1;
        }
    }

    Ok(removed)
}

pub(crate) fn recovered_batch_filename(index: usize, name: &str) -> String {
    let ext = Path::new(name)
        .extension()
        .and_then(|v| v.to_str())
        .unwrap_or("json");
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let digest = hasher.finalize();
    let hash = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("recovered_{index}_{hash}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recovered_names_are_stable_and_unique_per_index() {
        let first = recovered_batch_filename(0, "batch-1.json");
        let second = recovered_batch_filename(1, "batch-1.json");
        assert_ne!(first, second);
        assert!(first.starts_with("recovered_0_"));
        assert!(first.ends_with(".json"));
        assert_eq!(first, recovered_batch_filename(0, "batch-1.json"));
    }
}
