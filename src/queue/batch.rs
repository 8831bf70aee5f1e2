use super::store::{io_err, parse_err, sorted_json_paths, ItemStore, RequeueOutcome};
use super::{QueueError, QueuePaths, WorkItem, WorkItemStatus};
use crate::config::QueueSettings;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{random_suffix, sanitize_component, ConversationKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

/// An ordered group of same-conversation WorkItems, immutable once closed.
/// A closed batch is the unit of dispatch and is consumed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub items: Vec<WorkItem>,
    pub opened_at: i64,
    pub closed_at: i64,
}

#[derive(Debug, Clone)]
pub struct ClaimedBatch {
    pub ready_path: PathBuf,
    pub dispatched_path: PathBuf,
    pub batch: Batch,
}

#[derive(Debug)]
struct OpenBatch {
    items: Vec<WorkItem>,
    opened_at: i64,
}

/// Folds pending items into per-conversation open batches and closes them
/// when the batch window elapses or the size limit is hit, whichever first.
/// Only one batcher runs per state root, which keeps close-vs-append atomic:
/// an item that arrives after closure simply opens the next batch.
#[derive(Debug)]
pub struct Batcher {
    window_ms: u64,
    max_items: usize,
}

impl Batcher {
    pub fn new(settings: &QueueSettings) -> Self {
        Self {
            window_ms: settings.batch_window_ms,
            max_items: settings.batch_max_items,
        }
    }

    /// One batching pass: absorb actionable pending items, close every batch
    /// that is full or whose window has elapsed, persist the closed batches
    /// under `queue/ready`, and consume their member item files.
    pub fn tick(&mut self, store: &ItemStore, now: i64) -> Result<Vec<Batch>, QueueError> {
        let mut open: BTreeMap<ConversationKey, OpenBatch> = BTreeMap::new();

        for item in store.list_items()? {
            let actionable = match item.status {
                WorkItemStatus::Pending => item.not_before.map(|at| at <= now).unwrap_or(true),
                // Batched items whose batch never closed (crash between
                // absorb and close) are re-absorbed here.
                WorkItemStatus::Batched => true,
                _ => false,
            };
            if !actionable {
                continue;
            }
            let entry = open
                .entry(item.conversation_key.clone())
                .or_insert_with(|| OpenBatch {
                    items: Vec::new(),
                    opened_at: item.timestamp,
                });
            entry.opened_at = entry.opened_at.min(item.timestamp);
            entry.items.push(item);
        }

        let mut closed = Vec::new();
        for (key, open_batch) in open {
            let window_elapsed = now.saturating_sub(open_batch.opened_at) >= self.window_ms as i64;
            let mut waiting = open_batch.items;

            while !waiting.is_empty() {
                if waiting.len() < self.max_items && !window_elapsed {
                    // Under the size limit with the window still open: keep
                    // collecting. Mark members as batched so a stalled sweep
                    // can tell them apart from items that never reached a
                    // batch. A remainder left over after a full batch closed
                    // starts its own window on the next pass.
                    for item in &waiting {
                        if item.status == WorkItemStatus::Pending {
                            let mut marked = item.clone();
                            marked.status = WorkItemStatus::Batched;
                            store.write_item(&marked)?;
                        }
                    }
                    break;
                }

                let take = waiting.len().min(self.max_items.max(1));
                let mut members: Vec<WorkItem> = waiting.drain(..take).collect();
                for member in &mut members {
                    member.status = WorkItemStatus::Dispatched;
                }
                let batch = Batch {
                    id: format!(
                        "batch-{}-{}-{}",
                        now,
                        sanitize_component(key.as_str()),
                        random_suffix()
                    ),
                    conversation_key: key.clone(),
                    items: members.clone(),
                    opened_at: open_batch.opened_at,
                    closed_at: now,
                };
                write_ready_batch(store.paths(), &batch)?;
                for member in &members {
                    store.remove_item(member)?;
                }
                closed.push(batch);
            }
        }

        Ok(closed)
    }
}

fn write_ready_batch(paths: &QueuePaths, batch: &Batch) -> Result<(), QueueError> {
    let path = paths.ready.join(super::paths::batch_filename(&batch.id));
    let body = serde_json::to_vec_pretty(batch).map_err(|e| parse_err(&path, e))?;
    atomic_write_file(&path, &body).map_err(|e| io_err(&path, e))
}

/// Claims the oldest ready batch by renaming it into `queue/dispatched`. The
/// rename is the exactly-once hand-off: a batch that loses the race is simply
/// skipped.
pub fn claim_oldest_ready(paths: &QueuePaths) -> Result<Option<ClaimedBatch>, QueueError> {
    for ready_path in sorted_json_paths(&paths.ready)? {
        let Some(file_name) = ready_path.file_name() else {
            continue;
        };
        let dispatched_path = paths.dispatched.join(file_name);

        match fs::rename(&ready_path, &dispatched_path) {
            Ok(()) => {
                let raw = match fs::read_to_string(&dispatched_path) {
                    Ok(raw) => raw,
                    Err(err) => {
                        requeue_dispatched_file(paths, &dispatched_path)?;
                        return Err(io_err(&dispatched_path, err));
                    }
                };
                let batch: Batch = match serde_json::from_str(&raw) {
                    Ok(batch) => batch,
                    Err(err) => {
                        requeue_dispatched_file(paths, &dispatched_path)?;
                        return Err(parse_err(&dispatched_path, err));
                    }
                };
                return Ok(Some(ClaimedBatch {
                    ready_path,
                    dispatched_path,
                    batch,
                }));
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(io_err(&ready_path, err)),
        }
    }
    Ok(None)
}

/// Drops the in-flight batch file once its execution reached a terminal state
/// and its items were either notified or re-enqueued.
pub fn complete_claimed(paths: &QueuePaths, claimed: &ClaimedBatch) -> Result<(), QueueError> {
    match fs::remove_file(&claimed.dispatched_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(io_err(&claimed.dispatched_path, err)),
    }
}

/// Returns a claimed batch to `queue/ready` unexecuted, e.g. when the
/// dispatcher shuts down before a slot opened. The unique rename never
/// clobbers a newer ready batch.
pub fn release_claimed(paths: &QueuePaths, claimed: &ClaimedBatch) -> Result<(), QueueError> {
    requeue_dispatched_file(paths, &claimed.dispatched_path)
}

fn requeue_dispatched_file(paths: &QueuePaths, dispatched: &PathBuf) -> Result<(), QueueError> {
    let name = dispatched
        .file_stem()
        .and_then(|v| v.to_str())
        .unwrap_or("batch");
    let target = paths
        .ready
        .join(format!("{}_requeue_{}.json", name, random_suffix()));
    fs::rename(dispatched, &target).map_err(|e| io_err(dispatched, e))?;
    Ok(())
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub requeued: usize,
    pub failed_item_ids: Vec<String>,
}

/// Requeues work that sat past the stalled timeout without being picked up:
/// ready batches nobody claimed and loose items the batcher never folded in.
/// Every pass increments retry counts; exhausted items land in
/// `queue/failed` and are reported, never dropped.
pub fn sweep_stalled(
    store: &ItemStore,
    settings: &QueueSettings,
    now: i64,
) -> Result<SweepReport, QueueError> {
    let stalled_ms = (settings.stalled_after_secs as i64).saturating_mul(1000);
    let mut report = SweepReport::default();

    for ready_path in sorted_json_paths(&store.paths().ready)? {
        let raw = fs::read_to_string(&ready_path).map_err(|e| io_err(&ready_path, e))?;
        let batch: Batch = serde_json::from_str(&raw).map_err(|e| parse_err(&ready_path, e))?;
        if now.saturating_sub(batch.closed_at) < stalled_ms {
            continue;
        }
        for member in &batch.items {
            match store.requeue_with_backoff(member, settings)? {
                RequeueOutcome::Requeued => report.requeued += 1,
                RequeueOutcome::RetriesExhausted => {
                    report.failed_item_ids.push(member.id.clone())
                }
            }
        }
        fs::remove_file(&ready_path).map_err(|e| io_err(&ready_path, e))?;
    }

    for item in store.list_items()? {
        let since = item.not_before.unwrap_or(item.timestamp).max(item.timestamp);
        if now.saturating_sub(since) < stalled_ms {
            continue;
        }
        match store.requeue_with_backoff(&item, settings)? {
            RequeueOutcome::Requeued => report.requeued += 1,
            RequeueOutcome::RetriesExhausted => report.failed_item_ids.push(item.id.clone()),
        }
    }

    Ok(report)
}
