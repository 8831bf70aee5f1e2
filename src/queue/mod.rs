pub mod batch;
pub mod item;
pub mod paths;
pub mod store;

pub use batch::{
    claim_oldest_ready, complete_claimed, release_claimed, sweep_stalled, Batch, Batcher,
    ClaimedBatch, SweepReport,
};
pub use item::{NewWorkItem, PayloadFragment, WorkItem, WorkItemStatus};
pub use paths::{is_valid_queue_json_filename, QueuePaths};
pub use store::{backoff_delay_ms, ItemStore, RequeueOutcome};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid queue payload in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueSettings;
    use crate::shared::ids::ConversationKey;
    use tempfile::tempdir;

    fn key(raw: &str) -> ConversationKey {
        ConversationKey::parse(raw).expect("valid key")
    }

    fn store_in(dir: &std::path::Path) -> ItemStore {
        let paths = QueuePaths::from_state_root(dir);
        paths.bootstrap().expect("bootstrap queue dirs");
        ItemStore::new(paths)
    }

    fn settings() -> QueueSettings {
        QueueSettings {
            batch_window_ms: 2000,
            batch_max_items: 50,
            stalled_after_secs: 300,
            retry_base_delay_ms: 3000,
            retry_max_delay_ms: 60_000,
            max_retries: 4,
        }
    }

    #[test]
    fn items_within_window_fold_into_one_ordered_batch() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let base = 1_700_000_000_000i64;

        for offset in 0..5 {
            store
                .enqueue(NewWorkItem::message(
                    key("c1"),
                    &format!("m{offset}"),
                    base + offset * 100,
                ))
                .expect("enqueue");
        }

        let mut batcher = Batcher::new(&settings());
        // 500ms after the first arrival: window still open, nothing closes.
        let early = batcher.tick(&store, base + 500).expect("tick");
        assert!(early.is_empty());

        let closed = batcher.tick(&store, base + 2000).expect("tick");
        assert_eq!(closed.len(), 1);
        let batch = &closed[0];
        assert_eq!(batch.conversation_key, key("c1"));
        assert_eq!(batch.items.len(), 5);
        let texts: Vec<&str> = batch
            .items
            .iter()
            .map(|item| item.fragments[0].text.as_str())
            .collect();
        assert_eq!(texts, vec!["m0", "m1", "m2", "m3", "m4"]);

        // Member item files were consumed by closure.
        assert!(store.list_items().expect("list").is_empty());
    }

    #[test]
    fn size_limit_closes_batch_before_window() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let mut config = settings();
        config.batch_max_items = 2;
        let base = 1_700_000_000_000i64;

        for offset in 0..3 {
            store
                .enqueue(NewWorkItem::message(
                    key("c1"),
                    &format!("m{offset}"),
                    base + offset,
                ))
                .expect("enqueue");
        }

        let mut batcher = Batcher::new(&config);
        let closed = batcher.tick(&store, base + 10).expect("tick");
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].items.len(), 2);

        // The remainder is under the size limit and waits for its own
        // window instead of closing early.
        assert_eq!(store.list_items().expect("list").len(), 1);
        let later = batcher.tick(&store, base + 3000).expect("tick");
        assert_eq!(later.len(), 1);
        assert_eq!(later[0].items.len(), 1);
        assert_eq!(later[0].items[0].fragments[0].text, "m2");
    }

    #[test]
    fn late_item_starts_a_new_batch_after_closure() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let base = 1_700_000_000_000i64;

        store
            .enqueue(NewWorkItem::message(key("c1"), "first", base))
            .expect("enqueue");
        let mut batcher = Batcher::new(&settings());
        let first_close = batcher.tick(&store, base + 2000).expect("tick");
        assert_eq!(first_close.len(), 1);

        store
            .enqueue(NewWorkItem::message(key("c1"), "late", base + 2001))
            .expect("enqueue late");
        let second_close = batcher.tick(&store, base + 4500).expect("tick");
        assert_eq!(second_close.len(), 1);
        assert_eq!(second_close[0].items[0].fragments[0].text, "late");
        assert_ne!(first_close[0].id, second_close[0].id);
    }

    #[test]
    fn distinct_conversations_batch_independently() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let base = 1_700_000_000_000i64;

        store
            .enqueue(NewWorkItem::message(key("c1"), "a", base))
            .expect("enqueue");
        store
            .enqueue(NewWorkItem::message(key("c2"), "b", base + 1))
            .expect("enqueue");

        let mut batcher = Batcher::new(&settings());
        let closed = batcher.tick(&store, base + 2000).expect("tick");
        assert_eq!(closed.len(), 2);
        let keys: Vec<&str> = closed
            .iter()
            .map(|batch| batch.conversation_key.as_str())
            .collect();
        assert_eq!(keys, vec!["c1", "c2"]);
    }

    #[test]
    fn claim_is_exactly_once_and_completion_removes_the_batch() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let base = 1_700_000_000_000i64;
        store
            .enqueue(NewWorkItem::message(key("c1"), "a", base))
            .expect("enqueue");
        let mut batcher = Batcher::new(&settings());
        batcher.tick(&store, base + 2000).expect("tick");

        let claimed = claim_oldest_ready(store.paths())
            .expect("claim")
            .expect("batch");
        assert!(claimed.dispatched_path.exists());
        assert!(claim_oldest_ready(store.paths())
            .expect("second claim")
            .is_none());

        complete_claimed(store.paths(), &claimed).expect("complete");
        assert!(!claimed.dispatched_path.exists());
    }

    #[test]
    fn backoff_gate_defers_rebatching_until_not_before() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let base = crate::shared::time::now_millis();

        let item = store
            .enqueue(NewWorkItem::message(key("c1"), "retry me", base))
            .expect("enqueue");
        // First failure: requeued behind the base delay.
        let outcome = store
            .requeue_with_backoff(&item, &settings())
            .expect("requeue");
        assert_eq!(outcome, RequeueOutcome::Requeued);

        let gated = &store.list_items().expect("list")[0];
        assert_eq!(gated.retry_count, 1);
        let gate = gated.not_before.expect("backoff gate");

        let mut batcher = Batcher::new(&settings());
        let before_gate = batcher.tick(&store, gate - 1).expect("tick");
        assert!(before_gate.is_empty());
        let after_gate = batcher.tick(&store, gate + 2000).expect("tick");
        assert_eq!(after_gate.len(), 1);
        assert_eq!(after_gate[0].items[0].retry_count, 1);
    }

    #[test]
    fn fifth_failure_marks_item_failed_not_reenqueued() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let config = settings();
        let base = crate::shared::time::now_millis();

        let mut item = store
            .enqueue(NewWorkItem::message(key("c1"), "doomed", base))
            .expect("enqueue");

        for attempt in 1..=4 {
            let outcome = store
                .requeue_with_backoff(&item, &config)
                .expect("requeue");
            assert_eq!(outcome, RequeueOutcome::Requeued, "attempt {attempt}");
            item = store.list_items().expect("list").remove(0);
            assert_eq!(item.retry_count, attempt);
        }

        let outcome = store
            .requeue_with_backoff(&item, &config)
            .expect("final requeue");
        assert_eq!(outcome, RequeueOutcome::RetriesExhausted);
        assert!(store.list_items().expect("list").is_empty());

        let failed: Vec<_> = std::fs::read_dir(&store.paths().failed)
            .expect("failed dir")
            .collect();
        assert_eq!(failed.len(), 1);
    }

    #[test]
    fn stalled_ready_batch_is_dissolved_with_retry_increment() {
        let dir = tempdir().expect("tempdir");
        let store = store_in(dir.path());
        let config = settings();
        let now = crate::shared::time::now_millis();
        let stale = now - (config.stalled_after_secs as i64 * 1000) - 5000;

        store
            .enqueue(NewWorkItem::message(key("c1"), "stalled", stale))
            .expect("enqueue");
        let mut batcher = Batcher::new(&config);
        let closed = batcher.tick(&store, stale + 2000).expect("tick");
        assert_eq!(closed.len(), 1);
        // Nobody claims the ready batch; force closed_at to look stale.
        let ready_path = store
            .paths()
            .ready
            .join(paths::batch_filename(&closed[0].id));
        let mut stale_batch = closed[0].clone();
        stale_batch.closed_at = stale + 2000;
        std::fs::write(
            &ready_path,
            serde_json::to_vec_pretty(&stale_batch).expect("encode"),
        )
        .expect("write stale batch");

        let report = sweep_stalled(&store, &config, now).expect("sweep");
        assert_eq!(report.requeued, 1);
        assert!(report.failed_item_ids.is_empty());
        assert!(claim_oldest_ready(store.paths()).expect("claim").is_none());
        assert_eq!(store.list_items().expect("list")[0].retry_count, 1);
    }
}
