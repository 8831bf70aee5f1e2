use relayd::config::SchedulerSettings;
use relayd::queue::{ItemStore, QueuePaths};
use relayd::sched::{NewTask, ScheduleSpec, TaskScheduler, TaskStatus, TaskStore};
use relayd::shared::ids::ConversationKey;
use std::path::Path;
use tempfile::tempdir;

fn key(raw: &str) -> ConversationKey {
    ConversationKey::parse(raw).expect("valid key")
}

fn scheduler_in(root: &Path) -> (TaskScheduler, ItemStore) {
    let queue = QueuePaths::from_state_root(root);
    queue.bootstrap().expect("queue dirs");
    let items = ItemStore::new(queue);
    let scheduler = TaskScheduler::new(
        root,
        TaskStore::new(root),
        items.clone(),
        SchedulerSettings {
            tick_interval_secs: 60,
            retry_base_delay_secs: 30,
            retry_max_delay_secs: 3600,
        },
    );
    (scheduler, items)
}

#[test]
fn due_interval_task_fires_a_synthetic_work_item() {
    let dir = tempdir().expect("tempdir");
    let (mut scheduler, items) = scheduler_in(dir.path());
    let task = scheduler
        .store()
        .create(
            NewTask {
                conversation_key: key("c1"),
                schedule: ScheduleSpec::Interval {
                    every_seconds: 60,
                    anchor_at: None,
                },
                payload: "ping".to_string(),
                max_retries: 3,
            },
            1000,
        )
        .expect("create");
    assert_eq!(task.next_fire_at, Some(1060));

    // Not yet due.
    assert!(scheduler.tick(1050).expect("early tick").is_empty());
    assert!(items.list_items().expect("list").is_empty());

    let fired = scheduler.tick(1100).expect("tick");
    assert_eq!(fired.len(), 1);
    assert_eq!(fired[0].task_id, task.task_id);

    // The trigger entered the queue through the same entry point chat
    // producers use.
    let queued = items.list_items().expect("list");
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].conversation_key, key("c1"));
    assert_eq!(queued[0].fragments[0].text, "ping");
    assert_eq!(queued[0].timestamp, 1_100_000);

    let updated = scheduler.store().load(&task.task_id).expect("load");
    assert_eq!(updated.status, TaskStatus::Active);
    assert_eq!(updated.next_fire_at, Some(1120));
    assert_eq!(updated.last_fired_at, Some(1100));
    assert_eq!(updated.retry_count, 0);
}

#[test]
fn one_off_task_is_cancelled_after_its_single_fire() {
    let dir = tempdir().expect("tempdir");
    let (mut scheduler, items) = scheduler_in(dir.path());
    let task = scheduler
        .store()
        .create(
            NewTask {
                conversation_key: key("c1"),
                schedule: ScheduleSpec::Once { run_at: 500 },
                payload: "one time".to_string(),
                max_retries: 3,
            },
            100,
        )
        .expect("create");

    let fired = scheduler.tick(600).expect("tick");
    assert_eq!(fired.len(), 1);

    let done = scheduler.store().load(&task.task_id).expect("load");
    assert_eq!(done.status, TaskStatus::Cancelled);
    assert_eq!(done.next_fire_at, None);

    assert!(scheduler.tick(700).expect("later tick").is_empty());
    assert_eq!(items.list_items().expect("list").len(), 1);
}

#[test]
fn cron_task_advances_to_the_next_matching_minute() {
    let dir = tempdir().expect("tempdir");
    let (mut scheduler, _items) = scheduler_in(dir.path());
    let task = scheduler
        .store()
        .create(
            NewTask {
                conversation_key: key("c1"),
                schedule: ScheduleSpec::Cron {
                    expression: "0 9 * * *".to_string(),
                    timezone: "UTC".to_string(),
                },
                payload: "daily digest".to_string(),
                max_retries: 3,
            },
            0,
        )
        .expect("create");
    // 1970-01-01 09:00 UTC.
    assert_eq!(task.next_fire_at, Some(32_400));

    let fired = scheduler.tick(32_460).expect("tick");
    assert_eq!(fired.len(), 1);
    let updated = scheduler.store().load(&task.task_id).expect("load");
    // The next day's 09:00, computed from the scheduled time, not the
    // (late) actual fire time.
    assert_eq!(updated.next_fire_at, Some(118_800));
}

#[test]
fn reported_failures_consume_the_retry_budget_and_pause_at_the_boundary() {
    let dir = tempdir().expect("tempdir");
    let (mut scheduler, _items) = scheduler_in(dir.path());
    let task = scheduler
        .store()
        .create(
            NewTask {
                conversation_key: key("c1"),
                schedule: ScheduleSpec::Interval {
                    every_seconds: 60,
                    anchor_at: None,
                },
                payload: "flaky".to_string(),
                max_retries: 1,
            },
            1000,
        )
        .expect("create");

    let after_first = scheduler
        .report_outcome(&task.task_id, false, 2000)
        .expect("first failure");
    assert_eq!(after_first.status, TaskStatus::Active);
    assert_eq!(after_first.retry_count, 1);
    assert_eq!(after_first.next_fire_at, Some(2030));

    let after_second = scheduler
        .report_outcome(&task.task_id, false, 3000)
        .expect("second failure");
    assert_eq!(after_second.status, TaskStatus::Paused);
    assert_eq!(after_second.retry_count, 2);
    assert_eq!(after_second.next_fire_at, None);

    // Only an explicit resume re-arms the schedule.
    let resumed = scheduler.resume(&task.task_id, 4000).expect("resume");
    assert_eq!(resumed.status, TaskStatus::Active);
    assert_eq!(resumed.retry_count, 0);
    assert_eq!(resumed.next_fire_at, Some(4060));

    let recovered = scheduler
        .report_outcome(&task.task_id, true, 5000)
        .expect("success");
    assert_eq!(recovered.retry_count, 0);
    assert_eq!(recovered.last_result.as_deref(), Some("succeeded"));
}
