use relayd::config::SandboxSettings;
use relayd::ipc::{EnvelopeKind, IpcChannel, IpcEnvelope, StatusRecord, WorkerActivity};
use relayd::sandbox::{ExecMode, HealthAlert, SandboxError, WorkerPool};
use relayd::shared::ids::ConversationKey;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tempfile::tempdir;

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).expect("write script");
    let mut perms = fs::metadata(path).expect("metadata").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_secs() as i64
}

fn key(raw: &str) -> ConversationKey {
    ConversationKey::parse(raw).expect("valid key")
}

fn settings_for(binary: &Path) -> SandboxSettings {
    SandboxSettings {
        mode: ExecMode::Persistent,
        binary: binary.display().to_string(),
        heartbeat_max_age_secs: 30,
        execution_timeout_secs: 600,
        idle_worker_timeout_secs: 600,
        restart_window_secs: 300,
        max_restarts_in_window: 3,
        shutdown_grace_secs: 1,
        ..SandboxSettings::default()
    }
}

/// The pool normally learns liveness from the sandbox's own heartbeat
/// emitter; these tests play that role by writing the files directly.
fn fake_heartbeat(channel: &IpcChannel, at_secs: i64) {
    let envelope = IpcEnvelope {
        kind: EnvelopeKind::Heartbeat,
        correlation_id: "heartbeat".to_string(),
        payload: serde_json::json!({ "at": at_secs }),
        timestamp: at_secs * 1000,
    };
    fs::write(
        channel.paths().heartbeat_file(),
        serde_json::to_vec(&envelope).expect("encode"),
    )
    .expect("write heartbeat");
}

fn fake_status(channel: &IpcChannel, activity: WorkerActivity, started: Option<i64>, now: i64) {
    channel
        .write_status(&StatusRecord {
            activity,
            request_started_at: started,
            updated_at: now,
        })
        .expect("write status");
}

#[test]
fn live_worker_is_reused_for_the_same_conversation() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("worker-sleepy");
    write_script(&bin, "#!/bin/sh\nsleep 30\n");

    let pool = WorkerPool::new(dir.path().join("channels"), settings_for(&bin));
    let first = pool.channel_for(&key("c1")).expect("start worker");
    let second = pool.channel_for(&key("c1")).expect("reuse worker");
    assert_eq!(first.paths().root, second.paths().root);
    assert_eq!(pool.active_worker_count(), 1);

    pool.channel_for(&key("c2")).expect("second conversation");
    assert_eq!(pool.active_worker_count(), 2);
    assert_eq!(pool.active_channels().len(), 2);

    pool.shutdown();
    assert_eq!(pool.active_worker_count(), 0);
}

#[test]
fn dead_process_is_restarted_on_next_use() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("worker-flaky");
    write_script(&bin, "#!/bin/sh\nexit 0\n");

    let pool = WorkerPool::new(dir.path().join("channels"), settings_for(&bin));
    pool.channel_for(&key("c1")).expect("first start");
    thread::sleep(Duration::from_millis(300));

    pool.channel_for(&key("c1")).expect("restart after death");
    assert_eq!(pool.active_worker_count(), 1);
    pool.shutdown();
}

#[test]
fn stale_heartbeat_with_idle_status_triggers_a_restart() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("worker-sleepy");
    write_script(&bin, "#!/bin/sh\nsleep 30\n");

    let pool = WorkerPool::new(dir.path().join("channels"), settings_for(&bin));
    let channel = pool.channel_for(&key("c1")).expect("start worker");

    let now = unix_now();
    fake_heartbeat(&channel, now - 40);
    fake_status(&channel, WorkerActivity::Idle, None, now);

    let alerts = pool.check_health(now);
    assert_eq!(alerts.len(), 1);
    match &alerts[0] {
        HealthAlert::Restarted {
            conversation_key,
            restarts_in_window,
        } => {
            assert_eq!(conversation_key.as_str(), "c1");
            assert_eq!(*restarts_in_window, 1);
        }
        other => panic!("unexpected alert: {other:?}"),
    }
    assert_eq!(pool.active_worker_count(), 1);
    pool.shutdown();
}

#[test]
fn stale_heartbeat_while_processing_is_tolerated() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("worker-sleepy");
    write_script(&bin, "#!/bin/sh\nsleep 30\n");

    let pool = WorkerPool::new(dir.path().join("channels"), settings_for(&bin));
    let channel = pool.channel_for(&key("c1")).expect("start worker");

    let now = unix_now();
    fake_heartbeat(&channel, now - 40);
    fake_status(&channel, WorkerActivity::Processing, Some(now - 60), now);

    assert!(pool.check_health(now).is_empty());
    assert_eq!(pool.active_worker_count(), 1);
    pool.shutdown();
}

#[test]
fn fourth_restart_in_the_window_trips_the_crash_loop() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("worker-sleepy");
    write_script(&bin, "#!/bin/sh\nsleep 30\n");

    let pool = WorkerPool::new(dir.path().join("channels"), settings_for(&bin));
    let channel = pool.channel_for(&key("c1")).expect("start worker");

    for round in 1..=3u32 {
        let now = unix_now();
        fake_heartbeat(&channel, now - 40);
        fake_status(&channel, WorkerActivity::Idle, None, now);
        let alerts = pool.check_health(now);
        assert!(
            matches!(
                alerts.as_slice(),
                [HealthAlert::Restarted {
                    restarts_in_window, ..
                }] if *restarts_in_window == round
            ),
            "round {round}: {alerts:?}"
        );
    }

    let now = unix_now();
    fake_heartbeat(&channel, now - 40);
    fake_status(&channel, WorkerActivity::Idle, None, now);
    let alerts = pool.check_health(now);
    assert_eq!(alerts.len(), 1);
    match &alerts[0] {
        HealthAlert::CrashLoop {
            conversation_key,
            restarts_in_window,
        } => {
            assert_eq!(conversation_key.as_str(), "c1");
            assert_eq!(*restarts_in_window, 4);
        }
        other => panic!("unexpected alert: {other:?}"),
    }
    assert!(alerts[0].is_fatal());
    assert_eq!(pool.active_worker_count(), 0);

    // The key stays refused until an operator clears it.
    let err = pool
        .channel_for(&key("c1"))
        .expect_err("blocked after crash loop");
    assert!(matches!(err, SandboxError::CrashLoop { .. }));

    assert!(pool.clear_crash_loop(&key("c1")));
    pool.channel_for(&key("c1")).expect("fresh start after clear");
    assert_eq!(pool.active_worker_count(), 1);
    pool.shutdown();
}

#[test]
fn idle_worker_past_its_timeout_is_stopped() {
    let dir = tempdir().expect("tempdir");
    let bin = dir.path().join("worker-sleepy");
    write_script(&bin, "#!/bin/sh\nsleep 30\n");

    let pool = WorkerPool::new(dir.path().join("channels"), settings_for(&bin));
    let channel = pool.channel_for(&key("c1")).expect("start worker");

    // Evaluate far in the future with a fresh heartbeat: the worker is
    // healthy but has been idle past the timeout.
    let future = unix_now() + 1000;
    fake_heartbeat(&channel, future);
    fake_status(&channel, WorkerActivity::Idle, None, future);

    let alerts = pool.check_health(future);
    assert!(
        matches!(alerts.as_slice(), [HealthAlert::IdleStopped { .. }]),
        "{alerts:?}"
    );
    assert_eq!(pool.active_worker_count(), 0);
}
