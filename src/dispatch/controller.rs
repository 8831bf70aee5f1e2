use super::admission::Pending;
use super::{
    AdmissionQueue, CompletionNotifier, DeliveryLedger, DispatchError, Execution, Notification,
};
use crate::config::{DispatchSettings, QueueSettings};
use crate::queue::{
    claim_oldest_ready, complete_claimed, release_claimed, ClaimedBatch, ItemStore,
    RequeueOutcome, WorkItem,
};
use crate::sandbox::supervisor::error_is_retryable;
use crate::sandbox::{ExecMode, ExecStatus, ExecutionReport, ExecutionSupervisor, SandboxError};
use crate::shared::ids::{random_suffix, sanitize_component, ConversationKey};
use crate::shared::logging::append_events_log_line;
use crate::shared::time::{now_millis, now_secs};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[derive(Debug)]
struct QueuedExecution {
    claimed: ClaimedBatch,
    execution: Execution,
}

#[derive(Debug)]
struct ActiveExecution {
    execution: Execution,
    cancel: Arc<AtomicBool>,
    discard_result: bool,
}

#[derive(Debug)]
struct ExecutionCompletion {
    key: ConversationKey,
    execution_id: String,
    claimed: ClaimedBatch,
    result: Result<ExecutionReport, SandboxError>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassStats {
    pub claimed: usize,
    pub admitted: usize,
    pub completed: usize,
    pub expired: usize,
}

/// Admits ready batches into executions under a global concurrency ceiling
/// and per-conversation serialization. Each pump pass is non-blocking; the
/// runtime loop drives it on an interval.
pub struct DispatchController {
    state_root: PathBuf,
    store: ItemStore,
    queue_settings: QueueSettings,
    dispatch_settings: DispatchSettings,
    exec_mode: ExecMode,
    supervisor: Arc<ExecutionSupervisor>,
    notifier: Arc<dyn CompletionNotifier>,
    ledger: DeliveryLedger,
    admission: AdmissionQueue<QueuedExecution>,
    active: HashMap<ConversationKey, ActiveExecution>,
    in_flight: usize,
    completions_tx: Sender<ExecutionCompletion>,
    completions_rx: Receiver<ExecutionCompletion>,
}

impl DispatchController {
    pub fn new(
        state_root: &Path,
        queue_settings: QueueSettings,
        dispatch_settings: DispatchSettings,
        exec_mode: ExecMode,
        store: ItemStore,
        supervisor: Arc<ExecutionSupervisor>,
        notifier: Arc<dyn CompletionNotifier>,
    ) -> Result<Self, DispatchError> {
        let ledger = DeliveryLedger::load(state_root)?;
        let (completions_tx, completions_rx) = mpsc::channel();
        Ok(Self {
            state_root: state_root.to_path_buf(),
            store,
            queue_settings,
            dispatch_settings,
            exec_mode,
            supervisor,
            notifier,
            ledger,
            admission: AdmissionQueue::default(),
            active: HashMap::new(),
            in_flight: 0,
            completions_tx,
            completions_rx,
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn has_active(&self, key: &ConversationKey) -> bool {
        self.active
            .get(key)
            .map(|entry| entry.execution.is_active())
            .unwrap_or(false)
    }

    /// One non-blocking dispatch pass: claim ready batches, apply the
    /// interrupt policy, expire over-waited batches, fold in finished
    /// executions, and admit as many waiting batches as free slots allow.
    pub fn pump(&mut self, now: i64) -> Result<PassStats, DispatchError> {
        let mut stats = PassStats::default();

        let mut claim_budget = self.dispatch_settings.max_concurrency.saturating_mul(4);
        while claim_budget > 0 {
            match claim_oldest_ready(self.store.paths())? {
                Some(claimed) => {
                    let key = claimed.batch.conversation_key.clone();
                    let execution = Execution::queued(
                        format!(
                            "exec-{}-{}-{}",
                            sanitize_component(key.as_str()),
                            now,
                            random_suffix()
                        ),
                        key.clone(),
                        self.exec_mode,
                        now,
                    );
                    self.admission
                        .enqueue(key, QueuedExecution { claimed, execution }, now);
                    stats.claimed += 1;
                }
                None => break,
            }
            claim_budget -= 1;
        }

        // Fold finished executions before applying the interrupt policy so a
        // conversation whose run just completed is not superseded and its
        // result discarded.
        loop {
            match self.completions_rx.try_recv() {
                Ok(completion) => {
                    self.handle_completion(completion)?;
                    stats.completed += 1;
                }
                Err(mpsc::TryRecvError::Empty) => break,
                Err(mpsc::TryRecvError::Disconnected) => {
                    return Err(DispatchError::CompletionChannelClosed)
                }
            }
        }

        if self.dispatch_settings.interrupt_on_new_message {
            self.cancel_superseded();
        }

        for expired in self
            .admission
            .take_expired(now, self.dispatch_settings.queue_wait_timeout_ms)
        {
            stats.expired += 1;
            self.fail_fast_expired(expired)?;
        }

        let available = self
            .dispatch_settings
            .max_concurrency
            .saturating_sub(self.in_flight);
        for pending in self.admission.dequeue_runnable(available) {
            self.spawn_execution(pending);
            stats.admitted += 1;
        }

        Ok(stats)
    }

    /// Blocks until every in-flight execution completed or `timeout` passed,
    /// then returns unexecuted claimed batches to the ready queue.
    pub fn drain(&mut self, timeout: Duration) -> Result<(), DispatchError> {
        let deadline = Instant::now() + timeout;
        while self.in_flight > 0 && Instant::now() < deadline {
            match self.completions_rx.recv_timeout(Duration::from_millis(50)) {
                Ok(completion) => self.handle_completion(completion)?,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for pending in self.admission.drain_pending() {
            release_claimed(self.store.paths(), &pending.value.claimed)?;
        }
        Ok(())
    }

    /// Sends a cancellation to every active execution whose conversation has
    /// a newer batch waiting; its eventual result will be discarded.
    fn cancel_superseded(&mut self) {
        for key in self.admission.blocked_keys() {
            let execution_id = if let Some(active) = self.active.get_mut(&key) {
                if !active.discard_result {
                    active.discard_result = true;
                    active.cancel.store(true, Ordering::Relaxed);
                    Some(active.execution.id.clone())
                } else {
                    None
                }
            } else {
                None
            };
            if let Some(execution_id) = execution_id {
                self.log_event(json!({
                    "event": "dispatch.interrupt",
                    "conversationKey": key.as_str(),
                    "executionId": execution_id,
                }));
            }
        }
    }

    fn fail_fast_expired(
        &mut self,
        expired: Pending<QueuedExecution>,
    ) -> Result<(), DispatchError> {
        let QueuedExecution {
            claimed,
            mut execution,
        } = expired.value;
        execution.status = ExecStatus::TimedOut;
        self.log_event(json!({
            "event": "dispatch.queue_wait.timed_out",
            "conversationKey": expired.key.as_str(),
            "executionId": execution.id,
            "waitedMs": now_millis().saturating_sub(expired.enqueued_at),
        }));
        self.deliver(&Notification {
            conversation_key: expired.key.clone(),
            execution_id: execution.id.clone(),
            status: ExecStatus::TimedOut,
            payload: None,
            error: Some("timed out waiting for an execution slot".to_string()),
            timestamp: now_secs(),
        })?;
        self.requeue_members(&claimed.batch.items)?;
        complete_claimed(self.store.paths(), &claimed)?;
        Ok(())
    }

    fn spawn_execution(&mut self, pending: Pending<QueuedExecution>) {
        let QueuedExecution {
            claimed,
            mut execution,
        } = pending.value;
        execution.status = ExecStatus::Running;
        execution.started_at = Some(now_secs());

        let cancel = Arc::new(AtomicBool::new(false));
        let supervisor = Arc::clone(&self.supervisor);
        let tx = self.completions_tx.clone();
        let key = pending.key.clone();
        let execution_id = execution.id.clone();
        let cancel_for_run = Arc::clone(&cancel);

        self.log_event(json!({
            "event": "dispatch.admitted",
            "conversationKey": key.as_str(),
            "executionId": execution_id,
            "batchId": claimed.batch.id,
            "items": claimed.batch.items.len(),
        }));

        let _ = thread::spawn(move || {
            let result = supervisor.run(&execution_id, &claimed.batch, &cancel_for_run);
            let _ = tx.send(ExecutionCompletion {
                key,
                execution_id,
                claimed,
                result,
            });
        });

        self.active.insert(
            pending.key,
            ActiveExecution {
                execution,
                cancel,
                discard_result: false,
            },
        );
        self.in_flight += 1;
    }

    fn handle_completion(&mut self, completion: ExecutionCompletion) -> Result<(), DispatchError> {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.admission.complete(&completion.key);
        let discard = self
            .active
            .remove(&completion.key)
            .map(|active| active.discard_result)
            .unwrap_or(false);

        match completion.result {
            Ok(report) => {
                let report = if discard && report.status != ExecStatus::Cancelled {
                    // Superseded mid-flight: the result arrived before the
                    // sandbox noticed the interrupt. Discard it.
                    ExecutionReport {
                        status: ExecStatus::Cancelled,
                        payload: None,
                        error: Some("superseded by a newer message".to_string()),
                        retryable: false,
                        ..report
                    }
                } else {
                    report
                };

                self.log_event(json!({
                    "event": "dispatch.completed",
                    "conversationKey": completion.key.as_str(),
                    "executionId": report.execution_id,
                    "status": report.status,
                }));
                self.deliver(&Notification {
                    conversation_key: completion.key.clone(),
                    execution_id: report.execution_id.clone(),
                    status: report.status,
                    payload: report.payload.clone(),
                    error: report.error.clone(),
                    timestamp: now_secs(),
                })?;

                let should_retry = report.retryable
                    && matches!(report.status, ExecStatus::Failed | ExecStatus::TimedOut);
                if should_retry {
                    self.requeue_members(&completion.claimed.batch.items)?;
                }
            }
            Err(error) => {
                let fatal = matches!(error, SandboxError::CrashLoop { .. });
                self.log_event(json!({
                    "event": if fatal {
                        "dispatch.execution.fatal"
                    } else {
                        "dispatch.execution.error"
                    },
                    "conversationKey": completion.key.as_str(),
                    "executionId": completion.execution_id,
                    "error": error.to_string(),
                }));
                self.deliver(&Notification {
                    conversation_key: completion.key.clone(),
                    execution_id: completion.execution_id.clone(),
                    status: ExecStatus::Failed,
                    payload: None,
                    error: Some(error.to_string()),
                    timestamp: now_secs(),
                })?;
                if error_is_retryable(&error) {
                    self.requeue_members(&completion.claimed.batch.items)?;
                }
            }
        }

        complete_claimed(self.store.paths(), &completion.claimed)?;
        Ok(())
    }

    /// Exactly-once user-visible outcome per execution id: the delivery
    /// ledger swallows duplicates before the notifier sees them.
    fn deliver(&mut self, notification: &Notification) -> Result<(), DispatchError> {
        if !self.ledger.record_if_new(&notification.execution_id)? {
            return Ok(());
        }
        if let Err(error) = self.notifier.notify(notification) {
            self.log_event(json!({
                "event": "dispatch.notify.error",
                "executionId": notification.execution_id,
                "error": error,
            }));
        }
        Ok(())
    }

    fn requeue_members(&self, members: &[WorkItem]) -> Result<(), DispatchError> {
        for member in members {
            match self.store.requeue_with_backoff(member, &self.queue_settings)? {
                RequeueOutcome::Requeued => {}
                RequeueOutcome::RetriesExhausted => {
                    self.log_event(json!({
                        "event": "queue.item.failed",
                        "itemId": member.id,
                        "conversationKey": member.conversation_key.as_str(),
                        "retryCount": member.retry_count + 1,
                    }));
                }
            }
        }
        Ok(())
    }

    fn log_event(&self, mut payload: serde_json::Value) {
        if let Some(map) = payload.as_object_mut() {
            map.insert("timestamp".to_string(), json!(now_secs()));
        }
        if let Ok(line) = serde_json::to_string(&payload) {
            let _ = append_events_log_line(&self.state_root, &line);
        }
    }
}
