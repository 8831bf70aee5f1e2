use super::DispatchError;
use crate::sandbox::ExecStatus;
use crate::shared::fs_atomic::atomic_write_file;
use crate::shared::ids::{sanitize_component, ConversationKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

/// Terminal-outcome callback payload handed to the originating producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub conversation_key: ConversationKey,
    pub execution_id: String,
    pub status: ExecStatus,
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: i64,
}

/// The receiving side owns platform delivery; this crate only guarantees one
/// notification per execution id.
pub trait CompletionNotifier: Send + Sync {
    fn notify(&self, notification: &Notification) -> Result<(), String>;
}

/// Default notifier: one JSON file per outcome under `outbox/`, picked up by
/// whatever chat front end is attached to the state root.
#[derive(Debug, Clone)]
pub struct OutboxNotifier {
    outbox: PathBuf,
}

impl OutboxNotifier {
    pub fn new(state_root: &Path) -> Self {
        Self {
            outbox: state_root.join("outbox"),
        }
    }
}

impl CompletionNotifier for OutboxNotifier {
    fn notify(&self, notification: &Notification) -> Result<(), String> {
        fs::create_dir_all(&self.outbox)
            .map_err(|err| format!("failed to create {}: {err}", self.outbox.display()))?;
        let path = self.outbox.join(format!(
            "{}_{}.json",
            notification.timestamp,
            sanitize_component(&notification.execution_id)
        ));
        let body = serde_json::to_vec_pretty(notification)
            .map_err(|err| format!("failed to encode notification: {err}"))?;
        atomic_write_file(&path, &body)
            .map_err(|err| format!("failed to write {}: {err}", path.display()))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LedgerState {
    #[serde(default)]
    delivered_execution_ids: Vec<String>,
}

const LEDGER_CAPACITY: usize = 2048;

/// Persisted record of already-notified execution ids. Delivering the same
/// execution result twice yields exactly one user-visible outcome.
#[derive(Debug)]
pub struct DeliveryLedger {
    path: PathBuf,
    state: LedgerState,
}

impl DeliveryLedger {
    pub fn load(state_root: &Path) -> Result<Self, DispatchError> {
        let path = state_root.join("daemon/deliveries.json");
        let state = if path.exists() {
            let raw = fs::read_to_string(&path).map_err(|source| DispatchError::State {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&raw).unwrap_or_default()
        } else {
            LedgerState::default()
        };
        Ok(Self { path, state })
    }

    /// Records the delivery and returns true exactly once per execution id.
    pub fn record_if_new(&mut self, execution_id: &str) -> Result<bool, DispatchError> {
        if self
            .state
            .delivered_execution_ids
            .iter()
            .any(|existing| existing == execution_id)
        {
            return Ok(false);
        }
        self.state
            .delivered_execution_ids
            .push(execution_id.to_string());
        if self.state.delivered_execution_ids.len() > LEDGER_CAPACITY {
            let start = self.state.delivered_execution_ids.len() - LEDGER_CAPACITY;
            self.state.delivered_execution_ids =
                self.state.delivered_execution_ids[start..].to_vec();
        }
        self.persist()?;
        Ok(true)
    }

    fn persist(&self) -> Result<(), DispatchError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| DispatchError::State {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let body =
            serde_json::to_vec_pretty(&self.state).unwrap_or_else(|_| b"{}".to_vec());
        atomic_write_file(&self.path, &body).map_err(|source| DispatchError::State {
            path: self.path.display().to_string(),
            source,
        })
    }
}
