pub mod admission;
pub mod controller;
pub mod notify;

pub use admission::AdmissionQueue;
pub use controller::{DispatchController, PassStats};
pub use notify::{CompletionNotifier, DeliveryLedger, Notification, OutboxNotifier};

use crate::sandbox::{ExecMode, ExecStatus};
use crate::shared::ids::ConversationKey;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] crate::queue::QueueError),
    #[error("dispatch state error at {path}: {source}")]
    State {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("execution completion channel disconnected")]
    CompletionChannelClosed,
}

/// One run of a sandboxed process against a batch. `queued` and `running`
/// are the only states that count as active for per-conversation
/// exclusivity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execution {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub mode: ExecMode,
    pub status: ExecStatus,
    pub queued_at: i64,
    pub started_at: Option<i64>,
}

impl Execution {
    pub fn queued(
        id: String,
        conversation_key: ConversationKey,
        mode: ExecMode,
        queued_at: i64,
    ) -> Self {
        Self {
            id,
            conversation_key,
            mode,
            status: ExecStatus::Queued,
            queued_at,
            started_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}
