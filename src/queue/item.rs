use crate::shared::ids::ConversationKey;
use serde::{Deserialize, Serialize};

/// One message-sized slice of a WorkItem payload: text plus any attachment
/// references that arrived with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadFragment {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemStatus {
    Pending,
    Batched,
    Dispatched,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub fragments: Vec<PayloadFragment>,
    /// Arrival time, unix milliseconds.
    pub timestamp: i64,
    pub status: WorkItemStatus,
    #[serde(default)]
    pub retry_count: u32,
    /// Earliest re-dispatch time after a retry backoff, unix milliseconds.
    #[serde(default)]
    pub not_before: Option<i64>,
}

/// Producer-facing enqueue payload; the queue assigns id and status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewWorkItem {
    pub conversation_key: ConversationKey,
    pub fragments: Vec<PayloadFragment>,
    pub timestamp: i64,
}

impl NewWorkItem {
    pub fn message(conversation_key: ConversationKey, text: &str, timestamp: i64) -> Self {
        Self {
            conversation_key,
            fragments: vec![PayloadFragment {
                text: text.to_string(),
                attachments: Vec::new(),
            }],
            timestamp,
        }
    }
}
