use crate::shared::ids::ConversationKey;
use std::collections::{HashSet, VecDeque};

#[derive(Debug)]
pub struct Pending<T> {
    pub key: ConversationKey,
    pub value: T,
    pub enqueued_at: i64,
}

/// FIFO admission queue with per-conversation exclusivity. A head entry
/// blocked by its conversation's active execution is skipped, not popped, so
/// unrelated conversations never wait behind it; order within one
/// conversation is preserved.
#[derive(Debug)]
pub struct AdmissionQueue<T> {
    pending: VecDeque<Pending<T>>,
    active_keys: HashSet<ConversationKey>,
}

impl<T> Default for AdmissionQueue<T> {
    fn default() -> Self {
        Self {
            pending: VecDeque::new(),
            active_keys: HashSet::new(),
        }
    }
}

impl<T> AdmissionQueue<T> {
    pub fn enqueue(&mut self, key: ConversationKey, value: T, now: i64) {
        self.pending.push_back(Pending {
            key,
            value,
            enqueued_at: now,
        });
    }

    /// Removes and returns every entry whose admission wait exceeded
    /// `timeout_ms`. The wait timeout takes priority over any exclusivity
    /// block: an expired entry is returned even if its key is idle.
    pub fn take_expired(&mut self, now: i64, timeout_ms: u64) -> Vec<Pending<T>> {
        if timeout_ms == 0 {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(entry) = self.pending.pop_front() {
            if now.saturating_sub(entry.enqueued_at) >= timeout_ms as i64 {
                expired.push(entry);
            } else {
                remaining.push_back(entry);
            }
        }
        self.pending = remaining;
        expired
    }

    /// Pops up to `max_entries` admissible entries in FIFO order, skipping
    /// any whose conversation is already active. Popped keys become active.
    pub fn dequeue_runnable(&mut self, max_entries: usize) -> Vec<Pending<T>> {
        if max_entries == 0 || self.pending.is_empty() {
            return Vec::new();
        }

        let mut selected = Vec::new();
        let mut selected_keys = HashSet::new();
        let mut remaining = VecDeque::new();

        while let Some(entry) = self.pending.pop_front() {
            let key_busy =
                self.active_keys.contains(&entry.key) || selected_keys.contains(&entry.key);
            if !key_busy && selected.len() < max_entries {
                selected_keys.insert(entry.key.clone());
                self.active_keys.insert(entry.key.clone());
                selected.push(entry);
            } else {
                remaining.push_back(entry);
            }
        }

        self.pending = remaining;
        selected
    }

    pub fn complete(&mut self, key: &ConversationKey) {
        self.active_keys.remove(key);
    }

    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.active_keys.contains(key)
    }

    /// Keys of waiting entries whose conversation currently has an active
    /// execution; used by the interrupt-on-new-message policy.
    pub fn blocked_keys(&self) -> Vec<ConversationKey> {
        self.pending
            .iter()
            .filter(|entry| self.active_keys.contains(&entry.key))
            .map(|entry| entry.key.clone())
            .collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active_keys.len()
    }

    pub fn drain_pending(&mut self) -> Vec<Pending<T>> {
        self.pending.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(raw: &str) -> ConversationKey {
        ConversationKey::parse(raw).expect("valid key")
    }

    #[test]
    fn skips_blocked_head_without_reordering_its_conversation() {
        let mut queue = AdmissionQueue::default();
        queue.enqueue(key("c1"), "a1", 0);
        queue.enqueue(key("c1"), "a2", 1);
        queue.enqueue(key("c2"), "b1", 2);

        let first = queue.dequeue_runnable(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].value, "a1");
        assert_eq!(first[1].value, "b1");

        // c1 still active: its second batch must wait even with free slots.
        assert!(queue.dequeue_runnable(2).is_empty());

        queue.complete(&key("c1"));
        let next = queue.dequeue_runnable(2);
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].value, "a2");
    }

    #[test]
    fn concurrency_cap_limits_admissions_across_keys() {
        let mut queue = AdmissionQueue::default();
        queue.enqueue(key("c1"), 1, 0);
        queue.enqueue(key("c2"), 2, 0);
        queue.enqueue(key("c3"), 3, 0);

        let admitted = queue.dequeue_runnable(2);
        assert_eq!(admitted.len(), 2);
        assert_eq!(queue.pending_len(), 1);

        queue.complete(&key("c1"));
        let rest = queue.dequeue_runnable(2);
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].value, 3);
    }

    #[test]
    fn expired_entries_are_taken_even_when_blocked() {
        let mut queue = AdmissionQueue::default();
        let admitted = {
            queue.enqueue(key("c1"), "active", 0);
            queue.dequeue_runnable(1)
        };
        assert_eq!(admitted.len(), 1);

        queue.enqueue(key("c1"), "waiting", 100);
        let expired = queue.take_expired(5100, 5000);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].value, "waiting");
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn zero_timeout_means_wait_indefinitely() {
        let mut queue = AdmissionQueue::default();
        queue.enqueue(key("c1"), "waiting", 0);
        assert!(queue.take_expired(i64::MAX, 0).is_empty());
        assert_eq!(queue.pending_len(), 1);
    }
}
