//! Delayable message queue
//!
//! Holds outbound messages until their next delivery attempt is due. Ordered
//! by `(ready_at, ttl_absolute)` so that among equally ready messages the one
//! closest to expiry goes first; an insertion sequence number breaks the
//! remaining ties. Not synchronized itself: the router keeps it behind a mutex.

use std::collections::{BTreeMap, HashMap};

use crate::message::{DelayableMessage, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    ready_at_ms: i64,
    ttl_absolute_ms: i64,
    seq: u64,
}

#[derive(Debug, Default)]
pub struct DelayableMessageQueue {
    entries: BTreeMap<QueueKey, DelayableMessage>,
    keys_by_id: HashMap<MessageId, QueueKey>,
    next_seq: u64,
}

impl DelayableMessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `message`. Returns false, leaving the queue untouched, if a
    /// message with the same id is already queued.
    pub fn push(&mut self, message: DelayableMessage) -> bool {
        if self.keys_by_id.contains_key(message.id()) {
            return false;
        }
        let key = QueueKey {
            ready_at_ms: message.ready_at_ms(),
            ttl_absolute_ms: message.message().ttl_absolute_ms(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.keys_by_id.insert(message.id().to_string(), key);
        self.entries.insert(key, message);
        true
    }

    /// Takes the earliest message whose `ready_at` is not after `now_ms`.
    pub fn pop_ready(&mut self, now_ms: i64) -> Option<DelayableMessage> {
        let key = *self.entries.keys().next()?;
        if key.ready_at_ms > now_ms {
            return None;
        }
        let message = self.entries.remove(&key)?;
        self.keys_by_id.remove(message.id());
        Some(message)
    }

    pub fn next_ready_at(&self) -> Option<i64> {
        self.entries.keys().next().map(|k| k.ready_at_ms)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.keys_by_id.contains_key(message_id)
    }

    /// Removes and returns every queued message addressed to `participant_id`.
    pub fn remove_for_recipient(&mut self, participant_id: &str) -> Vec<DelayableMessage> {
        let keys: Vec<QueueKey> = self
            .entries
            .iter()
            .filter(|(_, m)| m.message().recipient() == participant_id)
            .map(|(k, _)| *k)
            .collect();

        keys.into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .inspect(|m| {
                self.keys_by_id.remove(m.id());
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
