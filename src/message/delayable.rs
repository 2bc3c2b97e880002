use std::fmt;

use serde::{Deserialize, Serialize};

use super::Message;
use crate::utils::error::RoutingError;

/// Invoked once with the terminal error if a message can't be delivered.
pub type FailureAction = Box<dyn FnOnce(RoutingError) + Send + Sync + 'static>;

/// A message waiting in the router queue for its next delivery attempt.
///
/// `ready_at_ms` moves forward on every retry, `retry_count` only grows.
pub struct DelayableMessage {
    message: Message,
    ready_at_ms: i64,
    retry_count: u32,
    failure_action: Option<FailureAction>,
}

impl DelayableMessage {
    pub fn new(message: Message, ready_at_ms: i64) -> Self {
        Self {
            message,
            ready_at_ms,
            retry_count: 0,
            failure_action: None,
        }
    }

    pub fn with_failure_action(mut self, action: FailureAction) -> Self {
        self.failure_action = Some(action);
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn id(&self) -> &str {
        self.message.id()
    }

    pub fn ready_at_ms(&self) -> i64 {
        self.ready_at_ms
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Schedules the next attempt. `ready_at` never moves backwards.
    pub fn reschedule(&mut self, ready_at_ms: i64) {
        self.ready_at_ms = self.ready_at_ms.max(ready_at_ms);
        self.retry_count += 1;
    }

    pub(crate) fn take_failure_action(&mut self) -> Option<FailureAction> {
        self.failure_action.take()
    }

    /// The durable part of this message, as written by persisters.
    pub fn to_stored(&self) -> StoredMessage {
        StoredMessage {
            message: self.message.clone(),
            retry_count: self.retry_count,
        }
    }
}

impl fmt::Debug for DelayableMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayableMessage")
            .field("id", &self.message.id())
            .field("recipient", &self.message.recipient())
            .field("ready_at_ms", &self.ready_at_ms)
            .field("retry_count", &self.retry_count)
            .field("has_failure_action", &self.failure_action.is_some())
            .finish()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub message: Message,
    pub retry_count: u32,
}

impl StoredMessage {
    /// Restores a queued message, ready at `now_ms`.
    pub fn into_delayable(self, now_ms: i64) -> DelayableMessage {
        DelayableMessage {
            message: self.message,
            ready_at_ms: now_ms,
            retry_count: self.retry_count,
            failure_action: None,
        }
    }
}
