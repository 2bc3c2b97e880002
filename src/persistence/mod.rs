//! The `persistence` module is the durability hook of the message router.
//!
//! The router hands every message that has to wait for another delivery
//! attempt to a [`MessagePersister`], and removes it again once the message
//! reaches a terminal outcome. On startup the router reloads whatever is
//! still stored, so queued messages survive a restart.
//!
//! Persistence failures are logged and never fail a send.

mod sled_store;

pub use sled_store::SledPersister;

use crate::message::{DelayableMessage, StoredMessage};

pub trait MessagePersister: Send + Sync + std::fmt::Debug {
    /// Stores `message` under `queue_id`. Storing an id again overwrites the
    /// previous copy. Returns false if the message could not be stored.
    fn persist(&self, queue_id: &str, message: &DelayableMessage) -> bool;

    /// Every message stored under `queue_id`.
    fn fetch_all(&self, queue_id: &str) -> Vec<StoredMessage>;

    /// Forgets the message with `message_id`. Unknown ids are ignored.
    fn remove(&self, queue_id: &str, message_id: &str);
}
