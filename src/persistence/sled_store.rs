use sled::Db;
use tracing::{debug, error, warn};

use super::MessagePersister;
use crate::message::{DelayableMessage, StoredMessage};
use crate::utils::error::PersistenceError;

/// Keeps queued messages in an embedded sled database, one tree per queue id,
/// keyed by message id with the JSON-encoded message as value.
#[derive(Clone)]
pub struct SledPersister {
    db: Db,
}

impl SledPersister {
    pub fn open(path: &str) -> Result<Self, PersistenceError> {
        let db = sled::open(path)?;
        debug!("Opened message store at {path}");
        Ok(Self { db })
    }

    /// A store that lives only as long as the process, for tests and tools.
    pub fn temporary() -> Result<Self, PersistenceError> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Self { db })
    }

    fn try_persist(&self, queue_id: &str, message: &DelayableMessage) -> Result<(), PersistenceError> {
        let serialized = serde_json::to_vec(&message.to_stored())?;
        let tree = self.db.open_tree(queue_id)?;
        tree.insert(message.id().as_bytes(), serialized)?;
        Ok(())
    }

    fn try_fetch_all(&self, queue_id: &str) -> Result<Vec<StoredMessage>, PersistenceError> {
        let tree = self.db.open_tree(queue_id)?;
        let messages = tree
            .iter()
            .filter_map(|res| res.ok())
            .filter_map(|(key, val)| match serde_json::from_slice(&val) {
                Ok(stored) => Some(stored),
                Err(e) => {
                    warn!(
                        "Skipping unreadable stored message {}: {e}",
                        String::from_utf8_lossy(&key)
                    );
                    None
                }
            })
            .collect();
        Ok(messages)
    }

    fn try_remove(&self, queue_id: &str, message_id: &str) -> Result<(), PersistenceError> {
        let tree = self.db.open_tree(queue_id)?;
        tree.remove(message_id.as_bytes())?;
        Ok(())
    }
}

impl MessagePersister for SledPersister {
    fn persist(&self, queue_id: &str, message: &DelayableMessage) -> bool {
        match self.try_persist(queue_id, message) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to persist message {}: {e}", message.id());
                false
            }
        }
    }

    fn fetch_all(&self, queue_id: &str) -> Vec<StoredMessage> {
        self.try_fetch_all(queue_id).unwrap_or_else(|e| {
            error!("Failed to load stored messages of queue {queue_id}: {e}");
            Vec::new()
        })
    }

    fn remove(&self, queue_id: &str, message_id: &str) {
        if let Err(e) = self.try_remove(queue_id, message_id) {
            error!("Failed to remove stored message {message_id}: {e}");
        }
    }
}

impl std::fmt::Debug for SledPersister {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledPersister")
            .field("db", &"sled::Db")
            .finish()
    }
}
