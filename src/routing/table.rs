//! Routing table
//!
//! Maps participant ids to the transport addresses they can be reached at.
//! Read-mostly: lookups share a read lock, registrations take the write lock.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, trace};

use crate::address::Address;
use crate::message::ParticipantId;
use crate::utils::clock::SharedClock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    /// Newest registration first; the first address is canonical.
    addresses: Vec<Address>,
    is_globally_visible: bool,
    expiry_date_ms: i64,
}

impl RoutingEntry {
    pub fn address(&self) -> Option<&Address> {
        self.addresses.first()
    }

    pub fn addresses(&self) -> &[Address] {
        &self.addresses
    }

    pub fn is_globally_visible(&self) -> bool {
        self.is_globally_visible
    }

    pub fn expiry_date_ms(&self) -> i64 {
        self.expiry_date_ms
    }
}

#[derive(Debug)]
pub struct RoutingTable {
    entries: RwLock<HashMap<ParticipantId, RoutingEntry>>,
    clock: SharedClock,
}

impl RoutingTable {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
        }
    }

    /// Registers an address that never expires.
    pub fn add(&self, participant_id: &str, address: Address, is_globally_visible: bool) {
        self.put(participant_id, address, is_globally_visible, i64::MAX);
    }

    /// Registers `address` for `participant_id`.
    ///
    /// A re-registered address moves to the front and becomes canonical.
    /// The expiry date only ever extends.
    pub fn put(
        &self,
        participant_id: &str,
        address: Address,
        is_globally_visible: bool,
        expiry_date_ms: i64,
    ) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(participant_id) {
            Some(entry) => {
                entry.addresses.retain(|a| a != &address);
                entry.addresses.insert(0, address);
                entry.is_globally_visible = is_globally_visible;
                entry.expiry_date_ms = entry.expiry_date_ms.max(expiry_date_ms);
            }
            None => {
                entries.insert(
                    participant_id.to_string(),
                    RoutingEntry {
                        addresses: vec![address],
                        is_globally_visible,
                        expiry_date_ms,
                    },
                );
            }
        }
        trace!("Routing entry updated for {participant_id}");
    }

    /// The canonical address of a participant, if it has a live entry.
    pub fn get(&self, participant_id: &str) -> Option<Address> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(participant_id)
            .filter(|e| e.expiry_date_ms >= now)
            .and_then(|e| e.address().cloned())
    }

    pub fn entry(&self, participant_id: &str) -> Option<RoutingEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(participant_id).cloned()
    }

    pub fn contains(&self, participant_id: &str) -> bool {
        self.get(participant_id).is_some()
    }

    pub fn remove(&self, participant_id: &str) -> Option<RoutingEntry> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let removed = entries.remove(participant_id);
        if removed.is_some() {
            debug!("Removed routing entry for {participant_id}");
        }
        removed
    }

    /// Drops one address of a multi-homed participant. The entry goes away
    /// with its last address.
    pub fn remove_address(&self, participant_id: &str, address: &Address) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(participant_id) {
            entry.addresses.retain(|a| a != address);
            if entry.addresses.is_empty() {
                entries.remove(participant_id);
            }
        }
    }

    /// Removes entries whose expiry date has passed. Returns how many were removed.
    pub fn purge(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, e| e.expiry_date_ms >= now_ms);
        let purged = before - entries.len();
        if purged > 0 {
            debug!("Purged {purged} expired routing entries");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
