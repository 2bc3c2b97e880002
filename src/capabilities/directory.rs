use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use tracing::{debug, info};

use super::DiscoveryService;
use super::entry::{DiscoveryEntry, LookupQos, ProviderScope};
use crate::config::ConflictPolicy;
use crate::message::ParticipantId;
use crate::routing::RoutingTable;
use crate::utils::clock::SharedClock;
use crate::utils::error::DirectoryError;

/// Local store of provider registrations
/// Keeps one entry per participant id and mirrors each entry's address into
/// the routing table so the router can reach registered providers
#[derive(Debug)]
pub struct CapabilitiesDirectory {
    entries: RwLock<HashMap<ParticipantId, DiscoveryEntry>>,
    routing_table: Arc<RoutingTable>,
    conflict_policy: ConflictPolicy,
    clock: SharedClock,
}

impl CapabilitiesDirectory {
    pub fn new(
        routing_table: Arc<RoutingTable>,
        conflict_policy: ConflictPolicy,
        clock: SharedClock,
    ) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            routing_table,
            conflict_policy,
            clock,
        }
    }

    /// Adds or replaces the registration of `entry.participant_id`
    /// With `LastWriteWins`, other participants registered for the same
    /// domain and interface are removed along with their routes
    pub fn add(&self, entry: DiscoveryEntry) -> Result<(), DirectoryError> {
        if entry.expiry_date_ms <= entry.last_seen_ms {
            return Err(DirectoryError::InvalidEntry(format!(
                "expiry date {} of {} is not after last seen {}",
                entry.expiry_date_ms, entry.participant_id, entry.last_seen_ms
            )));
        }

        let replaced: Vec<ParticipantId> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let replaced = match self.conflict_policy {
                ConflictPolicy::KeepAll => Vec::new(),
                ConflictPolicy::LastWriteWins => entries
                    .values()
                    .filter(|e| {
                        e.participant_id != entry.participant_id
                            && e.serves(&entry.domain, &entry.interface_name)
                    })
                    .map(|e| e.participant_id.clone())
                    .collect(),
            };
            for participant_id in &replaced {
                entries.remove(participant_id);
            }

            self.routing_table.put(
                &entry.participant_id,
                entry.address.clone(),
                entry.provider_qos.scope == ProviderScope::Global,
                entry.expiry_date_ms,
            );
            debug!(
                "Registered {} for {}/{}",
                entry.participant_id, entry.domain, entry.interface_name
            );
            entries.insert(entry.participant_id.clone(), entry);
            replaced
        };

        for participant_id in replaced {
            info!("Registration of {participant_id} replaced by a newer provider");
            self.routing_table.remove(&participant_id);
        }
        Ok(())
    }

    /// Entries serving `domain`/`interface_name` that pass `qos` right now.
    /// An empty result is not an error.
    pub fn lookup(&self, domain: &str, interface_name: &str, qos: LookupQos) -> Vec<DiscoveryEntry> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<DiscoveryEntry> = entries
            .values()
            .filter(|e| e.serves(domain, interface_name) && e.passes(qos, now))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_seen_ms.cmp(&a.last_seen_ms));
        found
    }

    /// The live entry of a participant, ignoring staleness.
    pub fn lookup_by_participant_id(&self, participant_id: &str) -> Option<DiscoveryEntry> {
        let now = self.clock.now_ms();
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(participant_id)
            .filter(|e| !e.is_expired(now))
            .cloned()
    }

    /// Removes a registration and its route. Removing an unknown participant
    /// does nothing.
    pub fn remove(&self, participant_id: &str) {
        let removed = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(participant_id);
        if removed.is_some() {
            self.routing_table.remove(participant_id);
            debug!("Removed registration of {participant_id}");
        }
    }

    /// Marks a participant as seen now. The expiry date moves by the same
    /// amount, so the registration keeps its lifetime.
    pub fn touch(&self, participant_id: &str) -> bool {
        let now = self.clock.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get_mut(participant_id) else {
            return false;
        };
        let shift = now - entry.last_seen_ms;
        if shift > 0 {
            entry.last_seen_ms = now;
            entry.expiry_date_ms = entry.expiry_date_ms.saturating_add(shift);
            self.routing_table.put(
                participant_id,
                entry.address.clone(),
                entry.provider_qos.scope == ProviderScope::Global,
                entry.expiry_date_ms,
            );
        }
        true
    }

    /// Drops every entry whose expiry date is before `now_ms`.
    pub fn sweep_expired(&self, now_ms: i64) -> usize {
        let expired: Vec<ParticipantId> = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let expired: Vec<ParticipantId> = entries
                .values()
                .filter(|e| e.is_expired(now_ms))
                .map(|e| e.participant_id.clone())
                .collect();
            for participant_id in &expired {
                entries.remove(participant_id);
            }
            expired
        };
        for participant_id in &expired {
            self.routing_table.remove(participant_id);
        }
        if !expired.is_empty() {
            debug!("Swept {} expired discovery entries", expired.len());
        }
        expired.len()
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

#[async_trait]
impl DiscoveryService for CapabilitiesDirectory {
    async fn add(&self, entry: DiscoveryEntry) -> Result<(), DirectoryError> {
        CapabilitiesDirectory::add(self, entry)
    }

    async fn lookup(&self, domain: &str, interface_name: &str) -> Vec<DiscoveryEntry> {
        CapabilitiesDirectory::lookup(self, domain, interface_name, LookupQos::Any)
    }

    async fn remove(&self, participant_id: &str) {
        CapabilitiesDirectory::remove(self, participant_id)
    }
}
