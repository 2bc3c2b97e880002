//! The `capabilities` module keeps track of which participant provides which
//! interface, and where it can be reached.
//!
//! Lookups can filter out stale registrations using the provider's QoS
//! metadata. Registrations past their expiry date are never returned, whether
//! or not the periodic sweep has removed them yet.

mod directory;
mod entry;

pub use directory::CapabilitiesDirectory;
pub use entry::{DiscoveryEntry, LookupQos, ProviderQos, ProviderScope};

use async_trait::async_trait;

use crate::utils::error::DirectoryError;

/// The directory as seen by a remote participant.
#[async_trait]
pub trait DiscoveryService: Send + Sync {
    async fn add(&self, entry: DiscoveryEntry) -> Result<(), DirectoryError>;

    async fn lookup(&self, domain: &str, interface_name: &str) -> Vec<DiscoveryEntry>;

    async fn remove(&self, participant_id: &str);
}

#[cfg(test)]
mod tests;
