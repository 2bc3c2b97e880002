use serde::{Deserialize, Serialize};

use crate::address::Address;
use crate::message::ParticipantId;

/// Who may see a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderScope {
    Local,
    #[default]
    Global,
}

/// Quality-of-service metadata a provider registers with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderQos {
    /// How long a cached registration may be used after it was last seen.
    pub cache_time_to_live_ms: i64,
    /// Maximum age of the registration for consumers that need fresh data.
    pub data_freshness_ms: i64,
    #[serde(default)]
    pub scope: ProviderScope,
}

impl Default for ProviderQos {
    fn default() -> Self {
        Self {
            cache_time_to_live_ms: 60_000,
            data_freshness_ms: 60_000,
            scope: ProviderScope::Global,
        }
    }
}

/// Which staleness predicate a lookup applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupQos {
    /// Only entries past their expiry date are excluded.
    #[default]
    Any,
    /// Keeps entries with `now - last_seen <= cache_time_to_live`.
    CacheTimeToLive,
    /// Keeps entries with `now - last_seen <= data_freshness`.
    DataFreshness,
}

/// A provider registration: which participant serves which interface, and
/// where it can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryEntry {
    pub participant_id: ParticipantId,
    pub domain: String,
    pub interface_name: String,
    pub address: Address,
    pub provider_qos: ProviderQos,
    pub last_seen_ms: i64,
    pub expiry_date_ms: i64,
}

impl DiscoveryEntry {
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expiry_date_ms < now_ms
    }

    pub fn serves(&self, domain: &str, interface_name: &str) -> bool {
        self.domain == domain && self.interface_name == interface_name
    }

    /// Whether a lookup at `now_ms` with `qos` may return this entry.
    pub fn passes(&self, qos: LookupQos, now_ms: i64) -> bool {
        if self.is_expired(now_ms) {
            return false;
        }
        let age = now_ms - self.last_seen_ms;
        match qos {
            LookupQos::Any => true,
            LookupQos::CacheTimeToLive => age <= self.provider_qos.cache_time_to_live_ms,
            LookupQos::DataFreshness => age <= self.provider_qos.data_freshness_ms,
        }
    }
}
