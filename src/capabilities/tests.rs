use std::sync::Arc;

use super::*;
use crate::address::Address;
use crate::config::ConflictPolicy;
use crate::routing::RoutingTable;
use crate::utils::clock::ManualClock;
use crate::utils::error::DirectoryError;

const T0: i64 = 1_000_000;

fn setup(policy: ConflictPolicy) -> (CapabilitiesDirectory, Arc<RoutingTable>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(T0));
    let table = Arc::new(RoutingTable::new(clock.clone()));
    let directory = CapabilitiesDirectory::new(table.clone(), policy, clock.clone());
    (directory, table, clock)
}

fn entry(participant_id: &str, interface_name: &str) -> DiscoveryEntry {
    DiscoveryEntry {
        participant_id: participant_id.to_string(),
        domain: "vehicle".to_string(),
        interface_name: interface_name.to_string(),
        address: Address::channel(format!("channel-{participant_id}")),
        provider_qos: ProviderQos {
            cache_time_to_live_ms: 1_000,
            data_freshness_ms: 200,
            scope: ProviderScope::Global,
        },
        last_seen_ms: T0,
        expiry_date_ms: T0 + 60_000,
    }
}

#[test]
fn test_lookup_cache_time_to_live_boundary() {
    let (directory, _, clock) = setup(ConflictPolicy::LastWriteWins);
    directory.add(entry("p1", "radio")).unwrap();

    clock.set(T0 + 999);
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).len(), 1);

    clock.set(T0 + 1_000);
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).len(), 1);

    clock.set(T0 + 1_001);
    assert!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).is_empty());
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::Any).len(), 1);
}

#[test]
fn test_lookup_data_freshness() {
    let (directory, _, clock) = setup(ConflictPolicy::LastWriteWins);
    directory.add(entry("p1", "radio")).unwrap();

    clock.set(T0 + 200);
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::DataFreshness).len(), 1);
    clock.set(T0 + 201);
    assert!(directory.lookup("vehicle", "radio", LookupQos::DataFreshness).is_empty());
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).len(), 1);
}

#[test]
fn test_expired_entries_are_never_returned() {
    let (directory, _, clock) = setup(ConflictPolicy::LastWriteWins);
    let mut short_lived = entry("p1", "radio");
    short_lived.expiry_date_ms = T0 + 500;
    short_lived.provider_qos.cache_time_to_live_ms = 10_000;
    directory.add(short_lived).unwrap();

    clock.set(T0 + 501);
    assert!(directory.lookup("vehicle", "radio", LookupQos::Any).is_empty());
    assert!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).is_empty());
    assert!(directory.lookup_by_participant_id("p1").is_none());
    // still stored until the sweep runs
    assert_eq!(directory.len(), 1);
}

#[test]
fn test_add_rejects_expiry_not_after_last_seen() {
    let (directory, table, _) = setup(ConflictPolicy::LastWriteWins);
    let mut invalid = entry("p1", "radio");
    invalid.expiry_date_ms = invalid.last_seen_ms;

    assert!(matches!(directory.add(invalid), Err(DirectoryError::InvalidEntry(_))));
    assert!(directory.is_empty());
    assert!(table.is_empty());
}

#[test]
fn test_add_registers_route_and_remove_is_idempotent() {
    let (directory, table, _) = setup(ConflictPolicy::LastWriteWins);
    directory.add(entry("p1", "radio")).unwrap();
    assert_eq!(table.get("p1"), Some(Address::channel("channel-p1")));
    assert!(table.entry("p1").unwrap().is_globally_visible());

    directory.remove("p1");
    directory.remove("p1");
    assert!(directory.is_empty());
    assert!(table.get("p1").is_none());
}

#[test]
fn test_last_write_wins_replaces_other_provider() {
    let (directory, table, _) = setup(ConflictPolicy::LastWriteWins);
    directory.add(entry("p1", "radio")).unwrap();
    directory.add(entry("p2", "radio")).unwrap();
    directory.add(entry("p3", "navigation")).unwrap();

    let found = directory.lookup("vehicle", "radio", LookupQos::Any);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].participant_id, "p2");
    assert!(table.get("p1").is_none());
    assert!(table.get("p3").is_some());
}

#[test]
fn test_keep_all_keeps_every_provider() {
    let (directory, _, clock) = setup(ConflictPolicy::KeepAll);
    directory.add(entry("p1", "radio")).unwrap();
    clock.advance(10);
    let mut newer = entry("p2", "radio");
    newer.last_seen_ms = T0 + 10;
    directory.add(newer).unwrap();

    let found = directory.lookup("vehicle", "radio", LookupQos::Any);
    let ids: Vec<_> = found.iter().map(|e| e.participant_id.as_str()).collect();
    assert_eq!(ids, vec!["p2", "p1"]);
}

#[test]
fn test_reregistration_upserts_same_participant() {
    let (directory, _, clock) = setup(ConflictPolicy::LastWriteWins);
    directory.add(entry("p1", "radio")).unwrap();

    clock.set(T0 + 5_000);
    let mut refreshed = entry("p1", "radio");
    refreshed.last_seen_ms = T0 + 5_000;
    refreshed.expiry_date_ms = T0 + 65_000;
    directory.add(refreshed).unwrap();

    assert_eq!(directory.len(), 1);
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).len(), 1);
}

#[test]
fn test_touch_refreshes_last_seen_and_expiry() {
    let (directory, _, clock) = setup(ConflictPolicy::LastWriteWins);
    directory.add(entry("p1", "radio")).unwrap();

    clock.set(T0 + 900);
    assert!(directory.touch("p1"));
    assert!(!directory.touch("unknown"));

    let touched = directory.lookup_by_participant_id("p1").unwrap();
    assert_eq!(touched.last_seen_ms, T0 + 900);
    assert_eq!(touched.expiry_date_ms, T0 + 60_900);

    clock.set(T0 + 1_500);
    assert_eq!(directory.lookup("vehicle", "radio", LookupQos::CacheTimeToLive).len(), 1);
}

#[test]
fn test_sweep_removes_expired_entries_and_routes() {
    let (directory, table, _) = setup(ConflictPolicy::KeepAll);
    let mut short_lived = entry("p1", "radio");
    short_lived.expiry_date_ms = T0 + 100;
    directory.add(short_lived).unwrap();
    directory.add(entry("p2", "radio")).unwrap();

    assert_eq!(directory.sweep_expired(T0 + 100), 0);
    assert_eq!(directory.sweep_expired(T0 + 101), 1);
    assert_eq!(directory.len(), 1);
    assert!(table.entry("p1").is_none());
    assert!(table.entry("p2").is_some());
}

#[tokio::test]
async fn test_discovery_service_interface() {
    let (directory, _, _) = setup(ConflictPolicy::LastWriteWins);
    let service: &dyn DiscoveryService = &directory;

    service.add(entry("p1", "radio")).await.unwrap();
    assert_eq!(service.lookup("vehicle", "radio").await.len(), 1);
    service.remove("p1").await;
    assert!(service.lookup("vehicle", "radio").await.is_empty());
}
