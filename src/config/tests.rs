use super::settings::{PartialRouterSettings, PartialSettings, Settings};
use super::{ConflictPolicy, load_config};
use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.router.retry_interval_ms, 3000);
    assert_eq!(settings.router.max_retries(), None);
    assert_eq!(settings.directory.conflict_policy, ConflictPolicy::LastWriteWins);
    assert!(!settings.backpressure.enabled);
    assert!(settings.backpressure.lower_threshold < settings.backpressure.max_incoming_requests);
}

#[test]
fn test_partial_merge_keeps_unset_defaults() {
    let partial = PartialSettings {
        router: Some(PartialRouterSettings {
            retry_interval_ms: Some(50),
            max_retry_count: Some(3),
            ..Default::default()
        }),
        ..Default::default()
    };
    let merged = partial.merge(Settings::default());
    assert_eq!(merged.router.retry_interval_ms, 50);
    assert_eq!(merged.router.max_retries(), Some(3));
    assert_eq!(merged.router.max_delay_ms, Settings::default().router.max_delay_ms);
    assert_eq!(merged.server, Settings::default().server);
}

// load_config reads config/default.toml relative to the working directory,
// so these tests must not run concurrently.
#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let orig = env::current_dir().expect("current_dir");
    env::set_current_dir(tmp.path()).expect("set current dir");

    fs::create_dir_all("config").expect("create config dir");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [router]
        retry_interval_ms = 25
        max_parallel_sends = 2

        [directory]
        conflict_policy = "keep_all"

        [backpressure]
        enabled = true
        max_incoming_requests = 10
        lower_threshold = 4
    "#;
    fs::write("config/default.toml", toml).expect("write config file");

    let cfg = load_config();

    env::set_current_dir(orig).expect("restore cwd");

    let cfg = cfg.expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.router.retry_interval_ms, 25);
    assert_eq!(cfg.router.max_parallel_sends, 2);
    assert_eq!(cfg.directory.conflict_policy, ConflictPolicy::KeepAll);
    assert!(cfg.backpressure.enabled);
    assert_eq!(cfg.backpressure.max_incoming_requests, 10);
    assert_eq!(cfg.backpressure.lower_threshold, 4);
}

#[test]
#[serial]
fn load_config_reads_environment() {
    temp_env::with_vars(
        [
            ("ROUTEMESH_SERVER__PORT", Some("7001")),
            ("ROUTEMESH_ROUTER__JITTER_RATIO", Some("0")),
            ("ROUTEMESH_PERSISTENCE__ENABLED", Some("true")),
        ],
        || {
            let cfg = load_config().expect("load_config failed");
            assert_eq!(cfg.server.port, 7001);
            assert_eq!(cfg.router.jitter_ratio, 0.0);
            assert!(cfg.persistence.enabled);
        },
    );
}

#[test]
#[serial]
fn load_config_rejects_inverted_backpressure_band() {
    temp_env::with_vars(
        [
            ("ROUTEMESH_BACKPRESSURE__ENABLED", Some("true")),
            ("ROUTEMESH_BACKPRESSURE__MAX_INCOMING_REQUESTS", Some("5")),
            ("ROUTEMESH_BACKPRESSURE__LOWER_THRESHOLD", Some("5")),
        ],
        || {
            assert!(load_config().is_err());
        },
    );
}
