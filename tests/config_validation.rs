//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::io::Write;
use std::time::Duration;

use tiered_netcore::config::{NetworkConfig, TierConfig};
use tiered_netcore::service::tier::TierBuilder;
use tiered_netcore::{ProtocolError, ProtocolTier, ThrottleRule};
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_tier_address() {
    let mut config = NetworkConfig::default();
    config.tiers.login.address = "not-an-address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid tier 'login' address")));
}

#[test]
fn test_empty_tier_address() {
    let mut config = NetworkConfig::default();
    config.tiers.world.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_duplicate_listen_address() {
    let mut config = NetworkConfig::default();
    config.tiers.login.address = config.tiers.lobby.address.clone();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("reuses listen address")));
}

#[test]
fn test_disabled_tier_may_share_address() {
    let mut config = NetworkConfig::default();
    config.tiers.login = TierConfig {
        enabled: false,
        ..TierConfig::new(&config.tiers.lobby.address)
    };

    assert!(config.validate().is_empty());
}

#[test]
fn test_ephemeral_ports_never_collide() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.tiers.lobby.address = "127.0.0.1:0".into();
        c.tiers.login.address = "127.0.0.1:0".into();
        c.tiers.world.address = "127.0.0.1:0".into();
    });
    assert!(config.validate().is_empty());
}

#[test]
fn test_duplicate_throttle_rule() {
    let mut config = NetworkConfig::default();
    let rule = ThrottleRule::new(0x06, Duration::from_millis(250), Duration::ZERO, 0);
    config.tiers.world.throttles = vec![rule.clone(), rule];

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("more than one throttle rule")));
}

#[test]
fn test_zero_throttle_interval() {
    let mut config = NetworkConfig::default();
    config.tiers.login.throttles = vec![ThrottleRule::new(0x03, Duration::ZERO, Duration::ZERO, 0)];

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Throttle interval for opcode 0x03")));
}

#[test]
fn test_invalid_default_seed() {
    let mut config = NetworkConfig::default();
    config.transport.default_seed = 10;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid default seed")));
}

#[test]
fn test_empty_default_key() {
    let mut config = NetworkConfig::default();
    config.transport.default_key = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Default key cannot be empty")));
}

#[test]
fn test_small_receive_buffer_warns() {
    let mut config = NetworkConfig::default();
    config.transport.receive_buffer_capacity = 8 * 1024;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("below the largest legal frame")));
}

#[test]
fn test_reap_threshold_must_exceed_heartbeat_interval() {
    let mut config = NetworkConfig::default();
    config.heartbeat.reap_threshold = config.heartbeat.byte_interval;

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Reap threshold")));
}

#[test]
fn test_no_log_output() {
    let mut config = NetworkConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_reports_every_error() {
    let mut config = NetworkConfig::default();
    config.transport.default_seed = 42;
    config.logging.app_name = String::new();

    let err = config.validate_strict().unwrap_err();
    match err {
        ProtocolError::ConfigError(msg) => {
            assert!(msg.contains("Invalid default seed"));
            assert!(msg.contains("Application name cannot be empty"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_load_from_toml_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[tiers.lobby]
address = "127.0.0.1:3610"

[tiers.login]
address = "127.0.0.1:3611"
enabled = false

[tiers.world]
address = "127.0.0.1:3612"

[[tiers.world.throttles]]
opcode = 6
interval = 300
disconnect_threshold = 50

[heartbeat]
byte_interval = 30000
tick_interval = 30000
warmup = 10000
reap_threshold = 90000
reap_check_interval = 5000
idle_threshold = 60000
idle_check_interval = 30000

[logging]
app_name = "test-server"
log_level = "debug"
log_to_console = true
log_to_file = false
json_format = true
"#
    )
    .unwrap();

    let config = NetworkConfig::from_file(file.path()).unwrap();
    assert_eq!(config.tiers.lobby.address, "127.0.0.1:3610");
    assert!(!config.tiers.login.enabled);
    assert_eq!(config.tiers.world.throttles.len(), 1);
    let rule = &config.tiers.world.throttles[0];
    assert_eq!(rule.interval, Duration::from_millis(300));
    assert_eq!(rule.duration, Duration::ZERO);
    assert_eq!(rule.disconnect_threshold, 50);
    assert_eq!(config.heartbeat.reap_threshold, Duration::from_secs(90));
    assert_eq!(config.logging.log_level, Level::DEBUG);
    // unspecified sections fall back to defaults
    assert_eq!(config.transport.default_key, "UrkcnItnI");
    assert!(config.validate().is_empty());
}

#[test]
fn test_bad_toml_is_a_config_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "[tiers.lobby\naddress = ").unwrap();

    assert!(matches!(
        NetworkConfig::from_file(file.path()),
        Err(ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_save_and_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("server.toml");
    let original = NetworkConfig::default_with_overrides(|c| {
        c.transport.redirect_address = "192.0.2.10".parse().unwrap();
        c.heartbeat.warmup = Duration::from_secs(5);
    });

    original.save_to_file(&path).unwrap();
    let reloaded = NetworkConfig::from_file(&path).unwrap();

    assert_eq!(reloaded.transport.redirect_address, original.transport.redirect_address);
    assert_eq!(reloaded.heartbeat.warmup, Duration::from_secs(5));
    assert_eq!(reloaded.tiers.world.throttles, original.tiers.world.throttles);
}

#[test]
fn test_example_config_parses() {
    let text = NetworkConfig::example_config();
    let parsed = NetworkConfig::from_toml(&text).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_tier_builder_from_config() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.transport.default_seed = 3;
        c.transport.redirect_delay = Duration::from_millis(100);
    });

    let lobby = TierBuilder::from_config(ProtocolTier::Lobby, &config)
        .unwrap()
        .build();
    let cipher = lobby.default_cipher().unwrap();
    assert_eq!(cipher.seed(), 3);
    assert_eq!(cipher.key(), b"UrkcnItnI");
    assert_eq!(lobby.redirect_delay(), Duration::from_millis(100));

    let world = TierBuilder::from_config(ProtocolTier::World, &config)
        .unwrap()
        .build();
    assert!(world.default_cipher().is_none());
    assert!(world.throttles().rule(0x06).is_some());
}
