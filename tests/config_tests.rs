//! Tests for configuration loading and validation.

use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

use zoned::config::{ManagerConfig, RuleEffect, ZoneConfig};
use zoned::Error;

fn write(dir: &TempDir, name: &str, value: &serde_json::Value) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, serde_json::to_vec_pretty(value).unwrap()).unwrap();
    path
}

// =============================================================================
// Manager Config
// =============================================================================

#[test]
fn test_full_manager_config() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "daemon.json",
        &json!({
            "defaultId": "z1",
            "foregroundId": "z2",
            "containersPath": "/var/lib/zoned/zones",
            "runMountPointPrefix": "/run/zoned",
            "containerConfigs": ["zones/z1.json", "zones/z2.json"],
            "ipcSocketPath": "/run/zoned/host.sock",
            "hostBusAddress": "unix:path=/var/run/dbus/system_bus_socket",
            "proxyCallRules": [
                {"caller": "z1", "target": "host", "targetMethod": "Ping"},
                {"caller": "*", "target": "*", "effect": "deny"}
            ],
            "inputConfig": {
                "enabled": true,
                "device": "/dev/input/event3",
                "code": 139,
                "numEvents": 2,
                "timeWindowMs": 500
            }
        }),
    );

    let config = ManagerConfig::from_file(&path).unwrap();
    assert_eq!(config.default_id, "z1");
    assert_eq!(config.foreground_id, "z2");
    assert_eq!(config.container_configs.len(), 2);
    assert_eq!(config.proxy_call_rules[0].effect, RuleEffect::Allow);
    assert_eq!(config.proxy_call_rules[0].target_method, "Ping");
    assert_eq!(config.proxy_call_rules[1].effect, RuleEffect::Deny);
    assert!(config.input_config.enabled);
    assert_eq!(config.input_config.code, 139);
}

#[test]
fn test_manager_config_missing_file() {
    let err = ManagerConfig::from_file(Path::new("/nonexistent/daemon.json")).unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
    assert!(err.is_config_error());
}

#[test]
fn test_manager_config_rejects_empty_default() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "daemon.json",
        &json!({"defaultId": "", "containersPath": "/zones"}),
    );
    let err = ManagerConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
}

#[test]
fn test_manager_config_rejects_malformed_json() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("daemon.json");
    std::fs::write(&path, b"{ not json").unwrap();
    let err = ManagerConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
}

// =============================================================================
// Zone Config
// =============================================================================

#[test]
fn test_zone_config_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "z1.json",
        &json!({
            "id": "z1",
            "rootfsPath": "rootfs",
            "vt": 2,
            "privilege": 10,
            "switchToDefaultAfterTimeout": true,
            "busAddress": "unix:path=/run/zoned/z1/bus.sock",
            "permittedToSend": ["/tmp/.*"],
            "permittedToRecv": ["/tmp/.*", "/shared/.*"]
        }),
    );

    let config = ZoneConfig::from_file(&path).unwrap();
    assert_eq!(config.id, "z1");
    assert_eq!(config.vt, 2);
    assert_eq!(config.privilege, 10);
    assert!(config.switch_to_default_after_timeout);
    assert_eq!(config.permitted_to_recv.len(), 2);
    assert_eq!(config.send_matchers().unwrap().len(), 1);
}

#[test]
fn test_zone_config_rejects_reserved_id() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "bad.json", &json!({"id": "host"}));
    let err = ZoneConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, Error::InvalidZoneId { .. }));
}

#[test]
fn test_zone_config_rejects_bad_regex() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "bad.json",
        &json!({"id": "z1", "permittedToRecv": ["/tmp/["]}),
    );
    let err = ZoneConfig::from_file(&path).unwrap_err();
    assert!(matches!(err, Error::Config { .. }));
}

#[test]
fn test_zone_config_defaults() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "z1.json", &json!({"id": "z1"}));
    let config = ZoneConfig::from_file(&path).unwrap();
    assert_eq!(config.privilege, 0);
    assert!(!config.switch_to_default_after_timeout);
    assert!(config.bus_address.is_empty());
    assert!(config.permitted_to_send.is_empty());
}
