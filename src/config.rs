//! Configuration types for the daemon and for individual zones.
//!
//! Both config kinds are JSON documents. The manager config references zone
//! configs by path; relative paths resolve against the manager config's
//! directory. All cross-field validation that can fail at startup lives
//! here so a bad deployment dies with a `ConfigError` before any zone is
//! touched.

use crate::constants::{
    HOST_ID, MAX_PERMISSION_PATTERNS, MAX_PROXY_CALL_RULES, MAX_ZONE_ID_LEN, MAX_ZONES,
};
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Validation Helpers
// =============================================================================

/// Validates a zone id: non-empty, bounded, not the reserved host id,
/// restricted to a safe character set.
pub fn validate_zone_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidZoneId {
            id: id.to_string(),
            reason: "id cannot be empty".to_string(),
        });
    }
    if id.len() > MAX_ZONE_ID_LEN {
        return Err(Error::InvalidZoneId {
            id: id.to_string(),
            reason: format!("id exceeds {MAX_ZONE_ID_LEN} bytes"),
        });
    }
    if id == HOST_ID {
        return Err(Error::InvalidZoneId {
            id: id.to_string(),
            reason: "id is reserved".to_string(),
        });
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidZoneId {
            id: id.to_string(),
            reason: "id contains invalid characters (allowed: a-z, A-Z, 0-9, -, _)".to_string(),
        });
    }
    Ok(())
}

/// Compiles a permission pattern list into anchored full-string regexes.
fn compile_patterns(patterns: &[String], config: &Path) -> Result<Vec<Regex>> {
    if patterns.len() > MAX_PERMISSION_PATTERNS {
        return Err(Error::Config {
            path: config.to_path_buf(),
            reason: format!(
                "too many permission patterns: {} (max {})",
                patterns.len(),
                MAX_PERMISSION_PATTERNS
            ),
        });
    }
    patterns
        .iter()
        .map(|p| {
            Regex::new(&format!("^(?:{p})$")).map_err(|e| Error::Config {
                path: config.to_path_buf(),
                reason: format!("invalid permission pattern '{p}': {e}"),
            })
        })
        .collect()
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| Error::Config {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// =============================================================================
// Proxy Call Rules
// =============================================================================

/// Rule effect. Rules without an explicit effect allow, which keeps
/// configs written for the allow-list-only format valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleEffect {
    /// Forward the call.
    #[default]
    Allow,
    /// Reject the call with a forbidden error.
    Deny,
}

/// One proxy-call rule. Every field is a shell-style glob (`*`, `?`);
/// an empty pattern matches anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyCallRule {
    /// Caller domain: a zone id or `"host"`.
    pub caller: String,
    /// Target domain: a zone id or `"host"`.
    pub target: String,
    /// Destination bus name on the target bus.
    pub target_bus_name: String,
    /// Destination object path.
    pub target_object_path: String,
    /// Destination interface.
    pub target_interface: String,
    /// Destination method.
    pub target_method: String,
    /// What to do on match.
    pub effect: RuleEffect,
}

// =============================================================================
// Input Monitor Config
// =============================================================================

/// Input monitor configuration. When enabled, the daemon watches `device`
/// for `num_events` key events with `code` within `time_window_ms` and
/// treats that as the zone-switch gesture.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InputConfig {
    /// Whether the monitor runs at all.
    pub enabled: bool,
    /// Evdev node to watch.
    pub device: PathBuf,
    /// Key code of the gesture.
    pub code: u16,
    /// Number of events composing one gesture.
    pub num_events: u32,
    /// Window in which the events must land, in milliseconds.
    pub time_window_ms: u64,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            device: PathBuf::from("/dev/input/event0"),
            code: 139,
            num_events: 2,
            time_window_ms: 500,
        }
    }
}

// =============================================================================
// Manager Config
// =============================================================================

/// Immutable-after-load daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagerConfig {
    /// Zone the daemon falls back to (display-off switch target).
    pub default_id: String,
    /// Zone to put in the foreground after `start_all`. Empty selects the
    /// zone with the numerically smallest privilege.
    #[serde(default)]
    pub foreground_id: String,
    /// Root under which every zone's filesystem tree lives.
    pub containers_path: PathBuf,
    /// Prefix for per-zone run mount points.
    #[serde(default = "default_run_mount_point_prefix")]
    pub run_mount_point_prefix: PathBuf,
    /// Zone config files, absolute or relative to this config's directory.
    #[serde(default)]
    pub container_configs: Vec<String>,
    /// Directory holding zone templates for `create_zone`, relative to
    /// this config's directory unless absolute.
    #[serde(default = "default_zone_template_path")]
    pub zone_template_path: PathBuf,
    /// Unix socket the host endpoint listens on.
    #[serde(default = "default_ipc_socket_path")]
    pub ipc_socket_path: PathBuf,
    /// Address of the host bus, used to forward host-targeted proxy calls.
    #[serde(default = "default_host_bus_address")]
    pub host_bus_address: String,
    /// Ordered proxy-call rules; first match wins, default deny.
    #[serde(default)]
    pub proxy_call_rules: Vec<ProxyCallRule>,
    /// Input monitor settings.
    #[serde(default)]
    pub input_config: InputConfig,
}

fn default_run_mount_point_prefix() -> PathBuf {
    PathBuf::from("/run/zoned")
}

fn default_zone_template_path() -> PathBuf {
    PathBuf::from("templates")
}

fn default_ipc_socket_path() -> PathBuf {
    PathBuf::from("/run/zoned/host.sock")
}

fn default_host_bus_address() -> String {
    "unix:path=/var/run/dbus/system_bus_socket".to_string()
}

impl ManagerConfig {
    /// Loads and validates a manager config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` on unreadable or malformed JSON, an empty
    /// default id, or rule/zone list overflow.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        config.validate(path)?;
        Ok(config)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        if self.default_id.is_empty() {
            return Err(Error::Config {
                path: path.to_path_buf(),
                reason: "defaultId cannot be empty".to_string(),
            });
        }
        if self.container_configs.len() > MAX_ZONES {
            return Err(Error::Config {
                path: path.to_path_buf(),
                reason: format!(
                    "too many zones: {} (max {})",
                    self.container_configs.len(),
                    MAX_ZONES
                ),
            });
        }
        if self.proxy_call_rules.len() > MAX_PROXY_CALL_RULES {
            return Err(Error::Config {
                path: path.to_path_buf(),
                reason: format!(
                    "too many proxy call rules: {} (max {})",
                    self.proxy_call_rules.len(),
                    MAX_PROXY_CALL_RULES
                ),
            });
        }
        Ok(())
    }

    /// Resolves the zone config paths against the manager config location.
    #[must_use]
    pub fn zone_config_paths(&self, manager_config_path: &Path) -> Vec<PathBuf> {
        let base = manager_config_path.parent().unwrap_or_else(|| Path::new("."));
        self.container_configs
            .iter()
            .map(|entry| {
                let p = Path::new(entry);
                if p.is_absolute() {
                    p.to_path_buf()
                } else {
                    base.join(p)
                }
            })
            .collect()
    }

    /// Resolves the template directory against the manager config location.
    #[must_use]
    pub fn resolved_template_path(&self, manager_config_path: &Path) -> PathBuf {
        if self.zone_template_path.is_absolute() {
            self.zone_template_path.clone()
        } else {
            let base = manager_config_path.parent().unwrap_or_else(|| Path::new("."));
            base.join(&self.zone_template_path)
        }
    }
}

// =============================================================================
// Zone Config
// =============================================================================

/// Per-zone configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    /// Zone id, unique across the daemon. `"host"` is reserved.
    pub id: String,
    /// Zone root filesystem, relative to the zone directory unless absolute.
    #[serde(default = "default_rootfs_path")]
    pub rootfs_path: PathBuf,
    /// Terminal number assigned to the zone.
    #[serde(default)]
    pub vt: u32,
    /// Numeric privilege; lower wins default foreground selection.
    #[serde(default)]
    pub privilege: u32,
    /// Whether a display-off while foreground switches back to the
    /// default zone.
    #[serde(default)]
    pub switch_to_default_after_timeout: bool,
    /// Address of the zone's bus. May be empty until the backend
    /// reports one.
    #[serde(default)]
    pub bus_address: String,
    /// Full-string regexes of paths the zone may send.
    #[serde(default)]
    pub permitted_to_send: Vec<String>,
    /// Full-string regexes of paths the zone may receive.
    #[serde(default)]
    pub permitted_to_recv: Vec<String>,
}

fn default_rootfs_path() -> PathBuf {
    PathBuf::from("rootfs")
}

impl ZoneConfig {
    /// Loads and validates a zone config from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for unreadable or malformed JSON or bad
    /// permission patterns, `Error::InvalidZoneId` for a bad id.
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: Self = read_json(path)?;
        validate_zone_id(&config.id)?;
        // Compile once to reject bad patterns at startup; zones compile
        // their own copies when constructed.
        compile_patterns(&config.permitted_to_send, path)?;
        compile_patterns(&config.permitted_to_recv, path)?;
        Ok(config)
    }

    /// Compiled permitted-to-send matchers.
    pub fn send_matchers(&self) -> Result<Vec<Regex>> {
        compile_patterns(&self.permitted_to_send, Path::new(&self.id))
    }

    /// Compiled permitted-to-recv matchers.
    pub fn recv_matchers(&self) -> Result<Vec<Regex>> {
        compile_patterns(&self.permitted_to_recv, Path::new(&self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_zone_id() {
        assert!(validate_zone_id("z1").is_ok());
        assert!(validate_zone_id("zone-a_2").is_ok());
        assert!(validate_zone_id("").is_err());
        assert!(validate_zone_id("host").is_err());
        assert!(validate_zone_id("bad/id").is_err());
        assert!(validate_zone_id(&"x".repeat(MAX_ZONE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_rule_effect_default_is_allow() {
        let rule: ProxyCallRule = serde_json::from_str(r#"{"caller": "z1"}"#).unwrap();
        assert_eq!(rule.effect, RuleEffect::Allow);
        assert_eq!(rule.target, "");
    }

    #[test]
    fn test_manager_config_defaults() {
        let json = r#"{
            "defaultId": "z1",
            "containersPath": "/var/lib/zoned/zones"
        }"#;
        let config: ManagerConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.default_id, "z1");
        assert_eq!(config.foreground_id, "");
        assert_eq!(config.run_mount_point_prefix, PathBuf::from("/run/zoned"));
        assert!(config.proxy_call_rules.is_empty());
        assert!(!config.input_config.enabled);
    }

    #[test]
    fn test_zone_config_path_resolution() {
        let json = r#"{
            "defaultId": "z1",
            "containersPath": "/zones",
            "containerConfigs": ["zones/z1.json", "/etc/zoned/z2.json"]
        }"#;
        let config: ManagerConfig = serde_json::from_str(json).unwrap();
        let paths = config.zone_config_paths(Path::new("/etc/zoned/daemon.json"));
        assert_eq!(paths[0], PathBuf::from("/etc/zoned/zones/z1.json"));
        assert_eq!(paths[1], PathBuf::from("/etc/zoned/z2.json"));
    }

    #[test]
    fn test_bad_permission_pattern_rejected() {
        let dir = std::env::temp_dir().join("zoned-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.json");
        std::fs::write(&path, r#"{"id": "z1", "permittedToSend": ["/tmp/["]}"#).unwrap();
        assert!(ZoneConfig::from_file(&path).is_err());
        std::fs::remove_file(&path).ok();
    }
}
