//! Container-runtime adapter.
//!
//! The daemon drives zones through the [`ZoneBackend`] trait and never
//! touches a container runtime directly. Production adapters (LXC-style
//! runtimes, VM drivers) live outside this crate; what ships here is the
//! in-memory [`TestBackend`], a state-recording driver in the libvirt
//! "test" tradition, used by the embedded mode and the test-suite.
//!
//! All operations are idempotent with respect to re-entry after success.

use crate::config::ZoneConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Callback reporting that the zone's bus address changed.
pub type BusAddressCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Primitive container handle the daemon drives.
#[async_trait]
pub trait ZoneBackend: Send + Sync {
    /// Starts the container.
    async fn start(&self) -> Result<()>;

    /// Stops the container immediately.
    async fn stop(&self) -> Result<()>;

    /// Asks the container to shut down gracefully.
    async fn shutdown(&self) -> Result<()>;

    /// Freezes every process in the container.
    async fn freeze(&self) -> Result<()>;

    /// Thaws a frozen container.
    async fn unfreeze(&self) -> Result<()>;

    /// Grants the container access to shared physical resources.
    async fn set_foreground(&self) -> Result<()>;

    /// Revokes access to shared physical resources.
    async fn set_background(&self) -> Result<()>;

    /// Whether the container is running (frozen counts as running).
    fn is_running(&self) -> bool;

    /// Current address of the container's bus; empty until known.
    fn bus_address(&self) -> String;

    /// Installs the bus-address change callback. Fired on every address
    /// transition, including the initial report and the empty address on
    /// disconnect.
    fn set_bus_address_callback(&self, callback: BusAddressCallback);

    /// Grants access to a device node.
    async fn grant_device(&self, device: &str, flags: u32) -> Result<()>;

    /// Revokes access to a device node.
    async fn revoke_device(&self, device: &str) -> Result<()>;
}

/// Creates backends for zones as they are constructed.
pub trait ZoneBackendFactory: Send + Sync {
    /// Builds the backend for one zone.
    ///
    /// # Errors
    ///
    /// Returns an error when the driver cannot serve this zone.
    fn create(&self, config: &ZoneConfig, run_mount_point: &Path) -> Result<Box<dyn ZoneBackend>>;
}

// =============================================================================
// Test Backend
// =============================================================================

#[derive(Default)]
struct TestBackendState {
    running: bool,
    frozen: bool,
    foreground: bool,
    devices: HashMap<String, u32>,
    callback: Option<BusAddressCallback>,
}

/// In-memory state-recording driver.
pub struct TestBackend {
    zone_id: String,
    bus_address: String,
    state: Mutex<TestBackendState>,
}

impl TestBackend {
    /// Creates a backend for the given zone config. An empty configured
    /// bus address is replaced with one under the run mount point.
    #[must_use]
    pub fn new(config: &ZoneConfig, run_mount_point: &Path) -> Self {
        let bus_address = if config.bus_address.is_empty() {
            format!("unix:path={}/bus.sock", run_mount_point.display())
        } else {
            config.bus_address.clone()
        };
        Self {
            zone_id: config.id.clone(),
            bus_address,
            state: Mutex::new(TestBackendState::default()),
        }
    }

    /// Whether the container currently holds the foreground.
    #[must_use]
    pub fn is_foreground(&self) -> bool {
        self.state.lock().expect("state lock").foreground
    }

    /// Flags the device was granted with, if granted.
    #[must_use]
    pub fn device_flags(&self, device: &str) -> Option<u32> {
        self.state
            .lock()
            .expect("state lock")
            .devices
            .get(device)
            .copied()
    }

    fn fire_bus_address(&self, address: String) {
        let callback = self
            .state
            .lock()
            .expect("state lock")
            .callback
            .clone();
        if let Some(callback) = callback {
            callback(address);
        }
    }
}

#[async_trait]
impl ZoneBackend for TestBackend {
    async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            if state.running {
                return Ok(());
            }
            state.running = true;
            state.frozen = false;
        }
        debug!(zone = %self.zone_id, "test backend started");
        self.fire_bus_address(self.bus_address.clone());
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("state lock");
            if !state.running {
                return Ok(());
            }
            state.running = false;
            state.frozen = false;
            state.foreground = false;
        }
        debug!(zone = %self.zone_id, "test backend stopped");
        self.fire_bus_address(String::new());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.stop().await
    }

    async fn freeze(&self) -> Result<()> {
        let mut state = self.state.lock().expect("state lock");
        if !state.running {
            return Err(Error::ZoneOperation {
                id: self.zone_id.clone(),
                op: "freeze",
                reason: "not running".to_string(),
            });
        }
        state.frozen = true;
        Ok(())
    }

    async fn unfreeze(&self) -> Result<()> {
        let mut state = self.state.lock().expect("state lock");
        state.frozen = false;
        Ok(())
    }

    async fn set_foreground(&self) -> Result<()> {
        self.state.lock().expect("state lock").foreground = true;
        Ok(())
    }

    async fn set_background(&self) -> Result<()> {
        self.state.lock().expect("state lock").foreground = false;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state.lock().expect("state lock").running
    }

    fn bus_address(&self) -> String {
        if self.is_running() {
            self.bus_address.clone()
        } else {
            String::new()
        }
    }

    fn set_bus_address_callback(&self, callback: BusAddressCallback) {
        self.state.lock().expect("state lock").callback = Some(callback);
    }

    async fn grant_device(&self, device: &str, flags: u32) -> Result<()> {
        self.state
            .lock()
            .expect("state lock")
            .devices
            .insert(device.to_string(), flags);
        Ok(())
    }

    async fn revoke_device(&self, device: &str) -> Result<()> {
        self.state
            .lock()
            .expect("state lock")
            .devices
            .remove(device);
        Ok(())
    }
}

/// Factory handing out [`TestBackend`] instances.
#[derive(Default)]
pub struct TestBackendFactory {
    _private: (),
}

impl TestBackendFactory {
    /// Creates the factory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ZoneBackendFactory for TestBackendFactory {
    fn create(&self, config: &ZoneConfig, run_mount_point: &Path) -> Result<Box<dyn ZoneBackend>> {
        Ok(Box::new(TestBackend::new(config, run_mount_point)))
    }
}

/// Run mount point assigned to a zone.
#[must_use]
pub fn run_mount_point(prefix: &Path, zone_id: &str) -> PathBuf {
    prefix.join(zone_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(id: &str) -> ZoneConfig {
        serde_json::from_str(&format!(r#"{{"id": "{id}"}}"#)).unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let backend = TestBackend::new(&test_config("z1"), Path::new("/run/zoned/z1"));
        assert!(!backend.is_running());
        backend.start().await.unwrap();
        backend.start().await.unwrap();
        assert!(backend.is_running());
        backend.stop().await.unwrap();
        backend.stop().await.unwrap();
        assert!(!backend.is_running());
    }

    #[tokio::test]
    async fn test_bus_address_reported_only_when_running() {
        let backend = TestBackend::new(&test_config("z1"), Path::new("/run/zoned/z1"));
        assert_eq!(backend.bus_address(), "");
        backend.start().await.unwrap();
        assert_eq!(backend.bus_address(), "unix:path=/run/zoned/z1/bus.sock");
    }

    #[tokio::test]
    async fn test_freeze_requires_running() {
        let backend = TestBackend::new(&test_config("z1"), Path::new("/run"));
        assert!(backend.freeze().await.is_err());
        backend.start().await.unwrap();
        backend.freeze().await.unwrap();
        assert!(backend.is_running());
    }
}
