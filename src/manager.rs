//! Central zone manager.
//!
//! Owns the map of zones, drives foreground selection, routes proxy calls
//! through the policy engine, and arbitrates cross-zone requests
//! (notifications, file moves). All mutable manager state lives behind a
//! single async mutex; single-zone operations snapshot the zone handle
//! under the lock and run outside it, map-shape changes (create/destroy)
//! hold the lock for the whole operation.

use crate::backend::{run_mount_point, ZoneBackendFactory};
use crate::bus::{BusConnection, BusConnector, BusError};
use crate::config::{validate_zone_id, ManagerConfig, ZoneConfig};
use crate::constants::{
    ERROR_FORBIDDEN, ERROR_FORWARDED, ERROR_UNKNOWN_ID, FILE_MOVE_DESTINATION_NOT_FOUND,
    FILE_MOVE_FAILED, FILE_MOVE_NO_PERMISSIONS_RECEIVE, FILE_MOVE_NO_PERMISSIONS_SEND,
    FILE_MOVE_SUCCEEDED, FILE_MOVE_WRONG_DESTINATION, HOST_ID, MAX_ZONES, PROXY_CALL_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::input::InputMonitor;
use crate::policy::ProxyCallPolicy;
use crate::zone::{ProxyCallRequest, Zone, ZoneEvents};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

/// Callback fired on every zone bus-address transition.
pub type StateCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Opaque state-subscription handle; unique for the process lifetime.
pub type SubscriptionId = u64;

struct ManagerState {
    zones: BTreeMap<String, Arc<Zone>>,
    foreground_id: String,
}

impl std::fmt::Debug for ZonesManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZonesManager").finish_non_exhaustive()
    }
}

/// The zones manager.
pub struct ZonesManager {
    config: ManagerConfig,
    config_path: PathBuf,
    policy: ProxyCallPolicy,
    connector: Arc<dyn BusConnector>,
    backend_factory: Arc<dyn ZoneBackendFactory>,
    host_connection: Arc<dyn BusConnection>,
    state: tokio::sync::Mutex<ManagerState>,
    subscriptions: Mutex<HashMap<SubscriptionId, StateCallback>>,
    next_subscription_id: AtomicU64,
    detach_on_exit: AtomicBool,
    input_monitor: Mutex<Option<InputMonitor>>,
}

impl ZonesManager {
    /// Loads the manager config, instantiates every configured zone, and
    /// validates the default zone exists.
    ///
    /// # Errors
    ///
    /// Any `ConfigError` here is fatal at daemon startup: malformed
    /// configs, duplicate or reserved ids, bad policy globs, or a default
    /// id missing from the zone set.
    pub async fn new(
        config_path: &Path,
        connector: Arc<dyn BusConnector>,
        backend_factory: Arc<dyn ZoneBackendFactory>,
    ) -> Result<Arc<Self>> {
        debug!(path = %config_path.display(), "instantiating zones manager");
        let config = ManagerConfig::from_file(config_path)?;
        let policy = ProxyCallPolicy::new(&config.proxy_call_rules)?;
        let host_connection = connector.connect(&config.host_bus_address).await?;

        let manager = Arc::new(Self {
            state: tokio::sync::Mutex::new(ManagerState {
                zones: BTreeMap::new(),
                foreground_id: config.foreground_id.clone(),
            }),
            config_path: config_path.to_path_buf(),
            policy,
            connector,
            backend_factory,
            host_connection,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
            detach_on_exit: AtomicBool::new(false),
            input_monitor: Mutex::new(None),
            config,
        });

        let mut zones = BTreeMap::new();
        for zone_config_path in manager.config.zone_config_paths(config_path) {
            debug!(path = %zone_config_path.display(), "creating zone");
            let zone_config = ZoneConfig::from_file(&zone_config_path)?;
            if zones.contains_key(&zone_config.id) {
                return Err(Error::InvalidZoneId {
                    id: zone_config.id,
                    reason: "duplicate zone id".to_string(),
                });
            }
            let zone = manager.build_zone(zone_config)?;
            zones.insert(zone.id().to_string(), zone);
        }

        if !zones.contains_key(&manager.config.default_id) {
            return Err(Error::Config {
                path: config_path.to_path_buf(),
                reason: format!(
                    "default zone id '{}' is not among the configured zones",
                    manager.config.default_id
                ),
            });
        }

        manager.state.lock().await.zones = zones;
        info!(zones = manager.config.container_configs.len(), "zones manager instantiated");
        Ok(manager)
    }

    fn build_zone(self: &Arc<Self>, config: ZoneConfig) -> Result<Arc<Zone>> {
        let mount = run_mount_point(&self.config.run_mount_point_prefix, &config.id);
        let backend = self.backend_factory.create(&config, &mount)?;
        let events = Arc::downgrade(self) as Weak<dyn ZoneEvents>;
        let zone = Arc::new(Zone::new(config, backend, Arc::clone(&self.connector), events)?);
        zone.install_backend_callback();
        Ok(zone)
    }

    /// Manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    // =========================================================================
    // Foreground Selection
    // =========================================================================

    /// Moves the foreground to `id`.
    ///
    /// Every zone (the target included) is first sent to the background so
    /// there is never a transient double-foreground, then the target is
    /// raised.
    pub async fn focus(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        self.focus_locked(&mut state, id).await
    }

    async fn focus_locked(&self, state: &mut ManagerState, id: &str) -> Result<()> {
        let target = state
            .zones
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownId(id.to_string()))?;
        if target.is_stopped() {
            return Err(Error::ZoneStopped(id.to_string()));
        }

        for zone in state.zones.values() {
            debug!(zone = %zone.id(), "being sent to background");
            if let Err(e) = zone.go_background().await {
                error!(zone = %zone.id(), error = %e, "failed to background zone");
            }
        }

        state.foreground_id = id.to_string();
        info!(zone = %id, "being sent to foreground");
        target.go_foreground().await
    }

    /// Starts every zone and establishes an initial foreground: the
    /// configured one when it started, otherwise the started zone with the
    /// numerically smallest privilege (ties go to the smallest id).
    pub async fn start_all(&self) -> Result<()> {
        info!("starting all zones");
        let mut state = self.state.lock().await;

        for (id, zone) in &state.zones {
            if let Err(e) = zone.start().await {
                error!(zone = %id, error = %e, "failed to start zone");
            }
        }

        let configured = state.foreground_id.clone();
        let configured_running = state
            .zones
            .get(&configured)
            .map(|z| z.is_running())
            .unwrap_or(false);

        let chosen = if configured_running {
            Some(configured)
        } else {
            let mut best: Option<&Arc<Zone>> = None;
            for zone in state.zones.values().filter(|z| z.is_running()) {
                let replace = match best {
                    None => true,
                    Some(current) => zone.privilege() < current.privilege(),
                };
                if replace {
                    best = Some(zone);
                }
            }
            best.map(|z| z.id().to_string())
        };

        match chosen {
            Some(id) => {
                state.foreground_id = id.clone();
                info!(zone = %id, "set as the foreground zone");
                if let Some(zone) = state.zones.get(&id) {
                    zone.go_foreground().await?;
                }
            }
            None => {
                warn!("no zone is running, leaving foreground unset");
            }
        }
        Ok(())
    }

    /// Stops every zone. Per-zone failures are logged and swallowed so one
    /// failure does not strand the others.
    pub async fn stop_all(&self) {
        info!("stopping all zones");
        let state = self.state.lock().await;
        for (id, zone) in &state.zones {
            if let Err(e) = zone.stop().await {
                error!(zone = %id, error = %e, "failed to stop zone");
            }
        }
    }

    fn running_foreground_locked(&self, state: &ManagerState) -> Option<Arc<Zone>> {
        state
            .zones
            .get(&state.foreground_id)
            .filter(|z| z.is_running())
            .cloned()
    }

    // =========================================================================
    // Host Operations
    // =========================================================================

    /// Ids of every managed zone, in id order.
    pub async fn get_zone_ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.zones.keys().cloned().collect()
    }

    /// Id of the running foreground zone, or empty when there is none.
    pub async fn get_active_zone_id(&self) -> String {
        let state = self.state.lock().await;
        self.running_foreground_locked(&state)
            .map(|z| z.id().to_string())
            .unwrap_or_default()
    }

    /// Moves the foreground to `id`; the zone must exist and be running.
    pub async fn set_active_zone(&self, id: &str) -> Result<()> {
        info!(zone = %id, "set active zone");
        self.focus(id).await
    }

    /// Bus address of every zone, keyed by id. Addresses are empty for
    /// zones without a connected bus.
    pub async fn get_zone_dbuses(&self) -> BTreeMap<String, String> {
        let state = self.state.lock().await;
        state
            .zones
            .iter()
            .map(|(id, zone)| (id.clone(), zone.bus_address()))
            .collect()
    }

    async fn lookup_zone(&self, id: &str) -> Result<Arc<Zone>> {
        let state = self.state.lock().await;
        state
            .zones
            .get(id)
            .cloned()
            .ok_or_else(|| Error::UnknownId(id.to_string()))
    }

    /// Starts one zone.
    pub async fn start_zone(&self, id: &str) -> Result<()> {
        self.lookup_zone(id).await?.start().await
    }

    /// Gracefully shuts one zone down.
    pub async fn shutdown_zone(&self, id: &str) -> Result<()> {
        self.lookup_zone(id).await?.shutdown().await
    }

    /// Locks (freezes) one zone.
    pub async fn lock_zone(&self, id: &str) -> Result<()> {
        self.lookup_zone(id).await?.lock().await
    }

    /// Unlocks (thaws) one zone.
    pub async fn unlock_zone(&self, id: &str) -> Result<()> {
        self.lookup_zone(id).await?.unlock().await
    }

    /// Grants a device node to a zone.
    pub async fn grant_device(&self, id: &str, device: &str, flags: u32) -> Result<()> {
        self.lookup_zone(id).await?.grant_device(device, flags).await
    }

    /// Revokes a device node from a zone.
    pub async fn revoke_device(&self, id: &str, device: &str) -> Result<()> {
        self.lookup_zone(id).await?.revoke_device(device).await
    }

    /// Creates a zone from a template config. Holds the manager lock for
    /// the whole operation; the new zone is left stopped.
    pub async fn create_zone(self: &Arc<Self>, id: &str, template: &str) -> Result<()> {
        validate_zone_id(id)?;
        info!(zone = %id, template, "create zone");
        let mut state = self.state.lock().await;
        if state.zones.contains_key(id) {
            return Err(Error::InvalidZoneId {
                id: id.to_string(),
                reason: "zone already exists".to_string(),
            });
        }
        if state.zones.len() >= MAX_ZONES {
            return Err(Error::InvalidZoneId {
                id: id.to_string(),
                reason: format!("zone limit reached ({MAX_ZONES})"),
            });
        }

        let template_path = self
            .config
            .resolved_template_path(&self.config_path)
            .join(format!("{template}.json"));
        let mut zone_config = ZoneConfig::from_file(&template_path)?;
        zone_config.id = id.to_string();

        let zone = self.build_zone(zone_config)?;
        state.zones.insert(id.to_string(), zone);
        Ok(())
    }

    /// Destroys a zone: shuts it down (falling back to a hard stop) and
    /// removes it from the map. Holds the manager lock throughout.
    pub async fn destroy_zone(&self, id: &str) -> Result<()> {
        info!(zone = %id, "destroy zone");
        let mut state = self.state.lock().await;
        let zone = state
            .zones
            .remove(id)
            .ok_or_else(|| Error::UnknownId(id.to_string()))?;
        if state.foreground_id == id {
            state.foreground_id.clear();
        }
        if let Err(e) = zone.shutdown().await {
            warn!(zone = %id, error = %e, "graceful shutdown failed, stopping");
            zone.stop().await?;
        }
        Ok(())
    }

    // =========================================================================
    // State Subscriptions
    // =========================================================================

    /// Subscribes to zone bus-state transitions. The returned id is never
    /// reused within the process lifetime.
    pub fn add_state_callback<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .insert(id, Arc::new(callback));
        id
    }

    /// Removes a subscription; returns whether it existed.
    pub fn del_state_callback(&self, id: SubscriptionId) -> bool {
        self.subscriptions
            .lock()
            .expect("subscriptions lock")
            .remove(&id)
            .is_some()
    }

    // =========================================================================
    // Detach / Shutdown
    // =========================================================================

    /// Makes daemon teardown leave every zone running.
    pub async fn set_zones_detach_on_exit(&self) {
        self.detach_on_exit.store(true, Ordering::SeqCst);
        let state = self.state.lock().await;
        for zone in state.zones.values() {
            zone.set_detach_on_exit();
        }
    }

    /// Tears the manager down: stops the input monitor and, unless
    /// detached, every zone.
    pub async fn shutdown(&self) {
        debug!("zones manager shutting down");
        self.stop_input_monitor();
        if !self.detach_on_exit.load(Ordering::SeqCst) {
            self.stop_all().await;
        }
    }

    // =========================================================================
    // Input Monitor
    // =========================================================================

    /// Starts the switch-gesture monitor when enabled in config.
    pub fn start_input_monitor(self: &Arc<Self>) -> Result<()> {
        if !self.config.input_config.enabled {
            return Ok(());
        }
        info!(device = %self.config.input_config.device.display(), "registering input monitor");
        let weak = Arc::downgrade(self);
        let monitor = InputMonitor::start(self.config.input_config.clone(), move || {
            if let Some(manager) = weak.upgrade() {
                manager.switching_sequence_notify();
            }
        })?;
        *self.input_monitor.lock().expect("input monitor lock") = Some(monitor);
        Ok(())
    }

    /// Stops the switch-gesture monitor if it is running.
    pub fn stop_input_monitor(&self) {
        if let Some(monitor) = self
            .input_monitor
            .lock()
            .expect("input monitor lock")
            .take()
        {
            monitor.stop();
        }
    }

    /// Switch-gesture handler. The switching policy (round-robin, LRU, a
    /// configured sequence) is not settled; the gesture is logged and
    /// otherwise ignored.
    pub fn switching_sequence_notify(&self) {
        info!("switch gesture received, switching policy not configured");
    }

    // =========================================================================
    // File Move
    // =========================================================================

    async fn handle_file_move(&self, caller: &str, destination: &str, path: &str) -> String {
        info!(src = %caller, dst = %destination, path = %path, "file move requested");
        let state = self.state.lock().await;

        let Some(source) = state.zones.get(caller).cloned() else {
            error!(zone = %caller, "file move from unknown zone");
            return FILE_MOVE_FAILED.to_string();
        };
        let Some(target) = state.zones.get(destination).cloned() else {
            error!(zone = %destination, "file move destination not found");
            return FILE_MOVE_DESTINATION_NOT_FOUND.to_string();
        };
        drop(state);

        if caller == destination {
            error!("cannot move a file to the calling zone");
            return FILE_MOVE_WRONG_DESTINATION.to_string();
        }
        if !source.is_send_allowed(path) {
            error!(zone = %caller, path = %path, "no permission to send");
            return FILE_MOVE_NO_PERMISSIONS_SEND.to_string();
        }
        if !target.is_recv_allowed(path) {
            error!(zone = %destination, path = %path, "no permission to receive");
            return FILE_MOVE_NO_PERMISSIONS_RECEIVE.to_string();
        }

        let relative = path.trim_start_matches('/');
        let src_abs = self.config.containers_path.join(caller).join(relative);
        let dst_abs = self.config.containers_path.join(destination).join(relative);

        if let Err(e) = move_file(&src_abs, &dst_abs).await {
            error!(path = %path, error = %e, "failed to move the file");
            return FILE_MOVE_FAILED.to_string();
        }

        if let Err(e) = target.send_notification(caller, path, FILE_MOVE_SUCCEEDED) {
            // Best effort only; the move already happened.
            error!(zone = %destination, error = %e, "file move notification not sent");
        }
        FILE_MOVE_SUCCEEDED.to_string()
    }
}

/// Moves a file, falling back to copy-and-remove across filesystems.
/// Destination directories are created as needed.
async fn move_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    if let Some(parent) = dst.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::rename(src, dst).await {
        Ok(()) => Ok(()),
        Err(_) => {
            tokio::fs::copy(src, dst).await?;
            tokio::fs::remove_file(src).await
        }
    }
}

// =============================================================================
// Zone Event Handling
// =============================================================================

#[async_trait]
impl ZoneEvents for ZonesManager {
    async fn notify_active_zone(&self, caller: &str, application: &str, message: &str) {
        info!(caller = %caller, application = %application, "notify active zone");
        let state = self.state.lock().await;
        let Some(active) = self.running_foreground_locked(&state) else {
            return;
        };
        if active.id() == caller {
            return;
        }
        if let Err(e) = active.send_notification(caller, application, message) {
            error!(caller = %caller, error = %e, "notification has not been sent");
        }
    }

    async fn display_off(&self, caller: &str) {
        debug!(zone = %caller, "display off");
        let mut state = self.state.lock().await;
        let Some(active) = self.running_foreground_locked(&state) else {
            return;
        };
        if active.is_switch_to_default_after_timeout_allowed() {
            let default_id = self.config.default_id.clone();
            info!(zone = %default_id, "display off, switching to default zone");
            if let Err(e) = self.focus_locked(&mut state, &default_id).await {
                error!(zone = %default_id, error = %e, "failed to switch to default zone");
            }
        }
    }

    async fn file_move_request(&self, caller: &str, destination: &str, path: &str) -> String {
        self.handle_file_move(caller, destination, path).await
    }

    async fn proxy_call(
        &self,
        caller: &str,
        request: ProxyCallRequest,
    ) -> std::result::Result<Value, BusError> {
        if !self.policy.is_allowed(
            caller,
            &request.target,
            &request.bus_name,
            &request.object_path,
            &request.interface,
            &request.method,
        ) {
            warn!(
                caller = %caller,
                target = %request.target,
                bus = %request.bus_name,
                path = %request.object_path,
                interface = %request.interface,
                method = %request.method,
                "forbidden proxy call"
            );
            return Err(BusError::new(ERROR_FORBIDDEN, "Proxy call forbidden"));
        }

        info!(
            caller = %caller,
            target = %request.target,
            interface = %request.interface,
            method = %request.method,
            "proxy call"
        );

        if request.target == HOST_ID {
            return match tokio::time::timeout(
                PROXY_CALL_TIMEOUT,
                self.host_connection.call(
                    &request.bus_name,
                    &request.object_path,
                    &request.interface,
                    &request.method,
                    request.args,
                ),
            )
            .await
            {
                Err(_) => Err(BusError::new(ERROR_FORWARDED, "downstream call timed out")),
                Ok(Err(e)) => Err(BusError::new(ERROR_FORWARDED, e.to_string())),
                Ok(Ok(value)) => Ok(value),
            };
        }

        let target = {
            let state = self.state.lock().await;
            state.zones.get(&request.target).cloned()
        };
        let target = match target {
            Some(zone) if zone.is_running() => zone,
            _ => {
                error!(target = %request.target, "unknown proxy call target");
                return Err(BusError::new(ERROR_UNKNOWN_ID, "Unknown proxy call target"));
            }
        };

        match tokio::time::timeout(
            PROXY_CALL_TIMEOUT,
            target.proxy_call(
                &request.bus_name,
                &request.object_path,
                &request.interface,
                &request.method,
                request.args,
            ),
        )
        .await
        {
            Err(_) => Err(BusError::new(ERROR_FORWARDED, "downstream call timed out")),
            Ok(Err(e)) => Err(BusError::new(ERROR_FORWARDED, e.to_string())),
            Ok(Ok(value)) => Ok(value),
        }
    }

    async fn bus_state_changed(&self, zone_id: &str, address: &str) {
        let callbacks: Vec<StateCallback> = self
            .subscriptions
            .lock()
            .expect("subscriptions lock")
            .values()
            .cloned()
            .collect();
        for callback in callbacks {
            callback(zone_id, address);
        }
    }
}
