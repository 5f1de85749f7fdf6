//! Per-zone state machine and zone-bus endpoint.
//!
//! A [`Zone`] owns its container backend and, while running, a connection
//! to the zone's own bus where it serves the zone-side API
//! (`NotifyActiveContainer`, `FileMoveRequest`, `ProxyCall`) and listens
//! for the power manager's `DisplayOff` signal. Everything a zone cannot
//! decide alone is routed to the manager through the [`ZoneEvents`]
//! capability interface; the zone holds only a non-owning handle so the
//! manager can drop the zone map without a reference cycle.

use crate::backend::ZoneBackend;
use crate::bus::{method_handler, BusConnection, BusConnector, BusError};
use crate::config::ZoneConfig;
use crate::constants::{
    POWER_MANAGER_BUS_NAME, POWER_MANAGER_INTERFACE, POWER_MANAGER_OBJECT_PATH,
    POWER_MANAGER_SIGNAL_DISPLAY_OFF, ZONE_BUS_NAME, ZONE_INTERFACE,
    ZONE_METHOD_FILE_MOVE_REQUEST, ZONE_METHOD_NOTIFY_ACTIVE_CONTAINER, ZONE_METHOD_PROXY_CALL,
    ZONE_OBJECT_PATH, ZONE_SIGNAL_NOTIFICATION,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

// =============================================================================
// Zone State
// =============================================================================

/// Zone lifecycle state.
///
/// ```text
///   Stopped ──start()──▶ Starting ──▶ Running ──lock()──▶ Locked
///      ▲                                │  ▲──unlock()──────┘
///      └────── Stopping ◀──stop()───────┘
///      └────── Aborting ◀── fatal ──────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneState {
    /// Not running.
    Stopped,
    /// Backend start in progress.
    Starting,
    /// Running; may or may not hold the foreground.
    Running,
    /// Backend stop in progress.
    Stopping,
    /// Running but frozen by an explicit lock.
    Locked,
    /// Frozen by the backend outside of a lock.
    Frozen,
    /// A fatal error interrupted a transition.
    Aborting,
}

impl std::fmt::Display for ZoneState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ZoneState::Stopped => "stopped",
            ZoneState::Starting => "starting",
            ZoneState::Running => "running",
            ZoneState::Stopping => "stopping",
            ZoneState::Locked => "locked",
            ZoneState::Frozen => "frozen",
            ZoneState::Aborting => "aborting",
        };
        write!(f, "{s}")
    }
}

// =============================================================================
// Proxy Call Request
// =============================================================================

/// One cross-domain method call, as carried on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyCallRequest {
    /// Target domain: a zone id or `"host"`.
    pub target: String,
    /// Destination bus name on the target bus.
    pub bus_name: String,
    /// Destination object path.
    pub object_path: String,
    /// Destination interface.
    pub interface: String,
    /// Destination method.
    pub method: String,
    /// Method arguments, forwarded opaquely.
    #[serde(default)]
    pub args: Value,
}

// =============================================================================
// Manager Capability Interface
// =============================================================================

/// What a zone may ask of its manager. The manager implements this; zones
/// hold a `Weak` reference that is invalidated before the manager drops
/// its zone map.
#[async_trait]
pub trait ZoneEvents: Send + Sync {
    /// A client inside `caller` wants the active zone notified.
    async fn notify_active_zone(&self, caller: &str, application: &str, message: &str);

    /// The display of `caller` went off.
    async fn display_off(&self, caller: &str);

    /// `caller` asks to move `path` into `destination`. Returns a
    /// file-move result code string.
    async fn file_move_request(&self, caller: &str, destination: &str, path: &str) -> String;

    /// `caller` asks to invoke a method in another domain.
    async fn proxy_call(
        &self,
        caller: &str,
        request: ProxyCallRequest,
    ) -> std::result::Result<Value, BusError>;

    /// The zone's bus address changed (empty on disconnect).
    async fn bus_state_changed(&self, zone_id: &str, address: &str);
}

// =============================================================================
// Zone
// =============================================================================

/// One managed zone.
pub struct Zone {
    config: ZoneConfig,
    send_matchers: Vec<Regex>,
    recv_matchers: Vec<Regex>,
    backend: Box<dyn ZoneBackend>,
    connector: Arc<dyn BusConnector>,
    events: Weak<dyn ZoneEvents>,
    state: Mutex<ZoneState>,
    /// Serializes lifecycle transitions.
    op_lock: tokio::sync::Mutex<()>,
    /// Serializes bus connect/disconnect against backend address reports.
    bus_lock: tokio::sync::Mutex<()>,
    connection: Mutex<Option<Arc<dyn BusConnection>>>,
    address: Mutex<String>,
    detach_on_exit: AtomicBool,
}

impl Zone {
    /// Builds a zone from its config and backend. The zone starts in
    /// `Stopped`; nothing touches the backend until `start()`.
    pub fn new(
        config: ZoneConfig,
        backend: Box<dyn ZoneBackend>,
        connector: Arc<dyn BusConnector>,
        events: Weak<dyn ZoneEvents>,
    ) -> Result<Self> {
        let send_matchers = config.send_matchers()?;
        let recv_matchers = config.recv_matchers()?;
        Ok(Self {
            config,
            send_matchers,
            recv_matchers,
            backend,
            connector,
            events,
            state: Mutex::new(ZoneState::Stopped),
            op_lock: tokio::sync::Mutex::new(()),
            bus_lock: tokio::sync::Mutex::new(()),
            connection: Mutex::new(None),
            address: Mutex::new(String::new()),
            detach_on_exit: AtomicBool::new(false),
        })
    }

    /// Wires the backend's bus-address reports into this zone. Must be
    /// called once the zone lives behind an `Arc`.
    pub fn install_backend_callback(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.backend.set_bus_address_callback(Arc::new(move |address| {
            if let Some(zone) = weak.upgrade() {
                tokio::spawn(async move {
                    zone.handle_bus_address_changed(address).await;
                });
            }
        }));
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Zone id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Zone config.
    #[must_use]
    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    /// Numeric privilege; lower wins default foreground selection.
    #[must_use]
    pub fn privilege(&self) -> u32 {
        self.config.privilege
    }

    /// Whether a display-off while foreground switches to the default zone.
    #[must_use]
    pub fn is_switch_to_default_after_timeout_allowed(&self) -> bool {
        self.config.switch_to_default_after_timeout
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ZoneState {
        *self.state.lock().expect("state lock")
    }

    /// True iff the zone is `Running` or `Locked`.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ZoneState::Running | ZoneState::Locked)
    }

    /// True iff the zone is `Stopped`.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == ZoneState::Stopped
    }

    /// Last reported bus address; empty when disconnected.
    #[must_use]
    pub fn bus_address(&self) -> String {
        self.address.lock().expect("address lock").clone()
    }

    /// Makes manager teardown skip stopping this zone.
    pub fn set_detach_on_exit(&self) {
        self.detach_on_exit.store(true, Ordering::SeqCst);
    }

    /// Whether teardown leaves the zone running.
    #[must_use]
    pub fn detach_on_exit(&self) -> bool {
        self.detach_on_exit.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ZoneState) {
        *self.state.lock().expect("state lock") = state;
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the zone and connects to its bus. Re-entry on a running
    /// zone is a no-op.
    pub async fn start(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.is_running() {
            return Ok(());
        }
        info!(zone = %self.id(), "starting");
        self.set_state(ZoneState::Starting);
        if let Err(e) = self.backend.start().await {
            self.set_state(ZoneState::Aborting);
            self.set_state(ZoneState::Stopped);
            return Err(Error::ZoneOperation {
                id: self.id().to_string(),
                op: "start",
                reason: e.to_string(),
            });
        }
        self.set_state(ZoneState::Running);
        self.handle_bus_address_changed(self.backend.bus_address())
            .await;
        Ok(())
    }

    /// Stops the zone immediately. Re-entry on a stopped zone is a no-op.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with("stop").await
    }

    /// Asks the zone to shut down gracefully, then reports it stopped.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_with("shutdown").await
    }

    async fn stop_with(&self, op: &'static str) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        if self.is_stopped() {
            return Ok(());
        }
        info!(zone = %self.id(), op, "stopping");
        self.set_state(ZoneState::Stopping);
        self.handle_bus_address_changed(String::new()).await;
        let outcome = match op {
            "shutdown" => self.backend.shutdown().await,
            _ => self.backend.stop().await,
        };
        match outcome {
            Ok(()) => {
                self.set_state(ZoneState::Stopped);
                Ok(())
            }
            Err(e) => {
                self.set_state(ZoneState::Aborting);
                Err(Error::ZoneOperation {
                    id: self.id().to_string(),
                    op,
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Freezes a running zone.
    pub async fn lock(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let state = self.state();
        if state != ZoneState::Running {
            return Err(Error::InvalidState {
                id: self.id().to_string(),
                state: state.to_string(),
                expected: ZoneState::Running.to_string(),
            });
        }
        self.backend.freeze().await?;
        self.set_state(ZoneState::Locked);
        Ok(())
    }

    /// Thaws a locked zone.
    pub async fn unlock(&self) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let state = self.state();
        if state != ZoneState::Locked {
            return Err(Error::InvalidState {
                id: self.id().to_string(),
                state: state.to_string(),
                expected: ZoneState::Locked.to_string(),
            });
        }
        self.backend.unfreeze().await?;
        self.set_state(ZoneState::Running);
        Ok(())
    }

    /// Grants the zone the shared physical resources. Idempotent.
    pub async fn go_foreground(&self) -> Result<()> {
        debug!(zone = %self.id(), "going to foreground");
        self.backend.set_foreground().await
    }

    /// Revokes the shared physical resources. Idempotent, valid in any
    /// state so a foreground sweep can cover stopped zones too.
    pub async fn go_background(&self) -> Result<()> {
        debug!(zone = %self.id(), "going to background");
        self.backend.set_background().await
    }

    // =========================================================================
    // Devices
    // =========================================================================

    /// Grants access to a device node.
    pub async fn grant_device(&self, device: &str, flags: u32) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ZoneStopped(self.id().to_string()));
        }
        self.backend.grant_device(device, flags).await
    }

    /// Revokes access to a device node.
    pub async fn revoke_device(&self, device: &str) -> Result<()> {
        if self.is_stopped() {
            return Err(Error::ZoneStopped(self.id().to_string()));
        }
        self.backend.revoke_device(device).await
    }

    // =========================================================================
    // File Move Permissions
    // =========================================================================

    /// Whether the zone may send `path` (full-string match).
    #[must_use]
    pub fn is_send_allowed(&self, path: &str) -> bool {
        self.send_matchers.iter().any(|re| re.is_match(path))
    }

    /// Whether the zone may receive `path` (full-string match).
    #[must_use]
    pub fn is_recv_allowed(&self, path: &str) -> bool {
        self.recv_matchers.iter().any(|re| re.is_match(path))
    }

    // =========================================================================
    // Bus Operations
    // =========================================================================

    /// Emits the `Notification` signal on the zone bus.
    pub fn send_notification(&self, container: &str, application: &str, message: &str) -> Result<()> {
        let connection = self
            .connection
            .lock()
            .expect("connection lock")
            .clone()
            .ok_or_else(|| Error::Bus(format!("zone '{}' has no bus connection", self.id())))?;
        connection.emit_signal(
            ZONE_OBJECT_PATH,
            ZONE_INTERFACE,
            ZONE_SIGNAL_NOTIFICATION,
            json!({
                "container": container,
                "application": application,
                "message": message,
            }),
        )
    }

    /// Forwards a method call onto the zone bus.
    pub async fn proxy_call(
        &self,
        bus_name: &str,
        object_path: &str,
        interface: &str,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, BusError> {
        let connection = self.connection.lock().expect("connection lock").clone();
        match connection {
            Some(connection) => {
                connection
                    .call(bus_name, object_path, interface, method, args)
                    .await
            }
            None => Err(BusError::new(
                "org.freedesktop.DBus.Error.Disconnected",
                format!("zone '{}' has no bus connection", self.id()),
            )),
        }
    }

    /// Applies a bus-address transition: tears down the old connection,
    /// connects to the new address when non-empty, and reports the change.
    /// Identical re-reports are dropped.
    pub(crate) async fn handle_bus_address_changed(&self, address: String) {
        let _guard = self.bus_lock.lock().await;
        if *self.address.lock().expect("address lock") == address {
            return;
        }

        let old = self.connection.lock().expect("connection lock").take();
        if let Some(old) = old {
            old.close();
        }

        let mut reported = address.clone();
        if !address.is_empty() {
            match self.connector.connect(&address).await {
                Ok(connection) => {
                    if let Err(e) = self.register_endpoint(&connection).await {
                        warn!(zone = %self.id(), error = %e, "zone endpoint setup failed");
                        reported = String::new();
                    } else {
                        *self.connection.lock().expect("connection lock") = Some(connection);
                    }
                }
                Err(e) => {
                    warn!(zone = %self.id(), address = %address, error = %e, "zone bus connect failed");
                    reported = String::new();
                }
            }
        }

        *self.address.lock().expect("address lock") = reported.clone();
        debug!(zone = %self.id(), address = %reported, "bus state changed");
        if let Some(events) = self.events.upgrade() {
            events.bus_state_changed(self.id(), &reported).await;
        }
    }

    /// Registers the zone-side API on a fresh bus connection.
    async fn register_endpoint(&self, connection: &Arc<dyn BusConnection>) -> Result<()> {
        connection.acquire_name(ZONE_BUS_NAME).await?;

        let events = self.events.clone();
        let caller = self.id().to_string();
        connection.register_method(
            ZONE_OBJECT_PATH,
            ZONE_INTERFACE,
            ZONE_METHOD_NOTIFY_ACTIVE_CONTAINER,
            method_handler(move |args: Value| {
                let events = events.clone();
                let caller = caller.clone();
                async move {
                    let (application, message) = parse_notify_args(&args)?;
                    if let Some(events) = events.upgrade() {
                        events
                            .notify_active_zone(&caller, &application, &message)
                            .await;
                    }
                    Ok(Value::Null)
                }
            }),
        );

        let events = self.events.clone();
        let caller = self.id().to_string();
        connection.register_method(
            ZONE_OBJECT_PATH,
            ZONE_INTERFACE,
            ZONE_METHOD_FILE_MOVE_REQUEST,
            method_handler(move |args: Value| {
                let events = events.clone();
                let caller = caller.clone();
                async move {
                    let (destination, path) = parse_file_move_args(&args)?;
                    let events = events.upgrade().ok_or_else(manager_gone)?;
                    let result = events.file_move_request(&caller, &destination, &path).await;
                    Ok(json!({ "result": result }))
                }
            }),
        );

        let events = self.events.clone();
        let caller = self.id().to_string();
        connection.register_method(
            ZONE_OBJECT_PATH,
            ZONE_INTERFACE,
            ZONE_METHOD_PROXY_CALL,
            method_handler(move |args: Value| {
                let events = events.clone();
                let caller = caller.clone();
                async move {
                    let request: ProxyCallRequest =
                        serde_json::from_value(args).map_err(|e| {
                            BusError::new(
                                "org.freedesktop.DBus.Error.InvalidArgs",
                                e.to_string(),
                            )
                        })?;
                    let events = events.upgrade().ok_or_else(manager_gone)?;
                    events.proxy_call(&caller, request).await
                }
            }),
        );

        // Display-off is only honored from the power manager's well-known
        // name; anonymous senders never reach this handler.
        let events = self.events.clone();
        let caller = self.id().to_string();
        connection.subscribe_signal(
            Some(POWER_MANAGER_BUS_NAME),
            POWER_MANAGER_OBJECT_PATH,
            POWER_MANAGER_INTERFACE,
            POWER_MANAGER_SIGNAL_DISPLAY_OFF,
            Arc::new(move |_args| {
                let events = events.clone();
                let caller = caller.clone();
                tokio::spawn(async move {
                    if let Some(events) = events.upgrade() {
                        events.display_off(&caller).await;
                    }
                });
            }),
        );

        Ok(())
    }
}

fn manager_gone() -> BusError {
    BusError::new(
        "org.freedesktop.DBus.Error.NoReply",
        "manager is shutting down",
    )
}

fn parse_notify_args(args: &Value) -> std::result::Result<(String, String), BusError> {
    let application = args.get("application").and_then(Value::as_str);
    let message = args.get("message").and_then(Value::as_str);
    match (application, message) {
        (Some(a), Some(m)) => Ok((a.to_string(), m.to_string())),
        _ => Err(BusError::new(
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected {application, message}",
        )),
    }
}

fn parse_file_move_args(args: &Value) -> std::result::Result<(String, String), BusError> {
    let destination = args.get("destination").and_then(Value::as_str);
    let path = args.get("path").and_then(Value::as_str);
    match (destination, path) {
        (Some(d), Some(p)) => Ok((d.to_string(), p.to_string())),
        _ => Err(BusError::new(
            "org.freedesktop.DBus.Error.InvalidArgs",
            "expected {destination, path}",
        )),
    }
}
