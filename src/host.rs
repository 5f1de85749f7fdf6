//! Host endpoint: the manager's surface for unprivileged clients on the
//! host, served over the socket IPC layer.
//!
//! Each host operation maps to one IPC method id with a JSON payload;
//! `zone_dbus_state` is broadcast as an IPC signal on every zone
//! bus-address transition.

use crate::constants::{
    ERROR_CONTAINER_STOPPED, ERROR_UNKNOWN_ID, HOST_ID, METHOD_CREATE_ZONE, METHOD_DESTROY_ZONE,
    METHOD_GET_ACTIVE_ZONE_ID, METHOD_GET_ZONE_DBUSES, METHOD_GET_ZONE_IDS, METHOD_GRANT_DEVICE,
    METHOD_LOCK_ZONE, METHOD_PROXY_CALL, METHOD_REVOKE_DEVICE, METHOD_SET_ACTIVE_ZONE,
    METHOD_SHUTDOWN_ZONE, METHOD_START_ZONE, METHOD_UNLOCK_ZONE, SIGNAL_ZONE_DBUS_STATE,
};
use crate::error::{Error, Result};
use crate::ipc::Service;
use crate::manager::{SubscriptionId, ZonesManager};
use crate::zone::{ProxyCallRequest, ZoneEvents};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::warn;

// =============================================================================
// Wire Payloads
// =============================================================================

/// Payload for single-zone operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneIdRequest {
    /// Zone id.
    pub id: String,
}

/// Payload for `CreateZone`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateZoneRequest {
    /// Id of the zone to create.
    pub id: String,
    /// Template name, resolved in the configured template directory.
    pub template: String,
}

/// Payload for `GrantDevice`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantDeviceRequest {
    /// Zone id.
    pub id: String,
    /// Device node.
    pub device: String,
    /// Access flags.
    pub flags: u32,
}

/// Payload for `RevokeDevice`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeDeviceRequest {
    /// Zone id.
    pub id: String,
    /// Device node.
    pub device: String,
}

/// Payload of the `zone_dbus_state` signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneDbusStateEvent {
    /// Zone id.
    pub id: String,
    /// New bus address; empty on disconnect.
    pub address: String,
}

fn parse<T: serde::de::DeserializeOwned>(payload: &[u8]) -> std::result::Result<T, String> {
    serde_json::from_slice(payload).map_err(|e| format!("bad request payload: {e}"))
}

/// Wire reason for a failed zone operation. Failure modes clients must
/// tell apart carry their named code, the same way forwarded bus errors
/// carry theirs.
fn wire_error(e: &Error) -> String {
    match e {
        Error::UnknownId(_) => format!("{ERROR_UNKNOWN_ID}: {e}"),
        Error::ZoneStopped(_) => format!("{ERROR_CONTAINER_STOPPED}: {e}"),
        _ => e.to_string(),
    }
}

fn reply<T: Serialize>(value: &T) -> std::result::Result<Vec<u8>, String> {
    serde_json::to_vec(value).map_err(|e| format!("reply serialization failed: {e}"))
}

// =============================================================================
// Host Endpoint
// =============================================================================

/// The manager's host-side IPC endpoint.
pub struct HostEndpoint {
    service: Service,
    manager: Arc<ZonesManager>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl HostEndpoint {
    /// Creates the endpoint on the configured host socket.
    #[must_use]
    pub fn new(manager: Arc<ZonesManager>) -> Self {
        let service = Service::new(manager.config().ipc_socket_path.clone());
        Self {
            service,
            manager,
            subscription: Mutex::new(None),
        }
    }

    /// The underlying IPC service (used by in-process clients).
    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Registers every host method and starts serving.
    pub fn start(&self) -> Result<()> {
        self.register_methods();

        let service = self.service.clone();
        let subscription = self.manager.add_state_callback(move |id, address| {
            let event = ZoneDbusStateEvent {
                id: id.to_string(),
                address: address.to_string(),
            };
            match serde_json::to_vec(&event) {
                Ok(payload) => {
                    let _ = service.signal(SIGNAL_ZONE_DBUS_STATE, payload);
                }
                Err(e) => warn!(error = %e, "zone dbus state signal not serialized"),
            }
        });
        *self.subscription.lock().expect("subscription lock") = Some(subscription);

        self.service.start()
    }

    /// Stops serving and drops the state subscription.
    pub async fn stop(&self) {
        if let Some(id) = self.subscription.lock().expect("subscription lock").take() {
            self.manager.del_state_callback(id);
        }
        self.service.stop().await;
    }

    fn register_methods(&self) {
        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_GET_ZONE_IDS, move |_peer, _payload| {
                let manager = Arc::clone(&manager);
                async move { reply(&manager.get_zone_ids().await) }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_GET_ACTIVE_ZONE_ID, move |_peer, _payload| {
                let manager = Arc::clone(&manager);
                async move { reply(&manager.get_active_zone_id().await) }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_SET_ACTIVE_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ZoneIdRequest = parse(&payload)?;
                    manager
                        .set_active_zone(&request.id)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_GET_ZONE_DBUSES, move |_peer, _payload| {
                let manager = Arc::clone(&manager);
                async move { reply(&manager.get_zone_dbuses().await) }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_CREATE_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: CreateZoneRequest = parse(&payload)?;
                    manager
                        .create_zone(&request.id, &request.template)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_DESTROY_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ZoneIdRequest = parse(&payload)?;
                    manager
                        .destroy_zone(&request.id)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_START_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ZoneIdRequest = parse(&payload)?;
                    manager
                        .start_zone(&request.id)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_SHUTDOWN_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ZoneIdRequest = parse(&payload)?;
                    manager
                        .shutdown_zone(&request.id)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_LOCK_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ZoneIdRequest = parse(&payload)?;
                    manager
                        .lock_zone(&request.id)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_UNLOCK_ZONE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ZoneIdRequest = parse(&payload)?;
                    manager
                        .unlock_zone(&request.id)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_GRANT_DEVICE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: GrantDeviceRequest = parse(&payload)?;
                    manager
                        .grant_device(&request.id, &request.device, request.flags)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_REVOKE_DEVICE, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: RevokeDeviceRequest = parse(&payload)?;
                    manager
                        .revoke_device(&request.id, &request.device)
                        .await
                        .map_err(|e| wire_error(&e))?;
                    reply(&Value::Null)
                }
            });

        let manager = Arc::clone(&self.manager);
        self.service
            .add_method_handler(METHOD_PROXY_CALL, move |_peer, payload| {
                let manager = Arc::clone(&manager);
                async move {
                    let request: ProxyCallRequest = parse(&payload)?;
                    let value = manager
                        .proxy_call(HOST_ID, request)
                        .await
                        .map_err(|e| e.to_string())?;
                    reply(&value)
                }
            });
    }
}
