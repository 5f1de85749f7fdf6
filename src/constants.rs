//! Constants for the zone manager.
//!
//! All limits, timeouts, method ids and wire-level names are defined here
//! to keep magic numbers out of the rest of the codebase.

use std::time::Duration;

// =============================================================================
// IPC Wire Limits
// =============================================================================

/// Maximum IPC frame payload size (1 MiB).
/// Prevents memory exhaustion from a misbehaving peer.
pub const MAX_FRAME_PAYLOAD: usize = 1024 * 1024;

/// Size of the fixed frame header:
/// `message_id (u64) | method_id (u32) | kind (u8) | payload_len (u32)`.
pub const FRAME_HEADER_LEN: usize = 8 + 4 + 1 + 4;

/// Maximum error-frame reason length (bytes).
pub const MAX_ERROR_REASON_LEN: usize = 4096;

/// Maximum concurrent IPC peers.
pub const MAX_PEERS: usize = 64;

// =============================================================================
// Timeouts
// =============================================================================

/// Default timeout for synchronous IPC calls.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_millis(500);

/// Timeout for downstream bus calls made on behalf of a proxy call.
pub const PROXY_CALL_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// IPC Method IDs (host endpoint)
// =============================================================================

/// Reserved method id used by peers to subscribe to signals.
pub const METHOD_SUBSCRIBE_SIGNALS: u32 = 0;

/// `GetZoneIds() -> [id]`.
pub const METHOD_GET_ZONE_IDS: u32 = 1;

/// `GetActiveZoneId() -> id | ""`.
pub const METHOD_GET_ACTIVE_ZONE_ID: u32 = 2;

/// `SetActiveZone(id)`.
pub const METHOD_SET_ACTIVE_ZONE: u32 = 3;

/// `GetZoneDbuses() -> {id: address}`.
pub const METHOD_GET_ZONE_DBUSES: u32 = 4;

/// `CreateZone(id, template)`.
pub const METHOD_CREATE_ZONE: u32 = 5;

/// `DestroyZone(id)`.
pub const METHOD_DESTROY_ZONE: u32 = 6;

/// `StartZone(id)`.
pub const METHOD_START_ZONE: u32 = 7;

/// `ShutdownZone(id)`.
pub const METHOD_SHUTDOWN_ZONE: u32 = 8;

/// `LockZone(id)`.
pub const METHOD_LOCK_ZONE: u32 = 9;

/// `UnlockZone(id)`.
pub const METHOD_UNLOCK_ZONE: u32 = 10;

/// `GrantDevice(id, device, flags)`.
pub const METHOD_GRANT_DEVICE: u32 = 11;

/// `RevokeDevice(id, device)`.
pub const METHOD_REVOKE_DEVICE: u32 = 12;

/// `ProxyCall(target, bus, path, iface, method, args) -> args`.
pub const METHOD_PROXY_CALL: u32 = 13;

/// Signal: `ZoneDbusState(id, address)`, emitted on every address change.
pub const SIGNAL_ZONE_DBUS_STATE: u32 = 100;

// =============================================================================
// Zone Bus Names
// =============================================================================

/// Well-known name the manager acquires on each zone bus.
pub const ZONE_BUS_NAME: &str = "org.tizen.containers.domain";

/// Zone object path.
pub const ZONE_OBJECT_PATH: &str = "/org/tizen/containers/domain";

/// Zone interface.
pub const ZONE_INTERFACE: &str = "org.tizen.containers.domain.manager";

/// `NotifyActiveContainer(application, message)`.
pub const ZONE_METHOD_NOTIFY_ACTIVE_CONTAINER: &str = "NotifyActiveContainer";

/// `FileMoveRequest(destination, path) -> result`.
pub const ZONE_METHOD_FILE_MOVE_REQUEST: &str = "FileMoveRequest";

/// `ProxyCall(target, bus, path, iface, method, args) -> args`.
pub const ZONE_METHOD_PROXY_CALL: &str = "ProxyCall";

/// Signal emitted by the manager towards a zone:
/// `Notification(zone, application, message)`.
pub const ZONE_SIGNAL_NOTIFICATION: &str = "Notification";

// =============================================================================
// Power Manager
// =============================================================================

/// Well-known name of the power manager on a zone bus. `DisplayOff`
/// signals are honored only when sent from a connection owning this name.
pub const POWER_MANAGER_BUS_NAME: &str = "org.tizen.power";

/// Power manager object path.
pub const POWER_MANAGER_OBJECT_PATH: &str = "/org/tizen/power";

/// Power manager interface.
pub const POWER_MANAGER_INTERFACE: &str = "org.tizen.power.manager";

/// Display-off signal name.
pub const POWER_MANAGER_SIGNAL_DISPLAY_OFF: &str = "DisplayOff";

// =============================================================================
// File Move Result Codes
// =============================================================================

/// File move completed and the destination was notified.
pub const FILE_MOVE_SUCCEEDED: &str = "org.tizen.containers.file_move.SUCCEEDED";

/// The filesystem move itself failed.
pub const FILE_MOVE_FAILED: &str = "org.tizen.containers.file_move.FAILED";

/// Destination zone does not exist.
pub const FILE_MOVE_DESTINATION_NOT_FOUND: &str =
    "org.tizen.containers.file_move.DESTINATION_NOT_FOUND";

/// Destination equals the caller.
pub const FILE_MOVE_WRONG_DESTINATION: &str =
    "org.tizen.containers.file_move.WRONG_DESTINATION";

/// Path not covered by the sender's permitted-to-send list.
pub const FILE_MOVE_NO_PERMISSIONS_SEND: &str =
    "org.tizen.containers.file_move.NO_PERMISSIONS_SEND";

/// Path not covered by the receiver's permitted-to-recv list.
pub const FILE_MOVE_NO_PERMISSIONS_RECEIVE: &str =
    "org.tizen.containers.file_move.NO_PERMISSIONS_RECEIVE";

// =============================================================================
// Bus Error Codes
// =============================================================================

/// Proxy call denied by policy.
pub const ERROR_FORBIDDEN: &str = "org.tizen.containers.error.FORBIDDEN";

/// Proxy call target does not exist.
pub const ERROR_UNKNOWN_ID: &str = "org.tizen.containers.error.UNKNOWN_ID";

/// Downstream call failed; the reason carries the downstream error.
pub const ERROR_FORWARDED: &str = "org.tizen.containers.error.FORWARDED";

/// Target zone exists but is not running.
pub const ERROR_CONTAINER_STOPPED: &str = "org.tizen.containers.error.CONTAINER_STOPPED";

// =============================================================================
// Reserved Identifiers
// =============================================================================

/// Reserved id denoting the host domain; never a valid zone id.
pub const HOST_ID: &str = "host";

// =============================================================================
// Validation Limits
// =============================================================================

/// Maximum zone id length.
pub const MAX_ZONE_ID_LEN: usize = 64;

/// Maximum zones per manager.
pub const MAX_ZONES: usize = 64;

/// Maximum proxy-call rules per config.
pub const MAX_PROXY_CALL_RULES: usize = 256;

/// Maximum entries in a permitted-to-send/recv list.
pub const MAX_PERMISSION_PATTERNS: usize = 64;
