//! Integration tests for the per-zone state machine and its bus endpoint.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use zoned::backend::TestBackend;
use zoned::bus::{BusConnector, BusError, MemoryBus};
use zoned::config::ZoneConfig;
use zoned::constants::{
    POWER_MANAGER_BUS_NAME, POWER_MANAGER_INTERFACE, POWER_MANAGER_OBJECT_PATH,
    POWER_MANAGER_SIGNAL_DISPLAY_OFF, ZONE_BUS_NAME, ZONE_INTERFACE,
    ZONE_METHOD_FILE_MOVE_REQUEST, ZONE_METHOD_NOTIFY_ACTIVE_CONTAINER, ZONE_OBJECT_PATH,
    ZONE_SIGNAL_NOTIFICATION,
};
use zoned::{Error, ProxyCallRequest, Zone, ZoneEvents, ZoneState};

const EVENT_TIMEOUT: Duration = Duration::from_secs(1);

// =============================================================================
// Test Helpers
// =============================================================================

/// Records every zone event for later assertions.
#[derive(Default)]
struct RecordingEvents {
    notifications: Mutex<Vec<(String, String, String)>>,
    display_off: Mutex<Vec<String>>,
    file_moves: Mutex<Vec<(String, String, String)>>,
    bus_states: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ZoneEvents for RecordingEvents {
    async fn notify_active_zone(&self, caller: &str, application: &str, message: &str) {
        self.notifications.lock().unwrap().push((
            caller.to_string(),
            application.to_string(),
            message.to_string(),
        ));
    }

    async fn display_off(&self, caller: &str) {
        self.display_off.lock().unwrap().push(caller.to_string());
    }

    async fn file_move_request(&self, caller: &str, destination: &str, path: &str) -> String {
        self.file_moves.lock().unwrap().push((
            caller.to_string(),
            destination.to_string(),
            path.to_string(),
        ));
        "tested".to_string()
    }

    async fn proxy_call(
        &self,
        _caller: &str,
        request: ProxyCallRequest,
    ) -> Result<Value, BusError> {
        Ok(json!({ "echo": request.method }))
    }

    async fn bus_state_changed(&self, zone_id: &str, address: &str) {
        self.bus_states
            .lock()
            .unwrap()
            .push((zone_id.to_string(), address.to_string()));
    }
}

fn zone_config(id: &str) -> ZoneConfig {
    serde_json::from_value(json!({
        "id": id,
        "privilege": 10,
        "busAddress": format!("unix:path=/run/test/{id}/bus.sock"),
        "permittedToSend": ["/tmp/.*"],
        "permittedToRecv": ["/tmp/.*"],
    }))
    .unwrap()
}

struct ZoneHarness {
    zone: Arc<Zone>,
    events: Arc<RecordingEvents>,
    bus: Arc<MemoryBus>,
}

fn build_zone(id: &str) -> ZoneHarness {
    let bus = MemoryBus::new();
    let events = Arc::new(RecordingEvents::default());
    let config = zone_config(id);
    let backend = Box::new(TestBackend::new(
        &config,
        std::path::Path::new(&format!("/run/test/{id}")),
    ));
    let zone = Arc::new(
        Zone::new(
            config,
            backend,
            Arc::clone(&bus) as Arc<dyn BusConnector>,
            Arc::downgrade(&events) as Weak<dyn ZoneEvents>,
        )
        .unwrap(),
    );
    zone.install_backend_callback();
    ZoneHarness { zone, events, bus }
}

/// Polls until the predicate holds or the timeout expires.
async fn wait_for(mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn test_start_stop_state_machine() {
    let harness = build_zone("z1");
    assert_eq!(harness.zone.state(), ZoneState::Stopped);
    assert!(harness.zone.is_stopped());
    assert!(!harness.zone.is_running());

    harness.zone.start().await.unwrap();
    assert_eq!(harness.zone.state(), ZoneState::Running);
    assert!(harness.zone.is_running());

    harness.zone.stop().await.unwrap();
    assert_eq!(harness.zone.state(), ZoneState::Stopped);
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();
    harness.zone.start().await.unwrap();
    assert_eq!(harness.zone.state(), ZoneState::Running);
}

#[tokio::test]
async fn test_lock_unlock() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();

    harness.zone.lock().await.unwrap();
    assert_eq!(harness.zone.state(), ZoneState::Locked);
    // A locked zone still counts as running.
    assert!(harness.zone.is_running());

    harness.zone.unlock().await.unwrap();
    assert_eq!(harness.zone.state(), ZoneState::Running);
}

#[tokio::test]
async fn test_lock_requires_running() {
    let harness = build_zone("z1");
    let err = harness.zone.lock().await.unwrap_err();
    assert!(matches!(err, Error::InvalidState { .. }));
}

#[tokio::test]
async fn test_go_background_twice_is_harmless() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();
    harness.zone.go_foreground().await.unwrap();
    harness.zone.go_background().await.unwrap();
    harness.zone.go_background().await.unwrap();
    assert!(harness.zone.is_running());
}

#[tokio::test]
async fn test_device_ops_rejected_when_stopped() {
    let harness = build_zone("z1");
    let err = harness.zone.grant_device("/dev/fb0", 3).await.unwrap_err();
    assert!(matches!(err, Error::ZoneStopped(_)));
    let err = harness.zone.revoke_device("/dev/fb0").await.unwrap_err();
    assert!(matches!(err, Error::ZoneStopped(_)));

    harness.zone.start().await.unwrap();
    harness.zone.grant_device("/dev/fb0", 3).await.unwrap();
    harness.zone.revoke_device("/dev/fb0").await.unwrap();
}

// =============================================================================
// Bus State Reporting
// =============================================================================

#[tokio::test]
async fn test_bus_address_reported_on_start_and_stop() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();

    let expected = "unix:path=/run/test/z1/bus.sock".to_string();
    assert_eq!(harness.zone.bus_address(), expected);
    {
        let states = harness.events.bus_states.lock().unwrap();
        assert_eq!(states.first(), Some(&("z1".to_string(), expected.clone())));
    }

    harness.zone.stop().await.unwrap();
    assert_eq!(harness.zone.bus_address(), "");
    let states = harness.events.bus_states.lock().unwrap();
    assert_eq!(states.last(), Some(&("z1".to_string(), String::new())));
}

// =============================================================================
// Zone Endpoint
// =============================================================================

#[tokio::test]
async fn test_notify_active_container_reaches_manager() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();

    let client = harness
        .bus
        .connect("unix:path=/run/test/z1/bus.sock")
        .await
        .unwrap();
    client
        .call(
            ZONE_BUS_NAME,
            ZONE_OBJECT_PATH,
            ZONE_INTERFACE,
            ZONE_METHOD_NOTIFY_ACTIVE_CONTAINER,
            json!({"application": "testapp", "message": "testmessage"}),
        )
        .await
        .unwrap();

    let notifications = harness.events.notifications.lock().unwrap();
    assert_eq!(
        notifications.as_slice(),
        &[(
            "z1".to_string(),
            "testapp".to_string(),
            "testmessage".to_string()
        )]
    );
}

#[tokio::test]
async fn test_file_move_request_roundtrip() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();

    let client = harness
        .bus
        .connect("unix:path=/run/test/z1/bus.sock")
        .await
        .unwrap();
    let reply = client
        .call(
            ZONE_BUS_NAME,
            ZONE_OBJECT_PATH,
            ZONE_INTERFACE,
            ZONE_METHOD_FILE_MOVE_REQUEST,
            json!({"destination": "z2", "path": "/tmp/a"}),
        )
        .await
        .unwrap();
    assert_eq!(reply, json!({"result": "tested"}));

    let moves = harness.events.file_moves.lock().unwrap();
    assert_eq!(
        moves.as_slice(),
        &[("z1".to_string(), "z2".to_string(), "/tmp/a".to_string())]
    );
}

#[tokio::test]
async fn test_notification_signal_emitted() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();

    let received = Arc::new(Mutex::new(Vec::new()));
    let received_clone = Arc::clone(&received);
    let client = harness
        .bus
        .connect("unix:path=/run/test/z1/bus.sock")
        .await
        .unwrap();
    client.subscribe_signal(
        Some(ZONE_BUS_NAME),
        ZONE_OBJECT_PATH,
        ZONE_INTERFACE,
        ZONE_SIGNAL_NOTIFICATION,
        Arc::new(move |args| {
            received_clone.lock().unwrap().push(args);
        }),
    );

    harness
        .zone
        .send_notification("testcontainer", "testapp", "testmessage")
        .unwrap();

    let received = received.lock().unwrap();
    assert_eq!(
        received.as_slice(),
        &[json!({
            "container": "testcontainer",
            "application": "testapp",
            "message": "testmessage",
        })]
    );
}

// =============================================================================
// Display-Off Filter
// =============================================================================

#[tokio::test]
async fn test_display_off_requires_power_manager_name() {
    let harness = build_zone("z1");
    harness.zone.start().await.unwrap();

    let client = harness
        .bus
        .connect("unix:path=/run/test/z1/bus.sock")
        .await
        .unwrap();

    // No well-known name: the signal must be ignored.
    client
        .emit_signal(
            POWER_MANAGER_OBJECT_PATH,
            POWER_MANAGER_INTERFACE,
            POWER_MANAGER_SIGNAL_DISPLAY_OFF,
            Value::Null,
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(harness.events.display_off.lock().unwrap().is_empty());

    // With the power manager's name acquired, it must be delivered.
    client.acquire_name(POWER_MANAGER_BUS_NAME).await.unwrap();
    client
        .emit_signal(
            POWER_MANAGER_OBJECT_PATH,
            POWER_MANAGER_INTERFACE,
            POWER_MANAGER_SIGNAL_DISPLAY_OFF,
            Value::Null,
        )
        .unwrap();

    let events = Arc::clone(&harness.events);
    assert!(
        wait_for(move || events.display_off.lock().unwrap().as_slice() == ["z1".to_string()])
            .await
    );
}

// =============================================================================
// File Move Permissions
// =============================================================================

#[tokio::test]
async fn test_permission_matchers_are_full_string() {
    let harness = build_zone("z1");
    assert!(harness.zone.is_send_allowed("/tmp/a"));
    assert!(harness.zone.is_recv_allowed("/tmp/nested/file"));
    assert!(!harness.zone.is_send_allowed("/etc/passwd"));
    // Prefix matches are not enough: the whole path must match.
    assert!(!harness.zone.is_send_allowed("x/tmp/a"));
}
