//! In-process message bus.
//!
//! One [`MemoryBus`] models the set of bus daemons on a machine: each
//! address is an independent broker with its own connections, well-known
//! names, method registrations and signal subscriptions. Connections made
//! through the same `MemoryBus` to the same address see each other.

use super::{BusConnection, BusConnector, BusError, BusMethodHandler, BusSignalHandler};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

type MethodKey = (String, String, String);

#[derive(Clone)]
struct Subscription {
    sender_name: Option<String>,
    path: String,
    interface: String,
    signal: String,
    handler: BusSignalHandler,
}

#[derive(Default)]
struct ConnRecord {
    names: Vec<String>,
    methods: HashMap<MethodKey, BusMethodHandler>,
    subscriptions: Vec<Subscription>,
}

#[derive(Default)]
struct BrokerState {
    connections: HashMap<u64, ConnRecord>,
    /// Well-known name ownership: name -> connection id.
    names: HashMap<String, u64>,
}

/// One bus daemon (per address).
#[derive(Default)]
struct Broker {
    state: Mutex<BrokerState>,
}

impl Broker {
    fn resolve_handler(
        &self,
        bus_name: &str,
        path: &str,
        interface: &str,
        method: &str,
    ) -> std::result::Result<BusMethodHandler, BusError> {
        let state = self.state.lock().expect("broker lock");
        let conn_id = state.names.get(bus_name).copied().ok_or_else(|| {
            BusError::new(
                "org.freedesktop.DBus.Error.ServiceUnknown",
                format!("no owner for name '{bus_name}'"),
            )
        })?;
        let record = state.connections.get(&conn_id).ok_or_else(|| {
            BusError::new(
                "org.freedesktop.DBus.Error.NoReply",
                "name owner disconnected",
            )
        })?;
        let key = (path.to_string(), interface.to_string(), method.to_string());
        record.methods.get(&key).cloned().ok_or_else(|| {
            BusError::new(
                "org.freedesktop.DBus.Error.UnknownMethod",
                format!("no method {interface}.{method} at {path}"),
            )
        })
    }

    fn deliver_signal(
        &self,
        sender_id: u64,
        path: &str,
        interface: &str,
        signal: &str,
        args: &Value,
    ) {
        // Snapshot matching handlers under the lock, invoke outside it.
        let handlers: Vec<BusSignalHandler> = {
            let state = self.state.lock().expect("broker lock");
            let sender_names: Vec<String> = state
                .connections
                .get(&sender_id)
                .map(|c| c.names.clone())
                .unwrap_or_default();
            state
                .connections
                .values()
                .flat_map(|record| record.subscriptions.iter())
                .filter(|sub| {
                    sub.path == path && sub.interface == interface && sub.signal == signal
                })
                .filter(|sub| match &sub.sender_name {
                    // Name-scoped subscriptions drop emissions from
                    // connections not owning the requested name.
                    Some(name) => sender_names.iter().any(|n| n == name),
                    None => true,
                })
                .map(|sub| Arc::clone(&sub.handler))
                .collect()
        };
        for handler in handlers {
            handler(args.clone());
        }
    }

    fn remove_connection(&self, conn_id: u64) {
        let mut state = self.state.lock().expect("broker lock");
        state.connections.remove(&conn_id);
        state.names.retain(|_, owner| *owner != conn_id);
    }
}

// =============================================================================
// MemoryBus
// =============================================================================

/// In-process bus universe; hands out connections by address.
#[derive(Default)]
pub struct MemoryBus {
    brokers: Mutex<HashMap<String, Arc<Broker>>>,
    next_conn_id: AtomicU64,
}

impl MemoryBus {
    /// Creates an empty bus universe.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn broker(&self, address: &str) -> Arc<Broker> {
        let mut brokers = self.brokers.lock().expect("brokers lock");
        Arc::clone(
            brokers
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(Broker::default())),
        )
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BusConnection>> {
        if address.is_empty() {
            return Err(Error::Bus("cannot connect to an empty address".to_string()));
        }
        let broker = self.broker(address);
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed) + 1;
        broker
            .state
            .lock()
            .expect("broker lock")
            .connections
            .insert(conn_id, ConnRecord::default());
        debug!(address, conn_id, "bus connection created");
        Ok(Arc::new(MemoryBusConnection {
            address: address.to_string(),
            conn_id,
            broker: Arc::downgrade(&broker),
        }))
    }
}

// =============================================================================
// MemoryBusConnection
// =============================================================================

/// A connection to one in-process broker.
pub struct MemoryBusConnection {
    address: String,
    conn_id: u64,
    broker: Weak<Broker>,
}

impl MemoryBusConnection {
    fn with_record<R>(&self, f: impl FnOnce(&mut ConnRecord) -> R) -> Option<R> {
        let broker = self.broker.upgrade()?;
        let mut state = broker.state.lock().expect("broker lock");
        state.connections.get_mut(&self.conn_id).map(f)
    }
}

#[async_trait]
impl BusConnection for MemoryBusConnection {
    fn address(&self) -> &str {
        &self.address
    }

    async fn acquire_name(&self, name: &str) -> Result<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| Error::Bus("bus is gone".to_string()))?;
        let mut state = broker.state.lock().expect("broker lock");
        if let Some(owner) = state.names.get(name) {
            if *owner != self.conn_id {
                return Err(Error::Bus(format!("name '{name}' already owned")));
            }
            return Ok(());
        }
        state.names.insert(name.to_string(), self.conn_id);
        if let Some(record) = state.connections.get_mut(&self.conn_id) {
            record.names.push(name.to_string());
        }
        debug!(address = %self.address, name, "bus name acquired");
        Ok(())
    }

    fn register_method(
        &self,
        path: &str,
        interface: &str,
        method: &str,
        handler: BusMethodHandler,
    ) {
        let key = (path.to_string(), interface.to_string(), method.to_string());
        self.with_record(|record| {
            record.methods.insert(key, handler);
        });
    }

    fn subscribe_signal(
        &self,
        sender_name: Option<&str>,
        path: &str,
        interface: &str,
        signal: &str,
        handler: BusSignalHandler,
    ) {
        let sub = Subscription {
            sender_name: sender_name.map(str::to_string),
            path: path.to_string(),
            interface: interface.to_string(),
            signal: signal.to_string(),
            handler,
        };
        self.with_record(|record| {
            record.subscriptions.push(sub);
        });
    }

    fn emit_signal(&self, path: &str, interface: &str, signal: &str, args: Value) -> Result<()> {
        let broker = self
            .broker
            .upgrade()
            .ok_or_else(|| Error::Bus("bus is gone".to_string()))?;
        broker.deliver_signal(self.conn_id, path, interface, signal, &args);
        Ok(())
    }

    async fn call(
        &self,
        bus_name: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, BusError> {
        let broker = self.broker.upgrade().ok_or_else(|| {
            BusError::new("org.freedesktop.DBus.Error.Disconnected", "bus is gone")
        })?;
        let handler = broker.resolve_handler(bus_name, path, interface, method)?;
        handler(args).await
    }

    fn close(&self) {
        if let Some(broker) = self.broker.upgrade() {
            broker.remove_connection(self.conn_id);
            debug!(address = %self.address, conn_id = self.conn_id, "bus connection closed");
        }
    }
}

impl Drop for MemoryBusConnection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::method_handler;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_call_by_well_known_name() {
        let bus = MemoryBus::new();
        let server = bus.connect("unix:path=/tmp/test-bus").await.unwrap();
        server.acquire_name("org.example.server").await.unwrap();
        server.register_method(
            "/org/example",
            "org.example.iface",
            "Echo",
            method_handler(|args| async move { Ok(args) }),
        );

        let client = bus.connect("unix:path=/tmp/test-bus").await.unwrap();
        let reply = client
            .call(
                "org.example.server",
                "/org/example",
                "org.example.iface",
                "Echo",
                json!({"x": 1}),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_call_unknown_name_fails() {
        let bus = MemoryBus::new();
        let client = bus.connect("unix:path=/tmp/test-bus").await.unwrap();
        let err = client
            .call("org.example.ghost", "/", "i", "M", Value::Null)
            .await
            .unwrap_err();
        assert!(err.name.contains("ServiceUnknown"));
    }

    #[tokio::test]
    async fn test_signal_sender_name_filter() {
        let bus = MemoryBus::new();
        let listener = bus.connect("a").await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = Arc::clone(&hits);
        listener.subscribe_signal(
            Some("org.example.power"),
            "/p",
            "i",
            "Off",
            Arc::new(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let sender = bus.connect("a").await.unwrap();
        sender.emit_signal("/p", "i", "Off", Value::Null).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        sender.acquire_name("org.example.power").await.unwrap();
        sender.emit_signal("/p", "i", "Off", Value::Null).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_addresses_are_isolated() {
        let bus = MemoryBus::new();
        let server = bus.connect("a").await.unwrap();
        server.acquire_name("org.example.server").await.unwrap();

        let client = bus.connect("b").await.unwrap();
        let err = client
            .call("org.example.server", "/", "i", "M", Value::Null)
            .await
            .unwrap_err();
        assert!(err.name.contains("ServiceUnknown"));
    }

    #[tokio::test]
    async fn test_close_releases_name() {
        let bus = MemoryBus::new();
        let server = bus.connect("a").await.unwrap();
        server.acquire_name("org.example.server").await.unwrap();
        server.close();

        let other = bus.connect("a").await.unwrap();
        other.acquire_name("org.example.server").await.unwrap();
    }
}
