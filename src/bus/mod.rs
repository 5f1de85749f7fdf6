//! Message-bus abstraction.
//!
//! The manager never talks to a concrete bus implementation directly; it
//! depends on the small capability surface below: connect by address,
//! acquire a well-known name, register method handlers, subscribe to
//! signals (optionally filtered by the sender's well-known name), emit
//! signals, and make async method calls. Arguments travel as
//! `serde_json::Value`.
//!
//! The in-process [`MemoryBus`] broker implements the capability for the
//! embedded mode and the test-suite; a system D-Bus adapter is an external
//! collaborator, exactly like the production container runtime.

mod memory;

pub use memory::{MemoryBus, MemoryBusConnection};

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Named error crossing the bus, preserved verbatim for forwarding.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{name}: {message}")]
pub struct BusError {
    /// Error name, e.g. `org.tizen.containers.error.FORBIDDEN`.
    pub name: String,
    /// Human-readable reason.
    pub message: String,
}

impl BusError {
    /// Creates a named bus error.
    #[must_use]
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

/// Future returned by a bus method handler.
pub type BusMethodFuture =
    Pin<Box<dyn Future<Output = std::result::Result<Value, BusError>> + Send>>;

/// Method handler registered on a connection.
pub type BusMethodHandler = Arc<dyn Fn(Value) -> BusMethodFuture + Send + Sync>;

/// Signal handler registered on a connection.
pub type BusSignalHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// One bus connection, either to the host bus or to a zone bus.
#[async_trait]
pub trait BusConnection: Send + Sync {
    /// Address this connection was created from.
    fn address(&self) -> &str;

    /// Acquires a well-known name on the bus.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bus` if the name is already owned.
    async fn acquire_name(&self, name: &str) -> Result<()>;

    /// Registers a method handler for `(path, interface, method)`,
    /// replacing any previous one.
    fn register_method(&self, path: &str, interface: &str, method: &str, handler: BusMethodHandler);

    /// Subscribes to a signal. When `sender_name` is set, only emissions
    /// from a connection currently owning that well-known name are
    /// delivered; anonymous or differently-named senders are dropped.
    fn subscribe_signal(
        &self,
        sender_name: Option<&str>,
        path: &str,
        interface: &str,
        signal: &str,
        handler: BusSignalHandler,
    );

    /// Emits a signal from this connection.
    fn emit_signal(&self, path: &str, interface: &str, signal: &str, args: Value) -> Result<()>;

    /// Calls a method on the connection owning `bus_name` and awaits the
    /// reply.
    async fn call(
        &self,
        bus_name: &str,
        path: &str,
        interface: &str,
        method: &str,
        args: Value,
    ) -> std::result::Result<Value, BusError>;

    /// Disconnects; releases owned names and registered handlers.
    fn close(&self);
}

/// Creates bus connections by address.
#[async_trait]
pub trait BusConnector: Send + Sync {
    /// Connects to the bus at `address`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Bus` when the bus is unreachable.
    async fn connect(&self, address: &str) -> Result<Arc<dyn BusConnection>>;
}

/// Convenience for building a method handler from an async closure.
pub fn method_handler<F, Fut>(f: F) -> BusMethodHandler
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, BusError>> + Send + 'static,
{
    Arc::new(move |args| Box::pin(f(args)) as BusMethodFuture)
}
