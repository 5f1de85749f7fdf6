//! # zoned
//!
//! **Host-resident daemon managing isolated execution zones**
//!
//! One machine runs many zones: OS-level containers with their own root
//! filesystem, bus address and priority. Exactly one running zone holds
//! the *foreground* (display, input); everything else stays in the
//! background. Unprivileged clients talk to the daemon over a socket API
//! to query zones, switch the foreground, grant devices, move files
//! between zones and subscribe to state changes. Calls from one zone into
//! another domain are relayed only after a static allow-list policy
//! approves them.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                              zoned                                 │
//! ├────────────────────────────────────────────────────────────────────┤
//! │  host clients ──▶ ipc::Service ──▶ HostEndpoint ─┐                 │
//! │                                                  ▼                 │
//! │  zone buses  ──▶ Zone endpoints ──▶ ZonesManager ──▶ ProxyCall     │
//! │                   (per zone)         │   │   │       Policy        │
//! │                                      │   │   └──▶ file move        │
//! │                                      │   └──▶ foreground focus     │
//! │                                      ▼                             │
//! │                              ZoneBackend (container runtime)       │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Key Properties
//!
//! - **Single foreground.** `focus()` backgrounds every zone before
//!   raising the target, so no two zones ever hold the foreground at
//!   once.
//! - **Policy-gated proxying.** Cross-domain calls match an ordered
//!   allow/deny rule list; first match wins, no match denies.
//! - **Isolated failures.** A zone that fails to start or stop never
//!   strands its siblings; handler failures on the IPC and bus layers are
//!   converted to error replies and the loops keep serving.
//! - **Pluggable edges.** The container runtime ([`backend::ZoneBackend`])
//!   and the message bus ([`bus::BusConnection`]) are capability traits;
//!   the crate ships in-memory drivers for both, production adapters live
//!   outside.

pub mod backend;
pub mod bus;
pub mod config;
pub mod constants;
pub mod error;
pub mod host;
pub mod input;
pub mod ipc;
pub mod manager;
pub mod policy;
pub mod zone;

pub use config::{InputConfig, ManagerConfig, ProxyCallRule, RuleEffect, ZoneConfig};
pub use error::{Error, Result};
pub use host::HostEndpoint;
pub use manager::{SubscriptionId, ZonesManager};
pub use policy::ProxyCallPolicy;
pub use zone::{ProxyCallRequest, Zone, ZoneEvents, ZoneState};
