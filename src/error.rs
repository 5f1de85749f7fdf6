//! Error types for the zone manager.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for zone manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the zone manager.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Configuration file is missing, unreadable, or malformed.
    #[error("invalid configuration '{path}': {reason}")]
    Config {
        /// Path of the offending config file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// Zone id is empty, reserved, or already taken.
    #[error("invalid zone id '{id}': {reason}")]
    InvalidZoneId {
        /// The rejected id.
        id: String,
        /// Why it was rejected.
        reason: String,
    },

    // =========================================================================
    // Zone Lifecycle Errors
    // =========================================================================
    /// No zone with the given id.
    #[error("unknown zone id: {0}")]
    UnknownId(String),

    /// A lifecycle or device operation on a zone failed.
    #[error("zone '{id}': {op} failed: {reason}")]
    ZoneOperation {
        /// Zone id.
        id: String,
        /// Operation name (start, stop, freeze, ...).
        op: &'static str,
        /// Backend-reported reason.
        reason: String,
    },

    /// Operation requires a running zone.
    #[error("zone '{0}' is stopped")]
    ZoneStopped(String),

    /// Zone is in the wrong state for the requested transition.
    #[error("zone '{id}' is in state '{state}', expected '{expected}'")]
    InvalidState {
        /// Zone id.
        id: String,
        /// Observed state.
        state: String,
        /// Required state.
        expected: String,
    },

    // =========================================================================
    // Proxy Call Errors
    // =========================================================================
    /// The proxy-call policy denied the call.
    #[error("proxy call forbidden")]
    Forbidden,

    /// The downstream call failed; carries the downstream reason verbatim.
    #[error("forwarded call failed: {0}")]
    Forwarded(String),

    // =========================================================================
    // IPC Errors
    // =========================================================================
    /// A synchronous call did not complete in time.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// The peer went away while a call was outstanding.
    #[error("peer {0} disconnected")]
    PeerGone(u64),

    /// The service was stopped while a call was outstanding.
    #[error("ipc service stopped")]
    ServiceStopped,

    /// A frame failed to parse; the offending peer is closed.
    #[error("malformed frame: {0}")]
    Framing(String),

    /// A registered handler failed or panicked.
    #[error("handler error: {0}")]
    Handler(String),

    /// No handler registered for the requested method.
    #[error("no handler for method {0}")]
    NoSuchMethod(u32),

    // =========================================================================
    // Bus Errors
    // =========================================================================
    /// Bus-level failure (connect, name acquisition, call, signal).
    #[error("bus error: {0}")]
    Bus(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Payload (de)serialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Detected invariant violation. Logged at error level and reported
    /// as a generic failure, never a process abort.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors that are fatal at daemon startup.
    #[must_use]
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::Config { .. } | Error::InvalidZoneId { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_formatting() {
        let err = Error::ZoneOperation {
            id: "z1".to_string(),
            op: "start",
            reason: "backend unavailable".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "zone 'z1': start failed: backend unavailable"
        );

        let err = Error::UnknownId("ghost".to_string());
        assert_eq!(err.to_string(), "unknown zone id: ghost");
    }

    #[test]
    fn test_config_error_classification() {
        let err = Error::Config {
            path: PathBuf::from("/etc/zoned/daemon.json"),
            reason: "missing defaultId".to_string(),
        };
        assert!(err.is_config_error());
        assert!(!Error::Forbidden.is_config_error());
    }
}
