//! Error types for the monitoring engine.
//!
//! The taxonomy mirrors the fatal/non-fatal split the monitor enforces:
//! `SupervisorError` and `MonitorError` travel on the monitor's error channel
//! and are fatal by convention; `RemediationError` is logged and contained.

use std::path::PathBuf;

use vigil_supervisor_protocol::FAULT_NOT_RUNNING;

/// Failures talking to the supervisor's control socket.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Supervisor unreachable at {path}: {source}")]
    Connection {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Supervisor protocol error: {0}")]
    Protocol(String),

    #[error("Supervisor fault: {code}: {message}")]
    Fault { code: String, message: String },
}

impl SupervisorError {
    /// True for the stop-a-stopped-process fault, which restart sequences
    /// treat as success.
    pub fn is_not_running(&self) -> bool {
        matches!(self, SupervisorError::Fault { code, .. } if code == FAULT_NOT_RUNNING)
    }
}

/// Failures surfaced on a monitor's error channel. The embedding application
/// decides the policy; the current convention is print-and-exit.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    /// A statefile exists but could not be read or parsed. Absence is never
    /// an error; it is the normal outcome of a delete event.
    #[error("Unreadable statefile {path}: {details}")]
    ProbeRead { path: PathBuf, details: String },

    #[error("Failed to watch probe directory {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures while detecting or fixing a port conflict. Never fatal, never
/// forwarded to the monitor's error channel, never retried proactively.
#[derive(Debug, thiserror::Error)]
pub enum RemediationError {
    #[error("No process found listening on port {0}")]
    PortHolderNotFound(u16),

    #[error("Failed to enumerate listening sockets: {0}")]
    PortScan(String),

    #[error("Failed to kill pid {pid}: {details}")]
    Kill { pid: u32, details: String },

    #[error("Failed to restart {name}: {source}")]
    Restart {
        name: String,
        #[source]
        source: SupervisorError,
    },

    #[error("Remediation is not supported on this platform")]
    Unsupported,
}

/// Failures of the small-state storage layer.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}
