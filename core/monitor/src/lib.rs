//! Health reconciliation for supervised services.
//!
//! The monitor merges two independently-updating sources of truth into one
//! published list of [`Process`] entities: the supervisor's control API
//! (polled) and the probe channel (statefiles watched on disk). On top of
//! that view it runs best-effort port-conflict remediation and a
//! self-recovery guard against memory exhaustion.

pub mod error;
pub mod monitor;
pub mod oom;
pub mod plugin;
pub mod probe_monitor;
pub mod process;
pub mod remediate;
pub mod storage;
pub mod supervisor;

pub use error::{MonitorError, RemediationError, StorageError, SupervisorError};
pub use monitor::{MonitorConfig, MonitorEvent, ProcessMonitor, DEFAULT_POLL_INTERVAL};
pub use oom::{OomGuard, OomGuardConfig, OomGuardHandle};
pub use plugin::{PluginCommand, PluginHost, ProcessPlugin};
pub use process::{ChildState, EffectiveState, ProbeUpdate, Process, ProcessState};
pub use storage::StorageConfig;
pub use supervisor::{SocketSupervisorClient, SupervisorClient};
