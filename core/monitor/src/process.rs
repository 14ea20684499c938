//! The per-service entity model.
//!
//! A `Process` reconciles two reports about one logical service: the
//! supervisor's own view (`statename`, `description`) and the optional
//! probe-reported `child` state written by the service itself. The
//! `effective_state` accessor is the single place that reconciliation
//! happens.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_supervisor_protocol::ProcessInfo;

use crate::error::SupervisorError;
use crate::supervisor::{restart_process, SupervisorClient};

/// Lifecycle states the supervisor (and probes) report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProcessState {
    /// Parses a wire token, mapping unrecognized tokens to `Unknown`.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "STOPPED" => ProcessState::Stopped,
            "STARTING" => ProcessState::Starting,
            "RUNNING" => ProcessState::Running,
            "BACKOFF" => ProcessState::Backoff,
            "STOPPING" => ProcessState::Stopping,
            "EXITED" => ProcessState::Exited,
            "FATAL" => ProcessState::Fatal,
            _ => ProcessState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "STOPPED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Backoff => "BACKOFF",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Exited => "EXITED",
            ProcessState::Fatal => "FATAL",
            ProcessState::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Probe-reported state of the service's own process, parsed from its
/// statefile. Scoped to one OS process instance; never carried across a pid
/// change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChildState {
    pub state: ProcessState,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inspector_url: Option<String>,
}

/// One statefile observation, keyed by logical service name. Always the
/// complete current truth for that name, never a delta.
#[derive(Debug, Clone)]
pub struct ProbeUpdate {
    pub name: String,
    pub child: ChildState,
    pub observed_at: DateTime<Utc>,
}

/// The reconciled (state, description) pair used for display and decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveState {
    pub state: ProcessState,
    pub description: String,
}

/// One supervised logical service.
///
/// Rebuilt from supervisor data on every poll cycle; only `child` is mutated
/// in place between polls, by the probe merge.
#[derive(Clone)]
pub struct Process {
    pub pid: u32,
    pub name: String,
    pub group: String,
    pub statename: ProcessState,
    pub description: String,
    pub logfile: PathBuf,
    pub child: Option<ChildState>,
    supervisor: Arc<dyn SupervisorClient>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("statename", &self.statename)
            .field("description", &self.description)
            .field("child", &self.child)
            .finish()
    }
}

impl Process {
    /// Builds a fresh entity from one poll-cycle entry.
    ///
    /// `previous` is the entity that had the same `pid` in the immediately
    /// preceding published list, if any; its `child` is the only thing
    /// carried over. Keying on exact pid equality is what guarantees a
    /// probe report never survives a restart.
    pub fn from_info(
        info: &ProcessInfo,
        previous: Option<&Process>,
        supervisor: Arc<dyn SupervisorClient>,
    ) -> Self {
        Self {
            pid: info.pid,
            name: info.name.clone(),
            group: info.group.clone(),
            statename: ProcessState::parse(&info.statename),
            description: info.description.clone(),
            logfile: info.logfile.clone(),
            child: previous.and_then(|p| p.child.clone()),
            supervisor,
        }
    }

    /// Name shown to operators: `name`, qualified by `group` when distinct.
    pub fn display_name(&self) -> String {
        if self.group == self.name {
            self.name.clone()
        } else {
            format!("{}:{}", self.group, self.name)
        }
    }

    /// Name used to address this service through the supervisor.
    pub fn daemon_name(&self) -> String {
        self.display_name()
    }

    /// Determines the "effective" state and description of the service.
    ///
    /// Normally the supervisor's own values. However, if the supervisor says
    /// RUNNING but the probe reports otherwise, the probe's view wins, since
    /// a nominally-running process may not actually be doing work. A RUNNING
    /// probe report with an empty description falls back to the supervisor's
    /// description.
    pub fn effective_state(&self) -> EffectiveState {
        if self.statename == ProcessState::Running {
            if let Some(child) = &self.child {
                let description =
                    if child.state == ProcessState::Running && child.description.is_empty() {
                        self.description.clone()
                    } else {
                        child.description.clone()
                    };
                return EffectiveState {
                    state: child.state,
                    description,
                };
            }
        }
        EffectiveState {
            state: self.statename,
            description: self.description.clone(),
        }
    }

    pub fn start(&self) -> Result<(), SupervisorError> {
        self.supervisor.start_process(&self.daemon_name())
    }

    pub fn stop(&self) -> Result<(), SupervisorError> {
        self.supervisor.stop_process(&self.daemon_name())
    }

    /// Stop (tolerating `NOT_RUNNING`) then start; no atomic restart RPC
    /// exists.
    pub fn restart(&self) -> Result<(), SupervisorError> {
        restart_process(self.supervisor.as_ref(), &self.daemon_name())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::error::SupervisorError;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scriptable supervisor double: queued poll responses, recorded calls.
    #[derive(Default)]
    pub struct FakeSupervisor {
        pub polls: Mutex<VecDeque<Result<Vec<ProcessInfo>, SupervisorError>>>,
        pub calls: Mutex<Vec<String>>,
        pub stop_fault: Mutex<Option<String>>,
    }

    impl FakeSupervisor {
        pub fn with_polls(
            polls: Vec<Result<Vec<ProcessInfo>, SupervisorError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                polls: Mutex::new(polls.into()),
                ..Default::default()
            })
        }

        pub fn recorded_calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock calls").clone()
        }
    }

    impl SupervisorClient for FakeSupervisor {
        fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
            self.polls
                .lock()
                .expect("lock polls")
                .pop_front()
                .unwrap_or_else(|| Ok(Vec::new()))
        }

        fn start_process(&self, name: &str) -> Result<(), SupervisorError> {
            self.calls
                .lock()
                .expect("lock calls")
                .push(format!("start:{name}"));
            Ok(())
        }

        fn stop_process(&self, name: &str) -> Result<(), SupervisorError> {
            self.calls
                .lock()
                .expect("lock calls")
                .push(format!("stop:{name}"));
            match self.stop_fault.lock().expect("lock fault").clone() {
                Some(code) => Err(SupervisorError::Fault {
                    code,
                    message: "fault".to_string(),
                }),
                None => Ok(()),
            }
        }

        fn get_pid(&self) -> Result<u32, SupervisorError> {
            Ok(1)
        }
    }

    pub fn info(pid: u32, name: &str, statename: &str, description: &str) -> ProcessInfo {
        ProcessInfo {
            pid,
            name: name.to_string(),
            group: name.to_string(),
            statename: statename.to_string(),
            description: description.to_string(),
            logfile: PathBuf::from(format!("/var/log/{name}.log")),
        }
    }
}
