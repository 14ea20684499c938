//! The plugin capability contract.
//!
//! Plugins observe process updates, contribute commands, and tap log lines.
//! How plugins get *loaded* is the embedding application's business; this
//! module only defines the surface and a host that invokes it safely. Every
//! call crosses a panic boundary, and a per-plugin rate-limit flag stops a
//! plugin that reacts to an update by causing another one from looping the
//! dispatcher: the flag is cleared on the next tick, not when the plugin
//! returns.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::process::Process;

/// An operator-facing action a plugin offers for a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginCommand {
    pub id: String,
    pub label: String,
}

pub trait ProcessPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Called once per published update, per process.
    fn on_update(&self, process: &Process);

    /// Commands the plugin wants surfaced for this process.
    fn commands(&self, _process: &Process) -> Vec<PluginCommand> {
        Vec::new()
    }

    /// A log line attributed to this process.
    fn on_log(&self, _process: &Process, _line: &str) {}
}

struct Registered {
    plugin: Arc<dyn ProcessPlugin>,
    // Set on the first dispatch of a tick; re-entrant dispatches in the same
    // tick are dropped.
    dispatched: AtomicBool,
}

/// Drives a fixed set of plugins. Constructed once by the embedding
/// application and passed by reference to whatever publishes updates.
pub struct PluginHost {
    plugins: Vec<Registered>,
}

impl PluginHost {
    pub fn new(plugins: Vec<Arc<dyn ProcessPlugin>>) -> Self {
        Self {
            plugins: plugins
                .into_iter()
                .map(|plugin| Registered {
                    plugin,
                    dispatched: AtomicBool::new(false),
                })
                .collect(),
        }
    }

    /// Opens a dispatch tick, re-arming every plugin.
    pub fn begin_tick(&self) {
        for registered in &self.plugins {
            registered.dispatched.store(false, Ordering::SeqCst);
        }
    }

    /// Delivers one update to every plugin that has not yet run this tick.
    pub fn dispatch_update(&self, process: &Process) {
        for registered in &self.plugins {
            if registered.dispatched.swap(true, Ordering::SeqCst) {
                debug!(
                    plugin = registered.plugin.name(),
                    "Plugin already dispatched this tick; rate-limited"
                );
                continue;
            }
            let plugin = &registered.plugin;
            if panic::catch_unwind(AssertUnwindSafe(|| plugin.on_update(process))).is_err() {
                warn!(plugin = plugin.name(), "Plugin panicked in on_update");
            }
        }
    }

    /// Collects commands across all plugins. A panicking plugin contributes
    /// nothing; the rest still do.
    pub fn collect_commands(&self, process: &Process) -> Vec<PluginCommand> {
        let mut commands = Vec::new();
        for registered in &self.plugins {
            let plugin = &registered.plugin;
            match panic::catch_unwind(AssertUnwindSafe(|| plugin.commands(process))) {
                Ok(mut contributed) => commands.append(&mut contributed),
                Err(_) => warn!(plugin = plugin.name(), "Plugin panicked in commands"),
            }
        }
        commands
    }

    /// Relays one log line to every plugin.
    pub fn relay_log(&self, process: &Process, line: &str) {
        for registered in &self.plugins {
            let plugin = &registered.plugin;
            if panic::catch_unwind(AssertUnwindSafe(|| plugin.on_log(process, line))).is_err() {
                warn!(plugin = plugin.name(), "Plugin panicked in on_log");
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::test_support::{info, FakeSupervisor};
    use std::sync::Mutex;

    struct RecordingPlugin {
        name: &'static str,
        seen: Mutex<Vec<String>>,
        logs: Mutex<Vec<String>>,
    }

    impl RecordingPlugin {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                seen: Mutex::new(Vec::new()),
                logs: Mutex::new(Vec::new()),
            })
        }
    }

    impl ProcessPlugin for RecordingPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn on_update(&self, process: &Process) {
            self.seen.lock().expect("lock").push(process.name.clone());
        }

        fn commands(&self, process: &Process) -> Vec<PluginCommand> {
            vec![PluginCommand {
                id: format!("{}.tail", self.name),
                label: format!("Tail {}", process.name),
            }]
        }

        fn on_log(&self, _process: &Process, line: &str) {
            self.logs.lock().expect("lock").push(line.to_string());
        }
    }

    struct PanickingPlugin;

    impl ProcessPlugin for PanickingPlugin {
        fn name(&self) -> &str {
            "panicky"
        }

        fn on_update(&self, _process: &Process) {
            panic!("boom");
        }

        fn commands(&self, _process: &Process) -> Vec<PluginCommand> {
            panic!("boom");
        }

        fn on_log(&self, _process: &Process, _line: &str) {
            panic!("boom");
        }
    }

    fn process() -> Process {
        Process::from_info(
            &info(100, "web", "RUNNING", "pid 100"),
            None,
            FakeSupervisor::with_polls(Vec::new()),
        )
    }

    #[test]
    fn panicking_plugin_does_not_stop_the_others() {
        let recording = RecordingPlugin::new("recorder");
        let host = PluginHost::new(vec![Arc::new(PanickingPlugin), recording.clone()]);
        let process = process();

        host.begin_tick();
        host.dispatch_update(&process);
        assert_eq!(*recording.seen.lock().expect("lock"), vec!["web"]);

        let commands = host.collect_commands(&process);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].id, "recorder.tail");

        host.relay_log(&process, "hello");
        assert_eq!(*recording.logs.lock().expect("lock"), vec!["hello"]);
    }

    #[test]
    fn dispatch_is_rate_limited_within_a_tick() {
        let recording = RecordingPlugin::new("recorder");
        let host = PluginHost::new(vec![recording.clone() as Arc<dyn ProcessPlugin>]);
        let process = process();

        host.begin_tick();
        host.dispatch_update(&process);
        // A plugin-triggered re-dispatch inside the same tick is dropped.
        host.dispatch_update(&process);
        assert_eq!(recording.seen.lock().expect("lock").len(), 1);

        // The next tick re-arms it.
        host.begin_tick();
        host.dispatch_update(&process);
        assert_eq!(recording.seen.lock().expect("lock").len(), 2);
    }

    #[test]
    fn commands_aggregate_across_plugins() {
        let first = RecordingPlugin::new("first");
        let second = RecordingPlugin::new("second");
        let host = PluginHost::new(vec![
            first as Arc<dyn ProcessPlugin>,
            second as Arc<dyn ProcessPlugin>,
        ]);

        let commands = host.collect_commands(&process());
        let ids: Vec<&str> = commands.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["first.tail", "second.tail"]);
    }
}
