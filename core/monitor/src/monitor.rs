//! The process monitor: polls the supervisor, merges probe reports, and
//! publishes one canonical list.
//!
//! Two sources update the list independently: a repeating supervisor poll
//! and filesystem events from the probe channel. Each published update
//! carries the complete current list, so observers always treat the latest
//! update as a total replacement of their view. The published list lives
//! behind a mutex; a `started` flag, re-checked under that mutex before
//! every publish, guarantees that results landing after `stop()` are
//! discarded instead of applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::probe_monitor::{ProbeMonitor, ProbeSignal};
use crate::process::{ProbeUpdate, Process};
use crate::remediate::{self, OsPortGuard, PortGuard};
use crate::storage::StorageConfig;
use crate::supervisor::SupervisorClient;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(1000);

/// What observers receive. Errors are fatal by convention; the embedding
/// application decides the policy.
#[derive(Debug)]
pub enum MonitorEvent {
    Update(Vec<Process>),
    Error(MonitorError),
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub poll_interval: Duration,
    pub storage: StorageConfig,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            storage: StorageConfig::default(),
        }
    }
}

pub struct ProcessMonitor {
    inner: Arc<Inner>,
    // Consumed by the dispatcher thread on first start.
    probe_rx: Mutex<Option<Receiver<ProbeSignal>>>,
}

struct Inner {
    supervisor: Arc<dyn SupervisorClient>,
    events: Sender<MonitorEvent>,
    processes: Mutex<Vec<Process>>,
    started: AtomicBool,
    // Bumped on every stop so a poll loop from a previous session cannot
    // resume after a restart.
    epoch: AtomicU64,
    poll_interval: Duration,
    probe: ProbeMonitor,
    port_guard: Arc<dyn PortGuard + Send + Sync>,
}

impl ProcessMonitor {
    pub fn new(
        config: MonitorConfig,
        supervisor: Arc<dyn SupervisorClient>,
        events: Sender<MonitorEvent>,
    ) -> Self {
        Self::with_port_guard(config, supervisor, events, Arc::new(OsPortGuard))
    }

    pub fn with_port_guard(
        config: MonitorConfig,
        supervisor: Arc<dyn SupervisorClient>,
        events: Sender<MonitorEvent>,
        port_guard: Arc<dyn PortGuard + Send + Sync>,
    ) -> Self {
        let (probe_tx, probe_rx) = mpsc::channel();
        let probe = ProbeMonitor::new(&config.storage, probe_tx);
        Self {
            inner: Arc::new(Inner {
                supervisor,
                events,
                processes: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                epoch: AtomicU64::new(0),
                poll_interval: config.poll_interval,
                probe,
                port_guard,
            }),
            probe_rx: Mutex::new(Some(probe_rx)),
        }
    }

    /// Starts monitoring: one synchronous initial poll, then the probe
    /// watcher, then the repeating poll loop. Idempotent while started.
    /// Must not be called concurrently with `stop()`.
    pub fn start(&self) -> Result<(), MonitorError> {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        Inner::poll_once(&self.inner);

        if let Err(err) = self.inner.probe.start() {
            self.inner.started.store(false, Ordering::SeqCst);
            return Err(err);
        }

        // The dispatcher is spawned once and survives stop/start cycles;
        // the started flag keeps it inert while stopped.
        if let Some(probe_rx) = lock(&self.probe_rx).take() {
            let inner = Arc::clone(&self.inner);
            thread::spawn(move || {
                while let Ok(signal) = probe_rx.recv() {
                    Inner::handle_probe_signal(&inner, signal);
                }
            });
        }

        let inner = Arc::clone(&self.inner);
        thread::spawn(move || loop {
            thread::sleep(inner.poll_interval);
            if !inner.started.load(Ordering::SeqCst)
                || inner.epoch.load(Ordering::SeqCst) != epoch
            {
                break;
            }
            Inner::poll_once(&inner);
        });

        Ok(())
    }

    /// Stops monitoring and clears the published list. Outstanding fetches
    /// are not cancelled; their results are discarded when they land.
    pub fn stop(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.probe.stop();
        lock(&self.inner.processes).clear();
        debug!("Process monitor stopped");
    }

    /// Read-only snapshot of the current published list.
    pub fn processes(&self) -> Vec<Process> {
        lock(&self.inner.processes).clone()
    }

    #[cfg(test)]
    pub(crate) fn apply_poll_for_test(&self, infos: Vec<vigil_supervisor_protocol::ProcessInfo>) {
        Inner::apply_poll(&self.inner, infos);
    }

    #[cfg(test)]
    pub(crate) fn handle_probe_signal_for_test(&self, signal: ProbeSignal) {
        Inner::handle_probe_signal(&self.inner, signal);
    }
}

impl Inner {
    fn poll_once(inner: &Arc<Inner>) {
        match inner.supervisor.get_all_process_info() {
            Ok(infos) => Self::apply_poll(inner, infos),
            Err(err) => {
                // Discard failures that land after stop, like any other
                // stale poll result.
                if inner.started.load(Ordering::SeqCst) {
                    let _ = inner.events.send(MonitorEvent::Error(err.into()));
                }
            }
        }
    }

    /// Applies one poll snapshot: rebuilds every entity, carrying `child`
    /// over only where the pid is unchanged, and publishes the new list.
    fn apply_poll(inner: &Arc<Inner>, infos: Vec<vigil_supervisor_protocol::ProcessInfo>) {
        let mut list = lock(&inner.processes);
        // Stale-write guard: stopped while the fetch was outstanding.
        if !inner.started.load(Ordering::SeqCst) {
            return;
        }

        let previous_by_pid: HashMap<u32, Process> =
            list.iter().map(|p| (p.pid, p.clone())).collect();
        *list = infos
            .iter()
            .map(|info| {
                Process::from_info(
                    info,
                    previous_by_pid.get(&info.pid),
                    Arc::clone(&inner.supervisor),
                )
            })
            .collect();

        // Publishing under the list lock serializes against stop().
        let _ = inner.events.send(MonitorEvent::Update(list.clone()));
    }

    fn handle_probe_signal(inner: &Arc<Inner>, signal: ProbeSignal) {
        match signal {
            ProbeSignal::Error(err) => {
                if inner.started.load(Ordering::SeqCst) {
                    let _ = inner.events.send(MonitorEvent::Error(err));
                }
            }
            ProbeSignal::Update(update) => Self::merge_probe_update(inner, update),
        }
    }

    /// Attaches one probe report to the entity with the matching logical
    /// name and publishes. A report for an unknown name means the service
    /// was removed from configuration: its statefile is cleaned up and
    /// nothing is published.
    fn merge_probe_update(inner: &Arc<Inner>, update: ProbeUpdate) {
        let mut list = lock(&inner.processes);
        if !inner.started.load(Ordering::SeqCst) {
            return;
        }

        let Some(position) = list.iter().position(|p| p.name == update.name) else {
            drop(list);
            debug!(name = %update.name, "Probe update for unknown service; discarding statefile");
            if let Err(err) = inner.probe.discard_probe(&update.name) {
                warn!(name = %update.name, error = %err, "Failed to discard orphaned statefile");
            }
            return;
        };

        list[position].child = Some(update.child);
        let process = list[position].clone();
        let _ = inner.events.send(MonitorEvent::Update(list.clone()));
        drop(list);

        // Remediation runs detached: it must never block or fail the
        // publish it reacts to.
        let port_guard = Arc::clone(&inner.port_guard);
        thread::spawn(move || {
            match remediate::check_and_remediate(&process, port_guard.as_ref()) {
                Ok(_) => {}
                Err(err) => {
                    debug!(
                        name = %process.display_name(),
                        error = %err,
                        "Port-conflict remediation failed"
                    );
                }
            }
        });
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
