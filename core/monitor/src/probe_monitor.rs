//! Watches the probe channel: a directory of per-service statefiles.
//!
//! Monitored services write their own health into
//! `<storage-root>/services/<name>.statefile` via `vigil-probe`. This module
//! turns filesystem notifications on that directory into `ProbeUpdate`
//! signals, recovers state that predates this run by scanning on start, and
//! cleans up statefiles whose service no longer exists.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};
use std::sync::Mutex;
use std::thread;

use chrono::Utc;
use fs_err as fs;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, warn};

use crate::error::MonitorError;
use crate::process::{ChildState, ProbeUpdate};
use crate::storage::{StorageConfig, STATEFILE_EXT};

/// One probe-channel occurrence, delivered to the monitor's dispatcher.
#[derive(Debug)]
pub enum ProbeSignal {
    Update(ProbeUpdate),
    Error(MonitorError),
}

pub struct ProbeMonitor {
    services_dir: PathBuf,
    signals: Sender<ProbeSignal>,
    // Holding the watcher keeps the subscription alive; dropping it stops
    // watching and lets the relay thread wind down.
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl ProbeMonitor {
    pub fn new(storage: &StorageConfig, signals: Sender<ProbeSignal>) -> Self {
        Self {
            services_dir: storage.services_dir(),
            signals,
            watcher: Mutex::new(None),
        }
    }

    /// Ensures the probe directory exists, synthesizes one update per
    /// existing statefile, then begins watching for changes. Idempotent.
    pub fn start(&self) -> Result<(), MonitorError> {
        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return Ok(());
        }

        fs::create_dir_all(&self.services_dir).map_err(|err| MonitorError::Io {
            context: format!("creating {}", self.services_dir.display()),
            source: err,
        })?;

        self.synthesize_existing()?;

        let (events_tx, events_rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |result: Result<Event, _>| {
            if let Ok(event) = result {
                let _ = events_tx.send(event);
            }
        })
        .map_err(|err| MonitorError::Watch {
            path: self.services_dir.clone(),
            source: err,
        })?;
        watcher
            .watch(&self.services_dir, RecursiveMode::NonRecursive)
            .map_err(|err| MonitorError::Watch {
                path: self.services_dir.clone(),
                source: err,
            })?;

        let signals = self.signals.clone();
        let services_dir = self.services_dir.clone();
        thread::spawn(move || {
            // Ends when the watcher (and with it the event sender) is dropped.
            while let Ok(event) = events_rx.recv() {
                if !matches!(
                    event.kind,
                    EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                ) {
                    continue;
                }
                for path in &event.paths {
                    relay_statefile_change(&services_dir, path, &signals);
                }
            }
        });

        *slot = Some(watcher);
        Ok(())
    }

    /// Stops watching. Outstanding reads are not cancelled; their results
    /// are discarded downstream by the monitor's stop guard.
    pub fn stop(&self) {
        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = None;
    }

    /// Deletes the statefile for `name`. Tolerates one already removed.
    pub fn discard_probe(&self, name: &str) -> Result<(), MonitorError> {
        let path = statefile_path(&self.services_dir, name);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(name = %name, "Discarded orphaned statefile");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MonitorError::Io {
                context: format!("removing {}", path.display()),
                source: err,
            }),
        }
    }

    /// Emits one update per statefile already on disk, recovering state
    /// reported before this monitoring session began.
    fn synthesize_existing(&self) -> Result<(), MonitorError> {
        let entries = fs::read_dir(&self.services_dir).map_err(|err| MonitorError::Io {
            context: format!("listing {}", self.services_dir.display()),
            source: err,
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| MonitorError::Io {
                context: format!("listing {}", self.services_dir.display()),
                source: err,
            })?;
            relay_statefile_change(&self.services_dir, &entry.path(), &self.signals);
        }
        Ok(())
    }
}

/// Reads one statefile and forwards the outcome as a signal.
///
/// A missing file is a no-op: it covers both a genuine delete event and the
/// benign race between a notification and our read. Paths that are not
/// statefiles are ignored.
fn relay_statefile_change(services_dir: &Path, path: &Path, signals: &Sender<ProbeSignal>) {
    let Some(name) = statefile_name(path) else {
        return;
    };
    match read_statefile(path) {
        Ok(Some(child)) => {
            let update = ProbeUpdate {
                name,
                child,
                observed_at: Utc::now(),
            };
            if signals.send(ProbeSignal::Update(update)).is_err() {
                warn!(dir = %services_dir.display(), "Probe signal receiver dropped");
            }
        }
        Ok(None) => {} // Deleted, or deleted between notification and read.
        Err(err) => {
            let _ = signals.send(ProbeSignal::Error(err));
        }
    }
}

/// Extracts the logical service name from a `<name>.statefile` path.
fn statefile_name(path: &Path) -> Option<String> {
    let file_name = path.file_name()?.to_str()?;
    file_name
        .strip_suffix(STATEFILE_EXT)
        .filter(|stem| !stem.is_empty())
        .map(str::to_string)
}

/// Parses one statefile. `Ok(None)` means the file does not exist.
fn read_statefile(path: &Path) -> Result<Option<ChildState>, MonitorError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(MonitorError::ProbeRead {
                path: path.to_path_buf(),
                details: err.to_string(),
            })
        }
    };
    serde_json::from_str(raw.trim())
        .map(Some)
        .map_err(|err| MonitorError::ProbeRead {
            path: path.to_path_buf(),
            details: err.to_string(),
        })
}

fn statefile_path(services_dir: &Path, name: &str) -> PathBuf {
    services_dir.join(format!("{name}{STATEFILE_EXT}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessState;
    use std::sync::mpsc::Receiver;
    use std::time::Duration;
    use tempfile::TempDir;

    fn monitor_in_temp() -> (TempDir, ProbeMonitor, Receiver<ProbeSignal>) {
        let temp = TempDir::new().expect("temp dir");
        let storage = StorageConfig::with_root(temp.path().join("vigil"));
        let (tx, rx) = mpsc::channel();
        let monitor = ProbeMonitor::new(&storage, tx);
        (temp, monitor, rx)
    }

    fn write_statefile(monitor: &ProbeMonitor, name: &str, contents: &str) {
        std::fs::create_dir_all(&monitor.services_dir).expect("create services dir");
        std::fs::write(statefile_path(&monitor.services_dir, name), contents)
            .expect("write statefile");
    }

    #[test]
    fn start_synthesizes_updates_for_existing_statefiles() {
        let (_temp, monitor, rx) = monitor_in_temp();
        write_statefile(&monitor, "web", r#"{"state":"RUNNING","description":""}"#);
        write_statefile(&monitor, "worker", r#"{"state":"FATAL","description":"boom"}"#);

        monitor.start().expect("start");
        monitor.stop();

        let mut names: Vec<String> = (0..2)
            .map(|_| match rx.recv_timeout(Duration::from_secs(1)) {
                Ok(ProbeSignal::Update(update)) => update.name,
                other => panic!("expected update, got {other:?}"),
            })
            .collect();
        names.sort();
        assert_eq!(names, vec!["web", "worker"]);
    }

    #[test]
    fn start_twice_scans_and_watches_once() {
        let (_temp, monitor, rx) = monitor_in_temp();
        write_statefile(&monitor, "web", r#"{"state":"RUNNING","description":""}"#);

        monitor.start().expect("first start");
        // A second start must not rescan the directory (or spin up another
        // watcher); the existing statefile is synthesized exactly once.
        monitor.start().expect("second start");

        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(ProbeSignal::Update(update)) => assert_eq!(update.name, "web"),
            other => panic!("expected update, got {other:?}"),
        }
        assert!(rx.recv_timeout(Duration::from_millis(400)).is_err());
        monitor.stop();
    }

    #[test]
    fn watcher_reports_statefile_writes() {
        let (_temp, monitor, rx) = monitor_in_temp();
        monitor.start().expect("start");

        write_statefile(&monitor, "web", r#"{"state":"FATAL","description":"x"}"#);
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(ProbeSignal::Update(update)) => {
                assert_eq!(update.name, "web");
                assert_eq!(update.child.state, ProcessState::Fatal);
                assert_eq!(update.child.description, "x");
            }
            other => panic!("expected update, got {other:?}"),
        }
        monitor.stop();
    }

    #[test]
    fn corrupt_statefile_surfaces_probe_read_error() {
        let (_temp, monitor, rx) = monitor_in_temp();
        write_statefile(&monitor, "web", "{not json");

        monitor.start().expect("start");
        monitor.stop();

        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(ProbeSignal::Error(MonitorError::ProbeRead { path, .. })) => {
                assert!(path.ends_with("web.statefile"));
            }
            other => panic!("expected probe read error, got {other:?}"),
        }
    }

    #[test]
    fn missing_statefile_is_a_no_op() {
        let (_temp, monitor, rx) = monitor_in_temp();
        monitor.start().expect("start");

        relay_statefile_change(
            &monitor.services_dir,
            &statefile_path(&monitor.services_dir, "ghost"),
            &monitor.signals,
        );
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        monitor.stop();
    }

    #[test]
    fn discard_probe_deletes_and_tolerates_missing() {
        let (_temp, monitor, _rx) = monitor_in_temp();
        write_statefile(&monitor, "web", r#"{"state":"RUNNING","description":""}"#);

        monitor.discard_probe("web").expect("discard");
        assert!(!statefile_path(&monitor.services_dir, "web").exists());
        // Already gone: still fine.
        monitor.discard_probe("web").expect("discard again");
    }

    #[test]
    fn non_statefile_paths_are_ignored() {
        assert_eq!(statefile_name(Path::new("/a/web.statefile")).as_deref(), Some("web"));
        assert!(statefile_name(Path::new("/a/web.tmp")).is_none());
        assert!(statefile_name(Path::new("/a/.statefile")).is_none());
    }
}
