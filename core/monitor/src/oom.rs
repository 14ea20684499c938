//! Self-recovery guard against memory exhaustion.
//!
//! Long monitoring sessions accumulate memory; rather than crash inside an
//! allocator, the guard samples our own resident set every 30 seconds and,
//! past a threshold, replaces the process image in place. On unix the
//! replacement is an `exec` of the current executable with the current argv,
//! so the pid the supervisor of *this* process knows stays valid.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use sysinfo::System;
use tracing::{debug, error, warn};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;

/// Replacement triggers at this fraction of the configured limit, leaving
/// headroom for the replacement itself to start.
const RSS_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct OomGuardConfig {
    pub memory_limit_bytes: u64,
    pub sample_interval: Duration,
}

impl Default for OomGuardConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: DEFAULT_MEMORY_LIMIT_BYTES,
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

/// Source of our own resident-set size. Faked in tests.
pub trait MemorySampler: Send + Sync {
    fn resident_bytes(&self) -> Option<u64>;
}

/// Real sampler over the system process table.
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !system.refresh_process(pid) {
            return None;
        }
        system.process(pid).map(|process| process.memory())
    }
}

/// How the current process gets replaced. Returns only on failure.
pub trait ProcessImage: Send + Sync {
    fn replace(&self) -> std::io::Error;
}

/// Replacement with the current executable and argv.
pub struct ExecProcessImage;

impl ProcessImage for ExecProcessImage {
    #[cfg(unix)]
    fn replace(&self) -> std::io::Error {
        use std::os::unix::process::CommandExt;

        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(err) => return err,
        };
        // exec only returns on failure.
        std::process::Command::new(exe)
            .args(std::env::args_os().skip(1))
            .exec()
    }

    #[cfg(not(unix))]
    fn replace(&self) -> std::io::Error {
        // No exec here: spawn a successor and exit. The pid changes, which
        // the log line makes visible to whoever supervises us.
        let exe = match std::env::current_exe() {
            Ok(exe) => exe,
            Err(err) => return err,
        };
        match std::process::Command::new(exe)
            .args(std::env::args_os().skip(1))
            .spawn()
        {
            Ok(child) => {
                warn!(
                    successor_pid = child.id(),
                    "In-place replacement unavailable on this platform; spawned successor and exiting"
                );
                std::process::exit(0);
            }
            Err(err) => err,
        }
    }
}

pub struct OomGuard;

/// Cancels the sampling loop on `stop()` or drop. Cannot undo a replacement
/// that already happened.
pub struct OomGuardHandle {
    stop_tx: Sender<()>,
}

impl OomGuardHandle {
    pub fn stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl OomGuard {
    pub fn start(config: OomGuardConfig) -> OomGuardHandle {
        Self::start_with(config, Arc::new(SysinfoSampler::new()), Arc::new(ExecProcessImage))
    }

    pub fn start_with(
        config: OomGuardConfig,
        sampler: Arc<dyn MemorySampler>,
        image: Arc<dyn ProcessImage>,
    ) -> OomGuardHandle {
        let (stop_tx, stop_rx) = mpsc::channel();
        thread::spawn(move || loop {
            match stop_rx.recv_timeout(config.sample_interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {}
            }
            let Some(rss) = sampler.resident_bytes() else {
                debug!("Could not sample resident-set size");
                continue;
            };
            let threshold = (config.memory_limit_bytes as f64 * RSS_THRESHOLD) as u64;
            if rss < threshold {
                continue;
            }
            warn!(
                rss_bytes = rss,
                limit_bytes = config.memory_limit_bytes,
                "Memory threshold exceeded; replacing process image"
            );
            let err = image.replace();
            // Reaching this line means the replacement failed; the next
            // sample retries it.
            error!(error = %err, "Process replacement failed");
        });
        OomGuardHandle { stop_tx }
    }
}
