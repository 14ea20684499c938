//! Embedded health reporter for monitored services.
//!
//! A service links this crate and reports its own health into a statefile
//! the monitor watches: `<storage-root>/services/<name>.statefile`. The
//! service writes RUNNING once it is actually serving and FATAL when it is
//! about to die; the monitor owns deletion, so the writer never removes its
//! own file. Writes are atomic (temp file + rename) so the watcher never
//! observes a half-written report.
//!
//! The statefile layout here must stay in sync with the monitor's reader;
//! the two crates deliberately share no code so that services embedding the
//! probe pull in nothing of the monitor.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

const STATEFILE_EXT: &str = ".statefile";
const STORAGE_DIR: &str = ".vigil";
const SERVICES_DIR: &str = "services";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("no home directory; cannot locate the statefile directory")]
    NoHomeDir,
    #[error("service name {0:?} is empty or not filename-safe")]
    InvalidName(String),
    #[error("writing statefile {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StateReport<'a> {
    state: &'a str,
    description: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pid: Option<u32>,
}

/// Handle to one service's statefile.
#[derive(Debug, Clone)]
pub struct Probe {
    statefile: PathBuf,
}

impl Probe {
    /// Creates the statefile directory and reports RUNNING. Call once the
    /// service is actually serving, not merely started.
    pub fn initialize(name: &str) -> Result<Self, ProbeError> {
        let home = dirs::home_dir().ok_or(ProbeError::NoHomeDir)?;
        Self::initialize_in(home.join(STORAGE_DIR), name)
    }

    /// Like [`Probe::initialize`] with an explicit storage root.
    pub fn initialize_in(root: PathBuf, name: &str) -> Result<Self, ProbeError> {
        if name.is_empty() || !name.chars().all(filename_safe) {
            return Err(ProbeError::InvalidName(name.to_string()));
        }
        let services = root.join(SERVICES_DIR);
        fs_err::create_dir_all(&services).map_err(|source| ProbeError::Write {
            path: services.clone(),
            source,
        })?;
        let probe = Self {
            statefile: services.join(format!("{name}{STATEFILE_EXT}")),
        };
        probe.report_running()?;
        Ok(probe)
    }

    /// Reports the service healthy, stamping our own pid.
    pub fn report_running(&self) -> Result<(), ProbeError> {
        self.write(&StateReport {
            state: "RUNNING",
            description: "",
            pid: Some(std::process::id()),
        })
    }

    /// Reports the service dying with a human-readable reason.
    pub fn report_fatal(&self, description: &str) -> Result<(), ProbeError> {
        self.write(&StateReport {
            state: "FATAL",
            description,
            pid: Some(std::process::id()),
        })
    }

    /// Installs a panic hook that reports FATAL before delegating to the
    /// previous hook. The report happens before unwinding finishes, so the
    /// monitor sees the failure even if the process dies mid-unwind.
    pub fn install_panic_hook(&self) {
        let probe = self.clone();
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |panic_info| {
            let _ = probe.report_fatal(&panic_info.to_string());
            previous(panic_info);
        }));
    }

    pub fn statefile_path(&self) -> &std::path::Path {
        &self.statefile
    }

    fn write(&self, report: &StateReport<'_>) -> Result<(), ProbeError> {
        let write_err = |source| ProbeError::Write {
            path: self.statefile.clone(),
            source,
        };
        let body = serde_json::to_vec(report)
            .map_err(|err| write_err(std::io::Error::new(std::io::ErrorKind::InvalidData, err)))?;
        // Same-directory temp file so the rename stays on one filesystem.
        let temp = self.statefile.with_extension("statefile.tmp");
        fs_err::write(&temp, body).map_err(write_err)?;
        fs_err::rename(&temp, &self.statefile).map_err(write_err)?;
        Ok(())
    }
}

fn filename_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':')
}
