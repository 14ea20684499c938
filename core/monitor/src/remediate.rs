//! Best-effort remediation of port conflicts.
//!
//! A service that dies with `EADDRINUSE` will keep dying until whatever holds
//! its port goes away. When a probe-sourced update shows a FATAL effective
//! state whose description names a conflicting port, we kill the holder and
//! restart the service through the supervisor. Every failure here is logged
//! and contained: a flapping service must never take down the monitoring
//! session, and the next probe update re-triggers detection if the conflict
//! persists.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::error::RemediationError;
use crate::process::{Process, ProcessState};

// The failure token followed by the first run of digits after it. Matching
// per-token (rather than taking the last digits in the text) keeps
// stack-trace line numbers from shadowing the port.
static PORT_CONFLICT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"EADDRINUSE\D*(\d+)").expect("valid port-conflict regex"));

/// Extracts the conflicting port from a FATAL description, if any.
/// Descriptions may repeat the failure across retry lines; the last
/// occurrence wins.
pub fn conflicting_port(description: &str) -> Option<u16> {
    PORT_CONFLICT
        .captures_iter(description)
        .last()
        .and_then(|captures| captures.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

/// OS surface needed to evict a port holder. Faked in tests.
pub trait PortGuard {
    fn pid_listening_on(&self, port: u16) -> Result<Option<u32>, RemediationError>;
    fn kill(&self, pid: u32) -> Result<(), RemediationError>;
}

/// Real implementation over the socket table and SIGKILL.
pub struct OsPortGuard;

impl PortGuard for OsPortGuard {
    fn pid_listening_on(&self, port: u16) -> Result<Option<u32>, RemediationError> {
        let all = listeners::get_all()
            .map_err(|err| RemediationError::PortScan(err.to_string()))?;
        Ok(all
            .into_iter()
            .find(|listener| listener.socket.port() == port)
            .map(|listener| listener.process.pid))
    }

    #[cfg(unix)]
    fn kill(&self, pid: u32) -> Result<(), RemediationError> {
        let result = unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) };
        if result == 0 {
            Ok(())
        } else {
            Err(RemediationError::Kill {
                pid,
                details: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: u32) -> Result<(), RemediationError> {
        Err(RemediationError::Unsupported)
    }
}

/// Checks one entity for the port-conflict signature and remediates it.
///
/// Returns the port that was freed, or `None` when the entity shows no
/// conflict. Errors abort the attempt but are the caller's to log, never to
/// escalate.
pub fn check_and_remediate(
    process: &Process,
    guard: &dyn PortGuard,
) -> Result<Option<u16>, RemediationError> {
    let effective = process.effective_state();
    if effective.state != ProcessState::Fatal {
        return Ok(None);
    }
    let Some(port) = conflicting_port(&effective.description) else {
        return Ok(None);
    };

    debug!(name = %process.display_name(), port, "Detected port conflict");

    let pid = guard
        .pid_listening_on(port)?
        .ok_or(RemediationError::PortHolderNotFound(port))?;
    guard.kill(pid)?;

    process
        .restart()
        .map_err(|source| RemediationError::Restart {
            name: process.daemon_name(),
            source,
        })?;

    info!(
        name = %process.display_name(),
        port,
        killed_pid = pid,
        "Freed conflicting port and restarted service"
    );
    Ok(Some(port))
}
