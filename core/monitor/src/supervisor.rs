//! Client for the supervisor's control socket.
//!
//! The supervisor is an external collaborator: it owns actual process
//! control. We consume a four-method surface over newline-delimited JSON,
//! one request per connection.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use vigil_supervisor_protocol::{
    Method, ProcessInfo, Request, Response, MAX_RESPONSE_BYTES,
};

use crate::error::SupervisorError;

const RPC_TIMEOUT_SECS: u64 = 5;
const READ_CHUNK_SIZE: usize = 4096;

/// The supervisor RPC surface the monitor consumes.
///
/// `stop_process` may fault with `NOT_RUNNING`; restart sequences tolerate
/// that fault as success.
pub trait SupervisorClient: Send + Sync {
    fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, SupervisorError>;
    fn start_process(&self, name: &str) -> Result<(), SupervisorError>;
    fn stop_process(&self, name: &str) -> Result<(), SupervisorError>;
    /// The supervisor's own OS pid, used to locate its config file on disk.
    fn get_pid(&self) -> Result<u32, SupervisorError>;
}

/// Client over the supervisor's Unix control socket.
#[derive(Debug, Clone)]
pub struct SocketSupervisorClient {
    socket_path: PathBuf,
}

impl SocketSupervisorClient {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    #[cfg(unix)]
    fn call(&self, request: &Request) -> Result<Value, SupervisorError> {
        use std::os::unix::net::UnixStream;

        let connect = |err| SupervisorError::Connection {
            path: self.socket_path.clone(),
            source: err,
        };

        let mut stream = UnixStream::connect(&self.socket_path).map_err(connect)?;
        let _ = stream.set_read_timeout(Some(Duration::from_secs(RPC_TIMEOUT_SECS)));
        let _ = stream.set_write_timeout(Some(Duration::from_secs(RPC_TIMEOUT_SECS)));

        let body = serde_json::to_vec(request)
            .map_err(|err| SupervisorError::Protocol(format!("encoding request: {err}")))?;
        stream.write_all(&body).map_err(connect)?;
        stream.write_all(b"\n").map_err(connect)?;
        stream.flush().map_err(connect)?;

        let raw = read_response(&mut stream).map_err(connect)?;
        let response: Response = serde_json::from_slice(&raw)
            .map_err(|err| SupervisorError::Protocol(format!("invalid response JSON: {err}")))?;

        if response.ok {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            let fault = response
                .fault
                .ok_or_else(|| SupervisorError::Protocol("fault response without fault".into()))?;
            Err(SupervisorError::Fault {
                code: fault.code,
                message: fault.message,
            })
        }
    }

    #[cfg(not(unix))]
    fn call(&self, _request: &Request) -> Result<Value, SupervisorError> {
        Err(SupervisorError::Protocol(
            "Unix control sockets are not supported on this platform".into(),
        ))
    }
}

#[cfg(unix)]
fn read_response(stream: &mut impl Read) -> std::io::Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_RESPONSE_BYTES {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) => return Err(err),
        }
    }
    if let Some(index) = buffer.iter().position(|b| *b == b'\n') {
        buffer.truncate(index);
    }
    Ok(buffer)
}

impl SupervisorClient for SocketSupervisorClient {
    fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
        let data = self.call(&Request::new(Method::GetAllProcessInfo))?;
        serde_json::from_value(data)
            .map_err(|err| SupervisorError::Protocol(format!("invalid process list: {err}")))
    }

    fn start_process(&self, name: &str) -> Result<(), SupervisorError> {
        debug!(name = %name, "Starting process");
        self.call(&Request::with_name(Method::StartProcess, name))?;
        Ok(())
    }

    fn stop_process(&self, name: &str) -> Result<(), SupervisorError> {
        debug!(name = %name, "Stopping process");
        self.call(&Request::with_name(Method::StopProcess, name))?;
        Ok(())
    }

    fn get_pid(&self) -> Result<u32, SupervisorError> {
        let data = self.call(&Request::new(Method::GetPid))?;
        serde_json::from_value(data)
            .map_err(|err| SupervisorError::Protocol(format!("invalid pid: {err}")))
    }
}

/// Determines the path of the supervisor's own logfile.
///
/// The supervisor exposes no RPC for this, so we ask for its pid, resolve its
/// working directory, and read the `logfile` key of the `supervisor.json`
/// config file found there.
pub fn main_logfile(supervisor: &dyn SupervisorClient) -> Result<PathBuf, SupervisorError> {
    let pid = supervisor.get_pid()?;
    let cwd = working_directory(pid)?;
    let config_path = cwd.join("supervisor.json");
    let raw = fs_err::read_to_string(&config_path).map_err(|err| {
        SupervisorError::Protocol(format!("reading {}: {err}", config_path.display()))
    })?;
    let config: Value = serde_json::from_str(&raw).map_err(|err| {
        SupervisorError::Protocol(format!("parsing {}: {err}", config_path.display()))
    })?;
    config
        .get("logfile")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| {
            SupervisorError::Protocol(format!("no logfile key in {}", config_path.display()))
        })
}

#[cfg(target_os = "linux")]
fn working_directory(pid: u32) -> Result<PathBuf, SupervisorError> {
    let link = PathBuf::from(format!("/proc/{pid}/cwd"));
    std::fs::read_link(&link).map_err(|err| SupervisorError::Connection {
        path: link,
        source: err,
    })
}

#[cfg(not(target_os = "linux"))]
fn working_directory(_pid: u32) -> Result<PathBuf, SupervisorError> {
    Err(SupervisorError::Protocol(
        "working-directory lookup is only implemented for Linux".into(),
    ))
}

/// Convenience for the two-phase restart: stop tolerating `NOT_RUNNING`,
/// then start. There is no atomic restart RPC.
pub fn restart_process(
    supervisor: &dyn SupervisorClient,
    name: &str,
) -> Result<(), SupervisorError> {
    match supervisor.stop_process(name) {
        Ok(()) => {}
        Err(err) if err.is_not_running() => {
            debug!(name = %name, "Process was already stopped before restart");
        }
        Err(err) => return Err(err),
    }
    supervisor.start_process(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use vigil_supervisor_protocol::FAULT_NOT_RUNNING;

    #[derive(Default)]
    struct RecordingSupervisor {
        calls: Mutex<Vec<String>>,
        stop_fault: Option<&'static str>,
    }

    impl SupervisorClient for RecordingSupervisor {
        fn get_all_process_info(&self) -> Result<Vec<ProcessInfo>, SupervisorError> {
            Ok(Vec::new())
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
            match self.stop_fault {
                Some(code) => Err(SupervisorError::Fault {
                    code: code.to_string(),
                    message: "fault".to_string(),
                }),
                None => Ok(()),
            }
        }

        fn get_pid(&self) -> Result<u32, SupervisorError> {
            Ok(1)
        }
    }

    #[test]
    fn restart_stops_then_starts() {
        let supervisor = RecordingSupervisor::default();
        restart_process(&supervisor, "web").expect("restart");
        assert_eq!(
            *supervisor.calls.lock().expect("lock"),
            vec!["stop:web", "start:web"]
        );
    }

    #[test]
    fn restart_tolerates_not_running_fault() {
        let supervisor = RecordingSupervisor {
            stop_fault: Some(FAULT_NOT_RUNNING),
            ..Default::default()
        };
        restart_process(&supervisor, "web").expect("restart");
        assert_eq!(
            *supervisor.calls.lock().expect("lock"),
            vec!["stop:web", "start:web"]
        );
    }

    #[test]
    fn restart_aborts_on_other_stop_faults() {
        let supervisor = RecordingSupervisor {
            stop_fault: Some("BAD_NAME"),
            ..Default::default()
        };
        assert!(restart_process(&supervisor, "web").is_err());
        // No start after a genuine stop failure.
        assert_eq!(*supervisor.calls.lock().expect("lock"), vec!["stop:web"]);
    }
}
