//! Wire types for the supervisor control socket.
//!
//! This crate is shared by the monitor and anything else that talks to the
//! supervisor, to prevent schema drift. Messages are newline-delimited JSON:
//! one request, one response, one connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_RESPONSE_BYTES: usize = 1024 * 1024; // 1MB

/// Fault code returned by `StopProcess` when the target is already stopped.
/// Callers performing a restart treat this as success.
pub const FAULT_NOT_RUNNING: &str = "NOT_RUNNING";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetAllProcessInfo,
    StartProcess,
    StopProcess,
    GetPid,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    /// Target process name, required by `StartProcess` and `StopProcess`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Request {
    pub fn new(method: Method) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            name: None,
        }
    }

    pub fn with_name(method: Method, name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            method,
            name: Some(name.into()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
}

impl Response {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            fault: None,
        }
    }

    pub fn fault(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            fault: Some(Fault {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Fault {
    pub code: String,
    pub message: String,
}

/// One entry of the `GetAllProcessInfo` response.
///
/// `statename` is the supervisor's lifecycle state token (`RUNNING`, `FATAL`,
/// `STOPPED`, ...). It stays a string on the wire; the monitor parses it.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
    pub group: String,
    pub statename: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logfile: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_with_name_carries_target() {
        let request = Request::with_name(Method::StopProcess, "web");
        let json = serde_json::to_string(&request).expect("serialize");
        let parsed: Request = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed.method, Method::StopProcess);
        assert_eq!(parsed.name.as_deref(), Some("web"));
        assert_eq!(parsed.protocol_version, PROTOCOL_VERSION);
    }

    #[test]
    fn request_rejects_unknown_fields() {
        let raw = r#"{"protocol_version":1,"method":"get_pid","extra":true}"#;
        assert!(serde_json::from_str::<Request>(raw).is_err());
    }

    #[test]
    fn fault_response_roundtrip() {
        let response = Response::fault(FAULT_NOT_RUNNING, "web is not running");
        let json = serde_json::to_string(&response).expect("serialize");
        let parsed: Response = serde_json::from_str(&json).expect("parse");
        assert!(!parsed.ok);
        let fault = parsed.fault.expect("fault present");
        assert_eq!(fault.code, FAULT_NOT_RUNNING);
    }

    #[test]
    fn process_info_tolerates_missing_description_and_logfile() {
        let raw = r#"{"pid":42,"name":"web","group":"web","statename":"RUNNING"}"#;
        let info: ProcessInfo = serde_json::from_str(raw).expect("parse");
        assert_eq!(info.pid, 42);
        assert!(info.description.is_empty());
    }
}
