//! Control protocol over `~/.apsbss/daemon.sock`.
//!
//! One JSON object per line each way. A request names a [`DaemonCommand`];
//! the reply is a [`DaemonResponse`] whose `data` is typed by the command:
//!
//! | cmd      | data             |
//! |----------|------------------|
//! | `status` | [`DaemonStatus`] |
//! | `sync`   | [`CycleReport`]  |
//! | `stop`   | [`StopAck`]      |

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use bss_sync::{CycleReport, Status, SyncState};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonCommand {
    /// Report the daemon and its last cycle.
    Status,
    /// Run a cycle now and reply with its report.
    Sync,
    /// Shut down after the current phase.
    Stop,
}

/// `{"cmd": "status"}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: DaemonCommand,
}

impl DaemonRequest {
    pub fn new(cmd: DaemonCommand) -> Self {
        Self { cmd }
    }
}

/// Reply to `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: u32,
    pub started_at_unix: u64,
    pub interval_secs: u64,
    pub socket: PathBuf,
    /// Status of the last cycle; `None` before the first one finishes.
    pub status: Option<Status>,
    pub state: Option<SyncState>,
    pub last_cycle: Option<CycleReport>,
}

/// Reply to `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopAck {
    pub stopping: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonResponse<T> {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> DaemonResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn into_data(self) -> Result<T, DaemonError> {
        if !self.ok {
            return Err(DaemonError::Protocol(
                self.error
                    .unwrap_or_else(|| "unknown daemon error".to_string()),
            ));
        }
        self.data
            .ok_or_else(|| DaemonError::Protocol("daemon reply carried no data".to_string()))
    }
}

/// Send one request to the daemon socket and read one typed response.
pub fn send_request<T: DeserializeOwned>(
    home: &Path,
    request: &DaemonRequest,
) -> Result<DaemonResponse<T>, DaemonError> {
    let socket = socket_path(home);
    if !socket.exists() {
        return Err(DaemonError::DaemonNotRunning { socket });
    }

    let mut stream = UnixStream::connect(&socket).map_err(|err| {
        if matches!(
            err.kind(),
            std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionReset
        ) {
            DaemonError::DaemonNotRunning {
                socket: socket.clone(),
            }
        } else {
            io_err(&socket, err)
        }
    })?;

    let mut payload = serde_json::to_string(request)?;
    payload.push('\n');
    stream
        .write_all(payload.as_bytes())
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut line = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }

    Ok(serde_json::from_str(line.trim_end())?)
}

/// Status of a running daemon. Retries briefly so a freshly started daemon
/// has time to bind its socket.
pub fn request_status(home: &Path) -> Result<DaemonStatus, DaemonError> {
    let request = DaemonRequest::new(DaemonCommand::Status);

    let mut last_not_running: Option<DaemonError> = None;
    for attempt in 0..5 {
        match send_request::<DaemonStatus>(home, &request) {
            Ok(response) => return response.into_data(),
            Err(err @ DaemonError::DaemonNotRunning { .. }) => {
                last_not_running = Some(err);
                if attempt < 4 {
                    sleep(Duration::from_millis(100));
                    continue;
                }
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_not_running.unwrap_or_else(|| {
        DaemonError::Protocol("daemon status retry loop exited unexpectedly".to_string())
    }))
}

pub fn request_stop(home: &Path) -> Result<StopAck, DaemonError> {
    send_request::<StopAck>(home, &DaemonRequest::new(DaemonCommand::Stop))?.into_data()
}

/// Ask the daemon for an immediate cycle and wait for its report.
pub fn request_sync(home: &Path) -> Result<CycleReport, DaemonError> {
    send_request::<CycleReport>(home, &DaemonRequest::new(DaemonCommand::Sync))?.into_data()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn missing_socket_means_not_running() {
        let home = TempDir::new().expect("home");
        let err = request_sync(home.path()).unwrap_err();
        assert!(matches!(err, DaemonError::DaemonNotRunning { .. }));
    }

    #[test]
    fn commands_are_lowercase_on_the_wire() {
        let encoded = serde_json::to_value(DaemonRequest::new(DaemonCommand::Sync)).unwrap();
        assert_eq!(encoded, json!({"cmd": "sync"}));
        let decoded: DaemonRequest = serde_json::from_str(r#"{"cmd":"stop"}"#).unwrap();
        assert_eq!(decoded.cmd, DaemonCommand::Stop);
    }

    #[test]
    fn unknown_command_does_not_parse() {
        let err = serde_json::from_str::<DaemonRequest>(r#"{"cmd":"restart"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown variant `restart`"), "{err}");
    }

    #[test]
    fn error_response_becomes_protocol_error() {
        let err = DaemonResponse::<StopAck>::error("sync queue closed")
            .into_data()
            .unwrap_err();
        assert_eq!(err.to_string(), "daemon protocol error: sync queue closed");
    }

    #[test]
    fn ok_response_without_data_is_an_error() {
        let response: DaemonResponse<StopAck> = serde_json::from_str(r#"{"ok": true}"#).unwrap();
        assert!(matches!(response.into_data(), Err(DaemonError::Protocol(_))));
    }

    #[test]
    fn status_reply_round_trips_before_first_cycle() {
        let status = DaemonStatus {
            running: true,
            pid: 4242,
            started_at_unix: 1_000_000,
            interval_secs: 60,
            socket: PathBuf::from("/tmp/daemon.sock"),
            status: None,
            state: None,
            last_cycle: None,
        };
        let wire = serde_json::to_string(&DaemonResponse::ok(status.clone())).unwrap();
        assert!(!wire.contains("\"error\""));
        let back: DaemonResponse<DaemonStatus> = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.into_data().unwrap(), status);
    }
}
