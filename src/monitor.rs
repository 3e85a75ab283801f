//! Monitor control channel.
//!
//! A Unix stream socket at a fixed path accepts one complete JSON object
//! per request; the `task` field selects the handler and the reply is a
//! 4-byte ASCII status code (HTTP-style: 200/400/500/501/502). The loop is
//! a small epoll dispatcher over the listener and its client connections.
//!
//! ```json
//! {"task": "create checkpoint", "params": {"path": "checkpoint"}}
//! ```
//!
//! Before a guest is running, `start app` and `load checkpoint` hand the
//! request to the waiting main thread (deferred start); once a guest runs
//! they are refused. After a successful `migrate` the reply is written
//! first, then the process exits — the guest lives on the peer.
//!
//! Requests with bytes trailing the JSON object are rejected outright.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use serde::Deserialize;

use crate::checkpoint;
use crate::config::{MigrationMode, MigrationParams, MigrationType};
use crate::hypervisor::Hypervisor;
use crate::migration::{self, MigrationError};

/// Fixed monitor socket path.
pub const SOCKET_PATH: &str = "/tmp/uhyve.sock";

/// epoll token of the listening socket.
const LISTENER_TOKEN: u64 = u64::MAX;

/// Task names the monitor knows; anything else is 501.
const KNOWN_TASKS: &[&str] = &["start app", "create checkpoint", "load checkpoint", "migrate"];

#[derive(Debug, Deserialize)]
#[serde(tag = "task")]
enum Task {
    #[serde(rename = "start app")]
    StartApp { path: PathBuf },

    #[serde(rename = "create checkpoint")]
    CreateCheckpoint { params: CheckpointParams },

    #[serde(rename = "load checkpoint")]
    LoadCheckpoint { path: PathBuf },

    #[serde(rename = "migrate")]
    Migrate { params: MigrateParams },
}

#[derive(Debug, Deserialize)]
struct CheckpointParams {
    path: PathBuf,
    #[serde(rename = "full-checkpoint")]
    full_checkpoint: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct MigrateParams {
    destination: String,
    mode: Option<String>,
    #[serde(rename = "type")]
    type_: Option<String>,
    #[serde(rename = "use-odp")]
    use_odp: Option<bool>,
    prefetch: Option<bool>,
}

/// A deferred-start request handed to the waiting main thread.
pub enum PreStartTask {
    StartApp(PathBuf),
    LoadCheckpoint(PathBuf),
}

pub struct PreStartRequest {
    pub task: PreStartTask,
    /// The status to report back to the monitor client.
    pub reply: mpsc::Sender<u32>,
}

/// State shared between the monitor thread and the rest of the process.
pub struct MonitorShared {
    hv: Mutex<Option<Arc<Hypervisor>>>,
    prestart: Mutex<Option<mpsc::Sender<PreStartRequest>>>,
}

impl MonitorShared {
    /// Monitor for an already-decided startup; deferred start disabled.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            hv: Mutex::new(None),
            prestart: Mutex::new(None),
        })
    }

    /// Monitor that forwards start tasks to the waiting main thread.
    pub fn with_prestart(sender: mpsc::Sender<PreStartRequest>) -> Arc<Self> {
        Arc::new(Self {
            hv: Mutex::new(None),
            prestart: Mutex::new(Some(sender)),
        })
    }

    /// The guest is up; start tasks are refused from here on.
    pub fn attach_hypervisor(&self, hv: Arc<Hypervisor>) {
        *self.hv.lock().unwrap() = Some(hv);
        *self.prestart.lock().unwrap() = None;
    }

    fn hypervisor(&self) -> Option<Arc<Hypervisor>> {
        self.hv.lock().unwrap().clone()
    }
}

/// Bind the monitor socket and run the event loop on its own thread.
///
/// Binding failures are fatal (returned); failures inside the loop only
/// drop the affected connection.
pub fn spawn(shared: Arc<MonitorShared>) -> io::Result<()> {
    // A previous instance may have left its socket behind.
    let _ = std::fs::remove_file(SOCKET_PATH);
    let listener = UnixListener::bind(SOCKET_PATH)?;
    listener.set_nonblocking(true)?;
    tracing::info!(path = SOCKET_PATH, "monitor listening");

    std::thread::Builder::new()
        .name("monitor".into())
        .spawn(move || {
            if let Err(e) = event_loop(listener, shared) {
                tracing::error!("monitor event loop failed: {e}");
            }
        })?;
    Ok(())
}

struct Connection {
    stream: UnixStream,
    buf: Vec<u8>,
}

fn event_loop(listener: UnixListener, shared: Arc<MonitorShared>) -> io::Result<()> {
    let epfd = epoll::create(true)?;
    epoll::ctl(
        epfd,
        epoll::ControlOptions::EPOLL_CTL_ADD,
        listener.as_raw_fd(),
        epoll::Event::new(epoll::Events::EPOLLIN, LISTENER_TOKEN),
    )?;

    let mut connections: HashMap<RawFd, Connection> = HashMap::new();
    let mut events = [epoll::Event::new(epoll::Events::empty(), 0); 16];

    loop {
        let ready = match epoll::wait(epfd, -1, &mut events) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };

        for event in &events[..ready] {
            if event.data == LISTENER_TOKEN {
                accept_clients(epfd, &listener, &mut connections)?;
            } else {
                let fd = event.data as RawFd;
                let closed = match connections.get_mut(&fd) {
                    Some(conn) => service_connection(conn, &shared),
                    None => continue,
                };
                if closed {
                    connections.remove(&fd);
                }
            }
        }
    }
}

fn accept_clients(
    epfd: RawFd,
    listener: &UnixListener,
    connections: &mut HashMap<RawFd, Connection>,
) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                let fd = stream.as_raw_fd();
                epoll::ctl(
                    epfd,
                    epoll::ControlOptions::EPOLL_CTL_ADD,
                    fd,
                    epoll::Event::new(epoll::Events::EPOLLIN, fd as u64),
                )?;
                connections.insert(
                    fd,
                    Connection {
                        stream,
                        buf: Vec::new(),
                    },
                );
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}

/// Drain a readable connection; returns true when it should be dropped.
fn service_connection(conn: &mut Connection, shared: &MonitorShared) -> bool {
    let mut chunk = [0u8; 4096];
    loop {
        match conn.stream.read(&mut chunk) {
            Ok(0) => return true,
            Ok(n) => conn.buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) => return true,
        }
    }

    // Wait for the rest of a partial object; anything else gets a reply.
    if looks_incomplete(&conn.buf) {
        return false;
    }
    let message = std::mem::take(&mut conn.buf);

    let (status, exit_after) = match parse_task(&message) {
        Ok(task) => run_task(shared, task),
        Err(status) => (status, false),
    };

    tracing::debug!(status, "monitor task finished");
    if conn.stream.write_all(&status_bytes(status)).is_err() {
        return true;
    }

    if exit_after {
        // The guest now runs on the migration destination.
        let _ = conn.stream.flush();
        std::process::exit(0);
    }
    false
}

/// A prefix of a JSON object we should keep waiting on.
fn looks_incomplete(buf: &[u8]) -> bool {
    match serde_json::from_slice::<serde_json::Value>(buf) {
        Ok(_) => false,
        Err(e) => e.is_eof(),
    }
}

/// Decode a task message; on failure, the status to report.
///
/// Trailing data after the object is a hard 400: a channel that framed one
/// request badly cannot be trusted about the next one.
fn parse_task(bytes: &[u8]) -> Result<Task, u32> {
    let value: serde_json::Value = serde_json::from_slice(bytes).map_err(|_| 400u32)?;
    let Some(name) = value.get("task").and_then(|v| v.as_str()).map(str::to_owned) else {
        tracing::warn!("monitor request without a task field");
        return Err(400);
    };
    if !KNOWN_TASKS.contains(&name.as_str()) {
        tracing::warn!(task = name, "monitor task not implemented");
        return Err(501);
    }
    serde_json::from_value::<Task>(value).map_err(|e| {
        tracing::warn!("malformed '{name}' task: {e}");
        400
    })
}

/// Execute a task; returns (status, exit-after-reply).
fn run_task(shared: &MonitorShared, task: Task) -> (u32, bool) {
    match task {
        Task::StartApp { path } => (prestart(shared, PreStartTask::StartApp(path)), false),
        Task::LoadCheckpoint { path } => {
            (prestart(shared, PreStartTask::LoadCheckpoint(path)), false)
        }

        Task::CreateCheckpoint { params } => {
            let Some(hv) = shared.hypervisor() else {
                tracing::warn!("checkpoint requested before the guest started");
                return (400, false);
            };
            let full = params
                .full_checkpoint
                .unwrap_or_else(|| hv.checkpoint.default_full());
            match hv.checkpoint.request(&hv, params.path, full) {
                Ok(()) => (200, false),
                Err(checkpoint::CheckpointError::NotRunning) => (400, false),
                Err(e) => {
                    tracing::error!("checkpoint task failed: {e}");
                    (500, false)
                }
            }
        }

        Task::Migrate { params } => {
            let Some(hv) = shared.hypervisor() else {
                tracing::warn!("migrate requested before the guest started");
                return (400, false);
            };
            let merged = merge_migration_params(hv.config.migration_params, &params);
            match migration::initiate(&hv, &params.destination, merged) {
                Ok(()) => (200, true),
                Err(MigrationError::Transport(e)) => {
                    tracing::error!("could not reach migration destination: {e}");
                    (502, false)
                }
                Err(e) => {
                    tracing::error!("migration task failed: {e}");
                    (500, false)
                }
            }
        }
    }
}

/// Forward a deferred-start task to the waiting main thread.
fn prestart(shared: &MonitorShared, task: PreStartTask) -> u32 {
    let sender = shared.prestart.lock().unwrap().clone();
    let Some(sender) = sender else {
        tracing::warn!("start task refused: a guest is already running");
        return 400;
    };

    let (reply_tx, reply_rx) = mpsc::channel();
    if sender
        .send(PreStartRequest {
            task,
            reply: reply_tx,
        })
        .is_err()
    {
        return 500;
    }
    reply_rx.recv().unwrap_or(500)
}

/// Override file/environment parameters with the task's explicit ones.
fn merge_migration_params(base: MigrationParams, params: &MigrateParams) -> MigrationParams {
    let mut merged = base;
    match params.mode.as_deref() {
        Some("complete-dump") => merged.mode = MigrationMode::CompleteDump,
        Some("incremental-dump") => merged.mode = MigrationMode::IncrementalDump,
        Some(other) => tracing::warn!("migration mode '{other}' not supported"),
        None => {}
    }
    match params.type_.as_deref() {
        Some("cold") => merged.type_ = MigrationType::Cold,
        Some("live") => merged.type_ = MigrationType::Live,
        Some(other) => tracing::warn!("migration type '{other}' not supported"),
        None => {}
    }
    if let Some(use_odp) = params.use_odp {
        merged.use_odp = use_odp;
    }
    if let Some(prefetch) = params.prefetch {
        merged.prefetch = prefetch;
    }
    merged
}

/// HTTP-style status as the 4-byte ASCII reply (three digits + NUL).
fn status_bytes(status: u32) -> [u8; 4] {
    let mut out = [0u8; 4];
    let text = format!("{:03}", status.min(999));
    out[..3].copy_from_slice(text.as_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_tasks() {
        let task = parse_task(br#"{"task": "start app", "path": "/tmp/guest"}"#).unwrap();
        assert!(matches!(task, Task::StartApp { .. }));

        let task = parse_task(
            br#"{"task": "create checkpoint", "params": {"path": "chk", "full-checkpoint": true}}"#,
        )
        .unwrap();
        match task {
            Task::CreateCheckpoint { params } => {
                assert_eq!(params.path, PathBuf::from("chk"));
                assert_eq!(params.full_checkpoint, Some(true));
            }
            other => panic!("unexpected task {other:?}"),
        }

        let task = parse_task(
            br#"{"task": "migrate", "params": {"destination": "10.0.0.2", "type": "live"}}"#,
        )
        .unwrap();
        match task {
            Task::Migrate { params } => {
                assert_eq!(params.destination, "10.0.0.2");
                assert_eq!(params.type_.as_deref(), Some("live"));
            }
            other => panic!("unexpected task {other:?}"),
        }
    }

    #[test]
    fn test_unknown_task_is_not_implemented() {
        assert_eq!(
            parse_task(br#"{"task": "reboot"}"#).unwrap_err(),
            501
        );
    }

    #[test]
    fn test_malformed_requests_are_bad() {
        // No task field.
        assert_eq!(parse_task(br#"{"command": "x"}"#).unwrap_err(), 400);
        // Not JSON at all.
        assert_eq!(parse_task(b"hello").unwrap_err(), 400);
        // Known task, missing required parameter.
        assert_eq!(
            parse_task(br#"{"task": "create checkpoint"}"#).unwrap_err(),
            400
        );
        // Trailing garbage after a valid object: fail closed.
        assert_eq!(
            parse_task(br#"{"task": "start app", "path": "/x"} trailing"#).unwrap_err(),
            400
        );
    }

    #[test]
    fn test_incomplete_objects_wait() {
        assert!(looks_incomplete(br#"{"task": "start"#));
        assert!(!looks_incomplete(br#"{"task": "start app"}"#));
        assert!(!looks_incomplete(b"garbage"));
    }

    #[test]
    fn test_status_bytes() {
        assert_eq!(&status_bytes(200), b"200\0");
        assert_eq!(&status_bytes(501), b"501\0");
    }

    #[test]
    fn test_merge_migration_params() {
        let base = MigrationParams::default();
        let merged = merge_migration_params(
            base,
            &MigrateParams {
                destination: "10.0.0.2".into(),
                mode: Some("incremental-dump".into()),
                type_: Some("live".into()),
                use_odp: Some(true),
                prefetch: None,
            },
        );
        assert_eq!(merged.mode, MigrationMode::IncrementalDump);
        assert_eq!(merged.type_, MigrationType::Live);
        assert!(merged.use_odp);
        assert!(!merged.prefetch);
    }
}
