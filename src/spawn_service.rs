//! Spawn-server client interface (§1 Non-goals: process creation itself is
//! delegated to an external privileged helper; this crate only describes
//! what it asks that helper for and narrows the response to what the
//! workplace needs).

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::error::{Result, SpawnError};
use crate::operator::workshop::WaitResult;

/// Everything the workplace needs to ask the spawn service to start one
/// child (§4.8 step 2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreparedChildProcess {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    /// Stdio/control-channel fds are handed to the spawn service
    /// out-of-band via `SCM_RIGHTS`, not serialized here; filled in by the
    /// caller immediately before the fd-passing send.
    #[serde(skip)]
    pub stdin_fd: Option<i32>,
    #[serde(skip)]
    pub stdout_fd: Option<i32>,
    #[serde(skip)]
    pub stderr_fd: Option<i32>,
    #[serde(skip)]
    pub control_channel_fd: Option<i32>,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub chroot: Option<PathBuf>,
    pub umask: Option<u32>,
    pub priority: i32,
    pub sched_idle: bool,
    pub ioprio_idle: bool,
    pub private_network: bool,
    pub private_tmp: bool,
    pub no_new_privs: bool,
    pub cgroup_name: Option<String>,
}

/// A started child, as reported back by the spawn service (§4.8 step 3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SpawnedChild {
    pub pid: u32,
    /// `pidfd`, used to wait for exit without racing on PID reuse. Carried
    /// here as a plain integer; the real transport hands it over via
    /// `SCM_RIGHTS` rather than this JSON field, which only orders the
    /// conversation.
    pub pidfd: i32,
    pub cgroup_fd: Option<i32>,
}

/// Narrow capability interface onto the external spawn service (§9: model
/// an external collaborator as a capability interface, not an open class
/// hierarchy).
#[async_trait]
pub trait SpawnService: Send + Sync {
    async fn spawn(&self, request: PreparedChildProcess) -> Result<SpawnedChild>;

    /// Reads a cgroup's `cpu.stat` `usage_usec` field, for CPU accounting
    /// (§4.7).
    async fn read_cpu_usage_microseconds(&self, cgroup_fd: i32) -> Result<u64>;

    /// Blocks until the child identified by `pid`/`pidfd` exits, returning
    /// its terminal status (§4.7's exit semantics). The privileged spawn
    /// service owns the real pidfd and reaps the child; this call only
    /// waits for its report.
    async fn wait(&self, pid: u32, pidfd: i32) -> Result<WaitResult>;

    /// Asks the spawn service to terminate the child identified by
    /// `pid`/`pidfd` (§4.7's timeout clause: "Timeout" kills the child
    /// before recording the result).
    async fn kill(&self, pid: u32, pidfd: i32) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WireRequest {
    Spawn(PreparedChildProcess),
    CpuUsage { cgroup_fd: i32 },
    Wait { pid: u32, pidfd: i32 },
    Kill { pid: u32, pidfd: i32 },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
enum WireResponse {
    Spawned(SpawnedChild),
    CpuUsage { microseconds: u64 },
    Waited(WaitResult),
    Killed,
    Error { message: String },
}

/// Thin client for an external spawn-server process reached over one
/// `AF_UNIX` socket per request (§5: "the in-daemon client maintains no
/// locking, only a socket to that process"). Frames are length-prefixed
/// JSON; the privileged side of the protocol (namespace/cgroup/rlimit
/// application, `SCM_RIGHTS` fd handoff) lives entirely in that external
/// process and is out of scope here.
pub struct UnixSocketSpawnService {
    socket_path: PathBuf,
}

impl UnixSocketSpawnService {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self { socket_path: socket_path.into() }
    }

    async fn roundtrip(&self, request: &WireRequest) -> Result<WireResponse> {
        let mut stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|e| SpawnError::Unavailable(e.to_string()))?;

        let body = serde_json::to_vec(request).map_err(|e| SpawnError::Request(e.to_string()))?;
        stream
            .write_all(&(body.len() as u32).to_be_bytes())
            .await
            .map_err(|e| SpawnError::Request(e.to_string()))?;
        stream.write_all(&body).await.map_err(|e| SpawnError::Request(e.to_string()))?;

        let mut len_buf = [0u8; 4];
        stream.read_exact(&mut len_buf).await.map_err(|e| SpawnError::Request(e.to_string()))?;
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut response_buf = vec![0u8; len];
        stream.read_exact(&mut response_buf).await.map_err(|e| SpawnError::Request(e.to_string()))?;

        serde_json::from_slice(&response_buf).map_err(|e| SpawnError::Request(e.to_string()).into())
    }
}

#[async_trait]
impl SpawnService for UnixSocketSpawnService {
    async fn spawn(&self, request: PreparedChildProcess) -> Result<SpawnedChild> {
        match self.roundtrip(&WireRequest::Spawn(request)).await? {
            WireResponse::Spawned(child) => Ok(child),
            WireResponse::Error { message } => Err(SpawnError::Request(message).into()),
            other => Err(SpawnError::Request(format!("unexpected response to spawn: {other:?}")).into()),
        }
    }

    async fn read_cpu_usage_microseconds(&self, cgroup_fd: i32) -> Result<u64> {
        match self.roundtrip(&WireRequest::CpuUsage { cgroup_fd }).await? {
            WireResponse::CpuUsage { microseconds } => Ok(microseconds),
            WireResponse::Error { message } => Err(SpawnError::Request(message).into()),
            other => Err(SpawnError::Request(format!("unexpected response to cpu usage query: {other:?}")).into()),
        }
    }

    async fn wait(&self, pid: u32, pidfd: i32) -> Result<WaitResult> {
        match self.roundtrip(&WireRequest::Wait { pid, pidfd }).await? {
            WireResponse::Waited(result) => Ok(result),
            WireResponse::Error { message } => Err(SpawnError::Request(message).into()),
            other => Err(SpawnError::Request(format!("unexpected response to wait: {other:?}")).into()),
        }
    }

    async fn kill(&self, pid: u32, pidfd: i32) -> Result<()> {
        match self.roundtrip(&WireRequest::Kill { pid, pidfd }).await? {
            WireResponse::Killed => Ok(()),
            WireResponse::Error { message } => Err(SpawnError::Request(message).into()),
            other => Err(SpawnError::Request(format!("unexpected response to kill: {other:?}")).into()),
        }
    }
}
