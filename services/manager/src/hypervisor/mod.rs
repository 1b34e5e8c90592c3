//! Hypervisor drivers.
//!
//! The instance manager picks a driver per instance and records the choice
//! in metadata, so control-plane calls after a daemon restart dispatch to
//! the implementation that launched the guest. Both drivers spawn the VMM
//! as a child process with a REST control socket and an ext4 disk chain of
//! root + overlay + config disk; they differ only in API dialect and
//! snapshot mechanics.

pub mod api;
pub mod cloud_hypervisor;
pub mod firecracker;

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::UnixStream;
use tracing::{debug, warn};

use hypeman_id::InstanceId;

use crate::error::Error;

pub use api::ApiError;
pub use cloud_hypervisor::CloudHypervisorDriver;
pub use firecracker::FirecrackerDriver;

/// Which VMM runs an instance. Persisted in instance metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HypervisorKind {
    #[serde(rename = "cloud-hypervisor")]
    CloudHypervisor,
    #[serde(rename = "firecracker")]
    Firecracker,
}

impl HypervisorKind {
    /// The name used for the control socket file and in metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CloudHypervisor => "cloud-hypervisor",
            Self::Firecracker => "firecracker",
        }
    }
}

impl std::fmt::Display for HypervisorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for HypervisorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cloud-hypervisor" => Ok(Self::CloudHypervisor),
            "firecracker" => Ok(Self::Firecracker),
            other => Err(format!("unknown hypervisor {other:?}")),
        }
    }
}

/// Errors from driver operations.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("control API error: {0}")]
    Api(#[from] ApiError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn VMM: {0}")]
    Spawn(String),

    #[error("VMM did not answer on its control socket within {0:?}")]
    BootTimeout(Duration),

    #[error("guest did not stop within the grace period")]
    StopTimeout,
}

impl From<DriverError> for Error {
    fn from(err: DriverError) -> Self {
        Error::HypervisorUnavailable(err.to_string())
    }
}

/// Guest NIC wiring.
#[derive(Debug, Clone)]
pub struct NetSpec {
    pub tap: String,
    pub mac: String,
}

/// Everything a driver needs to launch one guest.
#[derive(Debug, Clone)]
pub struct GuestSpec {
    pub instance_id: InstanceId,
    pub vcpus: u32,
    pub memory_bytes: u64,
    /// Extra memory made hot-pluggable, zero to disable.
    pub hotplug_bytes: u64,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub cmdline: String,
    /// Read-only base root disk.
    pub rootfs: PathBuf,
    /// Writable copy-on-write overlay.
    pub overlay: PathBuf,
    /// Read-only config disk for the in-guest init.
    pub config_disk: PathBuf,
    /// Volume backing files, attached after the fixed disks.
    pub extra_disks: Vec<PathBuf>,
    pub net: Option<NetSpec>,
    pub vsock_cid: u32,
    pub vsock_socket: PathBuf,
    pub api_socket: PathBuf,
    /// VMM process stdout/stderr.
    pub vmm_log: PathBuf,
    /// Guest serial console.
    pub console_log: PathBuf,
    /// Restore from this snapshot instead of cold-booting.
    pub restore_from: Option<PathBuf>,
    /// Deadline for the control socket to come up.
    pub launch_timeout: Duration,
}

/// A launched guest as seen by control-plane calls.
#[derive(Debug, Clone)]
pub struct GuestHandle {
    pub api_socket: PathBuf,
    pub pid: Option<u32>,
}

/// VMM lifecycle operations.
#[async_trait]
pub trait Driver: Send + Sync {
    /// The variant this driver implements.
    fn kind(&self) -> HypervisorKind;

    /// Spawns the VMM, boots (or restores) the guest, and returns the PID.
    async fn launch(&self, spec: &GuestSpec) -> Result<u32, DriverError>;

    /// Pauses guest vcpus.
    async fn pause(&self, handle: &GuestHandle) -> Result<(), DriverError>;

    /// Resumes a paused guest.
    async fn resume(&self, handle: &GuestHandle) -> Result<(), DriverError>;

    /// Writes a full snapshot (memory + device state) into `dest`.
    async fn snapshot(&self, handle: &GuestHandle, dest: &Path) -> Result<(), DriverError>;

    /// Gracefully stops the guest, escalating to SIGKILL after `grace`.
    async fn shutdown(&self, handle: &GuestHandle, grace: Duration) -> Result<(), DriverError>;

    /// Non-fatal liveness probe used by reconciliation.
    async fn is_alive(&self, handle: &GuestHandle) -> bool;
}

/// Selects the driver implementation for a variant tag.
pub fn driver_for(
    kind: HypervisorKind,
    cloud_hypervisor_bin: &Path,
    firecracker_bin: &Path,
) -> Box<dyn Driver> {
    match kind {
        HypervisorKind::CloudHypervisor => {
            Box::new(CloudHypervisorDriver::new(cloud_hypervisor_bin.to_path_buf()))
        }
        HypervisorKind::Firecracker => {
            Box::new(FirecrackerDriver::new(firecracker_bin.to_path_buf()))
        }
    }
}

/// Dials a guest vsock port through the VMM's Unix-socket multiplex.
///
/// Both VMMs speak the same host-side handshake: connect to the vsock
/// Unix socket, send `CONNECT <port>\n`, and wait for `OK <assigned>\n`.
/// Retries cover the window where the guest service is still starting.
pub async fn vsock_dial(
    vsock_socket: &Path,
    port: u32,
    attempts: u32,
) -> Result<UnixStream, DriverError> {
    let mut last_err: Option<std::io::Error> = None;

    for attempt in 0..attempts.max(1) {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        match try_vsock_dial(vsock_socket, port).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(socket = %vsock_socket.display(), port, attempt, error = %e, "vsock dial failed");
                last_err = Some(e);
            }
        }
    }

    Err(DriverError::Io(last_err.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "vsock dial failed")
    })))
}

async fn try_vsock_dial(vsock_socket: &Path, port: u32) -> std::io::Result<UnixStream> {
    use tokio::io::AsyncReadExt;

    let mut stream = UnixStream::connect(vsock_socket).await?;
    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await?;

    // Response is a single `OK <n>\n` line.
    let mut line = Vec::with_capacity(16);
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "vsock handshake closed",
            ));
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > 64 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "vsock handshake response too long",
            ));
        }
    }

    if line.starts_with(b"OK ") {
        Ok(stream)
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            format!("vsock handshake rejected: {}", String::from_utf8_lossy(&line)),
        ))
    }
}

/// Waits for a spawned VMM to answer on its control socket.
pub(crate) async fn wait_for_socket(
    client: &api::ApiClient,
    ping_path: &str,
    timeout: Duration,
) -> Result<(), DriverError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if client.get_ok(ping_path).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::BootTimeout(timeout));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Force-kills a VMM process and waits for it to disappear.
pub(crate) async fn kill_and_reap(pid: u32, timeout: Duration) -> Result<(), DriverError> {
    // The process may not be our child after a daemon restart, so signal by
    // pid and poll /proc instead of waitpid.
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }

    let deadline = tokio::time::Instant::now() + timeout;
    while process_exists(pid) {
        if tokio::time::Instant::now() >= deadline {
            return Err(DriverError::StopTimeout);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Ok(())
}

/// Whether a pid refers to a live process.
pub(crate) fn process_exists(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

/// Waits until a process exits or the deadline passes. Returns true if it
/// exited in time.
pub(crate) async fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while process_exists(pid) {
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    true
}

/// Removes a stale control socket before a fresh launch.
pub(crate) fn remove_stale_socket(path: &Path) {
    if path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(socket = %path.display(), error = %e, "stale socket removal failed");
        }
    }
}

/// In-memory driver for tests: "launch" creates the control socket path as
/// a plain file, shutdown removes it, snapshot writes a config marker.
/// This is enough for state derivation and lifecycle tests to run without
/// KVM.
#[derive(Debug, Default)]
pub struct MockDriver {
    /// When set, every launch fails after creating nothing.
    pub fail_launches: bool,
}

impl MockDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail_launches: true,
        }
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::CloudHypervisor
    }

    async fn launch(&self, spec: &GuestSpec) -> Result<u32, DriverError> {
        if self.fail_launches {
            return Err(DriverError::Spawn("mock driver configured to fail".to_string()));
        }
        if let Some(parent) = spec.api_socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&spec.api_socket, b"")?;
        Ok(std::process::id())
    }

    async fn pause(&self, _handle: &GuestHandle) -> Result<(), DriverError> {
        Ok(())
    }

    async fn resume(&self, _handle: &GuestHandle) -> Result<(), DriverError> {
        Ok(())
    }

    async fn snapshot(&self, _handle: &GuestHandle, dest: &Path) -> Result<(), DriverError> {
        std::fs::create_dir_all(dest)?;
        std::fs::write(dest.join("config.json"), b"{}")?;
        Ok(())
    }

    async fn shutdown(&self, handle: &GuestHandle, _grace: Duration) -> Result<(), DriverError> {
        if handle.api_socket.exists() {
            std::fs::remove_file(&handle.api_socket)?;
        }
        Ok(())
    }

    async fn is_alive(&self, handle: &GuestHandle) -> bool {
        handle.api_socket.exists()
    }
}
