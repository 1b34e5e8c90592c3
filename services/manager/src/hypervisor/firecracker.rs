//! firecracker driver.
//!
//! The alternate VMM. Configuration is incremental: each device is PUT to
//! its own endpoint before `InstanceStart`. Snapshots pause the guest,
//! write `config.json` (the VM state file) plus a memory file into the
//! snapshot directory, and are restored with `/snapshot/load`.
//!
//! Reference: https://github.com/firecracker-microvm/firecracker/blob/main/src/firecracker/swagger/firecracker.yaml

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::api::ApiClient;
use super::{
    kill_and_reap, remove_stale_socket, wait_for_exit, wait_for_socket, Driver, DriverError,
    GuestHandle, GuestSpec, HypervisorKind,
};

const SNAPSHOT_STATE_FILE: &str = "config.json";
const SNAPSHOT_MEM_FILE: &str = "memory.snap";

#[derive(Debug, Serialize)]
struct MachineConfig {
    vcpu_count: u32,
    mem_size_mib: u64,
    smt: bool,
}

#[derive(Debug, Serialize)]
struct BootSource {
    kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    initrd_path: Option<PathBuf>,
    boot_args: String,
}

#[derive(Debug, Serialize)]
struct DriveConfig {
    drive_id: String,
    path_on_host: PathBuf,
    is_root_device: bool,
    is_read_only: bool,
}

#[derive(Debug, Serialize)]
struct NetworkInterface {
    iface_id: String,
    host_dev_name: String,
    guest_mac: String,
}

#[derive(Debug, Serialize)]
struct VsockDevice {
    guest_cid: u32,
    uds_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct Action {
    action_type: &'static str,
}

#[derive(Debug, Serialize)]
struct VmState {
    state: &'static str,
}

#[derive(Debug, Serialize)]
struct SnapshotCreate {
    snapshot_path: PathBuf,
    mem_file_path: PathBuf,
}

#[derive(Debug, Serialize)]
struct SnapshotLoad {
    snapshot_path: PathBuf,
    mem_backend: MemBackend,
    resume_vm: bool,
}

#[derive(Debug, Serialize)]
struct MemBackend {
    backend_type: &'static str,
    backend_path: PathBuf,
}

/// The drive chain for a spec: root (read-only), overlay, config disk,
/// then volumes.
fn drive_configs(spec: &GuestSpec) -> Vec<DriveConfig> {
    let mut drives = vec![
        DriveConfig {
            drive_id: "rootfs".to_string(),
            path_on_host: spec.rootfs.clone(),
            is_root_device: true,
            is_read_only: true,
        },
        DriveConfig {
            drive_id: "overlay".to_string(),
            path_on_host: spec.overlay.clone(),
            is_root_device: false,
            is_read_only: false,
        },
        DriveConfig {
            drive_id: "config".to_string(),
            path_on_host: spec.config_disk.clone(),
            is_root_device: false,
            is_read_only: true,
        },
    ];
    for (i, path) in spec.extra_disks.iter().enumerate() {
        drives.push(DriveConfig {
            drive_id: format!("vol-{i}"),
            path_on_host: path.clone(),
            is_root_device: false,
            is_read_only: false,
        });
    }
    drives
}

/// Driver for firecracker.
pub struct FirecrackerDriver {
    binary: PathBuf,
}

impl FirecrackerDriver {
    /// Creates a driver invoking the given binary.
    pub fn new(binary: PathBuf) -> Self {
        Self { binary }
    }

    fn client(socket: &Path) -> ApiClient {
        ApiClient::new(socket)
    }

    async fn spawn_vmm(&self, spec: &GuestSpec) -> Result<u32, DriverError> {
        remove_stale_socket(&spec.api_socket);

        if let Some(parent) = spec.vmm_log.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.vmm_log)?;
        let log_err = log.try_clone()?;

        let child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(&spec.api_socket)
            .arg("--id")
            .arg(spec.instance_id.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| DriverError::Spawn("VMM exited immediately".to_string()))?;

        let client = Self::client(&spec.api_socket);
        if let Err(e) = wait_for_socket(&client, "/", spec.launch_timeout).await {
            let _ = kill_and_reap(pid, Duration::from_secs(5)).await;
            return Err(e);
        }
        Ok(pid)
    }

    async fn configure_and_start(
        client: &ApiClient,
        spec: &GuestSpec,
    ) -> Result<(), DriverError> {
        let machine = MachineConfig {
            vcpu_count: spec.vcpus,
            mem_size_mib: (spec.memory_bytes / (1024 * 1024)).max(128),
            smt: false,
        };
        client.put("/machine-config", &machine).await?;

        let boot = BootSource {
            kernel_image_path: spec.kernel.clone(),
            initrd_path: spec.initrd.clone(),
            boot_args: spec.cmdline.clone(),
        };
        client.put("/boot-source", &boot).await?;

        for drive in drive_configs(spec) {
            let path = format!("/drives/{}", drive.drive_id);
            client.put(&path, &drive).await?;
        }

        if let Some(net) = &spec.net {
            let iface = NetworkInterface {
                iface_id: "eth0".to_string(),
                host_dev_name: net.tap.clone(),
                guest_mac: net.mac.clone(),
            };
            client.put("/network-interfaces/eth0", &iface).await?;
        }

        let vsock = VsockDevice {
            guest_cid: spec.vsock_cid,
            uds_path: spec.vsock_socket.clone(),
        };
        client.put("/vsock", &vsock).await?;

        client
            .put(
                "/actions",
                &Action {
                    action_type: "InstanceStart",
                },
            )
            .await?;
        Ok(())
    }

    async fn load_snapshot(
        client: &ApiClient,
        snapshot_dir: &Path,
    ) -> Result<(), DriverError> {
        let load = SnapshotLoad {
            snapshot_path: snapshot_dir.join(SNAPSHOT_STATE_FILE),
            mem_backend: MemBackend {
                backend_type: "File",
                backend_path: snapshot_dir.join(SNAPSHOT_MEM_FILE),
            },
            resume_vm: true,
        };
        client.put("/snapshot/load", &load).await?;
        Ok(())
    }
}

#[async_trait]
impl Driver for FirecrackerDriver {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::Firecracker
    }

    async fn launch(&self, spec: &GuestSpec) -> Result<u32, DriverError> {
        let pid = self.spawn_vmm(spec).await?;
        let client = Self::client(&spec.api_socket);

        let boot = async {
            match &spec.restore_from {
                Some(snapshot_dir) => Self::load_snapshot(&client, snapshot_dir).await,
                None => Self::configure_and_start(&client, spec).await,
            }
        };

        if let Err(e) = boot.await {
            warn!(instance_id = %spec.instance_id, error = %e, "boot failed, reaping VMM");
            let _ = kill_and_reap(pid, Duration::from_secs(5)).await;
            return Err(e);
        }

        info!(
            instance_id = %spec.instance_id,
            pid,
            restored = spec.restore_from.is_some(),
            "firecracker guest running"
        );
        Ok(pid)
    }

    async fn pause(&self, handle: &GuestHandle) -> Result<(), DriverError> {
        Self::client(&handle.api_socket)
            .patch("/vm", &VmState { state: "Paused" })
            .await
            .map_err(Into::into)
    }

    async fn resume(&self, handle: &GuestHandle) -> Result<(), DriverError> {
        Self::client(&handle.api_socket)
            .patch("/vm", &VmState { state: "Resumed" })
            .await
            .map_err(Into::into)
    }

    async fn snapshot(&self, handle: &GuestHandle, dest: &Path) -> Result<(), DriverError> {
        std::fs::create_dir_all(dest)?;
        let create = SnapshotCreate {
            snapshot_path: dest.join(SNAPSHOT_STATE_FILE),
            mem_file_path: dest.join(SNAPSHOT_MEM_FILE),
        };
        Self::client(&handle.api_socket)
            .put("/snapshot/create", &create)
            .await
            .map_err(Into::into)
    }

    async fn shutdown(&self, handle: &GuestHandle, grace: Duration) -> Result<(), DriverError> {
        let client = Self::client(&handle.api_socket);
        match client
            .put(
                "/actions",
                &Action {
                    action_type: "SendCtrlAltDel",
                },
            )
            .await
        {
            Ok(()) => debug!(socket = %handle.api_socket.display(), "sent CtrlAltDel"),
            Err(e) => debug!(socket = %handle.api_socket.display(), error = %e, "CtrlAltDel failed, will kill"),
        }

        let Some(pid) = handle.pid else {
            return Ok(());
        };
        if wait_for_exit(pid, grace).await {
            return Ok(());
        }
        warn!(pid, "grace period expired, sending SIGKILL");
        kill_and_reap(pid, Duration::from_secs(5)).await
    }

    async fn is_alive(&self, handle: &GuestHandle) -> bool {
        let client = Self::client(&handle.api_socket);
        if !client.socket_exists() {
            return false;
        }
        client.get_ok("/").await.is_ok()
    }
}
