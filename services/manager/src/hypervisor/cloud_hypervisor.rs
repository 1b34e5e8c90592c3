//! cloud-hypervisor driver.
//!
//! The primary VMM. One process per guest, controlled over
//! `/api/v1/...` on a Unix socket: `vm.create` takes the whole machine
//! description as JSON, `vm.boot` starts it, and snapshot/restore move the
//! guest to and from a directory URL. The guest serial console goes to
//! `logs/app.log` via the VMM's file mode; the process's own output goes
//! to `logs/vmm.log`.

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

const PING: &str = "/api/v1/vmm.ping";

/// VM description for `vm.create`.
#[derive(Debug, Serialize)]
struct VmConfig {
    cpus: CpusConfig,
    memory: MemoryConfig,
    payload: PayloadConfig,
    disks: Vec<DiskConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    net: Vec<NetConfig>,
    vsock: VsockDeviceConfig,
    serial: ConsoleConfig,
    console: ConsoleConfig,
}

#[derive(Debug, Serialize)]
struct CpusConfig {
    boot_vcpus: u32,
    max_vcpus: u32,
}

#[derive(Debug, Serialize)]
struct MemoryConfig {
    size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    hotplug_size: Option<u64>,
}

#[derive(Debug, Serialize)]
struct PayloadConfig {
    kernel: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    initramfs: Option<PathBuf>,
    cmdline: String,
}

#[derive(Debug, Serialize)]
struct DiskConfig {
    path: PathBuf,
    readonly: bool,
}

#[derive(Debug, Serialize)]
struct NetConfig {
    tap: String,
    mac: String,
}

#[derive(Debug, Serialize)]
struct VsockDeviceConfig {
    cid: u32,
    socket: PathBuf,
}

#[derive(Debug, Serialize)]
struct ConsoleConfig {
    mode: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    file: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
struct SnapshotConfig {
    destination_url: String,
}

#[derive(Debug, Serialize)]
struct RestoreConfig {
    source_url: String,
}

/// Builds the `vm.create` body for a spec.
fn build_vm_config(spec: &GuestSpec) -> VmConfig {
    let mut disks = vec![
        DiskConfig {
            path: spec.rootfs.clone(),
            readonly: true,
        },
        DiskConfig {
            path: spec.overlay.clone(),
            readonly: false,
        },
        DiskConfig {
            path: spec.config_disk.clone(),
            readonly: true,
        },
    ];
    disks.extend(spec.extra_disks.iter().map(|path| DiskConfig {
        path: path.clone(),
        readonly: false,
    }));

    VmConfig {
        cpus: CpusConfig {
            boot_vcpus: spec.vcpus,
            max_vcpus: spec.vcpus,
        },
        memory: MemoryConfig {
            size: spec.memory_bytes,
            hotplug_size: (spec.hotplug_bytes > 0).then_some(spec.hotplug_bytes),
        },
        payload: PayloadConfig {
            kernel: spec.kernel.clone(),
            initramfs: spec.initrd.clone(),
            cmdline: spec.cmdline.clone(),
        },
        disks,
        net: spec
            .net
            .iter()
            .map(|net| NetConfig {
                tap: net.tap.clone(),
                mac: net.mac.clone(),
            })
            .collect(),
        vsock: VsockDeviceConfig {
            cid: spec.vsock_cid,
            socket: spec.vsock_socket.clone(),
        },
        serial: ConsoleConfig {
            mode: "File",
            file: Some(spec.console_log.clone()),
        },
        console: ConsoleConfig {
            mode: "Off",
            file: None,
        },
    }
}

/// Driver for cloud-hypervisor.
pub struct CloudHypervisorDriver {
    binary: PathBuf,
}

impl CloudHypervisorDriver {
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
            .arg("--api-socket")
            .arg(&spec.api_socket)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| DriverError::Spawn(format!("{}: {e}", self.binary.display())))?;

        let pid = child
            .id()
            .ok_or_else(|| DriverError::Spawn("VMM exited immediately".to_string()))?;

        let client = Self::client(&spec.api_socket);
        if let Err(e) = wait_for_socket(&client, PING, spec.launch_timeout).await {
            let _ = kill_and_reap(pid, Duration::from_secs(5)).await;
            return Err(e);
        }
        Ok(pid)
    }
}

#[async_trait]
impl Driver for CloudHypervisorDriver {
    fn kind(&self) -> HypervisorKind {
        HypervisorKind::CloudHypervisor
    }

    async fn launch(&self, spec: &GuestSpec) -> Result<u32, DriverError> {
        let pid = self.spawn_vmm(spec).await?;
        let client = Self::client(&spec.api_socket);

        let boot = async {
            match &spec.restore_from {
                Some(snapshot_dir) => {
                    let restore = RestoreConfig {
                        source_url: format!("file://{}", snapshot_dir.display()),
                    };
                    client.put("/api/v1/vm.restore", &restore).await?;
                    client.put_empty("/api/v1/vm.resume").await?;
                }
                None => {
                    let config = build_vm_config(spec);
                    client.put("/api/v1/vm.create", &config).await?;
                    client.put_empty("/api/v1/vm.boot").await?;
                }
            }
            Ok::<(), DriverError>(())
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
            "cloud-hypervisor guest running"
        );
        Ok(pid)
    }

    async fn pause(&self, handle: &GuestHandle) -> Result<(), DriverError> {
        Self::client(&handle.api_socket)
            .put_empty("/api/v1/vm.pause")
            .await
            .map_err(Into::into)
    }

    async fn resume(&self, handle: &GuestHandle) -> Result<(), DriverError> {
        Self::client(&handle.api_socket)
            .put_empty("/api/v1/vm.resume")
            .await
            .map_err(Into::into)
    }

    async fn snapshot(&self, handle: &GuestHandle, dest: &Path) -> Result<(), DriverError> {
        std::fs::create_dir_all(dest)?;
        let config = SnapshotConfig {
            destination_url: format!("file://{}", dest.display()),
        };
        Self::client(&handle.api_socket)
            .put("/api/v1/vm.snapshot", &config)
            .await
            .map_err(Into::into)
    }

    async fn shutdown(&self, handle: &GuestHandle, grace: Duration) -> Result<(), DriverError> {
        let client = Self::client(&handle.api_socket);
        match client.put_empty("/api/v1/vm.shutdown").await {
            Ok(()) => debug!(socket = %handle.api_socket.display(), "guest shutdown requested"),
            Err(e) => debug!(socket = %handle.api_socket.display(), error = %e, "shutdown call failed, will kill"),
        }
        // Ask the VMM itself to exit once the guest is down.
        let _ = client.put_empty("/api/v1/vmm.shutdown").await;

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
        client.get_ok(PING).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hypeman_id::InstanceId;

    fn spec() -> GuestSpec {
        GuestSpec {
            instance_id: InstanceId::parse("9f8a3c21d4e5b6a7f0c1d2e3").unwrap(),
            vcpus: 2,
            memory_bytes: 512 << 20,
            hotplug_bytes: 1 << 30,
            kernel: PathBuf::from("/var/lib/hypeman/system/kernel"),
            initrd: None,
            cmdline: "console=ttyS0 root=/dev/vda ro".to_string(),
            rootfs: PathBuf::from("/images/alpine/rootfs.ext4"),
            overlay: PathBuf::from("/guests/x/overlay.raw"),
            config_disk: PathBuf::from("/guests/x/config.ext4"),
            extra_disks: vec![PathBuf::from("/volumes/v/data.raw")],
            net: Some(super::super::NetSpec {
                tap: "hype-9f8a3c21".to_string(),
                mac: "02:00:00:11:22:33".to_string(),
            }),
            vsock_cid: 1234,
            vsock_socket: PathBuf::from("/guests/x/vsock.sock"),
            api_socket: PathBuf::from("/guests/x/cloud-hypervisor.sock"),
            vmm_log: PathBuf::from("/guests/x/logs/vmm.log"),
            console_log: PathBuf::from("/guests/x/logs/app.log"),
            restore_from: None,
            launch_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn vm_config_shape() {
        let config = build_vm_config(&spec());
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["cpus"]["boot_vcpus"], 2);
        assert_eq!(json["memory"]["size"], 512u64 << 20);
        assert_eq!(json["memory"]["hotplug_size"], 1u64 << 30);
        // Root disk first and read-only, overlay second and writable.
        assert_eq!(json["disks"][0]["readonly"], true);
        assert_eq!(json["disks"][1]["readonly"], false);
        assert_eq!(json["disks"][2]["readonly"], true);
        assert_eq!(json["disks"][3]["path"], "/volumes/v/data.raw");
        assert_eq!(json["net"][0]["tap"], "hype-9f8a3c21");
        assert_eq!(json["vsock"]["cid"], 1234);
        assert_eq!(json["serial"]["mode"], "File");
        assert_eq!(json["console"]["mode"], "Off");
    }

    #[test]
    fn hotplug_zero_is_omitted() {
        let mut s = spec();
        s.hotplug_bytes = 0;
        let json = serde_json::to_value(build_vm_config(&s)).unwrap();
        assert!(json["memory"].get("hotplug_size").is_none());
    }

    #[test]
    fn no_net_renders_empty() {
        let mut s = spec();
        s.net = None;
        let json = serde_json::to_value(build_vm_config(&s)).unwrap();
        assert!(json.get("net").is_none());
    }
}
