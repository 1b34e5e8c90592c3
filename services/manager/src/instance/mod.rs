//! Instance manager: assembles guests and drives their lifecycle.
//!
//! `create` blocks until the guest is Running or every partial step has
//! been rolled back. Per-instance operations serialize on a keyed mutex
//! (standby and restore on the same guest cannot interleave); different
//! guests proceed in parallel. Live state is always derived from the host
//! (control socket, snapshot directory), never trusted from metadata
//! alone.

pub mod config_disk;
pub mod logs;
pub mod state;

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex as StdMutex};

use rand::rngs::StdRng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use hypeman_id::InstanceId;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hypervisor::{
    self, Driver, GuestHandle, GuestSpec, HypervisorKind, MockDriver, NetSpec,
};
use crate::image::{ImageManager, ImageStatus};
use crate::network::NetworkManager;
use crate::oci::store::write_atomic;
use crate::oci::Reference;
use crate::paths::{LogSource, Paths};
use crate::resources::Accounting;

pub use config_disk::{GuestBootConfig, GuestNetwork};
pub use logs::LogStream;
pub use state::{InstanceMetadata, InstanceState, VolumeAttachment};

const DEFAULT_CMDLINE: &str = "console=ttyS0 reboot=k panic=1 root=/dev/vda ro";
/// Attempts when dialing the guest agent during boot.
const VSOCK_DIAL_ATTEMPTS: u32 = 25;

/// Builds a driver for a variant tag. Swappable so lifecycle tests run
/// against `MockDriver` instead of real VMMs.
pub type DriverFactory = dyn Fn(HypervisorKind) -> Box<dyn Driver> + Send + Sync;

/// What a caller asks for.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: Option<String>,
    pub image: String,
    /// Guest memory in bytes.
    pub size: u64,
    pub vcpus: u32,
    /// Overlay disk size in bytes.
    pub overlay_size: u64,
    /// Hot-pluggable memory in bytes, zero to disable.
    pub hotplug_size: u64,
    pub env: HashMap<String, String>,
    pub network_enabled: bool,
    /// Hypervisor override; the daemon default applies when unset.
    pub hypervisor: Option<HypervisorKind>,
    pub volumes: Vec<VolumeAttachment>,
}

/// An instance as reported to callers: persisted metadata with the state
/// replaced by the derived live state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Instance {
    #[serde(flatten)]
    pub metadata: InstanceMetadata,
}

impl Instance {
    /// The instance id.
    pub fn id(&self) -> &InstanceId {
        &self.metadata.id
    }

    /// Current (derived) state.
    pub fn state(&self) -> InstanceState {
        self.metadata.state
    }
}

/// The orchestrator.
pub struct InstanceManager {
    paths: Paths,
    config: Config,
    images: Arc<ImageManager>,
    network: Arc<NetworkManager>,
    accounting: Arc<Accounting>,
    clock: Arc<dyn Clock>,
    driver_factory: Box<DriverFactory>,
    rng: StdMutex<StdRng>,
    /// Per-instance operation locks; standby/restore/delete on one guest
    /// serialize here.
    op_locks: StdMutex<HashMap<InstanceId, Arc<Mutex<()>>>>,
}

impl InstanceManager {
    /// Creates the manager with the production driver factory.
    pub fn new(
        paths: Paths,
        config: Config,
        images: Arc<ImageManager>,
        network: Arc<NetworkManager>,
        accounting: Arc<Accounting>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Arc<Self> {
        let ch_bin = config.cloud_hypervisor_bin.clone();
        let fc_bin = config.firecracker_bin.clone();
        let factory: Box<DriverFactory> =
            Box::new(move |kind| hypervisor::driver_for(kind, &ch_bin, &fc_bin));
        Self::with_driver_factory(paths, config, images, network, accounting, clock, rng, factory)
    }

    /// Creates the manager with a mock driver (tests and dry runs).
    pub fn with_mock_driver(
        paths: Paths,
        config: Config,
        images: Arc<ImageManager>,
        network: Arc<NetworkManager>,
        accounting: Arc<Accounting>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
    ) -> Arc<Self> {
        let factory: Box<DriverFactory> = Box::new(|_| Box::new(MockDriver::new()));
        Self::with_driver_factory(paths, config, images, network, accounting, clock, rng, factory)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn with_driver_factory(
        paths: Paths,
        config: Config,
        images: Arc<ImageManager>,
        network: Arc<NetworkManager>,
        accounting: Arc<Accounting>,
        clock: Arc<dyn Clock>,
        rng: StdRng,
        driver_factory: Box<DriverFactory>,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            config,
            images,
            network,
            accounting,
            clock,
            driver_factory,
            rng: StdMutex::new(rng),
            op_locks: StdMutex::new(HashMap::new()),
        })
    }

    fn driver(&self, kind: HypervisorKind) -> Box<dyn Driver> {
        (self.driver_factory)(kind)
    }

    fn op_lock(&self, id: &InstanceId) -> Arc<Mutex<()>> {
        let mut locks = self.op_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    /// Creates an instance and blocks until it is Running (or fully rolled
    /// back).
    pub async fn create(&self, request: CreateRequest) -> Result<Instance> {
        // 1. Validation: Ready image, policy limits, sane volumes.
        let image = self.images.get(&request.image)?;
        if image.metadata.status != ImageStatus::Ready {
            return Err(Error::ImageNotReady {
                name: request.image.clone(),
                status: image.metadata.status.to_string(),
            });
        }
        self.validate_request(&request)?;

        let image_reference = Reference::parse(&image.metadata.name)
            .map_err(|e| Error::InvalidName(e.to_string()))?;
        let rootfs = self
            .paths
            .image_rootfs(&image_reference.repository, image.metadata.digest.hex());
        if !rootfs.exists() {
            return Err(Error::Internal(anyhow::anyhow!(
                "image {} is Ready but rootfs is missing",
                request.image
            )));
        }

        // 2. Identity: fresh id, deterministic vsock CID.
        let id = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            InstanceId::generate(&mut *rng)
        };
        let vsock_cid = id.vsock_cid();
        info!(instance_id = %id, image = %request.image, vsock_cid, "creating instance");

        // 3. Aggregate admission under the accounting lock.
        self.accounting.reserve(request.vcpus, request.size, 0)?;

        // Everything after this point must roll back on failure.
        let mut rollback = Rollback::new(self, &id, &request);

        // 4. Network.
        let allocation = if request.network_enabled {
            let rates = self.network.default_rates();
            match self
                .network
                .allocate(&id, request.name.as_deref(), rates)
            {
                Ok(allocation) => {
                    rollback.network_allocated = true;
                    Some(allocation)
                }
                Err(e) => {
                    rollback.run().await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        // 5–7. Disks, metadata, launch.
        let result = self
            .assemble_and_launch(&id, &request, &image.metadata, &rootfs, allocation.as_ref(), vsock_cid)
            .await;

        match result {
            Ok(instance) => Ok(instance),
            Err(e) => {
                error!(instance_id = %id, error = %e, "create failed, rolling back");
                rollback.run().await;
                Err(e)
            }
        }
    }

    async fn assemble_and_launch(
        &self,
        id: &InstanceId,
        request: &CreateRequest,
        image: &crate::image::ImageMetadata,
        rootfs: &std::path::Path,
        allocation: Option<&crate::network::NetworkAllocation>,
        vsock_cid: u32,
    ) -> Result<Instance> {
        let guest_dir = self.paths.guest_dir(id);
        fs::create_dir_all(self.paths.guest_log_dir(id))?;

        // Overlay: sparse, so it costs nothing until the guest writes.
        let overlay_path = self.paths.guest_overlay(id);
        let overlay = fs::File::create(&overlay_path)?;
        overlay.set_len(request.overlay_size)?;
        drop(overlay);

        let network = allocation.map(|a| GuestNetwork {
            ip: a.ip,
            netmask: a.netmask,
            gateway: a.gateway,
            mac: a.mac.clone(),
        });
        let boot_config = GuestBootConfig::assemble(
            format!("hype-{}", id.short()),
            image,
            &request.env,
            network,
        );
        let config_disk_path = self.paths.guest_config_disk(id);
        config_disk::build_config_disk(&config_disk_path, &boot_config)
            .map_err(|e| Error::Internal(anyhow::Error::new(e)))?;

        let hypervisor_type = request.hypervisor.unwrap_or(self.config.hypervisor);
        let mut metadata = InstanceMetadata {
            id: id.clone(),
            name: request.name.clone(),
            image: request.image.clone(),
            size: request.size,
            hotplug_size: request.hotplug_size,
            overlay_size: request.overlay_size,
            vcpus: request.vcpus,
            env: request.env.clone(),
            network_enabled: request.network_enabled,
            ip: allocation.map(|a| a.ip),
            mac: allocation.map(|a| a.mac.clone()),
            vsock_cid,
            vsock_socket: self.paths.guest_vsock_socket(id),
            hypervisor_type,
            pid: None,
            state: InstanceState::Creating,
            has_snapshot: false,
            created_at: self.clock.now(),
            started_at: None,
            stopped_at: None,
            volumes: request.volumes.clone(),
        };
        self.write_metadata(&metadata)?;
        self.log_op(id, "create: assembling guest");

        let spec = self.build_spec(&metadata, rootfs.to_path_buf(), None);
        let driver = self.driver(hypervisor_type);
        let pid = driver.launch(&spec).await?;

        metadata.transition("create", InstanceState::Running)?;
        metadata.pid = Some(pid);
        metadata.started_at = Some(self.clock.now());
        self.write_metadata(&metadata)?;
        self.log_op(id, &format!("create: running (pid {pid})"));

        info!(instance_id = %id, pid, dir = %guest_dir.display(), "instance running");
        Ok(Instance { metadata })
    }

    fn validate_request(&self, request: &CreateRequest) -> Result<()> {
        let limits = self.accounting.limits();
        if request.vcpus == 0 || request.vcpus > limits.max_instance_vcpus {
            return Err(Error::ResourceExhausted(format!(
                "vcpus must be in [1, {}]",
                limits.max_instance_vcpus
            )));
        }
        if request.size == 0 || request.size > limits.max_instance_memory {
            return Err(Error::ResourceExhausted(format!(
                "memory must be in [1, {}] bytes",
                limits.max_instance_memory
            )));
        }
        if request.overlay_size == 0 || request.overlay_size > limits.max_instance_overlay {
            return Err(Error::ResourceExhausted(format!(
                "overlay must be in [1, {}] bytes",
                limits.max_instance_overlay
            )));
        }
        if let Some(name) = &request.name {
            validate_instance_name(name)?;
        }

        let mut mount_paths = std::collections::HashSet::new();
        for attachment in &request.volumes {
            if !self.paths.volume_data(&attachment.volume_id).exists() {
                return Err(Error::not_found(format!(
                    "volume {}",
                    attachment.volume_id
                )));
            }
            if !mount_paths.insert(attachment.mount_path.as_str()) {
                return Err(Error::AlreadyExists(format!(
                    "duplicate mount path {}",
                    attachment.mount_path
                )));
            }
        }
        Ok(())
    }

    fn build_spec(
        &self,
        metadata: &InstanceMetadata,
        rootfs: std::path::PathBuf,
        restore_from: Option<std::path::PathBuf>,
    ) -> GuestSpec {
        let id = &metadata.id;
        let mut volumes = metadata.volumes.clone();
        volumes.sort_by(|a, b| a.volume_id.cmp(&b.volume_id));

        GuestSpec {
            instance_id: id.clone(),
            vcpus: metadata.vcpus,
            memory_bytes: metadata.size,
            hotplug_bytes: metadata.hotplug_size,
            kernel: self.config.kernel_path(&self.paths),
            initrd: self.config.initrd_path(&self.paths),
            cmdline: DEFAULT_CMDLINE.to_string(),
            rootfs,
            overlay: self.paths.guest_overlay(id),
            config_disk: self.paths.guest_config_disk(id),
            extra_disks: volumes
                .iter()
                .map(|v| self.paths.volume_data(&v.volume_id))
                .collect(),
            net: metadata.mac.as_ref().map(|mac| NetSpec {
                tap: crate::network::tap_name(id),
                mac: mac.clone(),
            }),
            vsock_cid: metadata.vsock_cid,
            vsock_socket: metadata.vsock_socket.clone(),
            api_socket: self.api_socket(metadata),
            vmm_log: self.paths.guest_log(id, LogSource::Vmm),
            console_log: self.paths.guest_log(id, LogSource::App),
            restore_from,
            launch_timeout: self.config.launch_timeout,
        }
    }

    fn api_socket(&self, metadata: &InstanceMetadata) -> std::path::PathBuf {
        self.paths
            .guest_api_socket(&metadata.id, metadata.hypervisor_type.as_str())
    }

    fn handle(&self, metadata: &InstanceMetadata) -> GuestHandle {
        GuestHandle {
            api_socket: self.api_socket(metadata),
            pid: metadata.pid,
        }
    }

    /// Looks up by id first, then by name. A name shared by several
    /// instances is `AmbiguousName`.
    pub fn get(&self, id_or_name: &str) -> Result<Instance> {
        if let Ok(id) = InstanceId::parse(id_or_name) {
            if let Some(metadata) = self.load_metadata(&id)? {
                return Ok(self.with_derived_state(metadata));
            }
        }

        let mut matches = Vec::new();
        for metadata in self.scan_metadata() {
            if metadata.name.as_deref() == Some(id_or_name) {
                matches.push(metadata);
            }
        }
        match matches.len() {
            0 => Err(Error::not_found(format!("instance {id_or_name}"))),
            1 => Ok(self.with_derived_state(matches.remove(0))),
            _ => Err(Error::AmbiguousName(id_or_name.to_string())),
        }
    }

    /// Enumerates all guests with derived live state.
    pub fn list(&self) -> Vec<Instance> {
        self.scan_metadata()
            .into_iter()
            .map(|metadata| self.with_derived_state(metadata))
            .collect()
    }

    /// Deletes an instance: stop, release network, free reservations,
    /// remove the guest directory. Idempotent; a missing instance is
    /// `NotFound` and leaves no residue.
    pub async fn delete(&self, id_or_name: &str) -> Result<()> {
        let instance = self.get(id_or_name)?;
        let id = instance.metadata.id.clone();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        // Re-read under the lock; a concurrent delete may have won.
        let Some(mut metadata) = self.load_metadata(&id)? else {
            return Err(Error::not_found(format!("instance {id_or_name}")));
        };

        // A delete interrupted by a crash leaves state Deleting behind;
        // retrying it must succeed, so only transition from other states.
        if metadata.state != InstanceState::Deleting {
            metadata.transition("delete", InstanceState::Deleting)?;
            self.write_metadata(&metadata)?;
        }
        self.log_op(&id, "delete: stopping guest");

        let driver = self.driver(metadata.hypervisor_type);
        let handle = self.handle(&metadata);
        if driver.is_alive(&handle).await {
            if let Err(e) = driver.shutdown(&handle, self.config.shutdown_grace).await {
                warn!(instance_id = %id, error = %e, "shutdown failed during delete");
            }
        }

        if metadata.network_enabled {
            self.network.release(&id);
        }
        self.accounting.release(metadata.vcpus, metadata.size, 0);

        fs::remove_dir_all(self.paths.guest_dir(&id))?;
        self.drop_op_lock(&id);
        info!(instance_id = %id, "instance deleted");
        Ok(())
    }

    /// Suspends a Running guest to disk: pause, snapshot, drop the VMM.
    /// The TAP is deleted but IP/MAC stay reserved in metadata.
    pub async fn standby(&self, id_or_name: &str) -> Result<Instance> {
        let instance = self.get(id_or_name)?;
        let id = instance.metadata.id.clone();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        let mut metadata = self
            .load_metadata(&id)?
            .ok_or_else(|| Error::not_found(format!("instance {id_or_name}")))?;
        let derived = self.derive_state(&metadata);
        if derived != InstanceState::Running {
            return Err(Error::invalid_state("standby", derived));
        }
        metadata.state = InstanceState::Running;
        metadata.transition("standby", InstanceState::Standby)?;

        let driver = self.driver(metadata.hypervisor_type);
        let handle = self.handle(&metadata);
        let snapshot_dir = self.paths.guest_snapshot_dir(&id);

        self.log_op(&id, "standby: pausing");
        driver.pause(&handle).await?;
        if let Err(e) = driver.snapshot(&handle, &snapshot_dir).await {
            // Leave the guest running rather than half-suspended.
            let _ = driver.resume(&handle).await;
            return Err(e.into());
        }
        driver.shutdown(&handle, self.config.shutdown_grace).await?;

        if metadata.network_enabled {
            self.network.detach_tap(&id);
        }

        metadata.pid = None;
        metadata.has_snapshot = true;
        metadata.stopped_at = Some(self.clock.now());
        self.write_metadata(&metadata)?;
        self.log_op(&id, "standby: suspended");

        info!(instance_id = %id, "instance in standby");
        Ok(Instance { metadata })
    }

    /// Resumes a Standby guest from its snapshot with the same IP/MAC.
    pub async fn restore(&self, id_or_name: &str) -> Result<Instance> {
        let instance = self.get(id_or_name)?;
        let id = instance.metadata.id.clone();
        let lock = self.op_lock(&id);
        let _guard = lock.lock().await;

        let mut metadata = self
            .load_metadata(&id)?
            .ok_or_else(|| Error::not_found(format!("instance {id_or_name}")))?;
        let derived = self.derive_state(&metadata);
        if derived != InstanceState::Standby {
            return Err(Error::invalid_state("restore", derived));
        }
        metadata.state = InstanceState::Standby;

        if metadata.network_enabled {
            let (Some(ip), Some(mac)) = (metadata.ip, metadata.mac.clone()) else {
                return Err(Error::Internal(anyhow::anyhow!(
                    "instance {id} has networking enabled but no recorded ip/mac"
                )));
            };
            self.network.recreate(
                &id,
                metadata.name.as_deref(),
                ip,
                &mac,
                self.network.default_rates(),
            )?;
        }

        let image = self.images.get(&metadata.image)?;
        let image_reference = Reference::parse(&image.metadata.name)
            .map_err(|e| Error::InvalidName(e.to_string()))?;
        let rootfs = self
            .paths
            .image_rootfs(&image_reference.repository, image.metadata.digest.hex());

        let snapshot_dir = self.paths.guest_snapshot_dir(&id);
        let spec = self.build_spec(&metadata, rootfs, Some(snapshot_dir));
        let driver = self.driver(metadata.hypervisor_type);

        self.log_op(&id, "restore: launching from snapshot");
        let pid = match driver.launch(&spec).await {
            Ok(pid) => pid,
            Err(e) => {
                if metadata.network_enabled {
                    self.network.detach_tap(&id);
                }
                return Err(e.into());
            }
        };

        metadata.transition("restore", InstanceState::Running)?;
        metadata.pid = Some(pid);
        metadata.started_at = Some(self.clock.now());
        self.write_metadata(&metadata)?;
        self.log_op(&id, &format!("restore: running (pid {pid})"));

        info!(instance_id = %id, pid, "instance restored");
        Ok(Instance { metadata })
    }

    /// Streams a guest log.
    pub fn stream_logs(
        &self,
        id_or_name: &str,
        source: LogSource,
        tail: usize,
        follow: bool,
    ) -> Result<LogStream> {
        let instance = self.get(id_or_name)?;
        let path = self.paths.guest_log(&instance.metadata.id, source);
        logs::stream_log(path, tail, follow).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(format!("log {} for {id_or_name}", source.file_name()))
            } else {
                Error::Internal(anyhow::Error::new(e))
            }
        })
    }

    /// Rotates oversized guest logs across all instances.
    pub fn rotate_logs(&self, max_bytes: u64, max_files: usize) -> Result<usize> {
        let mut rotated = 0;
        for metadata in self.scan_metadata() {
            for source in [LogSource::App, LogSource::Vmm, LogSource::Ops] {
                let path = self.paths.guest_log(&metadata.id, source);
                match logs::rotate_file(&path, max_bytes, max_files) {
                    Ok(true) => rotated += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(instance_id = %metadata.id, log = source.file_name(), error = %e, "rotation failed")
                    }
                }
            }
        }
        Ok(rotated)
    }

    /// Dials the guest agent over vsock.
    pub async fn vsock_dial(
        &self,
        id_or_name: &str,
        port: u32,
    ) -> Result<tokio::net::UnixStream> {
        let instance = self.get(id_or_name)?;
        hypervisor::vsock_dial(&instance.metadata.vsock_socket, port, VSOCK_DIAL_ATTEMPTS)
            .await
            .map_err(Into::into)
    }

    /// Startup reconciliation: re-register reservations and allocations
    /// from metadata without mutating anything, and return the ids whose
    /// guests may still be alive (the preserve set for orphan cleanup).
    pub fn reconcile(&self) -> Vec<InstanceId> {
        let mut preserve = Vec::new();
        for metadata in self.scan_metadata() {
            self.accounting.adopt(metadata.vcpus, metadata.size, 0);
            if let Some(ip) = metadata.ip {
                self.network.adopt(&metadata.id, metadata.name.as_deref(), ip);
            }

            let derived = self.derive_state(&metadata);
            debug!(instance_id = %metadata.id, recorded = %metadata.state, derived = %derived, "reconciled instance");
            if matches!(derived, InstanceState::Running | InstanceState::Unknown) {
                preserve.push(metadata.id.clone());
            }
        }
        preserve
    }

    // ---- state derivation and persistence ----

    fn with_derived_state(&self, mut metadata: InstanceMetadata) -> Instance {
        metadata.state = self.derive_state(&metadata);
        Instance { metadata }
    }

    /// Derives the live state from host facts: a responsive-looking
    /// control socket means Running, a snapshot means Standby, otherwise
    /// Stopped. Contradictions with persisted terminal states surface as
    /// Unknown, with a warning, never a panic.
    fn derive_state(&self, metadata: &InstanceMetadata) -> InstanceState {
        let socket_live = self.api_socket(metadata).exists();
        let snapshot = self
            .paths
            .guest_snapshot_dir(&metadata.id)
            .join("config.json")
            .exists();

        let derived = if socket_live {
            InstanceState::Running
        } else if snapshot {
            InstanceState::Standby
        } else {
            InstanceState::Stopped
        };

        match metadata.state {
            // Transitional or already-uncertain recorded states defer to
            // observation.
            InstanceState::Creating
            | InstanceState::Stopping
            | InstanceState::Deleting
            | InstanceState::Failed
            | InstanceState::Unknown => derived,
            recorded if recorded == derived => derived,
            recorded => {
                warn!(
                    instance_id = %metadata.id,
                    recorded = %recorded,
                    derived = %derived,
                    "metadata disagrees with host state"
                );
                InstanceState::Unknown
            }
        }
    }

    fn load_metadata(&self, id: &InstanceId) -> Result<Option<InstanceMetadata>> {
        let path = self.paths.guest_metadata(id);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn write_metadata(&self, metadata: &InstanceMetadata) -> Result<()> {
        let path = self.paths.guest_metadata(&metadata.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = path.with_extension("json.tmp");
        write_atomic(&temp, &path, &serde_json::to_vec_pretty(metadata)?)?;
        Ok(())
    }

    fn scan_metadata(&self) -> Vec<InstanceMetadata> {
        let Ok(entries) = fs::read_dir(self.paths.guests_dir()) else {
            return Vec::new();
        };
        let mut all = Vec::new();
        for entry in entries.flatten() {
            let Some(id) = entry
                .file_name()
                .to_str()
                .and_then(|name| InstanceId::parse(name).ok())
            else {
                continue;
            };
            match self.load_metadata(&id) {
                Ok(Some(metadata)) => all.push(metadata),
                Ok(None) => {
                    warn!(instance_id = %id, "guest directory without metadata")
                }
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "unreadable guest metadata")
                }
            }
        }
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    /// Appends a line to the instance's ops log. Best-effort.
    fn log_op(&self, id: &InstanceId, message: &str) {
        use std::io::Write as _;
        let path = self.paths.guest_log(id, LogSource::Ops);
        let Some(parent) = path.parent() else { return };
        if fs::create_dir_all(parent).is_err() {
            return;
        }
        let Ok(mut file) = fs::OpenOptions::new().create(true).append(true).open(&path) else {
            return;
        };
        let _ = writeln!(file, "{} {message}", self.clock.now().to_rfc3339());
    }

    fn drop_op_lock(&self, id: &InstanceId) {
        let mut locks = self.op_locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(id);
    }
}

/// Validates a user-facing instance name: DNS-label-ish, 1..=63 chars of
/// lowercase alphanumerics and dashes, no leading/trailing dash.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && !name.starts_with('-')
        && !name.ends_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && InstanceId::parse(name).is_err();
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidName(format!("instance name {name:?}")))
    }
}

/// Tracks which create steps completed, so failure unwinds them in
/// reverse order.
struct Rollback<'a> {
    manager: &'a InstanceManager,
    id: &'a InstanceId,
    request: &'a CreateRequest,
    network_allocated: bool,
}

impl<'a> Rollback<'a> {
    fn new(manager: &'a InstanceManager, id: &'a InstanceId, request: &'a CreateRequest) -> Self {
        Self {
            manager,
            id,
            request,
            network_allocated: false,
        }
    }

    async fn run(&self) {
        if self.network_allocated {
            self.manager.network.release(self.id);
        }
        self.manager
            .accounting
            .release(self.request.vcpus, self.request.size, 0);
        let guest_dir = self.manager.paths.guest_dir(self.id);
        if guest_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&guest_dir) {
                warn!(instance_id = %self.id, error = %e, "rollback could not remove guest dir");
            }
        }
        self.manager.drop_op_lock(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names_follow_label_rules() {
        assert!(validate_instance_name("web").is_ok());
        assert!(validate_instance_name("web-1").is_ok());
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("-web").is_err());
        assert!(validate_instance_name("web-").is_err());
        assert!(validate_instance_name("Web").is_err());
        assert!(validate_instance_name(&"a".repeat(64)).is_err());
        // A name that parses as an instance id would shadow id lookups.
        assert!(validate_instance_name("9f8a3c21d4e5b6a7f0c1d2e3").is_err());
    }
}
