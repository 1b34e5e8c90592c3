//! On-disk layout of the data directory.
//!
//! A pure value object: every accessor maps a logical resource to a path
//! under `data_dir` and performs no I/O. The layout is a compatibility
//! contract; renaming anything here strands artifacts of older daemons.
//!
//! ```text
//! <data_dir>/
//!   system/{kernel,initrd,oci-cache,binaries}
//!   images/<repo>/<digest-hex>/{rootfs.ext4, metadata.json}
//!   images/<repo>/<tag>            -> symlink to <digest-hex>/
//!   guests/<id>/{metadata.json, overlay.raw, config.ext4, <vmm>.sock,
//!                vsock.sock, logs/{app,vmm,ops}.log,
//!                snapshots/snapshot-latest/}
//!   volumes/<id>/{data.raw, metadata.json}
//! ```

use std::path::{Path, PathBuf};

use hypeman_id::{InstanceId, VolumeId};

/// Log file selector for a guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Guest console output (serial).
    App,
    /// Hypervisor process stdout/stderr.
    Vmm,
    /// Manager-side operational events for the instance.
    Ops,
}

impl LogSource {
    /// File name within the guest `logs/` directory.
    pub fn file_name(self) -> &'static str {
        match self {
            Self::App => "app.log",
            Self::Vmm => "vmm.log",
            Self::Ops => "ops.log",
        }
    }
}

/// Maps logical resources to filesystem paths under one root.
#[derive(Debug, Clone)]
pub struct Paths {
    data_dir: PathBuf,
}

impl Paths {
    /// Creates a paths layer rooted at `data_dir`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// The root data directory.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    // ---- system ----

    /// Directory holding kernel/initrd/binaries shared by all guests.
    pub fn system_dir(&self) -> PathBuf {
        self.data_dir.join("system")
    }

    /// Default guest kernel image.
    pub fn kernel(&self) -> PathBuf {
        self.system_dir().join("kernel")
    }

    /// Default guest initrd.
    pub fn initrd(&self) -> PathBuf {
        self.system_dir().join("initrd")
    }

    // ---- OCI cache ----

    /// Root of the content-addressed OCI cache.
    pub fn oci_cache_dir(&self) -> PathBuf {
        self.system_dir().join("oci-cache")
    }

    /// Blob directory (`blobs/sha256/`).
    pub fn blob_dir(&self) -> PathBuf {
        self.oci_cache_dir().join("blobs").join("sha256")
    }

    /// Path of a blob by hex digest (without the `sha256:` prefix).
    pub fn blob(&self, hex: &str) -> PathBuf {
        self.blob_dir().join(hex)
    }

    /// The OCI image index of the cache.
    pub fn oci_index(&self) -> PathBuf {
        self.oci_cache_dir().join("index.json")
    }

    /// The `oci-layout` marker file.
    pub fn oci_layout(&self) -> PathBuf {
        self.oci_cache_dir().join("oci-layout")
    }

    // ---- images ----

    /// Root of the built-image tree.
    pub fn images_dir(&self) -> PathBuf {
        self.data_dir.join("images")
    }

    /// Directory of one repository (`images/<repo>/`).
    pub fn repo_dir(&self, repo: &str) -> PathBuf {
        self.images_dir().join(repo)
    }

    /// Directory of one built image, keyed by manifest digest hex.
    pub fn image_dir(&self, repo: &str, digest_hex: &str) -> PathBuf {
        self.repo_dir(repo).join(digest_hex)
    }

    /// The bootable root disk of a built image.
    pub fn image_rootfs(&self, repo: &str, digest_hex: &str) -> PathBuf {
        self.image_dir(repo, digest_hex).join("rootfs.ext4")
    }

    /// Image metadata document.
    pub fn image_metadata(&self, repo: &str, digest_hex: &str) -> PathBuf {
        self.image_dir(repo, digest_hex).join("metadata.json")
    }

    /// Tag symlink (`images/<repo>/<tag>` → `<digest-hex>`).
    pub fn tag_link(&self, repo: &str, tag: &str) -> PathBuf {
        self.repo_dir(repo).join(tag)
    }

    // ---- guests ----

    /// Root of the per-instance tree.
    pub fn guests_dir(&self) -> PathBuf {
        self.data_dir.join("guests")
    }

    /// Directory of one guest.
    pub fn guest_dir(&self, id: &InstanceId) -> PathBuf {
        self.guests_dir().join(id.as_str())
    }

    /// Instance metadata document.
    pub fn guest_metadata(&self, id: &InstanceId) -> PathBuf {
        self.guest_dir(id).join("metadata.json")
    }

    /// Copy-on-write overlay disk.
    pub fn guest_overlay(&self, id: &InstanceId) -> PathBuf {
        self.guest_dir(id).join("overlay.raw")
    }

    /// Config disk consumed by the in-guest init.
    pub fn guest_config_disk(&self, id: &InstanceId) -> PathBuf {
        self.guest_dir(id).join("config.ext4")
    }

    /// Hypervisor control socket, named after the VMM that owns it.
    pub fn guest_api_socket(&self, id: &InstanceId, vmm: &str) -> PathBuf {
        self.guest_dir(id).join(format!("{vmm}.sock"))
    }

    /// Host side of the guest vsock device.
    pub fn guest_vsock_socket(&self, id: &InstanceId) -> PathBuf {
        self.guest_dir(id).join("vsock.sock")
    }

    /// Guest log directory.
    pub fn guest_log_dir(&self, id: &InstanceId) -> PathBuf {
        self.guest_dir(id).join("logs")
    }

    /// One guest log file.
    pub fn guest_log(&self, id: &InstanceId, source: LogSource) -> PathBuf {
        self.guest_log_dir(id).join(source.file_name())
    }

    /// Latest snapshot directory for suspend/resume.
    pub fn guest_snapshot_dir(&self, id: &InstanceId) -> PathBuf {
        self.guest_dir(id).join("snapshots").join("snapshot-latest")
    }

    // ---- volumes ----

    /// Root of the volume tree.
    pub fn volumes_dir(&self) -> PathBuf {
        self.data_dir.join("volumes")
    }

    /// Directory of one volume.
    pub fn volume_dir(&self, id: &VolumeId) -> PathBuf {
        self.volumes_dir().join(id.as_str())
    }

    /// Backing file of a volume.
    pub fn volume_data(&self, id: &VolumeId) -> PathBuf {
        self.volume_dir(id).join("data.raw")
    }
}
