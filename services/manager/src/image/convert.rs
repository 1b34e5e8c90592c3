//! Conversion of OCI manifests into bootable ext4 root disks.
//!
//! The pipeline per image: pull missing layer blobs, extract them in order
//! into a staging tree applying OCI whiteouts, size and format a sparse
//! ext4 file, copy the tree in, and surface the runtime config extracted
//! from the image config blob. All artifacts are produced in a build
//! directory next to the final image directory and renamed in at the end;
//! a failed build leaves nothing behind.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::BuildSettings;
use crate::image::pull::{PullClient, PullError};
use crate::oci::store::StoreError;
use crate::oci::{BlobStore, Digest, ImageConfig, Manifest, Reference, RuntimeConfig};

/// Errors from image conversion.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("pull error: {0}")]
    Pull(#[from] PullError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("layer extraction failed: {0}")]
    Extract(String),

    #[error("image too large: {size} bytes exceeds limit {limit}")]
    TooLarge { size: u64, limit: u64 },

    #[error("filesystem creation failed: {0}")]
    Mkfs(String),

    #[error("build timed out")]
    Timeout,
}

/// What the queue hands a converter.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    /// Reference used for upstream pulls (registry + repository).
    pub reference: Reference,
    /// Manifest digest; the image identity.
    pub digest: Digest,
    /// Final image directory (`images/<repo>/<hex>/`).
    pub image_dir: PathBuf,
}

/// What a successful conversion produced.
#[derive(Debug, Clone)]
pub struct ConvertOutcome {
    /// Size of the root disk in bytes.
    pub size_bytes: u64,
    /// Runtime config extracted from the image config blob.
    pub runtime: RuntimeConfig,
}

/// Converts a manifest into a bootable root disk.
///
/// Abstracted so lifecycle and queue tests can run without `mkfs.ext4`,
/// loop mounts, or network access.
#[async_trait]
pub trait Converter: Send + Sync {
    /// Builds `rootfs.ext4` inside `request.image_dir`.
    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertOutcome, ConvertError>;
}

/// The production converter.
pub struct Ext4Converter {
    settings: BuildSettings,
    pull: Arc<PullClient>,
    store: Arc<BlobStore>,
}

impl Ext4Converter {
    /// Creates a converter over the shared blob store and pull client.
    pub fn new(settings: BuildSettings, pull: Arc<PullClient>, store: Arc<BlobStore>) -> Self {
        Self {
            settings,
            pull,
            store,
        }
    }
}

#[async_trait]
impl Converter for Ext4Converter {
    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertOutcome, ConvertError> {
        // 1. Manifest: prefer the local cache (push origin), fall back to
        //    the upstream registry (pull origin).
        let manifest = self.load_manifest(request).await?;

        // 2. Pull missing layers, digest-verified on the fly.
        for (i, layer) in manifest.layers.iter().enumerate() {
            if self.store.has(&layer.digest) {
                debug!(layer = i, digest = %layer.digest, "layer already cached");
                continue;
            }
            self.pull
                .pull_blob(&request.reference, &layer.digest, &self.store)
                .await?;
        }

        // 3. Runtime config from the config blob.
        if !self.store.has(&manifest.config.digest) {
            self.pull
                .pull_blob(&request.reference, &manifest.config.digest, &self.store)
                .await?;
        }
        let config: ImageConfig =
            serde_json::from_slice(&self.store.read_blob(&manifest.config.digest)?)?;
        let runtime = config.config.unwrap_or_default();

        // 4. Stage, size, format, and populate on a blocking thread.
        let layer_paths: Vec<PathBuf> = manifest
            .layers
            .iter()
            .map(|l| self.store.blob_path(&l.digest))
            .collect();
        let settings = self.settings.clone();
        let image_dir = request.image_dir.clone();
        let digest = request.digest.clone();

        let size_bytes = tokio::task::spawn_blocking(move || {
            build_root_disk(&settings, &image_dir, &digest, &layer_paths)
        })
        .await
        .map_err(|e| ConvertError::Extract(format!("build task panicked: {e}")))??;

        Ok(ConvertOutcome {
            size_bytes,
            runtime,
        })
    }
}

impl Ext4Converter {
    async fn load_manifest(&self, request: &ConvertRequest) -> Result<Manifest, ConvertError> {
        if self.store.has(&request.digest) {
            let manifest: Manifest =
                serde_json::from_slice(&self.store.read_blob(&request.digest)?)?;
            return Ok(manifest);
        }
        let (bytes, manifest) = self
            .pull
            .fetch_manifest(&request.reference, &request.digest)
            .await?;
        self.store.put_bytes(&bytes)?;
        Ok(manifest)
    }
}

/// Synchronous tail of the pipeline: extract, size, mkfs, populate.
fn build_root_disk(
    settings: &BuildSettings,
    image_dir: &Path,
    digest: &Digest,
    layer_paths: &[PathBuf],
) -> Result<u64, ConvertError> {
    let parent = image_dir
        .parent()
        .ok_or_else(|| ConvertError::Extract("image dir has no parent".to_string()))?;
    fs::create_dir_all(parent)?;

    let build_dir = parent.join(format!(".build-{}", digest.hex()));
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir)?;
    }
    let result = build_in(settings, &build_dir, image_dir, layer_paths);
    if result.is_err() {
        fs::remove_dir_all(&build_dir).ok();
    }
    result
}

fn build_in(
    settings: &BuildSettings,
    build_dir: &Path,
    image_dir: &Path,
    layer_paths: &[PathBuf],
) -> Result<u64, ConvertError> {
    let staging = build_dir.join("staging");
    fs::create_dir_all(&staging)?;

    info!(
        layer_count = layer_paths.len(),
        staging = %staging.display(),
        "extracting layers"
    );
    for (i, layer_path) in layer_paths.iter().enumerate() {
        debug!(layer = i, path = %layer_path.display(), "extracting layer");
        extract_layer(layer_path, &staging)?;
    }

    let staged_bytes = dir_size(&staging)?;
    if staged_bytes > settings.max_disk_bytes {
        return Err(ConvertError::TooLarge {
            size: staged_bytes,
            limit: settings.max_disk_bytes,
        });
    }
    let disk_size = compute_disk_size(settings, staged_bytes).min(settings.max_disk_bytes);

    info!(staged_bytes, disk_size, "creating ext4 root disk");
    let disk_path = build_dir.join("rootfs.ext4");
    make_ext4(&disk_path, disk_size)?;
    populate_ext4(&disk_path, &staging, build_dir)?;

    fs::remove_dir_all(&staging).ok();

    // Move the finished disk into place; the image directory appears with
    // the rootfs already complete.
    fs::create_dir_all(image_dir)?;
    fs::rename(&disk_path, image_dir.join("rootfs.ext4"))?;
    fs::remove_dir_all(build_dir).ok();

    Ok(disk_size)
}

/// Final size = ceil(staged * inflate_factor) + floor_bytes.
fn compute_disk_size(settings: &BuildSettings, staged_bytes: u64) -> u64 {
    let inflated = (staged_bytes as f64 * settings.inflate_factor).ceil() as u64;
    inflated + settings.floor_bytes
}

/// Extracts one layer tarball, honoring OCI whiteouts.
fn extract_layer(layer_path: &Path, dest: &Path) -> Result<(), ConvertError> {
    let file = File::open(layer_path)?;
    let reader = BufReader::new(file);

    if is_gzip(layer_path)? {
        extract_archive(&mut Archive::new(GzDecoder::new(reader)), dest)
    } else {
        extract_archive(&mut Archive::new(reader), dest)
    }
}

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

fn extract_archive<R: Read>(archive: &mut Archive<R>, dest: &Path) -> Result<(), ConvertError> {
    archive.set_preserve_permissions(true);
    archive.set_unpack_xattrs(true);
    // Ownership can only be restored by root; guests running as a dev user
    // get files owned by that user instead.
    archive.set_preserve_ownerships(unsafe { libc::geteuid() } == 0);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path
            .components()
            .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            warn!(path = %path.display(), "skipping layer entry with parent component");
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if file_name == OPAQUE_WHITEOUT {
            // Opaque whiteout: lower-layer contents of the directory vanish.
            if let Some(parent) = path.parent() {
                let full_parent = dest.join(parent);
                if full_parent.is_dir() {
                    for child in fs::read_dir(&full_parent)? {
                        let child = child?.path();
                        if child.is_dir() {
                            fs::remove_dir_all(&child).ok();
                        } else {
                            fs::remove_file(&child).ok();
                        }
                    }
                }
            }
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            // Plain whiteout: the named sibling from a lower layer vanishes.
            let target = match path.parent() {
                Some(parent) => dest.join(parent).join(target_name),
                None => dest.join(target_name),
            };
            fs::remove_file(&target).ok();
            fs::remove_dir_all(&target).ok();
            continue;
        }

        let full_path = dest.join(&path);
        // Layers are allowed to omit intermediate directory entries.
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&full_path)
            .map_err(|e| ConvertError::Extract(format!("{}: {e}", path.display())))?;
    }

    Ok(())
}

/// Creates a sparse file and formats it as ext4.
fn make_ext4(path: &Path, size: u64) -> Result<(), ConvertError> {
    let file = File::create(path)?;
    file.set_len(size)?;
    drop(file);

    let status = Command::new("mkfs.ext4")
        .args(["-F", "-q"])
        .arg(path)
        .status()
        .map_err(|e| ConvertError::Mkfs(format!("mkfs.ext4: {e}")))?;
    if !status.success() {
        return Err(ConvertError::Mkfs("mkfs.ext4 failed".to_string()));
    }
    Ok(())
}

/// Loop-mounts the disk and copies the staged tree in, preserving mode,
/// ownership, xattrs, and symlinks.
fn populate_ext4(disk: &Path, staging: &Path, build_dir: &Path) -> Result<(), ConvertError> {
    let mount_dir = build_dir.join("mnt");
    fs::create_dir_all(&mount_dir)?;

    let status = Command::new("mount")
        .args(["-o", "loop"])
        .arg(disk)
        .arg(&mount_dir)
        .status()
        .map_err(|e| ConvertError::Mkfs(format!("mount: {e}")))?;
    if !status.success() {
        return Err(ConvertError::Mkfs("mount failed".to_string()));
    }

    let copy_result = Command::new("cp")
        .args(["-a", "--reflink=auto"])
        .arg(format!("{}/.", staging.display()))
        .arg(&mount_dir)
        .status();

    // Unmount unconditionally; a disk left mounted wedges later builds.
    let umount = Command::new("umount").arg(&mount_dir).status();
    fs::remove_dir(&mount_dir).ok();

    match copy_result {
        Ok(status) if status.success() => {}
        Ok(_) => return Err(ConvertError::Mkfs("cp into root disk failed".to_string())),
        Err(e) => return Err(ConvertError::Mkfs(format!("cp: {e}"))),
    }
    match umount {
        Ok(status) if status.success() => Ok(()),
        _ => Err(ConvertError::Mkfs("umount failed".to_string())),
    }
}

fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == [0x1f, 0x8b]),
        Err(_) => Ok(false),
    }
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                total += dir_size(&entry.path())?;
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}
