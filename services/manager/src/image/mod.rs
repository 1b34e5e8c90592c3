//! Image manager: turns OCI references into bootable root disks.
//!
//! `create` resolves a reference to a digest and enqueues a conversion;
//! building happens asynchronously on worker tasks and results are
//! observable by polling `get`. On disk, an image is
//! `images/<repo>/<digest-hex>/{rootfs.ext4, metadata.json}` with tag
//! symlinks next to the digest directories. The digest directory is owned
//! exclusively by this manager.

pub mod convert;
pub mod pull;
pub mod queue;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{error, info, warn};

use hypeman_id::InstanceId;

use crate::clock::Clock;
use crate::config::BuildSettings;
use crate::error::{Error, Result};
use crate::oci::store::write_atomic;
use crate::oci::{BlobStore, Digest, Reference};
use crate::paths::Paths;

use convert::{ConvertRequest, Converter};
use pull::{PullClient, PullError};
use queue::{BuildJob, BuildOrigin, BuildQueue};

/// Lifecycle status of an image. Transitions only move forward:
/// Pending → Building → Ready | Failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Pending,
    Building,
    Ready,
    Failed,
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Building => "building",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Persistent image metadata (`metadata.json` in the digest directory).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMetadata {
    /// Reference the image was created under.
    pub name: String,
    /// Manifest digest; the identity.
    pub digest: Digest,
    /// Root disk size in bytes; zero until Ready.
    pub size: u64,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub working_dir: String,
    /// Image-configured user, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub status: ImageStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    /// Failure message for Failed images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An image as reported to callers.
#[derive(Debug, Clone, Serialize)]
pub struct ImageRecord {
    #[serde(flatten)]
    pub metadata: ImageMetadata,
    /// 1-based position in the build queue; 0 means building now; absent
    /// for Ready/Failed images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_position: Option<u64>,
}

/// Answers "how many instances reference this image digest".
///
/// Installed by the instance layer; the trait breaks the dependency cycle
/// between image deletion and instance metadata.
pub trait ImageReferences: Send + Sync {
    fn referencing_instances(&self, digest: &Digest) -> usize;
}

/// No instances exist (tests, and bootstrap before the instance manager).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoReferences;

impl ImageReferences for NoReferences {
    fn referencing_instances(&self, _digest: &Digest) -> usize {
        0
    }
}

/// Counts references by scanning guest metadata on disk.
pub struct GuestImageReferences {
    paths: Paths,
}

impl GuestImageReferences {
    pub fn new(paths: Paths) -> Self {
        Self { paths }
    }
}

impl ImageReferences for GuestImageReferences {
    fn referencing_instances(&self, digest: &Digest) -> usize {
        let Ok(entries) = fs::read_dir(self.paths.guests_dir()) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|entry| {
                let id = InstanceId::parse(entry.file_name().to_str()?).ok()?;
                let data = fs::read(self.paths.guest_metadata(&id)).ok()?;
                let meta: serde_json::Value = serde_json::from_slice(&data).ok()?;
                let image = meta.get("image")?.as_str()?;
                self.resolves_to(image, digest).then_some(())
            })
            .count()
    }
}

impl GuestImageReferences {
    /// True when an instance's image reference resolves to `digest`,
    /// following the tag symlink for tag references.
    fn resolves_to(&self, image: &str, digest: &Digest) -> bool {
        let Ok(reference) = Reference::parse(image) else {
            return false;
        };
        if let Some(pinned) = &reference.digest {
            return pinned == digest;
        }
        let Some(tag) = &reference.tag else {
            return false;
        };
        let link = self.paths.tag_link(&reference.repository, tag);
        fs::read_link(link).is_ok_and(|target| target == Path::new(digest.hex()))
    }
}

/// The image manager.
pub struct ImageManager {
    paths: Paths,
    settings: BuildSettings,
    store: Arc<BlobStore>,
    pull: Arc<PullClient>,
    converter: Arc<dyn Converter>,
    queue: Arc<BuildQueue>,
    references: Arc<dyn ImageReferences>,
    clock: Arc<dyn Clock>,
    shutdown: watch::Sender<bool>,
}

impl ImageManager {
    /// Creates the manager and spawns its build workers.
    pub fn new(
        paths: Paths,
        settings: BuildSettings,
        store: Arc<BlobStore>,
        pull: Arc<PullClient>,
        converter: Arc<dyn Converter>,
        references: Arc<dyn ImageReferences>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (shutdown, _) = watch::channel(false);
        let manager = Arc::new(Self {
            paths,
            settings,
            store,
            pull,
            converter,
            queue: Arc::new(BuildQueue::new()),
            references,
            clock,
            shutdown,
        });

        manager.store.sweep_temp_files();
        for worker in 0..manager.settings.max_concurrent_builds {
            let manager = Arc::clone(&manager);
            let mut shutdown = manager.shutdown.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        job = manager.queue.next() => {
                            manager.run_build(worker, job).await;
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        manager
    }

    /// Stops the build workers. Pending jobs stay Pending on disk and are
    /// re-enqueued by `recover` on the next start.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        let dropped = self.queue.drain_pending();
        if !dropped.is_empty() {
            info!(count = dropped.len(), "dropped pending builds at shutdown");
        }
    }

    /// Re-enqueues images left Pending or Building by a previous daemon.
    pub fn recover(&self) -> Result<()> {
        for record in self.list()? {
            if matches!(
                record.metadata.status,
                ImageStatus::Pending | ImageStatus::Building
            ) {
                // Stored names carry the registry, so interrupted pulls can
                // resume against the right upstream.
                let reference = match Reference::parse(&record.metadata.name) {
                    Ok(parsed) => parsed.with_digest(record.metadata.digest.clone()),
                    Err(e) => {
                        warn!(name = %record.metadata.name, error = %e, "unparseable image name, skipping recovery");
                        continue;
                    }
                };
                info!(name = %record.metadata.name, digest = %record.metadata.digest, "re-enqueueing interrupted build");
                self.enqueue(&reference, record.metadata.digest.clone(), BuildOrigin::Pull)?;
            }
        }
        Ok(())
    }

    /// Resolves a reference and records a build for it. Idempotent: Ready
    /// images return immediately, in-flight builds report their queue
    /// position, and only unseen digests enqueue new work. Returns without
    /// waiting for the build.
    pub async fn create(&self, reference_str: &str) -> Result<ImageRecord> {
        let reference =
            Reference::parse(reference_str).map_err(|e| Error::InvalidName(e.to_string()))?;

        // Tag-only references resolve against the upstream synchronously;
        // this is the only potentially slow step on the create path.
        let digest = match &reference.digest {
            Some(digest) => digest.clone(),
            None => self.pull.resolve(&reference).await.map_err(map_pull_error)?,
        };

        if let Some(existing) = self.load_metadata(&reference.repository, digest.hex())? {
            match existing.status {
                ImageStatus::Ready => {
                    self.ensure_tag_link(&reference, digest.hex())?;
                    return Ok(self.to_record(existing));
                }
                ImageStatus::Pending | ImageStatus::Building => {
                    self.ensure_tag_link(&reference, digest.hex())?;
                    return Ok(self.to_record(existing));
                }
                // Failed is terminal for that attempt; a fresh create gets
                // a fresh build.
                ImageStatus::Failed => {}
            }
        }

        let metadata = self.record_pending(&reference, &digest)?;
        let position = self.enqueue(&reference, digest, BuildOrigin::Pull)?;
        Ok(ImageRecord {
            metadata,
            queue_position: Some(position),
        })
    }

    /// Records and enqueues a build for an image that just arrived through
    /// the embedded registry. All blobs are already in the local store.
    pub fn submit_push(
        &self,
        repository: &str,
        digest: &Digest,
        tag: Option<&str>,
    ) -> Result<ImageRecord> {
        let reference = Reference {
            registry: "localhost".to_string(),
            repository: repository.to_string(),
            tag: tag.map(str::to_string),
            digest: Some(digest.clone()),
        };

        if let Some(existing) = self.load_metadata(repository, digest.hex())? {
            if existing.status != ImageStatus::Failed {
                self.ensure_tag_link(&reference, digest.hex())?;
                return Ok(self.to_record(existing));
            }
        }

        let metadata = self.record_pending(&reference, digest)?;
        let position = self.enqueue(&reference, digest.clone(), BuildOrigin::Push)?;
        Ok(ImageRecord {
            metadata,
            queue_position: Some(position),
        })
    }

    /// Looks up an image by `repo:tag`, `repo@digest`, or bare digest.
    pub fn get(&self, name: &str) -> Result<ImageRecord> {
        if let Ok(digest) = Digest::parse(name) {
            return self
                .find_by_digest(&digest)?
                .map(|m| self.to_record(m))
                .ok_or_else(|| Error::not_found(format!("image {name}")));
        }

        let reference = Reference::parse(name).map_err(|e| Error::InvalidName(e.to_string()))?;
        let hex = self.resolve_hex(&reference)?;
        let metadata = self
            .load_metadata(&reference.repository, &hex)?
            .ok_or_else(|| Error::not_found(format!("image {name}")))?;
        Ok(self.to_record(metadata))
    }

    /// Enumerates all images on disk.
    pub fn list(&self) -> Result<Vec<ImageRecord>> {
        let mut records = Vec::new();
        collect_images(&self.paths.images_dir(), &mut |metadata_path| {
            match fs::read(metadata_path)
                .map_err(anyhow::Error::new)
                .and_then(|data| serde_json::from_slice(&data).map_err(anyhow::Error::new))
            {
                Ok(metadata) => records.push(self.to_record(metadata)),
                Err(e) => {
                    warn!(path = %metadata_path.display(), error = %e, "skipping unreadable image metadata")
                }
            }
        })?;
        records.sort_by(|a: &ImageRecord, b: &ImageRecord| a.metadata.name.cmp(&b.metadata.name));
        Ok(records)
    }

    /// Deletes an image: the digest directory and any tag symlinks pointing
    /// at it. Fails with `InUse` while instances reference the digest.
    pub fn delete(&self, name: &str) -> Result<()> {
        let (repository, hex) = if let Ok(digest) = Digest::parse(name) {
            let metadata = self
                .find_by_digest(&digest)?
                .ok_or_else(|| Error::not_found(format!("image {name}")))?;
            let repository = Reference::parse(&metadata.name)
                .map(|r| r.repository)
                .unwrap_or_else(|_| repo_of(&metadata.name));
            (repository, digest.hex().to_string())
        } else {
            let reference =
                Reference::parse(name).map_err(|e| Error::InvalidName(e.to_string()))?;
            let hex = self.resolve_hex(&reference)?;
            (reference.repository, hex)
        };

        let digest = Digest::parse(&format!("sha256:{hex}"))
            .map_err(|e| Error::InvalidName(e.to_string()))?;
        let referencing = self.references.referencing_instances(&digest);
        if referencing > 0 {
            return Err(Error::InUse(format!(
                "image {name} is referenced by {referencing} instance(s)"
            )));
        }

        let dir = self.paths.image_dir(&repository, &hex);
        if !dir.is_dir() {
            return Err(Error::not_found(format!("image {name}")));
        }
        fs::remove_dir_all(&dir)?;
        self.remove_tag_links(&repository, &hex)?;
        info!(repository = %repository, digest_hex = %hex, "image deleted");
        Ok(())
    }

    /// The shared build queue (exposed for observability).
    pub fn queue(&self) -> &BuildQueue {
        &self.queue
    }

    // ---- internals ----

    fn enqueue(&self, reference: &Reference, digest: Digest, origin: BuildOrigin) -> Result<u64> {
        let image_dir = self.paths.image_dir(&reference.repository, digest.hex());
        let submission = self.queue.submit(BuildJob {
            digest: digest.clone(),
            reference: reference.clone(),
            origin,
            image_dir,
        });
        info!(
            reference = %reference,
            digest = %digest,
            position = submission.position(),
            "build submitted"
        );
        Ok(submission.position())
    }

    async fn run_build(&self, worker: usize, job: BuildJob) {
        info!(worker, digest = %job.digest, reference = %job.reference, "build started");

        if let Err(e) = self.update_status(&job, ImageStatus::Building, None) {
            error!(digest = %job.digest, error = %e, "failed to mark image building");
        }

        let request = ConvertRequest {
            reference: job.reference.clone(),
            digest: job.digest.clone(),
            image_dir: job.image_dir.clone(),
        };
        let outcome = tokio::time::timeout(
            self.settings.build_timeout,
            self.converter.convert(&request),
        )
        .await
        .map_err(|_| convert::ConvertError::Timeout)
        .and_then(|r| r);

        match outcome {
            Ok(outcome) => {
                if let Err(e) = self.finish_ready(&job, &outcome) {
                    error!(digest = %job.digest, error = %e, "failed to record ready image");
                } else {
                    info!(
                        worker,
                        digest = %job.digest,
                        size = outcome.size_bytes,
                        "build completed"
                    );
                }
            }
            Err(e) => {
                warn!(worker, digest = %job.digest, error = %e, "build failed");
                if let Err(write_err) =
                    self.update_status(&job, ImageStatus::Failed, Some(e.to_string()))
                {
                    error!(digest = %job.digest, error = %write_err, "failed to record failed image");
                }
                // The converter removes its own build directory; a partial
                // rootfs never reaches the image directory.
            }
        }

        self.queue.complete(&job.digest);
    }

    fn record_pending(&self, reference: &Reference, digest: &Digest) -> Result<ImageMetadata> {
        let metadata = ImageMetadata {
            // The full form keeps the registry, which recovery needs to
            // resume interrupted pulls.
            name: reference.to_string(),
            digest: digest.clone(),
            size: 0,
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: Vec::new(),
            working_dir: String::new(),
            user: None,
            status: ImageStatus::Pending,
            created_at: self.clock.now(),
            error: None,
        };
        self.write_metadata(&reference.repository, digest.hex(), &metadata)?;
        self.ensure_tag_link(reference, digest.hex())?;
        Ok(metadata)
    }

    fn finish_ready(&self, job: &BuildJob, outcome: &convert::ConvertOutcome) -> Result<()> {
        let mut metadata = self
            .load_metadata(&job.reference.repository, job.digest.hex())?
            .ok_or_else(|| Error::not_found(format!("image metadata for {}", job.digest)))?;

        metadata.status = ImageStatus::Ready;
        metadata.size = outcome.size_bytes;
        metadata.entrypoint = outcome.runtime.entrypoint.clone().unwrap_or_default();
        metadata.cmd = outcome.runtime.cmd.clone().unwrap_or_default();
        metadata.env = outcome.runtime.env.clone().unwrap_or_default();
        metadata.working_dir = outcome.runtime.working_dir.clone().unwrap_or_default();
        metadata.user = outcome.runtime.user.clone();
        metadata.error = None;

        self.write_metadata(&job.reference.repository, job.digest.hex(), &metadata)?;
        self.ensure_tag_link(&job.reference, job.digest.hex())?;
        Ok(())
    }

    fn update_status(
        &self,
        job: &BuildJob,
        status: ImageStatus,
        error: Option<String>,
    ) -> Result<()> {
        let Some(mut metadata) =
            self.load_metadata(&job.reference.repository, job.digest.hex())?
        else {
            return Ok(());
        };
        metadata.status = status;
        metadata.error = error;
        self.write_metadata(&job.reference.repository, job.digest.hex(), &metadata)
    }

    fn load_metadata(&self, repository: &str, hex: &str) -> Result<Option<ImageMetadata>> {
        let path = self.paths.image_metadata(repository, hex);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(&path)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn write_metadata(
        &self,
        repository: &str,
        hex: &str,
        metadata: &ImageMetadata,
    ) -> Result<()> {
        let path = self.paths.image_metadata(repository, hex);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp = path.with_extension("json.tmp");
        write_atomic(&temp, &path, &serde_json::to_vec_pretty(metadata)?)?;
        Ok(())
    }

    /// Creates or repoints the tag symlink for a reference that has one.
    fn ensure_tag_link(&self, reference: &Reference, hex: &str) -> Result<()> {
        let Some(tag) = &reference.tag else {
            return Ok(());
        };
        let link = self.paths.tag_link(&reference.repository, tag);
        match fs::read_link(&link) {
            Ok(target) if target == Path::new(hex) => return Ok(()),
            Ok(_) => fs::remove_file(&link)?,
            Err(_) => {}
        }
        if let Some(parent) = link.parent() {
            fs::create_dir_all(parent)?;
        }
        std::os::unix::fs::symlink(hex, &link)?;
        Ok(())
    }

    fn remove_tag_links(&self, repository: &str, hex: &str) -> Result<()> {
        let repo_dir = self.paths.repo_dir(repository);
        let Ok(entries) = fs::read_dir(&repo_dir) else {
            return Ok(());
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_symlink() {
                if let Ok(target) = fs::read_link(&path) {
                    if target == Path::new(hex) {
                        fs::remove_file(&path)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Resolves a reference to a digest-hex directory name: digest wins,
    /// otherwise the tag symlink is followed.
    fn resolve_hex(&self, reference: &Reference) -> Result<String> {
        if let Some(digest) = &reference.digest {
            return Ok(digest.hex().to_string());
        }
        let tag = reference
            .tag
            .as_deref()
            .ok_or_else(|| Error::InvalidName(reference.to_string()))?;
        let link = self.paths.tag_link(&reference.repository, tag);
        let target = fs::read_link(&link)
            .map_err(|_| Error::not_found(format!("image {}:{tag}", reference.repository)))?;
        Ok(target.to_string_lossy().into_owned())
    }

    fn find_by_digest(&self, digest: &Digest) -> Result<Option<ImageMetadata>> {
        let mut found = None;
        let hex = digest.hex().to_string();
        collect_images(&self.paths.images_dir(), &mut |metadata_path| {
            if found.is_some() {
                return;
            }
            let dir_name = metadata_path
                .parent()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned());
            if dir_name.as_deref() == Some(hex.as_str()) {
                if let Ok(data) = fs::read(metadata_path) {
                    found = serde_json::from_slice(&data).ok();
                }
            }
        })?;
        Ok(found)
    }

    fn to_record(&self, metadata: ImageMetadata) -> ImageRecord {
        let queue_position = match metadata.status {
            ImageStatus::Pending | ImageStatus::Building => {
                self.queue.position(&metadata.digest).or(Some(0))
            }
            _ => None,
        };
        ImageRecord {
            metadata,
            queue_position,
        }
    }
}

/// Extracts the repository portion of a stored image name.
fn repo_of(name: &str) -> String {
    let name = name.split_once('@').map_or(name, |(n, _)| n);
    let name = name.rsplit_once(':').map_or(name, |(n, _)| n);
    name.to_string()
}

/// Walks the images tree calling `visit` for each `metadata.json` that sits
/// in a digest directory (64-hex name). Repositories may contain slashes,
/// so the walk recurses through intermediate directories; tag symlinks are
/// skipped to avoid visiting an image twice.
fn collect_images(dir: &Path, visit: &mut dyn FnMut(&Path)) -> Result<()> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Ok(());
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_symlink() || !path.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let is_digest_dir =
            name.len() == 64 && name.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f'));
        if is_digest_dir {
            let metadata_path = path.join("metadata.json");
            if metadata_path.exists() {
                visit(&metadata_path);
            }
        } else {
            collect_images(&path, visit)?;
        }
    }
    Ok(())
}

fn map_pull_error(err: PullError) -> Error {
    match err {
        PullError::NotFound(what) => Error::not_found(format!("image {what}")),
        PullError::NoMatchingPlatform { os, architecture } => {
            Error::not_found(format!("no manifest for platform {os}/{architecture}"))
        }
        other => Error::Internal(anyhow::Error::new(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_of_strips_tag_and_digest() {
        assert_eq!(repo_of("library/alpine:latest"), "library/alpine");
        assert_eq!(
            repo_of(&format!("library/alpine@sha256:{}", "a".repeat(64))),
            "library/alpine"
        );
        assert_eq!(repo_of("library/alpine"), "library/alpine");
    }

    #[test]
    fn image_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&ImageStatus::Building).unwrap(),
            "\"building\""
        );
        let parsed: ImageStatus = serde_json::from_str("\"ready\"").unwrap();
        assert_eq!(parsed, ImageStatus::Ready);
    }

    #[test]
    fn metadata_schema_roundtrip() {
        let metadata = ImageMetadata {
            name: "library/alpine:latest".to_string(),
            digest: Digest::of_bytes(b"manifest"),
            size: 4096,
            entrypoint: vec!["/bin/sh".to_string()],
            cmd: vec![],
            env: vec!["PATH=/usr/bin".to_string()],
            working_dir: "/".to_string(),
            user: None,
            status: ImageStatus::Ready,
            created_at: chrono::Utc::now(),
            error: None,
        };
        let json = serde_json::to_value(&metadata).unwrap();
        assert_eq!(json["status"], "ready");
        assert!(json.get("error").is_none());
        assert!(json.get("user").is_none());
        let back: ImageMetadata = serde_json::from_value(json).unwrap();
        assert_eq!(back.name, metadata.name);
        assert_eq!(back.size, 4096);
    }
}
