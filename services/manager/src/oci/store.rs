//! Content-addressed blob cache with an OCI image index.
//!
//! Blobs land in `blobs/sha256/<hex>` via a temp file and atomic rename;
//! a blob that already exists is authoritative and incoming duplicates are
//! discarded. `index.json` is an OCI image index whose entries carry the
//! ref name in an annotation; mutations are serialized behind a lock and
//! written tmp + rename. Writes always order blob-then-index so the index
//! never references a digest whose file is missing.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use super::{Descriptor, Digest, ImageIndex};

/// Annotation key carrying the ref name in index entries.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

const OCI_LAYOUT_CONTENT: &str = "{\"imageLayoutVersion\":\"1.0.0\"}\n";

/// Errors from blob store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("blob not found: {0}")]
    BlobNotFound(String),
}

/// Content-addressed blob store rooted at the OCI cache directory.
#[derive(Debug)]
pub struct BlobStore {
    blob_dir: PathBuf,
    index_path: PathBuf,
    layout_path: PathBuf,
    /// Serializes read-modify-write cycles on `index.json`.
    index_lock: Mutex<()>,
}

impl BlobStore {
    /// Opens the store, creating the directory layout if needed.
    pub fn open(
        blob_dir: impl Into<PathBuf>,
        index_path: impl Into<PathBuf>,
        layout_path: impl Into<PathBuf>,
    ) -> Result<Self, StoreError> {
        let store = Self {
            blob_dir: blob_dir.into(),
            index_path: index_path.into(),
            layout_path: layout_path.into(),
            index_lock: Mutex::new(()),
        };

        fs::create_dir_all(&store.blob_dir)?;
        if !store.layout_path.exists() {
            fs::write(&store.layout_path, OCI_LAYOUT_CONTENT)?;
        }
        if !store.index_path.exists() {
            store.write_index_locked(&ImageIndex::empty())?;
        }

        Ok(store)
    }

    /// Path of a blob by digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.blob_dir.join(digest.hex())
    }

    /// Returns true if the blob is present.
    pub fn has(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Size of a stored blob.
    pub fn size_of(&self, digest: &Digest) -> Result<u64, StoreError> {
        fs::metadata(self.blob_path(digest))
            .map(|m| m.len())
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))
    }

    /// Opens a stored blob for reading.
    pub fn open_blob(&self, digest: &Digest) -> Result<File, StoreError> {
        File::open(self.blob_path(digest))
            .map_err(|_| StoreError::BlobNotFound(digest.to_string()))
    }

    /// Reads a stored blob fully into memory (manifests and configs only;
    /// layers should use `open_blob`).
    pub fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, StoreError> {
        let mut data = Vec::new();
        self.open_blob(digest)?.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Begins a streaming blob write.
    pub fn begin(&self) -> Result<PendingBlob, StoreError> {
        let temp_path = self.blob_dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            next_temp_seq()
        ));
        let file = File::create(&temp_path)?;
        Ok(PendingBlob {
            file,
            temp_path,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    /// Finalizes a pending blob, verifying `expected` when given.
    ///
    /// If the blob already exists the temp file is discarded and the stored
    /// copy wins.
    pub fn commit(
        &self,
        mut pending: PendingBlob,
        expected: Option<&Digest>,
    ) -> Result<(Digest, u64), StoreError> {
        pending.file.flush()?;
        pending.file.sync_all()?;
        let computed = Digest::of_hasher(pending.hasher);

        if let Some(expected) = expected {
            if &computed != expected {
                fs::remove_file(&pending.temp_path).ok();
                return Err(StoreError::DigestMismatch {
                    expected: expected.to_string(),
                    actual: computed.to_string(),
                });
            }
        }

        let final_path = self.blob_path(&computed);
        if final_path.exists() {
            debug!(digest = %computed, "blob already stored, discarding duplicate");
            fs::remove_file(&pending.temp_path).ok();
        } else {
            fs::rename(&pending.temp_path, &final_path)?;
        }

        Ok((computed, pending.written))
    }

    /// Streams `reader` into the store and returns `(digest, size)`.
    pub fn put(&self, mut reader: impl Read) -> Result<(Digest, u64), StoreError> {
        let mut pending = self.begin()?;
        io::copy(&mut reader, &mut pending)?;
        self.commit(pending, None)
    }

    /// Stores a byte slice and returns its digest.
    pub fn put_bytes(&self, data: &[u8]) -> Result<Digest, StoreError> {
        let (digest, _) = self.put(data)?;
        Ok(digest)
    }

    /// Drops a half-written temp file (upload aborted).
    pub fn discard(&self, pending: PendingBlob) {
        fs::remove_file(&pending.temp_path).ok();
    }

    /// Reads the cache index.
    pub fn read_index(&self) -> Result<ImageIndex, StoreError> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        self.read_index_locked()
    }

    /// Inserts or replaces a manifest entry for `ref_name`.
    ///
    /// The caller must have stored the manifest blob first.
    pub fn record_manifest(
        &self,
        ref_name: &str,
        media_type: &str,
        digest: &Digest,
        size: u64,
    ) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut index = self.read_index_locked()?;
        index.manifests.retain(|d| {
            d.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) != Some(ref_name)
        });
        let mut annotations = HashMap::new();
        annotations.insert(REF_NAME_ANNOTATION.to_string(), ref_name.to_string());
        index.manifests.push(Descriptor {
            media_type: media_type.to_string(),
            digest: digest.clone(),
            size,
            platform: None,
            annotations,
        });
        self.write_index_locked(&index)
    }

    /// Looks up a manifest descriptor by ref name.
    pub fn find_by_ref(&self, ref_name: &str) -> Result<Option<Descriptor>, StoreError> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .iter()
            .find(|d| d.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) == Some(ref_name))
            .cloned())
    }

    /// Looks up manifest descriptors by digest, across all ref names.
    pub fn find_by_digest(&self, digest: &Digest) -> Result<Vec<Descriptor>, StoreError> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .iter()
            .filter(|d| &d.digest == digest)
            .cloned()
            .collect())
    }

    /// Removes index entries for `ref_name`. The blob itself stays cached.
    pub fn remove_ref(&self, ref_name: &str) -> Result<(), StoreError> {
        let _guard = self.index_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut index = self.read_index_locked()?;
        index.manifests.retain(|d| {
            d.annotations.get(REF_NAME_ANNOTATION).map(String::as_str) != Some(ref_name)
        });
        self.write_index_locked(&index)
    }

    /// Removes stale temp files left by a crashed daemon.
    pub fn sweep_temp_files(&self) {
        let Ok(entries) = fs::read_dir(&self.blob_dir) else {
            return;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            if name.to_string_lossy().starts_with(".tmp-") {
                warn!(file = %entry.path().display(), "removing stale blob temp file");
                fs::remove_file(entry.path()).ok();
            }
        }
    }

    fn read_index_locked(&self) -> Result<ImageIndex, StoreError> {
        let data = fs::read(&self.index_path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_index_locked(&self, index: &ImageIndex) -> Result<(), StoreError> {
        let temp = self.index_path.with_extension("json.tmp");
        write_atomic(&temp, &self.index_path, &serde_json::to_vec_pretty(index)?)?;
        Ok(())
    }
}

/// A blob mid-write: bytes stream through a hasher into a temp file.
#[derive(Debug)]
pub struct PendingBlob {
    file: File,
    temp_path: PathBuf,
    hasher: Sha256,
    written: u64,
}

impl PendingBlob {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }
}

impl Write for PendingBlob {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Digest {
    fn of_hasher(hasher: Sha256) -> Self {
        // Construction is private to this module; the hex is well-formed.
        Self::parse(&format!("sha256:{}", hex::encode(hasher.finalize())))
            .unwrap_or_else(|_| unreachable!("sha256 output is canonical hex"))
    }
}

/// Writes `data` to `temp` and renames it over `dest`.
pub fn write_atomic(temp: &Path, dest: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = File::create(temp)?;
    file.write_all(data)?;
    file.sync_all()?;
    drop(file);
    fs::rename(temp, dest)
}

fn next_temp_seq() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static SEQ: AtomicU64 = AtomicU64::new(0);
    SEQ.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> BlobStore {
        BlobStore::open(
            dir.path().join("blobs/sha256"),
            dir.path().join("index.json"),
            dir.path().join("oci-layout"),
        )
        .unwrap()
    }

    #[test]
    fn open_creates_layout() {
        let dir = TempDir::new().unwrap();
        let _store = store(&dir);
        assert!(dir.path().join("blobs/sha256").is_dir());
        assert!(dir.path().join("oci-layout").exists());
        let index: ImageIndex =
            serde_json::from_slice(&fs::read(dir.path().join("index.json")).unwrap()).unwrap();
        assert!(index.manifests.is_empty());
    }

    #[test]
    fn put_stores_content_addressed() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let (digest, size) = store.put(&b"layer data"[..]).unwrap();
        assert_eq!(size, 10);
        assert!(store.has(&digest));
        assert_eq!(store.read_blob(&digest).unwrap(), b"layer data");
        assert_eq!(store.size_of(&digest).unwrap(), 10);
    }

    #[test]
    fn duplicate_put_keeps_existing_blob() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let (first, _) = store.put(&b"same"[..]).unwrap();
        let (second, _) = store.put(&b"same"[..]).unwrap();
        assert_eq!(first, second);
        // No temp residue.
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("blobs/sha256"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp-"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn commit_verifies_expected_digest() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let mut pending = store.begin().unwrap();
        pending.write_all(b"payload").unwrap();
        let wrong = Digest::of_bytes(b"other");
        let err = store.commit(pending, Some(&wrong)).unwrap_err();
        assert!(matches!(err, StoreError::DigestMismatch { .. }));
        assert!(!store.has(&wrong));
        // The partial blob was discarded.
        assert!(!store.has(&Digest::of_bytes(b"payload")));
    }

    #[test]
    fn record_and_find_manifest_refs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let digest = store.put_bytes(b"{\"schemaVersion\":2}").unwrap();
        store
            .record_manifest(
                "library/alpine:latest",
                super::super::media_types::OCI_MANIFEST,
                &digest,
                19,
            )
            .unwrap();

        let found = store.find_by_ref("library/alpine:latest").unwrap().unwrap();
        assert_eq!(found.digest, digest);
        assert_eq!(found.size, 19);

        // Re-recording the same ref replaces, not duplicates.
        store
            .record_manifest(
                "library/alpine:latest",
                super::super::media_types::OCI_MANIFEST,
                &digest,
                19,
            )
            .unwrap();
        assert_eq!(store.read_index().unwrap().manifests.len(), 1);

        store.remove_ref("library/alpine:latest").unwrap();
        assert!(store.find_by_ref("library/alpine:latest").unwrap().is_none());
    }

    #[test]
    fn find_by_digest_spans_refs() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let digest = store.put_bytes(b"{}").unwrap();
        store
            .record_manifest("repo/a:latest", "m", &digest, 2)
            .unwrap();
        store
            .record_manifest("repo/b:latest", "m", &digest, 2)
            .unwrap();
        assert_eq!(store.find_by_digest(&digest).unwrap().len(), 2);
    }

    #[test]
    fn sweep_removes_only_temp_files() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let (digest, _) = store.put(&b"keep"[..]).unwrap();
        fs::write(dir.path().join("blobs/sha256/.tmp-999-0"), b"junk").unwrap();

        store.sweep_temp_files();
        assert!(store.has(&digest));
        assert!(!dir.path().join("blobs/sha256/.tmp-999-0").exists());
    }
}
