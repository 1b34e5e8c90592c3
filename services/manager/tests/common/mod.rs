//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;

use hypeman_manager::clock::SystemClock;
use hypeman_manager::config::{BuildSettings, Config};
use hypeman_manager::image::convert::{
    ConvertError, ConvertOutcome, ConvertRequest, Converter,
};
use hypeman_manager::image::pull::{PullClient, PullConfig};
use hypeman_manager::image::{ImageManager, ImageReferences, NoReferences};
use hypeman_manager::instance::InstanceManager;
use hypeman_manager::network::{NetworkManager, Subnet};
use hypeman_manager::oci::{BlobStore, Digest, RuntimeConfig};
use hypeman_manager::resources::Accounting;
use hypeman_manager::Paths;

/// Converter that fabricates a tiny "root disk" instead of running
/// mkfs/mount, recording every request it served.
pub struct StubConverter {
    pub delay: Duration,
    pub fail: bool,
    pub seen: Mutex<Vec<ConvertRequest>>,
}

impl StubConverter {
    pub fn new() -> Self {
        Self {
            delay: Duration::from_millis(10),
            fail: false,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl Converter for StubConverter {
    async fn convert(&self, request: &ConvertRequest) -> Result<ConvertOutcome, ConvertError> {
        self.seen.lock().await.push(request.clone());
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(ConvertError::Extract("stub converter failure".to_string()));
        }

        std::fs::create_dir_all(&request.image_dir)?;
        std::fs::write(request.image_dir.join("rootfs.ext4"), b"stub rootfs")?;
        Ok(ConvertOutcome {
            size_bytes: 11,
            runtime: RuntimeConfig {
                entrypoint: Some(vec!["/bin/sh".to_string()]),
                cmd: Some(vec!["-c".to_string(), "sleep infinity".to_string()]),
                env: Some(vec!["PATH=/usr/local/bin:/usr/bin".to_string()]),
                working_dir: Some("/".to_string()),
                user: Some("root".to_string()),
            },
        })
    }
}

pub fn test_paths(dir: &tempfile::TempDir) -> Paths {
    Paths::new(dir.path().to_path_buf())
}

pub fn test_store(paths: &Paths) -> Arc<BlobStore> {
    Arc::new(
        BlobStore::open(paths.blob_dir(), paths.oci_index(), paths.oci_layout()).unwrap(),
    )
}

pub fn test_pull() -> Arc<PullClient> {
    Arc::new(PullClient::new(PullConfig::default()).unwrap())
}

pub fn test_images(
    paths: &Paths,
    store: &Arc<BlobStore>,
    converter: Arc<dyn Converter>,
    references: Arc<dyn ImageReferences>,
) -> Arc<ImageManager> {
    ImageManager::new(
        paths.clone(),
        BuildSettings::default(),
        Arc::clone(store),
        test_pull(),
        converter,
        references,
        Arc::new(SystemClock),
    )
}

pub fn test_config(dir: &tempfile::TempDir) -> Config {
    Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    }
}

/// An instance manager over a mock hypervisor and a disabled-network
/// fabric; everything runs without KVM, root, or host mutation.
pub fn test_instances(
    dir: &tempfile::TempDir,
    images: &Arc<ImageManager>,
) -> Arc<InstanceManager> {
    let paths = test_paths(dir);
    let config = test_config(dir);
    let network = Arc::new(NetworkManager::new(
        "hypebr-test".to_string(),
        Subnet::parse("10.230.0.0/24").unwrap(),
        None,
        false,
        config.bandwidth.clone(),
        StdRng::seed_from_u64(11),
    ));
    let accounting = Arc::new(Accounting::new(config.limits.clone()));
    InstanceManager::with_mock_driver(
        paths,
        config,
        Arc::clone(images),
        network,
        accounting,
        Arc::new(SystemClock),
        StdRng::seed_from_u64(7),
    )
}

/// Fabricates a Ready image on disk the way a completed build leaves it.
pub fn seed_ready_image(paths: &Paths, repo: &str, tag: &str) -> (String, Digest) {
    let digest = Digest::of_bytes(format!("{repo}:{tag} manifest").as_bytes());
    let hex = digest.hex().to_string();

    let dir = paths.image_dir(repo, &hex);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(paths.image_rootfs(repo, &hex), b"seed rootfs").unwrap();

    let name = format!("localhost/{repo}:{tag}");
    let metadata = serde_json::json!({
        "name": name,
        "digest": digest.as_str(),
        "size": 11,
        "entrypoint": ["/bin/sh"],
        "cmd": [],
        "env": ["PATH=/usr/bin"],
        "working_dir": "/",
        "status": "ready",
        "created_at": "2025-06-01T00:00:00Z"
    });
    std::fs::write(
        paths.image_metadata(repo, &hex),
        serde_json::to_vec_pretty(&metadata).unwrap(),
    )
    .unwrap();
    std::os::unix::fs::symlink(&hex, paths.tag_link(repo, tag)).unwrap();

    (name, digest)
}

/// Skips a test when the ext4 userland tools are absent.
pub fn mkfs_available() -> bool {
    std::process::Command::new("mkfs.ext4")
        .arg("-V")
        .output()
        .is_ok()
}

pub fn no_references() -> Arc<dyn ImageReferences> {
    Arc::new(NoReferences)
}

pub fn stub_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert("APP_MODE".to_string(), "test".to_string());
    env
}
