//! End-to-end push tests against the embedded registry.
//!
//! The registry runs in-process on an ephemeral port; a plain reqwest
//! client plays the part of `docker push`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use tempfile::TempDir;

use common::{no_references, test_images, test_paths, test_store, StubConverter};
use hypeman_manager::oci::{media_types, Digest, Registry};
use hypeman_manager::ImageStatus;

struct Harness {
    base: String,
    http: reqwest::Client,
    store: Arc<hypeman_manager::oci::BlobStore>,
    images: Arc<hypeman_manager::ImageManager>,
    _dir: TempDir,
}

async fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let paths = test_paths(&dir);
    let store = test_store(&paths);
    let images = test_images(
        &paths,
        &store,
        Arc::new(StubConverter::new()),
        no_references(),
    );
    let registry = Registry::new(Arc::clone(&store), Arc::clone(&images), Duration::from_secs(60));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, registry.router()).await.unwrap();
    });

    Harness {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        store,
        images,
        _dir: dir,
    }
}

impl Harness {
    /// Uploads a blob the way a push client does: POST, PATCH, PUT.
    async fn push_blob(&self, repo: &str, data: &[u8]) -> Digest {
        let digest = Digest::of_bytes(data);

        let start = self
            .http
            .post(format!("{}/v2/{repo}/blobs/uploads/", self.base))
            .send()
            .await
            .unwrap();
        assert_eq!(start.status(), StatusCode::ACCEPTED);
        let location = start.headers()["location"].to_str().unwrap().to_string();

        let patch = self
            .http
            .patch(format!("{}{location}", self.base))
            .body(data.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(patch.status(), StatusCode::ACCEPTED);

        let put = self
            .http
            .put(format!("{}{location}?digest={digest}", self.base))
            .send()
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::CREATED);
        digest
    }

    fn manifest_for(&self, config: &Digest, config_len: usize, layers: &[(Digest, usize)]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": media_types::OCI_MANIFEST,
            "config": {
                "mediaType": media_types::OCI_CONFIG,
                "digest": config.as_str(),
                "size": config_len,
            },
            "layers": layers.iter().map(|(digest, len)| serde_json::json!({
                "mediaType": media_types::OCI_LAYER_TAR_GZIP,
                "digest": digest.as_str(),
                "size": len,
            })).collect::<Vec<_>>(),
        }))
        .unwrap()
    }
}

#[tokio::test]
async fn api_base_advertises_v2() {
    let h = harness().await;
    let response = h.http.get(format!("{}/v2/", h.base)).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["docker-distribution-api-version"],
        "registry/2.0"
    );
}

#[tokio::test]
async fn blob_push_roundtrip_byte_identical() {
    let h = harness().await;
    let payload = b"layer payload bytes".to_vec();

    let digest = h.push_blob("library/alpine", &payload).await;

    let head = h
        .http
        .head(format!("{}/v2/library/alpine/blobs/{digest}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), StatusCode::OK);
    assert_eq!(
        head.headers()["content-length"].to_str().unwrap(),
        payload.len().to_string()
    );

    let get = h
        .http
        .get(format!("{}/v2/library/alpine/blobs/{digest}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(get.status(), StatusCode::OK);
    assert_eq!(get.bytes().await.unwrap().to_vec(), payload);
}

#[tokio::test]
async fn chunked_upload_accumulates_range() {
    let h = harness().await;

    let start = h
        .http
        .post(format!("{}/v2/testing/app/blobs/uploads/", h.base))
        .send()
        .await
        .unwrap();
    let location = start.headers()["location"].to_str().unwrap().to_string();

    let first = h
        .http
        .patch(format!("{}{location}", h.base))
        .body("hello ".as_bytes().to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(first.headers()["range"].to_str().unwrap(), "0-5");

    let second = h
        .http
        .patch(format!("{}{location}", h.base))
        .body("world".as_bytes().to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(second.headers()["range"].to_str().unwrap(), "0-10");

    let digest = Digest::of_bytes(b"hello world");
    let put = h
        .http
        .put(format!("{}{location}?digest={digest}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::CREATED);
    assert!(h.store.has(&digest));
}

#[tokio::test]
async fn finalize_with_wrong_digest_discards_partial() {
    let h = harness().await;

    let start = h
        .http
        .post(format!("{}/v2/testing/app/blobs/uploads/", h.base))
        .send()
        .await
        .unwrap();
    let location = start.headers()["location"].to_str().unwrap().to_string();

    h.http
        .patch(format!("{}{location}", h.base))
        .body(b"actual content".to_vec())
        .send()
        .await
        .unwrap();

    let wrong = Digest::of_bytes(b"something else");
    let put = h
        .http
        .put(format!("{}{location}?digest={wrong}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::BAD_REQUEST);
    assert!(!h.store.has(&wrong));
    assert!(!h.store.has(&Digest::of_bytes(b"actual content")));

    // The session is gone; retrying the finalize is a 404.
    let retry = h
        .http
        .put(format!("{}{location}?digest={wrong}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(retry.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn cross_repo_mount_skips_upload() {
    let h = harness().await;
    let payload = b"shared base layer".to_vec();
    let digest = h.push_blob("library/alpine", &payload).await;

    let mount = h
        .http
        .post(format!(
            "{}/v2/testing/app/blobs/uploads/?mount={digest}&from=library/alpine",
            h.base
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(mount.status(), StatusCode::CREATED);
    assert_eq!(
        mount.headers()["docker-content-digest"].to_str().unwrap(),
        digest.as_str()
    );
}

#[tokio::test]
async fn second_push_dedups_with_head() {
    let h = harness().await;
    let payload = b"pushed once".to_vec();
    let digest = h.push_blob("library/alpine", &payload).await;

    // A well-behaved client HEADs before uploading; present blobs need no
    // second upload session at all.
    let head = h
        .http
        .head(format!("{}/v2/library/alpine/blobs/{digest}", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(head.status(), StatusCode::OK);
}

#[tokio::test]
async fn manifest_push_builds_image_and_tag_digest_lookups_agree() {
    let h = harness().await;

    let config_blob = serde_json::to_vec(&serde_json::json!({
        "architecture": "amd64",
        "os": "linux",
        "config": {"Entrypoint": ["/bin/sh"], "Env": ["PATH=/usr/bin"]}
    }))
    .unwrap();
    let layer = b"layer tar bytes".to_vec();

    let config_digest = h.push_blob("library/alpine", &config_blob).await;
    let layer_digest = h.push_blob("library/alpine", &layer).await;

    let manifest = h.manifest_for(
        &config_digest,
        config_blob.len(),
        &[(layer_digest, layer.len())],
    );
    let manifest_digest = Digest::of_bytes(&manifest);

    let put = h
        .http
        .put(format!("{}/v2/library/alpine/manifests/latest", h.base))
        .header("content-type", media_types::OCI_MANIFEST)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::CREATED);
    assert_eq!(
        put.headers()["docker-content-digest"].to_str().unwrap(),
        manifest_digest.as_str()
    );

    // Round-trip: the manifest comes back byte-identical by tag and digest.
    for reference in ["latest".to_string(), manifest_digest.to_string()] {
        let get = h
            .http
            .get(format!("{}/v2/library/alpine/manifests/{reference}", h.base))
            .send()
            .await
            .unwrap();
        assert_eq!(get.status(), StatusCode::OK);
        assert_eq!(get.bytes().await.unwrap().to_vec(), manifest);
    }

    // The push submitted a build; the stub converter completes it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let record = h.images.get("library/alpine:latest").unwrap();
        if record.metadata.status == ImageStatus::Ready {
            assert!(record.metadata.size > 0);
            assert!(!record.metadata.entrypoint.is_empty());
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "image never became ready (status {:?})",
            record.metadata.status
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Tag and digest lookups return the same Ready image.
    let by_tag = h.images.get("library/alpine:latest").unwrap();
    let by_digest = h
        .images
        .get(&format!("library/alpine@{manifest_digest}"))
        .unwrap();
    assert_eq!(by_tag.metadata.digest, by_digest.metadata.digest);
    assert_eq!(by_digest.metadata.status, ImageStatus::Ready);
}

#[tokio::test]
async fn manifest_with_missing_blobs_is_rejected() {
    let h = harness().await;

    let manifest = h.manifest_for(&Digest::of_bytes(b"absent config"), 13, &[]);
    let put = h
        .http
        .put(format!("{}/v2/library/alpine/manifests/latest", h.base))
        .header("content-type", media_types::OCI_MANIFEST)
        .body(manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn digest_collision_across_repositories_is_rejected() {
    let h = harness().await;

    let config_blob = b"{}".to_vec();
    let config_digest = h.push_blob("repo/a", &config_blob).await;
    let manifest = h.manifest_for(&config_digest, config_blob.len(), &[]);

    let first = h
        .http
        .put(format!("{}/v2/repo/a/manifests/latest", h.base))
        .header("content-type", media_types::OCI_MANIFEST)
        .body(manifest.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);

    let second = h
        .http
        .put(format!("{}/v2/repo/b/manifests/latest", h.base))
        .header("content-type", media_types::OCI_MANIFEST)
        .body(manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn manifest_list_without_host_arch_fails() {
    let h = harness().await;

    let list = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::OCI_INDEX,
        "manifests": [{
            "mediaType": media_types::OCI_MANIFEST,
            "digest": Digest::of_bytes(b"elsewhere").as_str(),
            "size": 9,
            "platform": {"architecture": "s390x", "os": "linux"}
        }]
    }))
    .unwrap();

    let put = h
        .http
        .put(format!("{}/v2/library/alpine/manifests/latest", h.base))
        .header("content-type", media_types::OCI_INDEX)
        .body(list)
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn docker_media_types_are_accepted() {
    let h = harness().await;

    let config_blob = b"{\"os\":\"linux\"}".to_vec();
    let config_digest = h.push_blob("docker/app", &config_blob).await;

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": media_types::DOCKER_MANIFEST,
        "config": {
            "mediaType": media_types::DOCKER_CONFIG,
            "digest": config_digest.as_str(),
            "size": config_blob.len(),
        },
        "layers": []
    }))
    .unwrap();

    let put = h
        .http
        .put(format!("{}/v2/docker/app/manifests/v1", h.base))
        .header("content-type", media_types::DOCKER_MANIFEST)
        .body(manifest)
        .send()
        .await
        .unwrap();
    assert_eq!(put.status(), StatusCode::CREATED);

    // Stored media type is the normalized OCI one.
    let head = h
        .http
        .head(format!("{}/v2/docker/app/manifests/v1", h.base))
        .send()
        .await
        .unwrap();
    assert_eq!(
        head.headers()["content-type"].to_str().unwrap(),
        media_types::OCI_MANIFEST
    );
}
