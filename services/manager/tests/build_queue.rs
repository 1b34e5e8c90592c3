//! Build pipeline observability: queue positions, dedup, failure capture,
//! and deletion guards.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use common::{no_references, test_images, test_paths, test_store, StubConverter};
use hypeman_manager::error::Error;
use hypeman_manager::image::ImageReferences;
use hypeman_manager::oci::Digest;
use hypeman_manager::ImageStatus;

fn digest(n: u8) -> Digest {
    Digest::of_bytes(&[n; 16])
}

#[tokio::test]
async fn queue_positions_never_increase_while_waiting() {
    let dir = TempDir::new().unwrap();
    let paths = test_paths(&dir);
    let store = test_store(&paths);
    // Slow builds saturate the workers so later submissions wait in line.
    let converter = Arc::new(StubConverter::slow(Duration::from_millis(150)));
    let images = test_images(&paths, &store, converter, no_references());

    let records: Vec<_> = (1..=4)
        .map(|n| {
            images
                .submit_push(&format!("queued/app{n}"), &digest(n), Some("v1"))
                .unwrap()
        })
        .collect();
    // Later submissions start deeper in the queue.
    let last = &records[3];
    let mut previous = last.queue_position.unwrap();
    assert!(previous >= 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = images.get("queued/app4:v1").unwrap();
        if record.metadata.status == ImageStatus::Ready {
            break;
        }
        if let Some(position) = record.queue_position {
            assert!(
                position <= previous,
                "queue position increased: {previous} -> {position}"
            );
            previous = position;
        }
        assert!(tokio::time::Instant::now() < deadline, "build never finished");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn resubmitting_a_digest_attaches_instead_of_queueing() {
    let dir = TempDir::new().unwrap();
    let paths = test_paths(&dir);
    let store = test_store(&paths);
    let converter = Arc::new(StubConverter::slow(Duration::from_millis(200)));
    let images = test_images(&paths, &store, converter.clone(), no_references());

    let first = images
        .submit_push("dedup/app", &digest(9), Some("v1"))
        .unwrap();
    let again = images
        .submit_push("dedup/app", &digest(9), Some("v1"))
        .unwrap();
    assert_eq!(first.metadata.digest, again.metadata.digest);

    // Wait for completion, then confirm one conversion served both.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while images.get("dedup/app:v1").unwrap().metadata.status != ImageStatus::Ready {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(converter.seen.lock().await.len(), 1);
}

#[tokio::test]
async fn failed_builds_record_the_error() {
    let dir = TempDir::new().unwrap();
    let paths = test_paths(&dir);
    let store = test_store(&paths);
    let images = test_images(
        &paths,
        &store,
        Arc::new(StubConverter::failing()),
        no_references(),
    );

    images
        .submit_push("broken/app", &digest(3), Some("v1"))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let record = loop {
        let record = images.get("broken/app:v1").unwrap();
        if record.metadata.status == ImageStatus::Failed {
            break record;
        }
        assert!(tokio::time::Instant::now() < deadline, "build never failed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert!(record
        .metadata
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("stub converter failure"));
    // No rootfs was left behind.
    assert!(!paths
        .image_rootfs("broken/app", digest(3).hex())
        .exists());

    // A fresh submit after failure gets a fresh build.
    let retry = images
        .submit_push("broken/app", &digest(3), Some("v1"))
        .unwrap();
    assert_eq!(retry.metadata.status, ImageStatus::Pending);
}

#[tokio::test]
async fn list_reports_status_and_positions() {
    let dir = TempDir::new().unwrap();
    let paths = test_paths(&dir);
    let store = test_store(&paths);
    let converter = Arc::new(StubConverter::slow(Duration::from_millis(300)));
    let images = test_images(&paths, &store, converter, no_references());

    for n in 1..=3 {
        images
            .submit_push(&format!("listed/app{n}"), &digest(n), Some("v1"))
            .unwrap();
    }

    let listed = images.list().unwrap();
    assert_eq!(listed.len(), 3);
    for record in &listed {
        assert!(matches!(
            record.metadata.status,
            ImageStatus::Pending | ImageStatus::Building
        ));
        assert!(record.queue_position.is_some());
    }
}

#[tokio::test]
async fn delete_respects_references_and_cleans_tags() {
    struct OneReference;
    impl ImageReferences for OneReference {
        fn referencing_instances(&self, digest: &Digest) -> usize {
            usize::from(digest == &digest_for_guard())
        }
    }

    let dir = TempDir::new().unwrap();
    let paths = test_paths(&dir);
    let store = test_store(&paths);
    let images = test_images(
        &paths,
        &store,
        Arc::new(StubConverter::new()),
        Arc::new(OneReference),
    );

    let guarded = digest_for_guard();
    images
        .submit_push("guarded/app", &guarded, Some("v1"))
        .unwrap();
    images
        .submit_push("free/app", &digest(42), Some("v1"))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while images.get("free/app:v1").unwrap().metadata.status != ImageStatus::Ready {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let err = images.delete("guarded/app:v1").unwrap_err();
    assert!(matches!(err, Error::InUse(_)));

    images.delete("free/app:v1").unwrap();
    assert!(matches!(
        images.get("free/app:v1").unwrap_err(),
        Error::NotFound(_)
    ));
    assert!(!paths.tag_link("free/app", "v1").exists());

    // Deleting again reports NotFound, not a crash.
    assert!(matches!(
        images.delete("free/app:v1").unwrap_err(),
        Error::NotFound(_)
    ));
}

fn digest_for_guard() -> Digest {
    Digest::of_bytes(b"guarded image manifest")
}
