//! Embedded OCI Distribution registry (push half).
//!
//! Serves enough of the distribution protocol that standard push clients
//! (`docker push`, `skopeo copy`, `crane push`) can upload images straight
//! into the local blob store:
//!
//! ```text
//! GET  /v2/
//! HEAD /v2/{name}/blobs/{digest}            GET also served for read-back
//! POST /v2/{name}/blobs/uploads/            ?mount=&from= honored
//! PATCH/PUT /v2/{name}/blobs/uploads/{id}
//! HEAD/GET/PUT /v2/{name}/manifests/{ref}
//! ```
//!
//! Repository names contain slashes, which rules out fixed-segment route
//! patterns; a single fallback handler parses the path instead. Docker v2
//! media types are normalized to OCI before anything is persisted. A
//! successfully pushed image manifest is handed to the image manager keyed
//! by its digest.

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tokio_util::io::ReaderStream;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use hypeman_id::UploadId;

use crate::image::ImageManager;
use crate::oci::reference::{validate_repository, validate_tag};
use crate::oci::store::{PendingBlob, StoreError, REF_NAME_ANNOTATION};
use crate::oci::{
    host_architecture, is_index_media_type, media_types, normalize_media_type, BlobStore, Digest,
    ImageIndex, Manifest,
};

const API_VERSION_HEADER: &str = "docker-distribution-api-version";
const API_VERSION: &str = "registry/2.0";
const CONTENT_DIGEST_HEADER: &str = "docker-content-digest";
const UPLOAD_UUID_HEADER: &str = "docker-upload-uuid";

/// Upper bound for a single request body (manifest or blob chunk).
const MAX_BODY_BYTES: usize = 2 * 1024 * 1024 * 1024;

/// One resumable upload session.
struct Upload {
    repository: String,
    pending: PendingBlob,
    created_at: Instant,
}

/// Shared state of the embedded registry.
pub struct Registry {
    store: Arc<BlobStore>,
    images: Arc<ImageManager>,
    uploads: Mutex<HashMap<String, Upload>>,
    session_ttl: Duration,
}

impl Registry {
    /// Creates the registry over the shared store and image manager.
    pub fn new(store: Arc<BlobStore>, images: Arc<ImageManager>, session_ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            images,
            uploads: Mutex::new(HashMap::new()),
            session_ttl,
        })
    }

    /// Builds the axum router serving the `/v2` surface.
    pub fn router(self: &Arc<Self>) -> Router {
        // axum routes HEAD to GET handlers automatically.
        Router::new()
            .route("/v2/", get(api_base))
            .fallback(dispatch)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(self))
    }

    /// Spawns the upload-session garbage collector.
    pub fn spawn_session_gc(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let period = (registry.session_ttl / 4).max(Duration::from_secs(1));
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                registry.collect_expired_sessions().await;
            }
        })
    }

    async fn collect_expired_sessions(&self) {
        let mut uploads = self.uploads.lock().await;
        let expired: Vec<String> = uploads
            .iter()
            .filter(|(_, u)| u.created_at.elapsed() > self.session_ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            if let Some(upload) = uploads.remove(&id) {
                warn!(session = %id, repository = %upload.repository, "expiring stale upload session");
                self.store.discard(upload.pending);
            }
        }
    }
}

/// A parsed `/v2` request path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Base,
    Blob { name: String, digest: String },
    UploadStart { name: String },
    Upload { name: String, session: String },
    Manifest { name: String, reference: String },
}

/// Parses a `/v2/...` path. Repository names may contain slashes, so the
/// path is split on the rightmost known marker.
fn parse_route(path: &str) -> Option<Route> {
    let path = path.strip_suffix('/').unwrap_or(path);
    if path == "/v2" {
        return Some(Route::Base);
    }
    let rest = path.strip_prefix("/v2/")?;

    if let Some((name, session)) = rest.rsplit_once("/blobs/uploads/") {
        return Some(Route::Upload {
            name: name.to_string(),
            session: session.to_string(),
        });
    }
    if let Some(name) = rest.strip_suffix("/blobs/uploads") {
        return Some(Route::UploadStart {
            name: name.to_string(),
        });
    }
    if let Some((name, digest)) = rest.rsplit_once("/blobs/") {
        return Some(Route::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        });
    }
    if let Some((name, reference)) = rest.rsplit_once("/manifests/") {
        return Some(Route::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        });
    }
    None
}

async fn api_base() -> Response {
    let mut response = StatusCode::OK.into_response();
    response.headers_mut().insert(
        API_VERSION_HEADER,
        HeaderValue::from_static(API_VERSION),
    );
    response
}

async fn dispatch(State(registry): State<Arc<Registry>>, request: Request) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let query = request.uri().query().unwrap_or("").to_string();

    let Some(route) = parse_route(&path) else {
        return registry_error(StatusCode::NOT_FOUND, "NAME_UNKNOWN", "unknown path");
    };

    // `http::Method` is not structurally matchable, so dispatch on names.
    match (method.as_str(), route) {
        ("GET" | "HEAD", Route::Base) => api_base().await,
        ("HEAD", Route::Blob { name, digest }) => {
            registry.head_blob(&name, &digest, false).await
        }
        ("GET", Route::Blob { name, digest }) => {
            registry.head_blob(&name, &digest, true).await
        }
        ("POST", Route::UploadStart { name }) => registry.start_upload(&name, &query).await,
        ("PATCH", Route::Upload { name, session }) => {
            registry.patch_upload(&name, &session, request.into_body()).await
        }
        ("PUT", Route::Upload { name, session }) => {
            registry
                .finalize_upload(&name, &session, &query, request.into_body())
                .await
        }
        ("HEAD", Route::Manifest { name, reference }) => {
            registry.get_manifest(&name, &reference, false).await
        }
        ("GET", Route::Manifest { name, reference }) => {
            registry.get_manifest(&name, &reference, true).await
        }
        ("PUT", Route::Manifest { name, reference }) => {
            registry.put_manifest(&name, &reference, request).await
        }
        _ => registry_error(
            StatusCode::METHOD_NOT_ALLOWED,
            "UNSUPPORTED",
            "method not supported for this path",
        ),
    }
}

impl Registry {
    async fn head_blob(&self, name: &str, digest: &str, with_body: bool) -> Response {
        if validate_repository(name).is_err() {
            return registry_error(StatusCode::BAD_REQUEST, "NAME_INVALID", "invalid repository");
        }
        let Ok(digest) = Digest::parse(digest) else {
            return registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "invalid digest");
        };
        let Ok(size) = self.store.size_of(&digest) else {
            return registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown");
        };

        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, size)
            .header(CONTENT_DIGEST_HEADER, digest.as_str())
            .header(header::CONTENT_TYPE, "application/octet-stream");

        if !with_body {
            return builder
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }

        match tokio::fs::File::open(self.store.blob_path(&digest)).await {
            Ok(file) => builder
                .body(Body::from_stream(ReaderStream::new(file)))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(_) => registry_error(StatusCode::NOT_FOUND, "BLOB_UNKNOWN", "blob unknown"),
        }
    }

    async fn start_upload(&self, name: &str, query: &str) -> Response {
        if validate_repository(name).is_err() {
            return registry_error(StatusCode::BAD_REQUEST, "NAME_INVALID", "invalid repository");
        }

        // Cross-repo mount: if the blob is already here, content addressing
        // makes the repository boundary irrelevant.
        let params = parse_query(query);
        if let Some(mount) = params.get("mount") {
            if let Ok(digest) = Digest::parse(mount) {
                if self.store.has(&digest) {
                    debug!(repository = %name, digest = %digest, "cross-repo mount hit");
                    return Response::builder()
                        .status(StatusCode::CREATED)
                        .header(header::LOCATION, format!("/v2/{name}/blobs/{digest}"))
                        .header(CONTENT_DIGEST_HEADER, digest.as_str())
                        .body(Body::empty())
                        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
                }
            }
        }

        let pending = match self.store.begin() {
            Ok(pending) => pending,
            Err(e) => return store_error_response(e),
        };
        let session = UploadId::generate(&mut StdRng::from_os_rng()).to_string();
        self.uploads.lock().await.insert(
            session.clone(),
            Upload {
                repository: name.to_string(),
                pending,
                created_at: Instant::now(),
            },
        );

        Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(
                header::LOCATION,
                format!("/v2/{name}/blobs/uploads/{session}"),
            )
            .header(UPLOAD_UUID_HEADER, session)
            .header(header::RANGE, "0-0")
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    async fn patch_upload(&self, name: &str, session: &str, body: Body) -> Response {
        let chunk = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return registry_error(StatusCode::BAD_REQUEST, "SIZE_INVALID", "body too large")
            }
        };

        let mut uploads = self.uploads.lock().await;
        let Some(upload) = uploads.get_mut(session) else {
            return registry_error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", "unknown session");
        };
        if upload.repository != name {
            return registry_error(
                StatusCode::BAD_REQUEST,
                "BLOB_UPLOAD_INVALID",
                "session belongs to a different repository",
            );
        }
        if let Err(e) = upload.pending.write_all(&chunk) {
            warn!(session = %session, error = %e, "chunk write failed");
            if let Some(upload) = uploads.remove(session) {
                self.store.discard(upload.pending);
            }
            return registry_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "BLOB_UPLOAD_INVALID",
                "write failed",
            );
        }

        let written = upload.pending.written();
        Response::builder()
            .status(StatusCode::ACCEPTED)
            .header(
                header::LOCATION,
                format!("/v2/{name}/blobs/uploads/{session}"),
            )
            .header(UPLOAD_UUID_HEADER, session)
            .header(header::RANGE, format!("0-{}", written.saturating_sub(1)))
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }

    async fn finalize_upload(
        &self,
        name: &str,
        session: &str,
        query: &str,
        body: Body,
    ) -> Response {
        let params = parse_query(query);
        let Some(digest_param) = params.get("digest") else {
            return registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "digest missing");
        };
        let Ok(expected) = Digest::parse(digest_param) else {
            return registry_error(StatusCode::BAD_REQUEST, "DIGEST_INVALID", "invalid digest");
        };

        let chunk = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return registry_error(StatusCode::BAD_REQUEST, "SIZE_INVALID", "body too large")
            }
        };

        let mut uploads = self.uploads.lock().await;
        let Some(mut upload) = uploads.remove(session) else {
            return registry_error(StatusCode::NOT_FOUND, "BLOB_UPLOAD_UNKNOWN", "unknown session");
        };
        drop(uploads);

        if upload.repository != name {
            self.store.discard(upload.pending);
            return registry_error(
                StatusCode::BAD_REQUEST,
                "BLOB_UPLOAD_INVALID",
                "session belongs to a different repository",
            );
        }
        if !chunk.is_empty() {
            if let Err(e) = upload.pending.write_all(&chunk) {
                warn!(session = %session, error = %e, "final chunk write failed");
                self.store.discard(upload.pending);
                return registry_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "BLOB_UPLOAD_INVALID",
                    "write failed",
                );
            }
        }

        match self.store.commit(upload.pending, Some(&expected)) {
            Ok((digest, size)) => {
                info!(repository = %name, digest = %digest, size, "blob uploaded");
                Response::builder()
                    .status(StatusCode::CREATED)
                    .header(header::LOCATION, format!("/v2/{name}/blobs/{digest}"))
                    .header(CONTENT_DIGEST_HEADER, digest.as_str())
                    .body(Body::empty())
                    .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
            }
            Err(StoreError::DigestMismatch { expected, actual }) => {
                warn!(repository = %name, expected = %expected, actual = %actual, "upload digest mismatch");
                registry_error(
                    StatusCode::BAD_REQUEST,
                    "DIGEST_INVALID",
                    "uploaded content does not match digest",
                )
            }
            Err(e) => store_error_response(e),
        }
    }

    async fn get_manifest(&self, name: &str, reference: &str, with_body: bool) -> Response {
        let descriptor = if let Ok(digest) = Digest::parse(reference) {
            self.store
                .find_by_digest(&digest)
                .ok()
                .and_then(|found| found.into_iter().find(|d| ref_repo(d) == Some(name)))
        } else {
            self.store.find_by_ref(&format!("{name}:{reference}")).ok().flatten()
        };

        let Some(descriptor) = descriptor else {
            return registry_error(StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN", "manifest unknown");
        };

        let builder = Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, descriptor.media_type.clone())
            .header(header::CONTENT_LENGTH, descriptor.size)
            .header(CONTENT_DIGEST_HEADER, descriptor.digest.as_str());

        if !with_body {
            return builder
                .body(Body::empty())
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response());
        }
        match self.store.read_blob(&descriptor.digest) {
            Ok(bytes) => builder
                .body(Body::from(bytes))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()),
            Err(e) => store_error_response(e),
        }
    }

    async fn put_manifest(&self, name: &str, reference: &str, request: Request) -> Response {
        if validate_repository(name).is_err() {
            return registry_error(StatusCode::BAD_REQUEST, "NAME_INVALID", "invalid repository");
        }

        let content_type = request
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(media_types::OCI_MANIFEST)
            .to_string();
        let media_type = normalize_media_type(&content_type).to_string();

        let bytes = match axum::body::to_bytes(request.into_body(), MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(_) => {
                return registry_error(StatusCode::BAD_REQUEST, "SIZE_INVALID", "body too large")
            }
        };
        let computed = Digest::of_bytes(&bytes);

        // A digest reference must match the content it names.
        let tag = match Digest::parse(reference) {
            Ok(ref_digest) => {
                if ref_digest != computed {
                    return registry_error(
                        StatusCode::BAD_REQUEST,
                        "DIGEST_INVALID",
                        "manifest digest does not match reference",
                    );
                }
                None
            }
            Err(_) => {
                if validate_tag(reference).is_err() {
                    return registry_error(StatusCode::BAD_REQUEST, "TAG_INVALID", "invalid tag");
                }
                Some(reference.to_string())
            }
        };

        // Conservative stance on digest collisions across repositories: the
        // same manifest pushed under two repos is rejected rather than
        // cross-linked.
        match self.store.find_by_digest(&computed) {
            Ok(existing) => {
                if existing
                    .iter()
                    .any(|d| ref_repo(d).is_some_and(|repo| repo != name))
                {
                    return registry_error(
                        StatusCode::CONFLICT,
                        "MANIFEST_INVALID",
                        "digest already exists under a different repository",
                    );
                }
            }
            Err(e) => return store_error_response(e),
        }

        // The image manifest the build will consume: either the pushed one,
        // or the host-arch child of a pushed index.
        let image_digest = if is_index_media_type(&media_type) {
            let index: ImageIndex = match serde_json::from_slice(&bytes) {
                Ok(index) => index,
                Err(_) => {
                    return registry_error(
                        StatusCode::BAD_REQUEST,
                        "MANIFEST_INVALID",
                        "malformed image index",
                    )
                }
            };
            match index.select_platform("linux", host_architecture()) {
                Some(child) => child.digest.clone(),
                None => {
                    return registry_error(
                        StatusCode::BAD_REQUEST,
                        "MANIFEST_INVALID",
                        &format!("no manifest for linux/{}", host_architecture()),
                    )
                }
            }
        } else {
            computed.clone()
        };

        // Writes go blob-then-index, and the index never references blobs
        // that are not fully stored.
        if image_digest != computed && !self.store.has(&image_digest) {
            return registry_error(
                StatusCode::BAD_REQUEST,
                "MANIFEST_BLOB_UNKNOWN",
                "index references a manifest that was not pushed",
            );
        }
        if image_digest == computed {
            let manifest: Manifest = match serde_json::from_slice(&bytes) {
                Ok(manifest) => manifest,
                Err(_) => {
                    return registry_error(
                        StatusCode::BAD_REQUEST,
                        "MANIFEST_INVALID",
                        "malformed manifest",
                    )
                }
            };
            for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
                if !self.store.has(&descriptor.digest) {
                    return registry_error(
                        StatusCode::BAD_REQUEST,
                        "MANIFEST_BLOB_UNKNOWN",
                        &format!("missing blob {}", descriptor.digest),
                    );
                }
            }
        }

        if let Err(e) = self.store.put_bytes(&bytes) {
            return store_error_response(e);
        }
        let ref_name = match &tag {
            Some(tag) => format!("{name}:{tag}"),
            None => format!("{name}@{computed}"),
        };
        if let Err(e) =
            self.store
                .record_manifest(&ref_name, &media_type, &computed, bytes.len() as u64)
        {
            return store_error_response(e);
        }

        info!(repository = %name, reference = %reference, digest = %computed, "manifest pushed");
        match self.images.submit_push(name, &image_digest, tag.as_deref()) {
            Ok(record) => {
                debug!(
                    repository = %name,
                    digest = %image_digest,
                    position = ?record.queue_position,
                    "image submitted for conversion"
                );
            }
            Err(e) => {
                // The push itself succeeded; the client can re-trigger the
                // build by pushing again or calling image create.
                warn!(repository = %name, digest = %image_digest, error = %e, "image submission failed");
            }
        }

        Response::builder()
            .status(StatusCode::CREATED)
            .header(header::LOCATION, format!("/v2/{name}/manifests/{computed}"))
            .header(CONTENT_DIGEST_HEADER, computed.as_str())
            .body(Body::empty())
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Repository portion of a descriptor's ref-name annotation.
fn ref_repo(descriptor: &crate::oci::Descriptor) -> Option<&str> {
    let ref_name = descriptor.annotations.get(REF_NAME_ANNOTATION)?;
    let ref_name = ref_name.split_once('@').map_or(ref_name.as_str(), |(n, _)| n);
    Some(ref_name.rsplit_once(':').map_or(ref_name, |(n, _)| n))
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn registry_error(status: StatusCode, code: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "errors": [{ "code": code, "message": message }]
    });
    (status, axum::Json(body)).into_response()
}

fn store_error_response(err: StoreError) -> Response {
    warn!(error = %err, "store operation failed");
    registry_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "UNKNOWN",
        "storage failure",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_route_base() {
        assert_eq!(parse_route("/v2"), Some(Route::Base));
        assert_eq!(parse_route("/v2/"), Some(Route::Base));
        assert_eq!(parse_route("/v1/"), None);
    }

    #[test]
    fn parse_route_blobs_with_nested_name() {
        assert_eq!(
            parse_route("/v2/library/alpine/blobs/sha256:abc"),
            Some(Route::Blob {
                name: "library/alpine".to_string(),
                digest: "sha256:abc".to_string(),
            })
        );
    }

    #[test]
    fn parse_route_uploads() {
        assert_eq!(
            parse_route("/v2/a/b/c/blobs/uploads/"),
            Some(Route::UploadStart {
                name: "a/b/c".to_string(),
            })
        );
        assert_eq!(
            parse_route("/v2/a/b/blobs/uploads/sess123"),
            Some(Route::Upload {
                name: "a/b".to_string(),
                session: "sess123".to_string(),
            })
        );
    }

    #[test]
    fn parse_route_manifests() {
        assert_eq!(
            parse_route("/v2/library/alpine/manifests/latest"),
            Some(Route::Manifest {
                name: "library/alpine".to_string(),
                reference: "latest".to_string(),
            })
        );
        assert_eq!(
            parse_route("/v2/library/alpine/manifests/sha256:abc"),
            Some(Route::Manifest {
                name: "library/alpine".to_string(),
                reference: "sha256:abc".to_string(),
            })
        );
    }

    #[test]
    fn ref_repo_strips_tag_and_digest() {
        let mut annotations = HashMap::new();
        annotations.insert(
            REF_NAME_ANNOTATION.to_string(),
            "library/alpine:latest".to_string(),
        );
        let descriptor = crate::oci::Descriptor {
            media_type: media_types::OCI_MANIFEST.to_string(),
            digest: Digest::of_bytes(b"x"),
            size: 1,
            platform: None,
            annotations,
        };
        assert_eq!(ref_repo(&descriptor), Some("library/alpine"));
    }

    #[test]
    fn query_parsing() {
        let params = parse_query("digest=sha256:abc&mount=sha256:def");
        assert_eq!(params["digest"], "sha256:abc");
        assert_eq!(params["mount"], "sha256:def");
        assert!(parse_query("").is_empty());
    }
}
