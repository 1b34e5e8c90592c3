//! Upstream registry client for resolving and pulling images.
//!
//! Implements the pull half of the OCI Distribution spec against remote
//! registries: tag → digest resolution, manifest fetch, and layer download
//! into the local blob store. Anonymous bearer-token auth is handled
//! transparently for registries that send a `WWW-Authenticate` challenge
//! (Docker Hub, ghcr.io).

use std::collections::HashMap;
use std::io::Write as _;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{header, Client, Response, StatusCode};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::oci::store::StoreError;
use crate::oci::{
    host_architecture, is_index_media_type, media_types, BlobStore, Digest, ImageIndex, Manifest,
    Reference,
};

/// Errors from upstream pulls.
#[derive(Debug, Error)]
pub enum PullError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("manifest not found: {0}")]
    NotFound(String),

    #[error("registry authentication failed for {0}")]
    AuthFailed(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("no manifest for platform {os}/{architecture}")]
    NoMatchingPlatform { os: String, architecture: String },

    #[error("unsupported manifest media type: {0}")]
    UnsupportedManifest(String),

    #[error("pull timed out")]
    Timeout,
}

/// Tuning for the pull client.
#[derive(Debug, Clone)]
pub struct PullConfig {
    /// Per-blob download timeout.
    pub blob_timeout: Duration,
    /// Overall HTTP client timeout.
    pub total_timeout: Duration,
    /// Plain-HTTP registries (development only).
    pub insecure_registries: Vec<String>,
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            blob_timeout: Duration::from_secs(300),
            total_timeout: Duration::from_secs(1800),
            insecure_registries: Vec::new(),
        }
    }
}

const MANIFEST_ACCEPT: &str = concat!(
    "application/vnd.oci.image.manifest.v1+json, ",
    "application/vnd.oci.image.index.v1+json, ",
    "application/vnd.docker.distribution.manifest.v2+json, ",
    "application/vnd.docker.distribution.manifest.list.v2+json"
);

/// Client for pulling manifests and blobs from upstream registries.
pub struct PullClient {
    http: Client,
    config: PullConfig,
    /// Bearer tokens keyed by (registry, repository).
    tokens: Mutex<HashMap<(String, String), String>>,
}

impl PullClient {
    /// Builds a pull client.
    pub fn new(config: PullConfig) -> Result<Self, PullError> {
        let http = Client::builder().timeout(config.total_timeout).build()?;
        Ok(Self {
            http,
            config,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn base_url(&self, registry: &str) -> String {
        if self
            .config
            .insecure_registries
            .iter()
            .any(|r| r == registry)
        {
            format!("http://{registry}")
        } else {
            format!("https://{registry}")
        }
    }

    /// Resolves a reference to the digest of its host-platform image
    /// manifest. Manifest lists are descended one level.
    pub async fn resolve(&self, reference: &Reference) -> Result<Digest, PullError> {
        if let Some(digest) = &reference.digest {
            let (bytes, media_type) = self.fetch_raw_manifest(reference, digest.as_str()).await?;
            return self
                .descend_to_image(reference, digest.clone(), &bytes, &media_type)
                .await;
        }

        let tag = reference.tag.as_deref().unwrap_or("latest");
        let (bytes, media_type) = self.fetch_raw_manifest(reference, tag).await?;
        let digest = Digest::of_bytes(&bytes);
        self.descend_to_image(reference, digest, &bytes, &media_type)
            .await
    }

    async fn descend_to_image(
        &self,
        reference: &Reference,
        digest: Digest,
        bytes: &[u8],
        media_type: &str,
    ) -> Result<Digest, PullError> {
        if !is_index_media_type(media_type) {
            return Ok(digest);
        }

        let index: ImageIndex = serde_json::from_slice(bytes)?;
        let os = "linux";
        let architecture = host_architecture();
        let child = index
            .select_platform(os, architecture)
            .ok_or_else(|| PullError::NoMatchingPlatform {
                os: os.to_string(),
                architecture: architecture.to_string(),
            })?;

        debug!(
            reference = %reference,
            index_digest = %digest,
            image_digest = %child.digest,
            "descended manifest list to host platform"
        );
        Ok(child.digest.clone())
    }

    /// Fetches an image manifest by digest, verifying content addressing.
    pub async fn fetch_manifest(
        &self,
        reference: &Reference,
        digest: &Digest,
    ) -> Result<(Vec<u8>, Manifest), PullError> {
        let (bytes, media_type) = self.fetch_raw_manifest(reference, digest.as_str()).await?;

        let computed = Digest::of_bytes(&bytes);
        if &computed != digest {
            return Err(PullError::DigestMismatch {
                expected: digest.to_string(),
                actual: computed.to_string(),
            });
        }
        if is_index_media_type(&media_type) {
            return Err(PullError::UnsupportedManifest(media_type));
        }

        let manifest: Manifest = serde_json::from_slice(&bytes)?;
        Ok((bytes, manifest))
    }

    async fn fetch_raw_manifest(
        &self,
        reference: &Reference,
        tag_or_digest: &str,
    ) -> Result<(Vec<u8>, String), PullError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url(&reference.registry),
            reference.repository,
            tag_or_digest
        );

        let response = self
            .get_authenticated(reference, &url, MANIFEST_ACCEPT)
            .await?;

        match response.status() {
            StatusCode::OK => {
                let media_type = response
                    .headers()
                    .get(header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or(media_types::OCI_MANIFEST)
                    .to_string();
                let bytes = response.bytes().await?;
                Ok((bytes.to_vec(), media_type))
            }
            StatusCode::NOT_FOUND => Err(PullError::NotFound(format!(
                "{}/{}:{tag_or_digest}",
                reference.registry, reference.repository
            ))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(PullError::AuthFailed(reference.registry.clone()))
            }
            _ => Err(PullError::Http(response.error_for_status().unwrap_err())),
        }
    }

    /// Downloads a blob into the store, verifying its digest on the fly.
    /// Returns the stored size; a blob already present is not re-fetched.
    pub async fn pull_blob(
        &self,
        reference: &Reference,
        digest: &Digest,
        store: &Arc<BlobStore>,
    ) -> Result<u64, PullError> {
        if store.has(digest) {
            debug!(digest = %digest, "blob already cached");
            return store.size_of(digest).map_err(Into::into);
        }

        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url(&reference.registry),
            reference.repository,
            digest
        );

        let response = tokio::time::timeout(
            self.config.blob_timeout,
            self.get_authenticated(reference, &url, "*/*"),
        )
        .await
        .map_err(|_| PullError::Timeout)??;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(PullError::NotFound(digest.to_string())),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(PullError::AuthFailed(reference.registry.clone()))
            }
            _ => return Err(PullError::Http(response.error_for_status().unwrap_err())),
        }

        let mut pending = store.begin()?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            pending
                .write_all(&chunk)
                .map_err(|e| PullError::Store(StoreError::Io(e)))?;
        }

        let (stored, size) = match store.commit(pending, Some(digest)) {
            Ok(ok) => ok,
            Err(StoreError::DigestMismatch { expected, actual }) => {
                return Err(PullError::DigestMismatch { expected, actual })
            }
            Err(e) => return Err(e.into()),
        };

        info!(digest = %stored, size, "blob downloaded");
        Ok(size)
    }

    /// Performs a GET, answering bearer-token challenges once per repo.
    async fn get_authenticated(
        &self,
        reference: &Reference,
        url: &str,
        accept: &str,
    ) -> Result<Response, PullError> {
        let token_key = (reference.registry.clone(), reference.repository.clone());

        let cached = self.tokens.lock().await.get(&token_key).cloned();
        let mut request = self.http.get(url).header(header::ACCEPT, accept);
        if let Some(token) = &cached {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;

        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let Some(challenge) = challenge else {
            return Ok(response);
        };

        let token = self.fetch_token(reference, &challenge).await?;
        self.tokens
            .lock()
            .await
            .insert(token_key, token.clone());

        let retry = self
            .http
            .get(url)
            .header(header::ACCEPT, accept)
            .bearer_auth(token)
            .send()
            .await?;
        Ok(retry)
    }

    /// Fetches an anonymous pull token from the challenge's realm.
    async fn fetch_token(
        &self,
        reference: &Reference,
        challenge: &str,
    ) -> Result<String, PullError> {
        let params = parse_bearer_challenge(challenge);
        let realm = params
            .get("realm")
            .ok_or_else(|| PullError::AuthFailed(reference.registry.clone()))?;

        let mut request = self.http.get(realm).query(&[(
            "scope",
            format!("repository:{}:pull", reference.repository),
        )]);
        if let Some(service) = params.get("service") {
            request = request.query(&[("service", service.as_str())]);
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            token: Option<String>,
            #[serde(default)]
            access_token: Option<String>,
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(PullError::AuthFailed(reference.registry.clone()));
        }
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .ok_or_else(|| PullError::AuthFailed(reference.registry.clone()))
    }
}

/// Parses `Bearer realm="...",service="...",scope="..."` into a map.
fn parse_bearer_challenge(challenge: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let Some(rest) = challenge.strip_prefix("Bearer ") else {
        return params;
    };
    for part in rest.split(',') {
        if let Some((key, value)) = part.trim().split_once('=') {
            params.insert(
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            );
        }
    }
    params
}
