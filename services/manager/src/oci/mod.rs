//! OCI content types, the content-addressed cache, and the embedded registry.

pub mod reference;
pub mod registry;
pub mod store;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use reference::Reference;
pub use registry::Registry;
pub use store::BlobStore;

/// Media types understood by the cache and registry. Docker v2 types are
/// accepted on the wire and normalized to their OCI equivalents before
/// anything is persisted.
pub mod media_types {
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
    pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
    pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";
    pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
    pub const DOCKER_LAYER: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";
}

/// Maps Docker v2 media types onto their OCI equivalents.
///
/// Unknown types pass through untouched; layer handling keys off the
/// `+gzip` suffix rather than an exhaustive list.
pub fn normalize_media_type(media_type: &str) -> &str {
    match media_type {
        media_types::DOCKER_MANIFEST => media_types::OCI_MANIFEST,
        media_types::DOCKER_MANIFEST_LIST => media_types::OCI_INDEX,
        media_types::DOCKER_CONFIG => media_types::OCI_CONFIG,
        media_types::DOCKER_LAYER => media_types::OCI_LAYER_TAR_GZIP,
        other => other,
    }
}

/// Returns true for manifest-list / index media types.
pub fn is_index_media_type(media_type: &str) -> bool {
    matches!(
        media_type,
        media_types::OCI_INDEX | media_types::DOCKER_MANIFEST_LIST
    )
}

/// A `sha256:<hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest(String);

/// Errors from digest parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DigestError {
    #[error("digest must use the sha256 algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("digest hex must be 64 lowercase hex characters: {0}")]
    MalformedHex(String),
}

impl Digest {
    /// Parses a `sha256:<hex>` string.
    pub fn parse(s: &str) -> Result<Self, DigestError> {
        let Some(hex) = s.strip_prefix("sha256:") else {
            return Err(DigestError::UnsupportedAlgorithm(s.to_string()));
        };
        if hex.len() != 64 || !hex.chars().all(|c| matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(DigestError::MalformedHex(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// Computes the digest of a byte slice.
    pub fn of_bytes(data: &[u8]) -> Self {
        use sha2::Digest as _;
        Self(format!("sha256:{}", hex::encode(sha2::Sha256::digest(data))))
    }

    /// The full `sha256:<hex>` form.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hex portion, used as a file and directory name.
    pub fn hex(&self) -> &str {
        &self.0["sha256:".len()..]
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for Digest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Content descriptor as it appears in manifests and indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: Digest,
    /// Size in bytes.
    pub size: u64,
    /// Platform, present in index entries.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    /// Annotations; the cache index stores ref names here.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

/// Platform selector for multi-arch indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

/// OCI image manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// OCI image index (manifest list).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub manifests: Vec<Descriptor>,
}

impl ImageIndex {
    /// Empty index with the canonical media type.
    pub fn empty() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(media_types::OCI_INDEX.to_string()),
            manifests: Vec::new(),
        }
    }

    /// Selects the child manifest matching the host architecture.
    pub fn select_platform(&self, os: &str, architecture: &str) -> Option<&Descriptor> {
        self.manifests.iter().find(|d| {
            d.platform
                .as_ref()
                .is_some_and(|p| p.os == os && p.architecture == architecture)
        })
    }
}

/// The runtime half of an OCI image config document.
///
/// Field names inside `config` are capitalized in the wire format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(rename = "Entrypoint", default)]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd", default)]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Env", default)]
    pub env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir", default)]
    pub working_dir: Option<String>,
    #[serde(rename = "User", default)]
    pub user: Option<String>,
}

/// OCI image config document (the blob referenced by `manifest.config`).
#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub os: Option<String>,
    #[serde(default)]
    pub config: Option<RuntimeConfig>,
}

/// The host architecture in OCI notation.
pub fn host_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEX: &str = "b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7";

    #[test]
    fn digest_parse_and_accessors() {
        let digest = Digest::parse(&format!("sha256:{HEX}")).unwrap();
        assert_eq!(digest.hex(), HEX);
        assert_eq!(digest.as_str(), format!("sha256:{HEX}"));
    }

    #[test]
    fn digest_rejects_other_algorithms_and_bad_hex() {
        assert!(matches!(
            Digest::parse(&format!("sha512:{HEX}")),
            Err(DigestError::UnsupportedAlgorithm(_))
        ));
        assert!(matches!(
            Digest::parse("sha256:abc"),
            Err(DigestError::MalformedHex(_))
        ));
        assert!(Digest::parse(&format!("sha256:{}", HEX.to_uppercase())).is_err());
    }

    #[test]
    fn digest_of_bytes_matches_known_value() {
        // sha256("hello world")
        assert_eq!(
            Digest::of_bytes(b"hello world").as_str(),
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn docker_media_types_normalize_to_oci() {
        assert_eq!(
            normalize_media_type(media_types::DOCKER_MANIFEST),
            media_types::OCI_MANIFEST
        );
        assert_eq!(
            normalize_media_type(media_types::DOCKER_LAYER),
            media_types::OCI_LAYER_TAR_GZIP
        );
        assert_eq!(normalize_media_type("application/foo"), "application/foo");
    }

    #[test]
    fn index_platform_selection() {
        let index: ImageIndex = serde_json::from_value(serde_json::json!({
            "schemaVersion": 2,
            "manifests": [
                {
                    "mediaType": media_types::OCI_MANIFEST,
                    "digest": format!("sha256:{HEX}"),
                    "size": 100,
                    "platform": {"architecture": "amd64", "os": "linux"}
                },
                {
                    "mediaType": media_types::OCI_MANIFEST,
                    "digest": format!("sha256:{}", "a".repeat(64)),
                    "size": 100,
                    "platform": {"architecture": "arm64", "os": "linux"}
                }
            ]
        }))
        .unwrap();

        let chosen = index.select_platform("linux", "arm64").unwrap();
        assert_eq!(chosen.digest.hex(), "a".repeat(64));
        assert!(index.select_platform("linux", "riscv64").is_none());
    }

    #[test]
    fn runtime_config_uses_capitalized_wire_names() {
        let parsed: RuntimeConfig = serde_json::from_value(serde_json::json!({
            "Entrypoint": ["/bin/sh"],
            "Cmd": ["-c", "sleep 1"],
            "Env": ["PATH=/usr/bin"],
            "WorkingDir": "/app"
        }))
        .unwrap();
        assert_eq!(parsed.entrypoint.as_deref(), Some(&["/bin/sh".to_string()][..]));
        assert_eq!(parsed.working_dir.as_deref(), Some("/app"));
    }
}
