//! OCI image reference parsing and normalization.
//!
//! A reference is `[registry/]repository[:tag][@digest]`. Bare names follow
//! Docker conventions: `alpine` normalizes to `registry-1.docker.io` /
//! `library/alpine` / tag `latest`. A digest always wins over a tag when
//! both are present.

use thiserror::Error;

use super::{Digest, DigestError};

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";
const DEFAULT_TAG: &str = "latest";

/// Errors from reference parsing.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReferenceError {
    #[error("reference cannot be empty")]
    Empty,

    #[error("invalid repository name: {0}")]
    InvalidRepository(String),

    #[error("invalid tag: {0}")]
    InvalidTag(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(#[from] DigestError),
}

/// A normalized OCI image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Registry host (and optional port).
    pub registry: String,
    /// Repository path, e.g. `library/alpine`.
    pub repository: String,
    /// Tag, always present after normalization unless a digest was given.
    pub tag: Option<String>,
    /// Digest, when pinned.
    pub digest: Option<Digest>,
}

impl Reference {
    /// Parses and normalizes a reference string.
    pub fn parse(input: &str) -> Result<Self, ReferenceError> {
        if input.is_empty() {
            return Err(ReferenceError::Empty);
        }

        // Split off the digest first; everything after '@' is digest.
        let (name_and_tag, digest) = match input.rsplit_once('@') {
            Some((name, digest_str)) => (name, Some(Digest::parse(digest_str)?)),
            None => (input, None),
        };

        // A ':' after the last '/' is a tag separator; before it, a port.
        let (name, tag) = match name_and_tag.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') => (name, Some(tag.to_string())),
            _ => (name_and_tag, None),
        };

        if name.is_empty() {
            return Err(ReferenceError::Empty);
        }

        // The first path component is a registry only if it looks like a host.
        let (registry, repository) = match name.split_once('/') {
            Some((head, rest))
                if head.contains('.') || head.contains(':') || head == "localhost" =>
            {
                (head.to_string(), rest.to_string())
            }
            Some(_) => (DEFAULT_REGISTRY.to_string(), name.to_string()),
            None => (DEFAULT_REGISTRY.to_string(), format!("library/{name}")),
        };

        validate_repository(&repository)?;
        if let Some(tag) = &tag {
            validate_tag(tag)?;
        }

        let tag = match (&tag, &digest) {
            (None, None) => Some(DEFAULT_TAG.to_string()),
            _ => tag,
        };

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// The canonical identity string: `repository@digest` when pinned,
    /// `repository:tag` otherwise.
    pub fn canonical(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => format!("{}@{}", self.repository, digest),
            (None, Some(tag)) => format!("{}:{}", self.repository, tag),
            (None, None) => self.repository.clone(),
        }
    }

    /// Returns a copy of this reference pinned to `digest`.
    pub fn with_digest(&self, digest: Digest) -> Self {
        Self {
            digest: Some(digest),
            ..self.clone()
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}

/// Validates a repository path: slash-separated components of lowercase
/// alphanumerics with single inner separators (`.`, `_`, `__`, `-`).
pub fn validate_repository(repository: &str) -> Result<(), ReferenceError> {
    if repository.is_empty() || repository.len() > 255 {
        return Err(ReferenceError::InvalidRepository(repository.to_string()));
    }
    for component in repository.split('/') {
        if !is_valid_component(component) {
            return Err(ReferenceError::InvalidRepository(repository.to_string()));
        }
    }
    Ok(())
}

fn is_valid_component(component: &str) -> bool {
    if component.is_empty() {
        return false;
    }
    let bytes = component.as_bytes();
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    if !alnum(bytes[0]) || !alnum(bytes[bytes.len() - 1]) {
        return false;
    }
    let mut prev_sep = 0usize;
    for &b in bytes {
        match b {
            b'a'..=b'z' | b'0'..=b'9' => prev_sep = 0,
            b'_' => {
                // Docker allows at most two consecutive underscores.
                prev_sep += 1;
                if prev_sep > 2 {
                    return false;
                }
            }
            b'.' | b'-' => {
                prev_sep += 1;
                if prev_sep > 1 {
                    return false;
                }
            }
            _ => return false,
        }
    }
    true
}

/// Validates a tag: up to 128 characters of `[A-Za-z0-9_.-]`, not starting
/// with `.` or `-`.
pub fn validate_tag(tag: &str) -> Result<(), ReferenceError> {
    let valid = !tag.is_empty()
        && tag.len() <= 128
        && !tag.starts_with(['.', '-'])
        && tag
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ReferenceError::InvalidTag(tag.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const HEX: &str = "b5b2b2c507a0944348e0303114d8d93aaaa081732b86451d9bce1f432a537bc7";

    #[rstest]
    #[case("alpine", DEFAULT_REGISTRY, "library/alpine", Some("latest"))]
    #[case("alpine:3.20", DEFAULT_REGISTRY, "library/alpine", Some("3.20"))]
    #[case("myuser/myapp:v1", DEFAULT_REGISTRY, "myuser/myapp", Some("v1"))]
    #[case("ghcr.io/org/repo:v2", "ghcr.io", "org/repo", Some("v2"))]
    #[case("localhost:5000/myapp:test", "localhost:5000", "myapp", Some("test"))]
    fn parse_normalizes(
        #[case] input: &str,
        #[case] registry: &str,
        #[case] repository: &str,
        #[case] tag: Option<&str>,
    ) {
        let parsed = Reference::parse(input).unwrap();
        assert_eq!(parsed.registry, registry);
        assert_eq!(parsed.repository, repository);
        assert_eq!(parsed.tag.as_deref(), tag);
        assert!(parsed.digest.is_none());
    }

    #[test]
    fn parse_digest_reference() {
        let parsed = Reference::parse(&format!("alpine@sha256:{HEX}")).unwrap();
        assert_eq!(parsed.repository, "library/alpine");
        assert!(parsed.tag.is_none());
        assert_eq!(parsed.digest.as_ref().unwrap().hex(), HEX);
    }

    #[test]
    fn parse_tag_and_digest_keeps_both() {
        let parsed = Reference::parse(&format!("alpine:3.20@sha256:{HEX}")).unwrap();
        assert_eq!(parsed.tag.as_deref(), Some("3.20"));
        assert!(parsed.digest.is_some());
        // Canonical form prefers the digest.
        assert_eq!(parsed.canonical(), format!("library/alpine@sha256:{HEX}"));
    }

    #[test]
    fn parse_rejects_malformed_input() {
        assert!(Reference::parse("").is_err());
        assert!(Reference::parse("UPPER/case:tag").is_err());
        assert!(Reference::parse("alpine:").is_err());
        assert!(Reference::parse("re..po").is_err());
        assert!(Reference::parse("alpine@sha256:short").is_err());
        assert!(Reference::parse("alpine:-bad").is_err());
    }

    #[test]
    fn component_separator_rules() {
        assert!(validate_repository("a__b/c.d-e").is_ok());
        assert!(validate_repository("a___b").is_err());
        assert!(validate_repository("a--b").is_err());
        assert!(validate_repository("-ab").is_err());
        assert!(validate_repository("ab-").is_err());
    }

    #[test]
    fn canonical_for_tag_only() {
        let parsed = Reference::parse("alpine:edge").unwrap();
        assert_eq!(parsed.canonical(), "library/alpine:edge");
    }
}
