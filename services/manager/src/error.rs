//! Error taxonomy visible at the manager boundary.
//!
//! Subsystems keep their own error enums close to the code that produces
//! them and convert into this taxonomy at the public surface, preserving the
//! kind a caller can act on. Everything without an actionable kind collapses
//! into `Internal` and is logged with context at the point of conversion.

use thiserror::Error;

/// Result alias for manager-boundary operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the public manager APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// The referenced image, instance, or volume does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A name or digest collided with an existing resource.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A malformed OCI reference or instance name.
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// The requested transition is not permitted from the current state.
    #[error("invalid state: {operation} not permitted while {state}")]
    InvalidState {
        /// Operation that was attempted.
        operation: String,
        /// State the resource was in.
        state: String,
    },

    /// A name matched more than one instance.
    #[error("ambiguous name: {0} matches multiple instances")]
    AmbiguousName(String),

    /// Instance creation was requested against a non-Ready image.
    #[error("image {name} is not ready (status: {status})")]
    ImageNotReady {
        /// Image reference as given by the caller.
        name: String,
        /// Current image status.
        status: String,
    },

    /// Deletion was requested while the resource is still referenced.
    #[error("in use: {0}")]
    InUse(String),

    /// An aggregate vcpu/memory/volume limit would be exceeded.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// A volume archive exceeded the configured size limit.
    #[error("archive too large: {size} bytes exceeds limit {limit}")]
    ArchiveTooLarge {
        /// Observed size in bytes.
        size: u64,
        /// Configured limit in bytes.
        limit: u64,
    },

    /// A volume archive contained an unsafe member path.
    #[error("invalid archive path: {0}")]
    InvalidArchivePath(String),

    /// The configured guest subnet collides with an existing host route.
    #[error(
        "subnet conflict: configured range {subnet} overlaps route {route} via {device}; \
         choose a different HYPEMAN_SUBNET or remove the conflicting route"
    )]
    SubnetConflict {
        /// The configured guest subnet.
        subnet: String,
        /// The conflicting route destination.
        route: String,
        /// The interface carrying the conflicting route.
        device: String,
    },

    /// The hypervisor process could not be launched or controlled.
    #[error("hypervisor unavailable: {0}")]
    HypervisorUnavailable(String),

    /// Everything else. Always logged with context where it is raised.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// Shorthand for a `NotFound` with a formatted message.
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    /// Shorthand for an `InvalidState` from an operation/state pair.
    pub fn invalid_state(operation: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// Returns true for errors a caller can retry after the resource settles.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::ImageNotReady { .. } | Self::HypervisorUnavailable(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_conflict_names_both_sides() {
        let err = Error::SubnetConflict {
            subnet: "10.100.0.0/16".to_string(),
            route: "10.100.0.0/24".to_string(),
            device: "docker0".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("10.100.0.0/16"));
        assert!(msg.contains("10.100.0.0/24"));
        assert!(msg.contains("docker0"));
        assert!(msg.contains("HYPEMAN_SUBNET"));
    }

    #[test]
    fn invalid_state_mentions_operation_and_state() {
        let err = Error::invalid_state("standby", "Stopped");
        assert_eq!(
            err.to_string(),
            "invalid state: standby not permitted while Stopped"
        );
    }
}
