//! Instance states, the transition table, and persistent metadata.
//!
//! `state` only changes through `InstanceMetadata::transition`, which
//! enforces the table below. Anything else is a bug in the caller, not a
//! state to tolerate:
//!
//! ```text
//! Creating → Running | Failed
//! Running  → Standby | Stopping
//! Standby  → Running | Deleting
//! Stopping → Stopped
//! *        → Deleting            (delete always wins)
//! ```

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use hypeman_id::{InstanceId, VolumeId};

use crate::error::{Error, Result};
use crate::hypervisor::HypervisorKind;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Creating,
    Running,
    Standby,
    Stopping,
    Stopped,
    Failed,
    Deleting,
    /// Reconciliation could not determine the truth; surfaced, never acted
    /// on automatically.
    Unknown,
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Creating => "Creating",
            Self::Running => "Running",
            Self::Standby => "Standby",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Failed => "Failed",
            Self::Deleting => "Deleting",
            Self::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

impl InstanceState {
    /// Whether `self → to` is a permitted transition.
    pub fn can_transition(self, to: InstanceState) -> bool {
        if to == Self::Deleting {
            return self != Self::Deleting;
        }
        matches!(
            (self, to),
            (Self::Creating, Self::Running)
                | (Self::Creating, Self::Failed)
                | (Self::Running, Self::Standby)
                | (Self::Running, Self::Stopping)
                | (Self::Standby, Self::Running)
                | (Self::Stopping, Self::Stopped)
        )
    }
}

/// A volume attached to an instance. Volume lifecycle itself lives outside
/// the instance manager; only the attachment record does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeAttachment {
    pub volume_id: VolumeId,
    pub mount_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Persistent instance metadata (`guests/<id>/metadata.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceMetadata {
    pub id: InstanceId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Image reference as given at create time.
    pub image: String,
    /// Guest memory in bytes.
    pub size: u64,
    /// Hot-pluggable memory in bytes, zero when disabled.
    #[serde(default)]
    pub hotplug_size: u64,
    /// Overlay disk size in bytes.
    pub overlay_size: u64,
    pub vcpus: u32,
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub network_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<Ipv4Addr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    pub vsock_cid: u32,
    pub vsock_socket: PathBuf,
    pub hypervisor_type: HypervisorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub state: InstanceState,
    #[serde(default)]
    pub has_snapshot: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub volumes: Vec<VolumeAttachment>,
}

impl InstanceMetadata {
    /// Applies a state transition, rejecting anything outside the table.
    pub fn transition(&mut self, operation: &str, to: InstanceState) -> Result<()> {
        if !self.state.can_transition(to) {
            return Err(Error::invalid_state(operation, self.state));
        }
        self.state = to;
        Ok(())
    }
}
