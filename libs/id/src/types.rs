//! Typed ID definitions for hypeman resources.
//!
//! Each ID is an opaque 24-character lowercase hex string. Instance IDs
//! additionally carry deterministic derivations consumed by the host
//! resource fabric.

use crate::{define_id, fnv1a_64};

define_id!(InstanceId, 24);
define_id!(VolumeId, 24);
define_id!(UploadId, 24);

/// CIDs 0 (hypervisor), 1 (local), and 2 (host) are reserved by the vsock
/// address family; guests always get 3 or above.
const VSOCK_CID_FLOOR: u64 = 3;

impl InstanceId {
    /// Derives the guest vsock CID for this instance.
    ///
    /// The derivation is pure: the same instance ID always maps to the same
    /// CID, across process restarts, so a restored guest keeps its address.
    /// Range is `[3, 2^32 - 2]`.
    #[must_use]
    pub fn vsock_cid(&self) -> u32 {
        let hash = fnv1a_64(self.short().as_bytes());
        let modulus = (1u64 << 32) - 4;
        (hash % modulus + VSOCK_CID_FLOOR) as u32
    }
}
