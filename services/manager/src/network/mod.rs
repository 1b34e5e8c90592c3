//! Host networking for guests: one bridge, NAT to the uplink, a TAP per
//! instance, and per-guest traffic shaping.
//!
//! One mutex serializes name-uniqueness checks and IP/MAC picking; the
//! slow host mutations (TAP creation, tc) run outside it, which is safe
//! because TAP names are deterministic per instance and cannot collide.
//! `initialize` must complete before the first allocation.

pub mod bridge;
pub mod shaping;
pub mod tap;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use hypeman_id::InstanceId;

use crate::config::Bandwidth;
use crate::error::Error;

pub use tap::{tap_name, TAP_PREFIX};

/// Errors from host networking operations.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("network state parse error: {0}")]
    Parse(String),

    #[error("instance name already in use: {0}")]
    NameTaken(String),

    #[error("no free addresses in subnet {0}")]
    PoolExhausted(String),

    #[error(
        "bridge {bridge} already exists with address {actual}, expected {expected}; \
         remove the address or configure a different bridge"
    )]
    BridgeMismatch {
        bridge: String,
        expected: String,
        actual: String,
    },

    #[error("subnet {subnet} conflicts with route {route} via {device}")]
    SubnetConflict {
        subnet: String,
        route: String,
        device: String,
    },

    #[error("network manager not initialized")]
    NotInitialized,
}

impl From<NetworkError> for Error {
    fn from(err: NetworkError) -> Self {
        match err {
            NetworkError::NameTaken(name) => Error::AlreadyExists(name),
            NetworkError::PoolExhausted(subnet) => {
                Error::ResourceExhausted(format!("no free addresses in {subnet}"))
            }
            NetworkError::SubnetConflict {
                subnet,
                route,
                device,
            } => Error::SubnetConflict {
                subnet,
                route,
                device,
            },
            other => Error::Internal(anyhow::Error::new(other)),
        }
    }
}

/// Runs a host command, returning stdout on success.
pub(crate) fn run_command(program: &str, argv: &[String]) -> Result<String, NetworkError> {
    let output = std::process::Command::new(program)
        .args(argv)
        .output()
        .map_err(|e| NetworkError::Command {
            command: program.to_string(),
            stderr: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(NetworkError::Command {
            command: format!("{program} {}", argv.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// An IPv4 subnet in CIDR form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subnet {
    network: Ipv4Addr,
    prefix: u8,
}

impl Subnet {
    /// Builds a subnet, masking `address` down to its network address.
    pub fn new(address: Ipv4Addr, prefix: u8) -> Self {
        let prefix = prefix.min(32);
        let network = Ipv4Addr::from(u32::from(address) & Self::mask(prefix));
        Self { network, prefix }
    }

    /// Parses `a.b.c.d/len`.
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("missing '/' in CIDR {s:?}"))?;
        let addr: Ipv4Addr = addr.parse()?;
        let prefix: u8 = prefix.parse()?;
        if prefix > 32 {
            anyhow::bail!("prefix length {prefix} out of range");
        }
        Ok(Self::new(addr, prefix))
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    /// The network address.
    pub fn network(&self) -> Ipv4Addr {
        self.network
    }

    /// Prefix length.
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Dotted-quad netmask.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(Self::mask(self.prefix))
    }

    /// The gateway: network address + 1.
    pub fn gateway(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 1)
    }

    /// The broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask(self.prefix))
    }

    /// Number of assignable guest addresses (network, gateway, and
    /// broadcast are reserved).
    pub fn guest_capacity(&self) -> u32 {
        let total = 1u64 << (32 - self.prefix as u64);
        (total.saturating_sub(3)) as u32
    }

    /// The n-th assignable guest address, starting at network + 2.
    pub fn guest_address(&self, index: u32) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) + 2 + index)
    }

    /// True when `ip` falls inside this subnet.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask(self.prefix) == u32::from(self.network)
    }

    /// True when the two ranges share any address.
    pub fn overlaps(&self, other: &Subnet) -> bool {
        self.contains(other.network) || other.contains(self.network)
    }
}

impl std::fmt::Display for Subnet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// What a guest gets from the network fabric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkAllocation {
    pub instance_id: InstanceId,
    pub ip: Ipv4Addr,
    pub mac: String,
    pub tap: String,
    pub gateway: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

#[derive(Debug, Clone)]
struct AllocEntry {
    ip: Ipv4Addr,
    name: Option<String>,
}

#[derive(Debug)]
struct AllocState {
    entries: HashMap<InstanceId, AllocEntry>,
    rng: StdRng,
}

/// Rates for one guest, bits per second.
#[derive(Debug, Clone, Copy)]
pub struct GuestRates {
    pub download_bps: u64,
    pub upload_bps: u64,
    pub upload_ceil_bps: u64,
}

impl GuestRates {
    /// Defaults from the daemon bandwidth config.
    pub fn from_bandwidth(bandwidth: &Bandwidth) -> Self {
        Self {
            download_bps: bandwidth.download_bps,
            upload_bps: bandwidth.upload_bps,
            upload_ceil_bps: bandwidth.upload_ceil_bps,
        }
    }
}

/// Owner of the bridge, TAPs, addresses, and shaping state.
pub struct NetworkManager {
    bridge_name: String,
    subnet: Subnet,
    uplink_override: Option<String>,
    isolate_guests: bool,
    bandwidth: Bandwidth,
    state: Mutex<AllocState>,
    initialized: AtomicBool,
}

impl NetworkManager {
    /// Builds the manager. `rng` is seedable so tests can pin IP picks.
    pub fn new(
        bridge: String,
        subnet: Subnet,
        uplink: Option<String>,
        isolate_guests: bool,
        bandwidth: Bandwidth,
        rng: StdRng,
    ) -> Self {
        Self {
            bridge_name: bridge,
            subnet,
            uplink_override: uplink,
            isolate_guests,
            bandwidth,
            state: Mutex::new(AllocState {
                entries: HashMap::new(),
                rng,
            }),
            initialized: AtomicBool::new(false),
        }
    }

    /// The managed subnet.
    pub fn subnet(&self) -> &Subnet {
        &self.subnet
    }

    /// The bridge device name.
    pub fn bridge(&self) -> &str {
        &self.bridge_name
    }

    /// Default rates for guests that do not override them.
    pub fn default_rates(&self) -> GuestRates {
        GuestRates::from_bandwidth(&self.bandwidth)
    }

    /// Converges bridge, NAT rules, forwarding, and the shaping root.
    pub fn initialize(&self) -> Result<(), NetworkError> {
        bridge::initialize(
            &self.bridge_name,
            &self.subnet,
            self.uplink_override.as_deref(),
        )?;
        shaping::ensure_root(&self.bridge_name, self.bandwidth.upload_total_bps)?;
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn require_initialized(&self) -> Result<(), NetworkError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NetworkError::NotInitialized)
        }
    }

    /// Allocates IP, MAC, TAP, and shaping for a new guest.
    pub fn allocate(
        &self,
        instance_id: &InstanceId,
        instance_name: Option<&str>,
        rates: GuestRates,
    ) -> Result<NetworkAllocation, NetworkError> {
        self.require_initialized()?;

        // Reservation happens under the lock; host mutations after it.
        let (ip, mac) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

            if let Some(name) = instance_name {
                let taken = state
                    .entries
                    .iter()
                    .any(|(id, e)| id != instance_id && e.name.as_deref() == Some(name));
                if taken {
                    return Err(NetworkError::NameTaken(name.to_string()));
                }
            }

            let ip = self.pick_address(&mut state)?;
            let mac = generate_mac(&mut state.rng);
            state.entries.insert(
                instance_id.clone(),
                AllocEntry {
                    ip,
                    name: instance_name.map(str::to_string),
                },
            );
            (ip, mac)
        };

        let allocation = NetworkAllocation {
            instance_id: instance_id.clone(),
            ip,
            mac,
            tap: tap_name(instance_id),
            gateway: self.subnet.gateway(),
            netmask: self.subnet.netmask(),
        };

        if let Err(e) = self.attach_tap(&allocation, rates) {
            self.forget(instance_id);
            return Err(e);
        }

        info!(
            instance_id = %instance_id,
            ip = %allocation.ip,
            mac = %allocation.mac,
            tap = %allocation.tap,
            "network allocated"
        );
        Ok(allocation)
    }

    /// Re-creates the TAP for a guest leaving standby, keeping the IP/MAC
    /// recorded in its metadata. Idempotent: an existing TAP is reused.
    pub fn recreate(
        &self,
        instance_id: &InstanceId,
        instance_name: Option<&str>,
        ip: Ipv4Addr,
        mac: &str,
        rates: GuestRates,
    ) -> Result<NetworkAllocation, NetworkError> {
        self.require_initialized()?;

        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.entries.insert(
                instance_id.clone(),
                AllocEntry {
                    ip,
                    name: instance_name.map(str::to_string),
                },
            );
        }

        let allocation = NetworkAllocation {
            instance_id: instance_id.clone(),
            ip,
            mac: mac.to_string(),
            tap: tap_name(instance_id),
            gateway: self.subnet.gateway(),
            netmask: self.subnet.netmask(),
        };

        if !tap::tap_exists(&allocation.tap) {
            self.attach_tap(&allocation, rates)?;
        }
        Ok(allocation)
    }

    /// Releases a guest's TAP and shaping class; the address becomes
    /// reusable. Best-effort on the host side.
    pub fn release(&self, instance_id: &InstanceId) {
        let tap = tap_name(instance_id);
        shaping::remove_upload_class(&self.bridge_name, &tap);
        if tap::tap_exists(&tap) {
            if let Err(e) = tap::delete_tap(&tap) {
                warn!(tap = %tap, error = %e, "TAP removal failed");
            }
        }
        self.forget(instance_id);
    }

    /// Deletes a guest's TAP but keeps the address reserved (standby).
    pub fn detach_tap(&self, instance_id: &InstanceId) {
        let tap = tap_name(instance_id);
        shaping::remove_upload_class(&self.bridge_name, &tap);
        if tap::tap_exists(&tap) {
            if let Err(e) = tap::delete_tap(&tap) {
                warn!(tap = %tap, error = %e, "TAP removal failed");
            }
        }
    }

    /// Re-registers an allocation discovered in metadata at startup, so
    /// uniqueness checks see guests from before the restart.
    pub fn adopt(&self, instance_id: &InstanceId, instance_name: Option<&str>, ip: Ipv4Addr) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.insert(
            instance_id.clone(),
            AllocEntry {
                ip,
                name: instance_name.map(str::to_string),
            },
        );
    }

    /// Removes hypeman TAPs and shaping classes with no owning instance.
    ///
    /// `None` skips cleanup entirely: when reconciliation could not decide
    /// which guests are alive, deleting devices would be guessing.
    pub fn cleanup_orphans(&self, keep: Option<&[InstanceId]>) -> Result<(), NetworkError> {
        let Some(keep) = keep else {
            warn!("liveness undetermined, skipping orphan cleanup");
            return Ok(());
        };

        let expected: Vec<String> = keep.iter().map(tap_name).collect();
        let removed = tap::sweep_orphan_taps(&expected);
        if !removed.is_empty() {
            info!(count = removed.len(), "orphan TAPs removed");
        }

        let live = tap::list_hypeman_taps();
        shaping::sweep_orphan_classes(&self.bridge_name, &live)
    }

    fn attach_tap(
        &self,
        allocation: &NetworkAllocation,
        rates: GuestRates,
    ) -> Result<(), NetworkError> {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        tap::create_tap(
            &allocation.tap,
            uid,
            gid,
            &self.bridge_name,
            self.isolate_guests,
        )?;

        let shape = || -> Result<(), NetworkError> {
            let ifindex = tap::ifindex(&allocation.tap)?;
            shaping::install_upload_class(
                &self.bridge_name,
                &allocation.tap,
                ifindex,
                rates.upload_bps,
                rates.upload_ceil_bps,
            )?;
            shaping::install_download_tbf(
                &allocation.tap,
                rates.download_bps,
                self.bandwidth.burst_multiplier,
            )
        };
        if let Err(e) = shape() {
            let _ = tap::delete_tap(&allocation.tap);
            return Err(e);
        }
        Ok(())
    }

    fn forget(&self, instance_id: &InstanceId) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.entries.remove(instance_id);
    }

    /// Random sampling with a bounded retry, then a sequential scan. The
    /// scan guarantees exhaustion is detected instead of looping forever.
    fn pick_address(&self, state: &mut AllocState) -> Result<Ipv4Addr, NetworkError> {
        let capacity = self.subnet.guest_capacity();
        if capacity == 0 {
            return Err(NetworkError::PoolExhausted(self.subnet.to_string()));
        }
        let in_use: std::collections::HashSet<Ipv4Addr> =
            state.entries.values().map(|e| e.ip).collect();

        for _ in 0..5 {
            let candidate = self.subnet.guest_address(state.rng.random_range(0..capacity));
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }
        for index in 0..capacity {
            let candidate = self.subnet.guest_address(index);
            if !in_use.contains(&candidate) {
                return Ok(candidate);
            }
        }
        Err(NetworkError::PoolExhausted(self.subnet.to_string()))
    }
}

/// Generates a locally-administered unicast MAC: `02:00:00:xx:xx:xx`.
fn generate_mac(rng: &mut StdRng) -> String {
    format!(
        "02:00:00:{:02x}:{:02x}:{:02x}",
        rng.random_range(0..=255u32),
        rng.random_range(0..=255u32),
        rng.random_range(0..=255u32)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn manager() -> NetworkManager {
        NetworkManager::new(
            "hypebr0".to_string(),
            Subnet::parse("10.230.0.0/24").unwrap(),
            None,
            false,
            Bandwidth::default(),
            StdRng::seed_from_u64(1),
        )
    }

    fn inst(n: u8) -> InstanceId {
        InstanceId::parse(&format!("{:024x}", n)).unwrap()
    }

    #[test]
    fn subnet_parse_and_masking() {
        let s = Subnet::parse("10.230.0.77/24").unwrap();
        assert_eq!(s.network(), Ipv4Addr::new(10, 230, 0, 0));
        assert_eq!(s.gateway(), Ipv4Addr::new(10, 230, 0, 1));
        assert_eq!(s.broadcast(), Ipv4Addr::new(10, 230, 0, 255));
        assert_eq!(s.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(s.guest_capacity(), 253);
        assert_eq!(s.to_string(), "10.230.0.0/24");
    }

    #[test]
    fn subnet_parse_rejects_garbage() {
        assert!(Subnet::parse("10.0.0.0").is_err());
        assert!(Subnet::parse("10.0.0.0/33").is_err());
        assert!(Subnet::parse("not-an-ip/8").is_err());
    }

    #[test]
    fn subnet_overlap_is_symmetric() {
        let wide = Subnet::parse("10.100.0.0/16").unwrap();
        let narrow = Subnet::parse("10.100.7.0/24").unwrap();
        let other = Subnet::parse("10.200.0.0/24").unwrap();
        assert!(wide.overlaps(&narrow));
        assert!(narrow.overlaps(&wide));
        assert!(!wide.overlaps(&other));
    }

    #[test]
    fn guest_addresses_skip_reserved() {
        let s = Subnet::parse("10.230.0.0/24").unwrap();
        assert_eq!(s.guest_address(0), Ipv4Addr::new(10, 230, 0, 2));
        assert_eq!(s.guest_address(252), Ipv4Addr::new(10, 230, 0, 254));
    }

    #[test]
    fn mac_is_locally_administered() {
        let mut rng = StdRng::seed_from_u64(7);
        let mac = generate_mac(&mut rng);
        assert!(mac.starts_with("02:00:00:"));
        assert_eq!(mac.len(), 17);
        // Seeded generation is reproducible.
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(generate_mac(&mut rng), mac);
    }

    #[test]
    fn allocation_requires_initialize() {
        let manager = manager();
        let err = manager
            .allocate(&inst(1), None, manager.default_rates())
            .unwrap_err();
        assert!(matches!(err, NetworkError::NotInitialized));
    }

    #[test]
    fn pick_address_avoids_in_use_and_detects_exhaustion() {
        let manager = NetworkManager::new(
            "hypebr0".to_string(),
            // /30 has exactly one assignable guest address.
            Subnet::parse("10.9.9.0/30").unwrap(),
            None,
            false,
            Bandwidth::default(),
            StdRng::seed_from_u64(3),
        );

        let mut state = AllocState {
            entries: HashMap::new(),
            rng: StdRng::seed_from_u64(3),
        };
        let only = manager.pick_address(&mut state).unwrap();
        assert_eq!(only, Ipv4Addr::new(10, 9, 9, 2));

        state.entries.insert(
            inst(1),
            AllocEntry {
                ip: only,
                name: None,
            },
        );
        let err = manager.pick_address(&mut state).unwrap_err();
        assert!(matches!(err, NetworkError::PoolExhausted(_)));
    }

    #[test]
    fn adopt_registers_name_for_uniqueness() {
        let manager = manager();
        manager.adopt(&inst(1), Some("web"), Ipv4Addr::new(10, 230, 0, 2));
        let state = manager.state.lock().unwrap();
        let entry = state.entries.get(&inst(1)).unwrap();
        assert_eq!(entry.name.as_deref(), Some("web"));
        assert_eq!(entry.ip, Ipv4Addr::new(10, 230, 0, 2));
    }

    #[test]
    fn seeded_rng_makes_allocation_deterministic() {
        let s = Subnet::parse("10.230.0.0/24").unwrap();
        let pick = |seed| {
            let mut state = AllocState {
                entries: HashMap::new(),
                rng: StdRng::seed_from_u64(seed),
            };
            let m = NetworkManager::new(
                "hypebr0".into(),
                s,
                None,
                false,
                Bandwidth::default(),
                StdRng::seed_from_u64(seed),
            );
            m.pick_address(&mut state).unwrap()
        };
        assert_eq!(pick(42), pick(42));
    }
}
