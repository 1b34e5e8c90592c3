//! Daemon configuration.
//!
//! All settings come from `HYPEMAN_*` environment variables with defaults
//! suitable for a development host. Malformed values abort startup with a
//! message naming the offending variable; a daemon that silently falls back
//! to a default subnet or limit is harder to debug than one that refuses to
//! start.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::hypervisor::HypervisorKind;
use crate::network::Subnet;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// Aggregate and per-instance admission limits.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum vcpus summed over all defined instances.
    pub max_total_vcpus: u32,
    /// Maximum guest memory summed over all defined instances, in bytes.
    pub max_total_memory: u64,
    /// Maximum volume storage summed over all volumes, in bytes.
    pub max_total_volume_bytes: u64,
    /// Maximum vcpus for a single instance.
    pub max_instance_vcpus: u32,
    /// Maximum memory for a single instance, in bytes.
    pub max_instance_memory: u64,
    /// Maximum overlay size for a single instance, in bytes.
    pub max_instance_overlay: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_total_vcpus: 64,
            max_total_memory: 128 * GIB,
            max_total_volume_bytes: 512 * GIB,
            max_instance_vcpus: 16,
            max_instance_memory: 32 * GIB,
            max_instance_overlay: 64 * GIB,
        }
    }
}

/// Default per-guest traffic shaping rates, all in bits per second.
#[derive(Debug, Clone)]
pub struct Bandwidth {
    /// Guest download (external → guest) rate.
    pub download_bps: u64,
    /// Guest upload (guest → external) guaranteed rate.
    pub upload_bps: u64,
    /// Guest upload ceiling when the aggregate class has headroom.
    pub upload_ceil_bps: u64,
    /// Aggregate upload capacity of the bridge root class.
    pub upload_total_bps: u64,
    /// Burst multiplier for the download token bucket.
    pub burst_multiplier: u64,
}

impl Default for Bandwidth {
    fn default() -> Self {
        Self {
            download_bps: 200_000_000,
            upload_bps: 100_000_000,
            upload_ceil_bps: 1_000_000_000,
            upload_total_bps: 10_000_000_000,
            burst_multiplier: 2,
        }
    }
}

/// Image build tuning.
#[derive(Debug, Clone)]
pub struct BuildSettings {
    /// Concurrent conversion workers.
    pub max_concurrent_builds: usize,
    /// Root disk size = ceil(layer_total * inflate_factor) + floor_bytes.
    pub inflate_factor: f64,
    /// Flat headroom added to every root disk, in bytes.
    pub floor_bytes: u64,
    /// Root disk size clamp, in bytes.
    pub max_disk_bytes: u64,
    /// Per-job build timeout.
    pub build_timeout: Duration,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 2,
            inflate_factor: 1.25,
            floor_bytes: 64 * MIB,
            max_disk_bytes: 32 * GIB,
            build_timeout: Duration::from_secs(1800),
        }
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the on-disk layout.
    pub data_dir: PathBuf,
    /// Listen address for the embedded OCI registry.
    pub registry_listen: SocketAddr,
    /// Bridge device for the default guest network.
    pub bridge: String,
    /// Guest subnet in CIDR form.
    pub subnet: Subnet,
    /// Uplink interface override; autodetected from the default route if unset.
    pub uplink: Option<String>,
    /// Isolate guests from each other on the bridge (bridge-slave isolation).
    pub isolate_guests: bool,
    /// Guest kernel image; defaults to `<data_dir>/system/kernel`.
    pub kernel: Option<PathBuf>,
    /// Guest initrd; defaults to `<data_dir>/system/initrd`.
    pub initrd: Option<PathBuf>,
    /// Hypervisor used for new instances.
    pub hypervisor: HypervisorKind,
    /// Path to the cloud-hypervisor binary.
    pub cloud_hypervisor_bin: PathBuf,
    /// Path to the firecracker binary.
    pub firecracker_bin: PathBuf,
    /// Grace period for guest shutdown before SIGKILL.
    pub shutdown_grace: Duration,
    /// Deadline for a launched VMM to answer on its control socket.
    pub launch_timeout: Duration,
    /// Registry upload sessions older than this are garbage-collected.
    pub upload_session_ttl: Duration,
    /// Admission limits.
    pub limits: Limits,
    /// Traffic shaping defaults.
    pub bandwidth: Bandwidth,
    /// Image build tuning.
    pub build: BuildSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/hypeman"),
            registry_listen: SocketAddr::from(([127, 0, 0, 1], 5000)),
            bridge: "hypebr0".to_string(),
            subnet: Subnet::new(std::net::Ipv4Addr::new(10, 230, 0, 0), 24),
            uplink: None,
            isolate_guests: false,
            kernel: None,
            initrd: None,
            hypervisor: HypervisorKind::CloudHypervisor,
            cloud_hypervisor_bin: PathBuf::from("cloud-hypervisor"),
            firecracker_bin: PathBuf::from("firecracker"),
            shutdown_grace: Duration::from_secs(10),
            launch_timeout: Duration::from_secs(30),
            upload_session_ttl: Duration::from_secs(3600),
            limits: Limits::default(),
            bandwidth: Bandwidth::default(),
            build: BuildSettings::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `HYPEMAN_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(dir) = env_string("HYPEMAN_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(listen) = env_string("HYPEMAN_REGISTRY_LISTEN") {
            config.registry_listen = listen
                .parse()
                .with_context(|| format!("HYPEMAN_REGISTRY_LISTEN: invalid address {listen:?}"))?;
        }
        if let Some(bridge) = env_string("HYPEMAN_BRIDGE") {
            config.bridge = bridge;
        }
        if let Some(cidr) = env_string("HYPEMAN_SUBNET") {
            config.subnet = Subnet::parse(&cidr)
                .with_context(|| format!("HYPEMAN_SUBNET: invalid CIDR {cidr:?}"))?;
        }
        config.uplink = env_string("HYPEMAN_UPLINK");
        if let Some(v) = env_string("HYPEMAN_ISOLATE_GUESTS") {
            config.isolate_guests = parse_bool("HYPEMAN_ISOLATE_GUESTS", &v)?;
        }
        config.kernel = env_string("HYPEMAN_KERNEL").map(PathBuf::from);
        config.initrd = env_string("HYPEMAN_INITRD").map(PathBuf::from);
        if let Some(kind) = env_string("HYPEMAN_HYPERVISOR") {
            config.hypervisor = kind
                .parse()
                .map_err(|e: String| anyhow::anyhow!("HYPEMAN_HYPERVISOR: {e}"))?;
        }
        if let Some(bin) = env_string("HYPEMAN_CLOUD_HYPERVISOR_BIN") {
            config.cloud_hypervisor_bin = PathBuf::from(bin);
        }
        if let Some(bin) = env_string("HYPEMAN_FIRECRACKER_BIN") {
            config.firecracker_bin = PathBuf::from(bin);
        }
        if let Some(secs) = env_parse::<u64>("HYPEMAN_SHUTDOWN_GRACE_SECS")? {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("HYPEMAN_LAUNCH_TIMEOUT_SECS")? {
            config.launch_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("HYPEMAN_UPLOAD_SESSION_TTL_SECS")? {
            config.upload_session_ttl = Duration::from_secs(secs);
        }

        if let Some(n) = env_parse::<u32>("HYPEMAN_MAX_TOTAL_VCPUS")? {
            config.limits.max_total_vcpus = n;
        }
        if let Some(n) = env_parse::<u64>("HYPEMAN_MAX_TOTAL_MEMORY_BYTES")? {
            config.limits.max_total_memory = n;
        }
        if let Some(n) = env_parse::<u64>("HYPEMAN_MAX_TOTAL_VOLUME_BYTES")? {
            config.limits.max_total_volume_bytes = n;
        }

        if let Some(n) = env_parse::<usize>("HYPEMAN_MAX_CONCURRENT_BUILDS")? {
            if n == 0 {
                bail!("HYPEMAN_MAX_CONCURRENT_BUILDS must be at least 1");
            }
            config.build.max_concurrent_builds = n;
        }
        if let Some(f) = env_parse::<f64>("HYPEMAN_IMAGE_INFLATE_FACTOR")? {
            if !(1.0..=10.0).contains(&f) {
                bail!("HYPEMAN_IMAGE_INFLATE_FACTOR must be in [1.0, 10.0], got {f}");
            }
            config.build.inflate_factor = f;
        }

        if let Some(n) = env_parse::<u64>("HYPEMAN_DOWNLOAD_BPS")? {
            config.bandwidth.download_bps = n;
        }
        if let Some(n) = env_parse::<u64>("HYPEMAN_UPLOAD_BPS")? {
            config.bandwidth.upload_bps = n;
        }
        if let Some(n) = env_parse::<u64>("HYPEMAN_UPLOAD_CEIL_BPS")? {
            config.bandwidth.upload_ceil_bps = n;
        }

        Ok(config)
    }

    /// The kernel image to boot guests with.
    pub fn kernel_path(&self, paths: &crate::paths::Paths) -> PathBuf {
        self.kernel.clone().unwrap_or_else(|| paths.kernel())
    }

    /// The initrd to boot guests with, if any is present.
    pub fn initrd_path(&self, paths: &crate::paths::Paths) -> Option<PathBuf> {
        if let Some(explicit) = &self.initrd {
            return Some(explicit.clone());
        }
        let default = paths.initrd();
        default.exists().then_some(default)
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env_string(key) {
        None => Ok(None),
        Some(raw) => match raw.parse() {
            Ok(v) => Ok(Some(v)),
            Err(e) => bail!("{key}: invalid value {raw:?}: {e}"),
        },
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => bail!("{key}: expected a boolean, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.bridge, "hypebr0");
        assert_eq!(config.subnet.to_string(), "10.230.0.0/24");
        assert_eq!(config.build.max_concurrent_builds, 2);
        assert!(config.limits.max_instance_vcpus <= config.limits.max_total_vcpus);
    }

    #[test]
    fn parse_bool_accepts_common_spellings() {
        assert!(parse_bool("K", "true").unwrap());
        assert!(parse_bool("K", "1").unwrap());
        assert!(!parse_bool("K", "no").unwrap());
        assert!(parse_bool("K", "maybe").is_err());
    }
}
