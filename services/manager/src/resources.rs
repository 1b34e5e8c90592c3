//! Host resource measurement and aggregate accounting.
//!
//! `SystemResources` answers "what does this host have"; `Accounting`
//! answers "what have we promised to guests". Admission goes through one
//! accounting mutex so that two concurrent creates cannot both squeeze into
//! the last slot.

use std::path::Path;
use std::sync::Mutex;

use serde::Serialize;

use crate::config::Limits;
use crate::error::{Error, Result};
use crate::paths::Paths;

/// Static capacity of the host.
#[derive(Debug, Clone, Serialize)]
pub struct SystemResources {
    /// Online CPU cores.
    pub cpu_cores: u32,
    /// Total physical memory in bytes.
    pub total_memory_bytes: u64,
    /// Memory the kernel reports as available, in bytes.
    pub available_memory_bytes: u64,
}

impl SystemResources {
    /// Measures the host.
    pub fn measure() -> Self {
        let cpu_cores = get_cpu_count();
        let (total_memory, available_memory) = get_memory_info();

        Self {
            cpu_cores,
            total_memory_bytes: total_memory,
            available_memory_bytes: available_memory,
        }
    }
}

fn get_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as u32;
        }
    }

    std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1)
}

#[cfg(target_os = "linux")]
fn get_memory_info() -> (u64, u64) {
    if let Ok(meminfo) = std::fs::read_to_string("/proc/meminfo") {
        return parse_meminfo(&meminfo);
    }

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let avail_pages = unsafe { libc::sysconf(libc::_SC_AVPHYS_PAGES) };

    if page_size > 0 && total_pages > 0 {
        let total = (page_size * total_pages) as u64;
        let avail = if avail_pages > 0 {
            (page_size * avail_pages) as u64
        } else {
            total
        };
        return (total, avail);
    }

    (16 << 30, 8 << 30)
}

#[cfg(not(target_os = "linux"))]
fn get_memory_info() -> (u64, u64) {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let total_pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };

        if page_size > 0 && total_pages > 0 {
            let total = (page_size * total_pages) as u64;
            return (total, total / 2);
        }
    }

    (16 << 30, 8 << 30)
}

fn parse_meminfo(content: &str) -> (u64, u64) {
    let mut total: u64 = 0;
    let mut available: u64 = 0;
    let mut free: u64 = 0;
    let mut buffers: u64 = 0;
    let mut cached: u64 = 0;

    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() >= 2 {
            const KB_TO_BYTES: u64 = 1024;
            let value: u64 = parts[1].parse().unwrap_or(0) * KB_TO_BYTES;
            match parts[0] {
                "MemTotal:" => total = value,
                "MemAvailable:" => available = value,
                "MemFree:" => free = value,
                "Buffers:" => buffers = value,
                "Cached:" => cached = value,
                _ => {}
            }
        }
    }

    if available == 0 {
        available = free + buffers + cached;
    }

    (total, available)
}

/// Disk usage under the data directory, broken down by consumer.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DiskUsage {
    /// Built image root disks and metadata, in bytes.
    pub images_bytes: u64,
    /// Content-addressed OCI blob cache, in bytes.
    pub oci_cache_bytes: u64,
    /// Volume backing files, in bytes.
    pub volumes_bytes: u64,
    /// Per-guest overlays, config disks, and snapshots, in bytes.
    pub overlays_bytes: u64,
}

impl DiskUsage {
    /// Walks the data directory and sums apparent sizes per consumer.
    pub fn measure(paths: &Paths) -> Self {
        Self {
            images_bytes: dir_size(&paths.images_dir()),
            oci_cache_bytes: dir_size(&paths.oci_cache_dir()),
            volumes_bytes: dir_size(&paths.volumes_dir()),
            overlays_bytes: dir_size(&paths.guests_dir()),
        }
    }
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_symlink() {
            continue;
        }
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

/// Live reservation totals.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Reserved {
    /// Vcpus reserved by defined instances.
    pub vcpus: u32,
    /// Guest memory reserved by defined instances, in bytes.
    pub memory_bytes: u64,
    /// Volume storage reserved, in bytes.
    pub volume_bytes: u64,
}

/// Aggregate resource accounting with admission control.
#[derive(Debug)]
pub struct Accounting {
    limits: Limits,
    reserved: Mutex<Reserved>,
}

impl Accounting {
    /// Creates an empty ledger bounded by `limits`.
    pub fn new(limits: Limits) -> Self {
        Self {
            limits,
            reserved: Mutex::new(Reserved::default()),
        }
    }

    /// The configured limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Current totals.
    pub fn reserved(&self) -> Reserved {
        *self.reserved.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reserves capacity for a new instance, atomically against the limits.
    pub fn reserve(&self, vcpus: u32, memory_bytes: u64, volume_bytes: u64) -> Result<()> {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());

        let next_vcpus = reserved.vcpus + vcpus;
        if next_vcpus > self.limits.max_total_vcpus {
            return Err(Error::ResourceExhausted(format!(
                "vcpus: {next_vcpus} would exceed limit {}",
                self.limits.max_total_vcpus
            )));
        }
        let next_memory = reserved.memory_bytes + memory_bytes;
        if next_memory > self.limits.max_total_memory {
            return Err(Error::ResourceExhausted(format!(
                "memory: {next_memory} bytes would exceed limit {}",
                self.limits.max_total_memory
            )));
        }
        let next_volume = reserved.volume_bytes + volume_bytes;
        if next_volume > self.limits.max_total_volume_bytes {
            return Err(Error::ResourceExhausted(format!(
                "volume storage: {next_volume} bytes would exceed limit {}",
                self.limits.max_total_volume_bytes
            )));
        }

        reserved.vcpus = next_vcpus;
        reserved.memory_bytes = next_memory;
        reserved.volume_bytes = next_volume;
        Ok(())
    }

    /// Returns capacity to the pool (instance deleted or create rolled back).
    pub fn release(&self, vcpus: u32, memory_bytes: u64, volume_bytes: u64) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.vcpus = reserved.vcpus.saturating_sub(vcpus);
        reserved.memory_bytes = reserved.memory_bytes.saturating_sub(memory_bytes);
        reserved.volume_bytes = reserved.volume_bytes.saturating_sub(volume_bytes);
    }

    /// Re-registers capacity for an instance discovered at startup.
    ///
    /// Reconciliation must not fail admission for guests that already exist,
    /// so this bypasses the limit checks.
    pub fn adopt(&self, vcpus: u32, memory_bytes: u64, volume_bytes: u64) {
        let mut reserved = self.reserved.lock().unwrap_or_else(|e| e.into_inner());
        reserved.vcpus += vcpus;
        reserved.memory_bytes += memory_bytes;
        reserved.volume_bytes += volume_bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> Limits {
        Limits {
            max_total_vcpus: 8,
            max_total_memory: 8 << 30,
            max_total_volume_bytes: 64 << 30,
            ..Limits::default()
        }
    }

    #[test]
    fn measure_reports_positive_capacity() {
        let resources = SystemResources::measure();
        assert!(resources.cpu_cores > 0);
        assert!(resources.total_memory_bytes > 0);
        assert!(resources.available_memory_bytes <= resources.total_memory_bytes);
    }

    #[test]
    fn parse_meminfo_prefers_mem_available() {
        let sample = "MemTotal:       16384000 kB\nMemFree:         1234567 kB\nMemAvailable:    8000000 kB\nBuffers:          123456 kB\nCached:          2345678 kB\n";
        let (total, available) = parse_meminfo(sample);
        assert_eq!(total, 16384000 * 1024);
        assert_eq!(available, 8000000 * 1024);
    }

    #[test]
    fn parse_meminfo_falls_back_to_free_buffers_cached() {
        let sample =
            "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nBuffers:          500000 kB\nCached:          2000000 kB\n";
        let (_, available) = parse_meminfo(sample);
        assert_eq!(available, (1000000 + 500000 + 2000000) * 1024);
    }

    #[test]
    fn reserve_enforces_each_limit() {
        let acc = Accounting::new(limits());
        acc.reserve(4, 4 << 30, 0).unwrap();
        // Fits exactly.
        acc.reserve(4, 4 << 30, 0).unwrap();
        // One vcpu over.
        let err = acc.reserve(1, 0, 0).unwrap_err();
        assert!(matches!(err, Error::ResourceExhausted(_)));
    }

    #[test]
    fn release_returns_capacity() {
        let acc = Accounting::new(limits());
        acc.reserve(8, 0, 0).unwrap();
        assert!(acc.reserve(1, 0, 0).is_err());
        acc.release(8, 0, 0);
        acc.reserve(8, 0, 0).unwrap();
    }

    #[test]
    fn adopt_bypasses_limits() {
        let acc = Accounting::new(limits());
        acc.adopt(100, 0, 0);
        assert_eq!(acc.reserved().vcpus, 100);
        // Further admission is refused until capacity is released.
        assert!(acc.reserve(1, 0, 0).is_err());
    }

    #[test]
    fn release_saturates_at_zero() {
        let acc = Accounting::new(limits());
        acc.release(5, 5, 5);
        let reserved = acc.reserved();
        assert_eq!(reserved.vcpus, 0);
        assert_eq!(reserved.memory_bytes, 0);
    }
}
