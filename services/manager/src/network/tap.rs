//! TAP device lifecycle.
//!
//! Each guest gets one TAP named `hype-<first-8-chars-of-id>`; the prefix
//! reserves a device namespace, which is what makes orphan cleanup after a
//! crash safe. Creation attaches the device to the bridge and optionally
//! sets the bridge-slave isolated flag.

use std::fs;
use std::path::Path;

use hypeman_id::InstanceId;
use tracing::{debug, info, warn};

use super::{run_command, NetworkError};

/// Name prefix of every hypeman-owned TAP.
pub const TAP_PREFIX: &str = "hype-";

/// The TAP device name for an instance.
pub fn tap_name(id: &InstanceId) -> String {
    format!("{TAP_PREFIX}{}", id.short())
}

/// Returns true if the named link exists.
pub fn tap_exists(name: &str) -> bool {
    Path::new("/sys/class/net").join(name).exists()
}

/// Kernel ifindex of a link.
pub fn ifindex(name: &str) -> Result<u32, NetworkError> {
    let path = Path::new("/sys/class/net").join(name).join("ifindex");
    let raw = fs::read_to_string(&path)
        .map_err(|e| NetworkError::Parse(format!("{}: {e}", path.display())))?;
    raw.trim()
        .parse()
        .map_err(|e| NetworkError::Parse(format!("ifindex {raw:?}: {e}")))
}

/// Lists all hypeman-owned TAP names on the host.
pub fn list_hypeman_taps() -> Vec<String> {
    let Ok(entries) = fs::read_dir("/sys/class/net") else {
        return Vec::new();
    };
    entries
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name.starts_with(TAP_PREFIX))
        .collect()
}

fn run_ip(argv: &[&str]) -> Result<(), NetworkError> {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    run_command("ip", &argv).map(|_| ())
}

/// Creates a TAP, brings it up, and enslaves it to the bridge.
///
/// On any failure the partially-configured device is deleted before the
/// error is returned.
pub fn create_tap(
    name: &str,
    uid: u32,
    gid: u32,
    bridge: &str,
    isolated: bool,
) -> Result<(), NetworkError> {
    info!(tap = %name, bridge = %bridge, "creating TAP device");

    run_ip(&[
        "tuntap",
        "add",
        "dev",
        name,
        "mode",
        "tap",
        "user",
        &uid.to_string(),
        "group",
        &gid.to_string(),
    ])?;

    let configure = || -> Result<(), NetworkError> {
        run_ip(&["link", "set", "dev", name, "up"])?;
        run_ip(&["link", "set", "dev", name, "master", bridge])?;
        if isolated {
            let argv: Vec<String> = ["link", "set", "dev", name, "isolated", "on"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            run_command("bridge", &argv)?;
        }
        Ok(())
    };

    if let Err(e) = configure() {
        let _ = run_ip(&["link", "delete", name]);
        return Err(e);
    }

    debug!(tap = %name, "TAP device ready");
    Ok(())
}

/// Deletes a TAP device.
pub fn delete_tap(name: &str) -> Result<(), NetworkError> {
    info!(tap = %name, "deleting TAP device");
    run_ip(&["link", "delete", name])
}

/// Deletes hypeman TAPs that are not in `expected`. Passing every live
/// guest's TAP here is the caller's job; an empty slice removes them all.
pub fn sweep_orphan_taps(expected: &[String]) -> Vec<String> {
    let mut removed = Vec::new();
    for name in list_hypeman_taps() {
        if expected.iter().any(|keep| keep == &name) {
            continue;
        }
        warn!(tap = %name, "removing orphan TAP device");
        match delete_tap(&name) {
            Ok(()) => removed.push(name),
            Err(e) => warn!(tap = %name, error = %e, "orphan TAP removal failed"),
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_is_prefix_plus_short_id() {
        let id = InstanceId::parse("9f8a3c21d4e5b6a7f0c1d2e3").unwrap();
        assert_eq!(tap_name(&id), "hype-9f8a3c21");
        // IFNAMSIZ is 16 including the terminator.
        assert!(tap_name(&id).len() <= 15);
    }

    #[test]
    fn tap_name_is_deterministic() {
        let id = InstanceId::parse("9f8a3c21d4e5b6a7f0c1d2e3").unwrap();
        assert_eq!(tap_name(&id), tap_name(&id));
    }
}
