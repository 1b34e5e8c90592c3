//! Per-guest traffic shaping.
//!
//! Upload (guest → external) is shaped on the bridge with a classful HTB
//! tree: root qdisc `1:`, aggregate class `1:1`, and one class per guest
//! whose 16-bit id is derived from the TAP name. A `basic` filter matching
//! `rt_iif` on the TAP's ifindex steers traffic into the class, and an
//! `fq_codel` leaf keeps per-flow latency flat. Download (external →
//! guest) is a TBF qdisc on the TAP's egress.
//!
//! All command argv rendering is pure and unit-tested; execution goes
//! through `run_tc`.

use std::collections::HashSet;

use hypeman_id::fnv1a_64;
use tracing::{debug, warn};

use super::{run_command, NetworkError};

/// Minimum burst for the download token bucket, one full-size frame.
const MIN_BURST_BYTES: u64 = 1514;

/// Formats a rate in bits/s using the coarsest unit that represents it
/// exactly, so `tc` does not truncate (2.5 Gbps must render as `2500mbit`,
/// not `2gbit`).
pub fn format_rate(bps: u64) -> String {
    if bps == 0 {
        return "0bit".to_string();
    }
    if bps % 1_000_000_000 == 0 {
        format!("{}gbit", bps / 1_000_000_000)
    } else if bps % 1_000_000 == 0 {
        format!("{}mbit", bps / 1_000_000)
    } else if bps % 1_000 == 0 {
        format!("{}kbit", bps / 1_000)
    } else {
        format!("{bps}bit")
    }
}

/// Derives the HTB class id for a TAP device: FNV-1a of the name, low 16
/// bits. Ids 0 and 1 are shifted up because `1:0` is invalid and `1:1` is
/// the aggregate class.
pub fn class_id(tap: &str) -> u16 {
    let id = (fnv1a_64(tap.as_bytes()) & 0xffff) as u16;
    if id <= 1 {
        id + 2
    } else {
        id
    }
}

/// Download burst: `(rate × multiplier) / 250`, floored at one frame.
pub fn tbf_burst_bytes(rate_bps: u64, multiplier: u64) -> u64 {
    ((rate_bps / 8) * multiplier / 250).max(MIN_BURST_BYTES)
}

// ---- argv rendering ----

pub(crate) fn root_qdisc_args(bridge: &str) -> Vec<String> {
    args(&["qdisc", "replace", "dev", bridge, "root", "handle", "1:", "htb", "default", "0"])
}

pub(crate) fn root_class_args(bridge: &str, aggregate_bps: u64) -> Vec<String> {
    let rate = format_rate(aggregate_bps);
    args(&[
        "class", "replace", "dev", bridge, "parent", "1:", "classid", "1:1", "htb", "rate", &rate,
    ])
}

pub(crate) fn guest_class_args(bridge: &str, id: u16, rate_bps: u64, ceil_bps: u64) -> Vec<String> {
    let classid = format!("1:{id:x}");
    let rate = format_rate(rate_bps);
    let ceil = format_rate(ceil_bps);
    args(&[
        "class", "replace", "dev", bridge, "parent", "1:1", "classid", &classid, "htb", "rate",
        &rate, "ceil", &ceil,
    ])
}

pub(crate) fn guest_leaf_args(bridge: &str, id: u16) -> Vec<String> {
    let parent = format!("1:{id:x}");
    let handle = format!("{id:x}:");
    args(&[
        "qdisc", "replace", "dev", bridge, "parent", &parent, "handle", &handle, "fq_codel",
    ])
}

pub(crate) fn guest_filter_args(bridge: &str, id: u16, ifindex: u32) -> Vec<String> {
    let matcher = format!("meta(rt_iif eq {ifindex})");
    let flowid = format!("1:{id:x}");
    args(&[
        "filter", "add", "dev", bridge, "parent", "1:", "protocol", "all", "basic", "match",
        &matcher, "flowid", &flowid,
    ])
}

pub(crate) fn tbf_args(tap: &str, rate_bps: u64, burst_bytes: u64) -> Vec<String> {
    let rate = format_rate(rate_bps);
    let burst = format!("{burst_bytes}b");
    args(&[
        "qdisc", "replace", "dev", tap, "root", "tbf", "rate", &rate, "burst", &burst, "latency",
        "50ms",
    ])
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

// ---- execution ----

fn run_tc(argv: &[String]) -> Result<String, NetworkError> {
    run_command("tc", argv)
}

/// Ensures the bridge's root HTB qdisc and aggregate class exist.
///
/// `replace` makes both calls idempotent against an already-shaped bridge.
pub fn ensure_root(bridge: &str, aggregate_bps: u64) -> Result<(), NetworkError> {
    run_tc(&root_qdisc_args(bridge))?;
    run_tc(&root_class_args(bridge, aggregate_bps))?;
    Ok(())
}

/// Installs the upload class, leaf qdisc, and steering filter for a TAP.
pub fn install_upload_class(
    bridge: &str,
    tap: &str,
    ifindex: u32,
    rate_bps: u64,
    ceil_bps: u64,
) -> Result<(), NetworkError> {
    let id = class_id(tap);
    run_tc(&guest_class_args(bridge, id, rate_bps, ceil_bps))?;
    run_tc(&guest_leaf_args(bridge, id))?;
    run_tc(&guest_filter_args(bridge, id, ifindex))?;
    debug!(tap, class = format!("1:{id:x}"), "upload class installed");
    Ok(())
}

/// Installs the download TBF on a TAP's egress.
pub fn install_download_tbf(
    tap: &str,
    rate_bps: u64,
    burst_multiplier: u64,
) -> Result<(), NetworkError> {
    let burst = tbf_burst_bytes(rate_bps, burst_multiplier);
    run_tc(&tbf_args(tap, rate_bps, burst))?;
    Ok(())
}

/// Removes the upload class, its leaf, and its filters for a TAP.
/// Best-effort: every step is attempted even if an earlier one fails.
pub fn remove_upload_class(bridge: &str, tap: &str) {
    remove_class_by_id(bridge, class_id(tap));
}

fn remove_class_by_id(bridge: &str, id: u16) {
    let flowid = format!("1:{id:x}");

    match run_tc(&args(&["filter", "show", "dev", bridge, "parent", "1:"])) {
        Ok(output) => {
            for filter in parse_filters(&output) {
                if filter.flowid.as_deref() != Some(flowid.as_str()) {
                    continue;
                }
                let pref = filter.pref.to_string();
                let result = run_tc(&args(&[
                    "filter", "del", "dev", bridge, "parent", "1:", "pref", &pref, "handle",
                    &filter.handle, "basic",
                ]));
                if let Err(e) = result {
                    warn!(bridge, flowid = %flowid, error = %e, "filter removal failed");
                }
            }
        }
        Err(e) => warn!(bridge, error = %e, "filter listing failed"),
    }

    let parent = format!("1:{id:x}");
    if let Err(e) = run_tc(&args(&["qdisc", "del", "dev", bridge, "parent", &parent])) {
        debug!(bridge, class = %parent, error = %e, "leaf qdisc removal failed");
    }
    if let Err(e) = run_tc(&args(&["class", "del", "dev", bridge, "classid", &parent])) {
        warn!(bridge, class = %parent, error = %e, "class removal failed");
    }
}

/// Deletes HTB classes on the bridge whose id does not belong to any TAP in
/// `taps`. Filters are removed first (by flowid), then leaves, then classes.
pub fn sweep_orphan_classes(bridge: &str, taps: &[String]) -> Result<(), NetworkError> {
    let expected: HashSet<u16> = taps.iter().map(|t| class_id(t)).collect();

    let output = run_tc(&args(&["class", "show", "dev", bridge]))?;
    for id in parse_class_ids(&output) {
        if id == 1 || expected.contains(&id) {
            continue;
        }
        warn!(bridge, class = format!("1:{id:x}"), "removing orphan traffic class");
        remove_class_by_id(bridge, id);
    }
    Ok(())
}

/// One filter as printed by `tc filter show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FilterSpec {
    pub pref: u32,
    pub handle: String,
    pub flowid: Option<String>,
}

/// Parses `tc filter show dev <dev> parent 1:` output. `tc` spreads one
/// filter over two lines: the first carries `pref`, the continuation
/// carries `handle` and `flowid`.
pub(crate) fn parse_filters(output: &str) -> Vec<FilterSpec> {
    let mut filters = Vec::new();
    let mut current_pref: Option<u32> = None;

    for line in output.lines() {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if let Some(i) = tokens.iter().position(|t| *t == "pref") {
            current_pref = tokens.get(i + 1).and_then(|v| v.parse().ok());
        }
        let handle = tokens
            .iter()
            .position(|t| *t == "handle")
            .and_then(|i| tokens.get(i + 1))
            .map(|s| s.to_string());
        let flowid = tokens
            .iter()
            .position(|t| *t == "flowid")
            .and_then(|i| tokens.get(i + 1))
            .map(|s| s.to_string());

        if let (Some(pref), Some(handle)) = (current_pref, handle) {
            filters.push(FilterSpec {
                pref,
                handle,
                flowid,
            });
        }
    }
    filters
}

/// Parses class ids (the minor of `1:xxxx`, hex) from `tc class show`.
pub(crate) fn parse_class_ids(output: &str) -> Vec<u16> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            if tokens.next() != Some("class") {
                return None;
            }
            let _kind = tokens.next()?;
            let classid = tokens.next()?;
            let minor = classid.strip_prefix("1:")?;
            u16::from_str_radix(minor, 16).ok()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_uses_coarsest_exact_unit() {
        assert_eq!(format_rate(10_000_000_000), "10gbit");
        assert_eq!(format_rate(2_500_000_000), "2500mbit");
        assert_eq!(format_rate(1_000_000), "1mbit");
        assert_eq!(format_rate(1_500_000), "1500kbit");
        assert_eq!(format_rate(999), "999bit");
        assert_eq!(format_rate(0), "0bit");
    }

    #[test]
    fn class_id_is_stable_and_avoids_reserved() {
        let a = class_id("hype-9f8a3c21");
        assert_eq!(a, class_id("hype-9f8a3c21"));
        assert_ne!(a, class_id("hype-00000000"));
        assert!(a >= 2);
    }

    #[test]
    fn burst_floors_at_frame_size() {
        // 1 Mbit/s * 2 / 250 = 1000 bytes, below one frame.
        assert_eq!(tbf_burst_bytes(1_000_000, 2), MIN_BURST_BYTES);
        // 200 Mbit/s * 2 / 250 = 200_000 bytes.
        assert_eq!(tbf_burst_bytes(200_000_000, 2), 200_000);
    }

    #[test]
    fn argv_rendering() {
        assert_eq!(
            root_qdisc_args("hypebr0").join(" "),
            "qdisc replace dev hypebr0 root handle 1: htb default 0"
        );
        assert_eq!(
            guest_class_args("hypebr0", 0x4a3b, 100_000_000, 1_000_000_000).join(" "),
            "class replace dev hypebr0 parent 1:1 classid 1:4a3b htb rate 100mbit ceil 1gbit"
        );
        assert_eq!(
            guest_filter_args("hypebr0", 0x4a3b, 17).join(" "),
            "filter add dev hypebr0 parent 1: protocol all basic match meta(rt_iif eq 17) flowid 1:4a3b"
        );
        assert_eq!(
            tbf_args("hype-9f8a3c21", 200_000_000, 200_000).join(" "),
            "qdisc replace dev hype-9f8a3c21 root tbf rate 200mbit burst 200000b latency 50ms"
        );
    }

    #[test]
    fn parse_class_ids_reads_hex_minors() {
        let output = "\
class htb 1:1 root rate 10Gbit ceil 10Gbit burst 1250b cburst 1250b
class htb 1:4a3b parent 1:1 leaf 4a3b: prio 0 rate 100Mbit ceil 1Gbit
class htb 1:beef parent 1:1 prio 0 rate 50Mbit ceil 1Gbit
";
        assert_eq!(parse_class_ids(output), vec![0x1, 0x4a3b, 0xbeef]);
    }

    #[test]
    fn parse_filters_joins_continuation_lines() {
        let output = "\
filter parent 1: protocol all pref 49152 basic chain 0
filter parent 1: protocol all pref 49152 basic chain 0 handle 0x1 flowid 1:4a3b
  meta(rt_iif eq 17)
filter parent 1: protocol all pref 49151 basic chain 0 handle 0x2 flowid 1:beef
";
        let filters = parse_filters(output);
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].pref, 49152);
        assert_eq!(filters[0].handle, "0x1");
        assert_eq!(filters[0].flowid.as_deref(), Some("1:4a3b"));
        assert_eq!(filters[1].pref, 49151);
        assert_eq!(filters[1].flowid.as_deref(), Some("1:beef"));
    }
}
