//! Bridge and NAT reconciliation.
//!
//! `initialize` converges the host onto a known-good state: the bridge
//! exists and carries the gateway address, IPv4 forwarding is on, and
//! exactly one copy of each hypeman iptables rule sits at its canonical
//! position. Rules are tagged with an owner comment and only rules bearing
//! that comment are ever deleted; everything untagged belongs to the rest
//! of the OS.

use std::fs;

use tracing::{debug, info, warn};

use super::{run_command, NetworkError, Subnet};

/// Comment tags marking hypeman-owned iptables rules.
pub const NAT_COMMENT: &str = "hypeman-nat";
pub const FORWARD_OUT_COMMENT: &str = "hypeman-forward-out";
pub const FORWARD_IN_COMMENT: &str = "hypeman-forward-in";

const IP_FORWARD_PATH: &str = "/proc/sys/net/ipv4/ip_forward";

/// One route from `ip route show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HostRoute {
    /// Destination; `None` for the default route.
    pub dest: Option<Subnet>,
    /// Interface the route goes out of.
    pub device: String,
}

/// Parses `ip route show` output. Lines that do not name a `dev` are
/// ignored (blackhole routes and the like).
pub(crate) fn parse_routes(output: &str) -> Vec<HostRoute> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let first = tokens.first()?;
            let dest = if *first == "default" {
                None
            } else {
                Some(Subnet::parse(first).ok()?)
            };
            let device = tokens
                .iter()
                .position(|t| *t == "dev")
                .and_then(|i| tokens.get(i + 1))?
                .to_string();
            Some(HostRoute { dest, device })
        })
        .collect()
}

/// Finds a route that overlaps `subnet` on a foreign interface.
pub(crate) fn find_conflict<'a>(
    routes: &'a [HostRoute],
    subnet: &Subnet,
    bridge: &str,
) -> Option<&'a HostRoute> {
    routes.iter().find(|route| {
        route.device != bridge
            && route
                .dest
                .as_ref()
                .is_some_and(|dest| dest.overlaps(subnet))
    })
}

/// The interface carrying the default route.
pub(crate) fn default_route_device(routes: &[HostRoute]) -> Option<String> {
    routes
        .iter()
        .find(|r| r.dest.is_none())
        .map(|r| r.device.clone())
}

fn run_ip(argv: &[&str]) -> Result<String, NetworkError> {
    let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
    run_command("ip", &argv)
}

/// Reads the kernel routing table.
fn host_routes() -> Result<Vec<HostRoute>, NetworkError> {
    Ok(parse_routes(&run_ip(&["route", "show"])?))
}

fn link_exists(name: &str) -> bool {
    std::path::Path::new("/sys/class/net").join(name).exists()
}

/// IPv4 addresses currently on a link.
fn link_addresses(name: &str) -> Result<Vec<String>, NetworkError> {
    let output = run_ip(&["-o", "-4", "addr", "show", "dev", name])?;
    Ok(parse_link_addresses(&output))
}

pub(crate) fn parse_link_addresses(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let i = tokens.iter().position(|t| *t == "inet")?;
            tokens.get(i + 1).map(|s| s.to_string())
        })
        .collect()
}

/// Ensures the bridge exists, is up, and carries the gateway address.
///
/// A bridge that exists with a different address is an operator-owned
/// artifact; it is reported, never rewritten.
fn ensure_bridge(bridge: &str, subnet: &Subnet) -> Result<(), NetworkError> {
    let gateway_cidr = format!("{}/{}", subnet.gateway(), subnet.prefix());

    if !link_exists(bridge) {
        info!(bridge = %bridge, "creating bridge");
        run_ip(&["link", "add", "name", bridge, "type", "bridge"])?;
    }
    run_ip(&["link", "set", bridge, "up"])?;

    let addresses = link_addresses(bridge)?;
    if addresses.iter().any(|a| a == &gateway_cidr) {
        debug!(bridge = %bridge, address = %gateway_cidr, "gateway address already present");
        return Ok(());
    }
    if !addresses.is_empty() {
        return Err(NetworkError::BridgeMismatch {
            bridge: bridge.to_string(),
            expected: gateway_cidr,
            actual: addresses.join(", "),
        });
    }

    run_ip(&["addr", "add", &gateway_cidr, "dev", bridge])?;
    Ok(())
}

/// Enables IPv4 forwarding if the kernel has it off.
fn ensure_ip_forward() -> Result<(), NetworkError> {
    let current = fs::read_to_string(IP_FORWARD_PATH)
        .map_err(|e| NetworkError::Parse(format!("{IP_FORWARD_PATH}: {e}")))?;
    if current.trim() == "1" {
        return Ok(());
    }
    info!("enabling IPv4 forwarding");
    fs::write(IP_FORWARD_PATH, "1")
        .map_err(|e| NetworkError::Parse(format!("{IP_FORWARD_PATH}: {e}")))
}

/// One iptables rule hypeman owns.
#[derive(Debug, Clone)]
pub(crate) struct RuleSpec {
    /// `Some("nat")` for NAT-table rules.
    pub table: Option<&'static str>,
    pub chain: &'static str,
    /// 1-based insert position; `None` appends.
    pub position: Option<u32>,
    /// Match and target argv, without the comment matcher.
    pub args: Vec<String>,
    pub comment: &'static str,
}

impl RuleSpec {
    /// Full argv including the owner comment.
    pub fn full_args(&self) -> Vec<String> {
        let mut full = self.args.clone();
        full.extend(
            ["-m", "comment", "--comment", self.comment]
                .iter()
                .map(|s| s.to_string()),
        );
        full
    }
}

/// The three canonical rules for a subnet/bridge/uplink triple.
pub(crate) fn canonical_rules(subnet: &Subnet, bridge: &str, uplink: &str) -> Vec<RuleSpec> {
    let subnet_cidr = subnet.to_string();
    vec![
        RuleSpec {
            table: Some("nat"),
            chain: "POSTROUTING",
            position: None,
            args: vec![
                "-s".into(),
                subnet_cidr,
                "-o".into(),
                uplink.into(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
            comment: NAT_COMMENT,
        },
        RuleSpec {
            table: None,
            chain: "FORWARD",
            position: Some(1),
            args: vec![
                "-i".into(),
                bridge.into(),
                "-o".into(),
                uplink.into(),
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "NEW,ESTABLISHED,RELATED".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
            comment: FORWARD_OUT_COMMENT,
        },
        RuleSpec {
            table: None,
            chain: "FORWARD",
            position: Some(2),
            args: vec![
                "-i".into(),
                uplink.into(),
                "-o".into(),
                bridge.into(),
                "-m".into(),
                "conntrack".into(),
                "--ctstate".into(),
                "ESTABLISHED,RELATED".into(),
                "-j".into(),
                "ACCEPT".into(),
            ],
            comment: FORWARD_IN_COMMENT,
        },
    ]
}

/// 1-based positions (among the chain's rules) of rules carrying `comment`,
/// from `iptables -S <chain>` output.
pub(crate) fn tagged_positions(listing: &str, chain: &str, comment: &str) -> Vec<u32> {
    let prefix = format!("-A {chain} ");
    let needle = format!("--comment {comment}");
    let quoted = format!("--comment \"{comment}\"");
    listing
        .lines()
        .filter(|line| line.starts_with(&prefix))
        .enumerate()
        .filter(|(_, line)| line.contains(&needle) || line.contains(&quoted))
        .map(|(i, _)| i as u32 + 1)
        .collect()
}

fn iptables(table: Option<&str>, argv: &[String]) -> Result<String, NetworkError> {
    let mut full: Vec<String> = Vec::new();
    if let Some(table) = table {
        full.push("-t".into());
        full.push(table.into());
    }
    full.extend(argv.iter().cloned());
    run_command("iptables", &full)
}

fn list_chain(table: Option<&str>, chain: &str) -> Result<String, NetworkError> {
    iptables(table, &["-S".to_string(), chain.to_string()])
}

fn rule_present(spec: &RuleSpec) -> bool {
    let mut argv = vec!["-C".to_string(), spec.chain.to_string()];
    argv.extend(spec.full_args());
    iptables(spec.table, &argv).is_ok()
}

/// Reconciles one rule: correct rule at the correct position is left
/// alone; otherwise every tagged copy is deleted and the canonical rule
/// inserted.
fn reconcile_rule(spec: &RuleSpec) -> Result<(), NetworkError> {
    let listing = list_chain(spec.table, spec.chain)?;
    let positions = tagged_positions(&listing, spec.chain, spec.comment);

    let at_expected_position = match spec.position {
        Some(expected) => positions == [expected],
        None => positions.len() == 1,
    };
    if at_expected_position && rule_present(spec) {
        debug!(chain = spec.chain, comment = spec.comment, "rule already canonical");
        return Ok(());
    }

    // Delete by position, highest first, so indices stay valid.
    for position in positions.iter().rev() {
        let argv = vec![
            "-D".to_string(),
            spec.chain.to_string(),
            position.to_string(),
        ];
        if let Err(e) = iptables(spec.table, &argv) {
            warn!(chain = spec.chain, position, error = %e, "stale rule removal failed");
        }
    }

    let mut argv = match spec.position {
        Some(position) => vec![
            "-I".to_string(),
            spec.chain.to_string(),
            position.to_string(),
        ],
        None => vec!["-A".to_string(), spec.chain.to_string()],
    };
    argv.extend(spec.full_args());
    iptables(spec.table, &argv)?;
    info!(chain = spec.chain, comment = spec.comment, "rule installed");
    Ok(())
}

/// Outcome of `initialize`.
#[derive(Debug, Clone)]
pub struct BridgeState {
    /// Interface NAT egress uses.
    pub uplink: String,
}

/// Converges bridge, forwarding, and NAT rules. Idempotent: a second run
/// against a configured host performs no mutations.
pub fn initialize(
    bridge: &str,
    subnet: &Subnet,
    uplink_override: Option<&str>,
) -> Result<BridgeState, NetworkError> {
    let routes = host_routes()?;

    if let Some(conflict) = find_conflict(&routes, subnet, bridge) {
        return Err(NetworkError::SubnetConflict {
            subnet: subnet.to_string(),
            route: conflict
                .dest
                .as_ref()
                .map(Subnet::to_string)
                .unwrap_or_default(),
            device: conflict.device.clone(),
        });
    }

    ensure_bridge(bridge, subnet)?;
    ensure_ip_forward()?;

    let uplink = match uplink_override {
        Some(explicit) => explicit.to_string(),
        None => default_route_device(&routes).ok_or_else(|| {
            NetworkError::Parse("no default route and no explicit uplink configured".to_string())
        })?,
    };

    for spec in canonical_rules(subnet, bridge, &uplink) {
        reconcile_rule(&spec)?;
    }

    info!(bridge = %bridge, subnet = %subnet, uplink = %uplink, "host network initialized");
    Ok(BridgeState { uplink })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn subnet(s: &str) -> Subnet {
        Subnet::parse(s).unwrap()
    }

    #[test]
    fn parse_routes_reads_dest_and_device() {
        let output = "\
default via 192.168.1.1 dev eth0 proto dhcp metric 100
10.100.0.0/24 dev docker0 proto kernel scope link src 10.100.0.1
192.168.1.0/24 dev eth0 proto kernel scope link src 192.168.1.50
";
        let routes = parse_routes(output);
        assert_eq!(routes.len(), 3);
        assert!(routes[0].dest.is_none());
        assert_eq!(routes[0].device, "eth0");
        assert_eq!(routes[1].dest.as_ref().unwrap().to_string(), "10.100.0.0/24");
        assert_eq!(routes[1].device, "docker0");
    }

    #[test]
    fn conflict_detection_matches_overlap_on_foreign_device() {
        let routes = parse_routes("10.100.0.0/24 dev docker0 scope link\n");
        // A /16 wholly containing the /24 conflicts.
        let conflict = find_conflict(&routes, &subnet("10.100.0.0/16"), "hypebr0").unwrap();
        assert_eq!(conflict.device, "docker0");
        // The same range on our own bridge does not.
        let own = parse_routes("10.100.0.0/16 dev hypebr0 scope link\n");
        assert!(find_conflict(&own, &subnet("10.100.0.0/16"), "hypebr0").is_none());
        // A disjoint range does not.
        assert!(find_conflict(&routes, &subnet("10.200.0.0/24"), "hypebr0").is_none());
    }

    #[test]
    fn default_route_device_found() {
        let routes = parse_routes("default via 10.0.0.1 dev wlan0\n10.0.0.0/24 dev wlan0\n");
        assert_eq!(default_route_device(&routes).as_deref(), Some("wlan0"));
        assert!(default_route_device(&[]).is_none());
    }

    #[test]
    fn parse_link_addresses_reads_inet() {
        let output =
            "7: hypebr0    inet 10.230.0.1/24 brd 10.230.0.255 scope global hypebr0\\       valid_lft forever preferred_lft forever\n";
        assert_eq!(parse_link_addresses(output), vec!["10.230.0.1/24"]);
    }

    #[test]
    fn canonical_rules_render_expected_args() {
        let rules = canonical_rules(&subnet("10.230.0.0/24"), "hypebr0", "eth0");
        assert_eq!(rules.len(), 3);

        assert_eq!(rules[0].table, Some("nat"));
        assert_eq!(
            rules[0].full_args().join(" "),
            "-s 10.230.0.0/24 -o eth0 -j MASQUERADE -m comment --comment hypeman-nat"
        );
        assert_eq!(rules[1].position, Some(1));
        assert!(rules[1].full_args().join(" ").contains("NEW,ESTABLISHED,RELATED"));
        assert_eq!(rules[2].position, Some(2));
        assert!(!rules[2].full_args().join(" ").contains("NEW"));
    }

    #[test]
    fn tagged_positions_counts_only_chain_rules() {
        let listing = "\
-P FORWARD ACCEPT
-A FORWARD -i hypebr0 -o eth0 -m conntrack --ctstate NEW,ESTABLISHED,RELATED -m comment --comment hypeman-forward-out -j ACCEPT
-A FORWARD -i docker0 -j ACCEPT
-A FORWARD -i eth0 -o hypebr0 -m conntrack --ctstate ESTABLISHED,RELATED -m comment --comment hypeman-forward-in -j ACCEPT
";
        assert_eq!(
            tagged_positions(listing, "FORWARD", FORWARD_OUT_COMMENT),
            vec![1]
        );
        assert_eq!(
            tagged_positions(listing, "FORWARD", FORWARD_IN_COMMENT),
            vec![3]
        );
        assert!(tagged_positions(listing, "FORWARD", NAT_COMMENT).is_empty());
    }

    #[test]
    fn tagged_positions_handles_quoted_comments() {
        let listing =
            "-A POSTROUTING -s 10.230.0.0/24 -o eth0 -m comment --comment \"hypeman-nat\" -j MASQUERADE\n";
        assert_eq!(
            tagged_positions(listing, "POSTROUTING", NAT_COMMENT),
            vec![1]
        );
    }

    #[test]
    fn subnet_gateway_is_network_plus_one() {
        let s = subnet("10.230.0.0/24");
        assert_eq!(s.gateway(), Ipv4Addr::new(10, 230, 0, 1));
    }
}
