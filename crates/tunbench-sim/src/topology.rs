//! Virtual networks built from Linux network namespaces.
//!
//! A [`TopologySpec`] is plain data: hosts, veth links, routes, policy rules
//! and the WAN segments that get shaped. [`Topology::build`] validates the
//! spec and brings it up; dropping the [`Topology`] deletes every namespace.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::command::Cmd;
use crate::error::BenchError;
use crate::host::Host;
use crate::impairment::QueueBasis;

/// Linux limit on interface names (IFNAMSIZ - 1).
pub const MAX_IFACE_NAME: usize = 15;

pub const DEFAULT_PREFIX: &str = "tb";

/// Queueing-delay basis used on the multi-path diamond.
pub const DIAMOND_QUEUE_BASIS: Duration = Duration::from_millis(200);

fn sudo() -> Cmd {
    Cmd::new("sudo")
}

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// A Linux network namespace managed via `ip netns`.
///
/// Created (with loopback up) on construction, deleted on drop. `host` is
/// the logical id used in logs and errors; `name` is the kernel-side name.
#[derive(Debug)]
pub struct Namespace {
    name: String,
    host: String,
}

impl Namespace {
    pub fn new(name: &str, host: &str) -> Result<Self> {
        // remove a stale namespace left by a crashed run
        let _ = sudo().args(["ip", "netns", "del", name]).output();

        sudo()
            .args(["ip", "netns", "add", name])
            .output_checked()
            .with_context(|| format!("create netns {name}"))?;

        let ns = Self {
            name: name.to_string(),
            host: host.to_string(),
        };
        ns.exec_checked(Cmd::new("ip").args(["link", "set", "lo", "up"]))
            .with_context(|| format!("bring up loopback in {name}"))?;
        Ok(ns)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a veth pair with one end in each namespace. Both ends are
    /// created directly inside their namespaces, so equal interface names in
    /// two coexisting topologies never collide.
    pub fn create_veth(&self, peer: &Namespace, local_iface: &str, peer_iface: &str) -> Result<()> {
        sudo()
            .args(["ip", "link", "add", local_iface, "netns", &self.name])
            .args(["type", "veth", "peer", "name", peer_iface, "netns", &peer.name])
            .output_checked()
            .with_context(|| {
                format!(
                    "create veth {}/{local_iface} <-> {}/{peer_iface}",
                    self.host, peer.host
                )
            })?;
        Ok(())
    }

    pub fn add_address(&self, iface: &str, cidr: &str) -> Result<()> {
        self.exec_checked(Cmd::new("ip").args(["addr", "add", cidr, "dev", iface]))
            .with_context(|| format!("assign {cidr} to {}/{iface}", self.host))?;
        Ok(())
    }

    pub fn link_up(&self, iface: &str) -> Result<()> {
        self.exec_checked(Cmd::new("ip").args(["link", "set", iface, "up"]))
            .with_context(|| format!("bring up {}/{iface}", self.host))?;
        Ok(())
    }

    pub fn sysctl(&self, key: &str, value: &str) -> Result<()> {
        self.exec_checked(Cmd::new("sysctl").args(["-w", &format!("{key}={value}")]))
            .with_context(|| format!("sysctl {key}={value} on {}", self.host))?;
        Ok(())
    }

    /// Point-to-point link: veth pair, one address on each side, both up.
    pub fn add_veth_link(
        &self,
        peer: &Namespace,
        local_iface: &str,
        peer_iface: &str,
        local_ip: &str,
        peer_ip: &str,
    ) -> Result<()> {
        self.create_veth(peer, local_iface, peer_iface)?;
        self.add_address(local_iface, local_ip)?;
        self.link_up(local_iface)?;
        peer.add_address(peer_iface, peer_ip)?;
        peer.link_up(peer_iface)?;
        Ok(())
    }
}

impl Host for Namespace {
    fn name(&self) -> &str {
        &self.host
    }

    fn wrap(&self, cmd: Cmd) -> Cmd {
        cmd.wrapped_in(sudo().args(["ip", "netns", "exec", &self.name]))
    }
}

impl Drop for Namespace {
    fn drop(&mut self) {
        let _ = sudo().args(["ip", "netns", "del", &self.name]).output();
    }
}

/// Delete every namespace whose name starts with `<prefix>-`. Returns how
/// many were removed.
pub fn remove_stale_namespaces(prefix: &str) -> Result<usize> {
    let out = sudo().args(["ip", "netns", "list"]).output_checked()?;
    let listing = String::from_utf8_lossy(&out.stdout);
    let marker = format!("{prefix}-");

    let mut removed = 0;
    for name in listing
        .lines()
        .filter_map(|l| l.split_whitespace().next())
        .filter(|n| n.starts_with(&marker))
    {
        match sudo().args(["ip", "netns", "del", name]).output_checked() {
            Ok(_) => removed += 1,
            Err(e) => warn!(ns = name, error = %e, "could not remove stale namespace"),
        }
    }
    Ok(removed)
}

// ---------------------------------------------------------------------------
// Spec
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyShape {
    /// `h1 - r1 - r2 - h2`, one WAN segment.
    Chain,
    /// h1 multi-homed to r1 and r2, both reaching r3, which serves h2.
    Diamond,
}

impl fmt::Display for TopologyShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TopologyShape::Chain => "chain",
            TopologyShape::Diamond => "diamond",
        })
    }
}

impl FromStr for TopologyShape {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "chain" | "single-path" => Ok(TopologyShape::Chain),
            "diamond" | "multipath" | "multi-path" => Ok(TopologyShape::Diamond),
            other => Err(format!("unknown topology shape `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Endpoint,
    Router,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HostSpec {
    pub id: String,
    pub role: Role,
    /// Fraction of one CPU this host may use when limits are enforced.
    pub cpu_share: f64,
}

/// One side of a veth link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub iface: String,
    /// Address with prefix length, e.g. `6.6.6.6/24`.
    pub cidr: String,
}

impl Endpoint {
    pub fn ip(&self) -> &str {
        self.cidr.split('/').next().unwrap_or(&self.cidr)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSpec {
    pub a: Endpoint,
    pub b: Endpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSpec {
    pub host: String,
    pub dest: String,
    pub via: Option<String>,
    pub dev: Option<String>,
    pub scope: Option<String>,
    pub table: Option<u32>,
    /// Emit `nexthop` before `via` (multipath-capable default route).
    pub nexthop: bool,
}

impl RouteSpec {
    fn to_cmd(&self) -> Cmd {
        let mut cmd = Cmd::new("ip").args(["route", "add", &self.dest]);
        if let Some(scope) = &self.scope {
            cmd = cmd.args(["scope", scope]);
        }
        if self.nexthop {
            cmd = cmd.arg("nexthop");
        }
        if let Some(via) = &self.via {
            cmd = cmd.args(["via", via]);
        }
        if let Some(dev) = &self.dev {
            cmd = cmd.args(["dev", dev]);
        }
        if let Some(table) = self.table {
            cmd = cmd.args(["table".to_string(), table.to_string()]);
        }
        cmd
    }
}

/// Source-address policy rule: `ip rule add from <from> table <table>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRule {
    pub host: String,
    pub from: String,
    pub table: u32,
}

impl PolicyRule {
    fn to_cmd(&self) -> Cmd {
        Cmd::new("ip").args([
            "rule".to_string(),
            "add".to_string(),
            "from".to_string(),
            self.from.clone(),
            "table".to_string(),
            self.table.to_string(),
        ])
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentEnd {
    pub host: String,
    pub iface: String,
}

/// A link whose two router interfaces receive the impairment profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WanSegment {
    pub name: String,
    pub ends: [SegmentEnd; 2],
}

#[derive(Debug, Clone)]
pub struct TopologySpec {
    pub shape: TopologyShape,
    /// Namespace names are `<prefix>-<host>`.
    pub prefix: String,
    pub hosts: Vec<HostSpec>,
    pub links: Vec<LinkSpec>,
    pub routes: Vec<RouteSpec>,
    pub rules: Vec<PolicyRule>,
    pub segments: Vec<WanSegment>,
    pub queue_basis: QueueBasis,
    /// Run host commands under a systemd CPU quota of `cpu_share`.
    pub enforce_cpu_limits: bool,
    /// Enable ECN on the endpoints after bring-up.
    pub ecn: bool,
}

fn host(id: &str, role: Role, cpu_share: f64) -> HostSpec {
    HostSpec {
        id: id.into(),
        role,
        cpu_share,
    }
}

fn link(a: (&str, &str, &str), b: (&str, &str, &str)) -> LinkSpec {
    let ep = |(host, iface, cidr): (&str, &str, &str)| Endpoint {
        host: host.into(),
        iface: iface.into(),
        cidr: cidr.into(),
    };
    LinkSpec { a: ep(a), b: ep(b) }
}

fn route(host: &str, dest: &str, via: Option<&str>, dev: Option<&str>) -> RouteSpec {
    RouteSpec {
        host: host.into(),
        dest: dest.into(),
        via: via.map(Into::into),
        dev: dev.map(Into::into),
        ..Default::default()
    }
}

fn segment(name: &str, a: (&str, &str), b: (&str, &str)) -> WanSegment {
    WanSegment {
        name: name.into(),
        ends: [
            SegmentEnd {
                host: a.0.into(),
                iface: a.1.into(),
            },
            SegmentEnd {
                host: b.0.into(),
                iface: b.1.into(),
            },
        ],
    }
}

impl TopologySpec {
    pub fn for_shape(shape: TopologyShape) -> Self {
        match shape {
            TopologyShape::Chain => Self::chain(),
            TopologyShape::Diamond => Self::diamond(),
        }
    }

    pub fn chain() -> Self {
        Self {
            shape: TopologyShape::Chain,
            prefix: DEFAULT_PREFIX.into(),
            hosts: vec![
                host("h1", Role::Endpoint, 0.3),
                host("h2", Role::Endpoint, 0.3),
                host("r1", Role::Router, 0.1),
                host("r2", Role::Router, 0.1),
            ],
            links: vec![
                link(("h1", "h1-eth0", "6.6.6.6/24"), ("r1", "r1-eth0", "6.6.6.1/24")),
                link(("r1", "r1-eth1", "10.0.0.2/24"), ("r2", "r2-eth0", "10.0.0.3/24")),
                link(("r2", "r2-eth1", "7.7.7.1/24"), ("h2", "h2-eth0", "7.7.7.7/24")),
            ],
            routes: vec![
                route("r1", "default", Some("10.0.0.3"), None),
                route("r2", "default", Some("10.0.0.2"), None),
                route("h1", "default", Some("6.6.6.1"), None),
                route("h2", "default", Some("7.7.7.1"), None),
            ],
            rules: Vec::new(),
            segments: vec![segment("wan", ("r1", "r1-eth1"), ("r2", "r2-eth0"))],
            queue_basis: QueueBasis::RoundTrip,
            enforce_cpu_limits: false,
            ecn: true,
        }
    }

    pub fn diamond() -> Self {
        let table_route = |dest: &str, via: Option<&str>, dev: &str, table: u32| RouteSpec {
            scope: via.is_none().then(|| "link".to_string()),
            table: Some(table),
            ..route("h1", dest, via, Some(dev))
        };

        Self {
            shape: TopologyShape::Diamond,
            prefix: DEFAULT_PREFIX.into(),
            hosts: ["h1", "h2", "r1", "r2", "r3"]
                .into_iter()
                .map(|id| {
                    let role = if id.starts_with('h') {
                        Role::Endpoint
                    } else {
                        Role::Router
                    };
                    host(id, role, 0.2)
                })
                .collect(),
            links: vec![
                link(("h1", "h1-eth0", "3.3.3.3/24"), ("r1", "r1-eth0", "3.3.3.1/24")),
                link(("h1", "h1-eth1", "4.4.4.4/24"), ("r2", "r2-eth0", "4.4.4.1/24")),
                link(("r1", "r1-eth1", "5.5.5.1/24"), ("r3", "r3-eth0", "5.5.5.2/24")),
                link(("r2", "r2-eth1", "6.6.6.1/24"), ("r3", "r3-eth1", "6.6.6.2/24")),
                link(("r3", "r3-eth2", "7.7.7.1/24"), ("h2", "h2-eth0", "7.7.7.7/24")),
            ],
            routes: vec![
                table_route("3.3.3.0/24", None, "h1-eth0", 1),
                table_route("default", Some("3.3.3.1"), "h1-eth0", 1),
                table_route("4.4.4.0/24", None, "h1-eth1", 2),
                table_route("default", Some("4.4.4.1"), "h1-eth1", 2),
                RouteSpec {
                    scope: Some("global".into()),
                    nexthop: true,
                    ..route("h1", "default", Some("3.3.3.1"), Some("h1-eth0"))
                },
                route("h2", "default", Some("7.7.7.1"), None),
                route("r3", "3.3.3.0/24", Some("5.5.5.1"), Some("r3-eth0")),
                route("r3", "4.4.4.0/24", Some("6.6.6.1"), Some("r3-eth1")),
                route("r1", "7.7.7.0/24", Some("5.5.5.2"), Some("r1-eth1")),
                route("r1", "4.4.4.0/24", Some("5.5.5.2"), Some("r1-eth1")),
                route("r1", "6.6.6.0/24", Some("5.5.5.2"), Some("r1-eth1")),
                route("r2", "7.7.7.0/24", Some("6.6.6.2"), Some("r2-eth1")),
                route("r2", "3.3.3.0/24", Some("6.6.6.2"), Some("r2-eth1")),
                route("r2", "5.5.5.0/24", Some("6.6.6.2"), Some("r2-eth1")),
            ],
            rules: vec![
                PolicyRule {
                    host: "h1".into(),
                    from: "3.3.3.3".into(),
                    table: 1,
                },
                PolicyRule {
                    host: "h1".into(),
                    from: "4.4.4.4".into(),
                    table: 2,
                },
            ],
            segments: vec![
                segment("north", ("r1", "r1-eth1"), ("r3", "r3-eth0")),
                segment("south", ("r2", "r2-eth1"), ("r3", "r3-eth1")),
            ],
            queue_basis: QueueBasis::Fixed(DIAMOND_QUEUE_BASIS),
            enforce_cpu_limits: false,
            ecn: true,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_cpu_limits(mut self, enforce: bool) -> Self {
        self.enforce_cpu_limits = enforce;
        self
    }

    pub fn namespace_name(&self, host: &str) -> String {
        format!("{}-{host}", self.prefix)
    }

    fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.links.iter().flat_map(|l| [&l.a, &l.b])
    }

    /// Primary address of `host`: the first address assigned to it.
    pub fn primary_address(&self, host: &str) -> Option<&str> {
        self.endpoints().find(|e| e.host == host).map(Endpoint::ip)
    }

    /// Reject allocation collisions before anything touches the kernel.
    pub fn validate(&self) -> Result<(), BenchError> {
        let fail = |msg: String| Err(BenchError::TopologyBuild(msg));

        let mut ids = HashSet::new();
        for h in &self.hosts {
            if !ids.insert(h.id.as_str()) {
                return fail(format!("duplicate host id `{}`", h.id));
            }
            if !(h.cpu_share > 0.0 && h.cpu_share <= 1.0) {
                return fail(format!("host `{}` has invalid cpu share {}", h.id, h.cpu_share));
            }
        }

        if self.hosts.len() < 2 || self.hosts[..2].iter().any(|h| h.role != Role::Endpoint) {
            return fail("the first two hosts must be the client and server endpoints".into());
        }

        let mut ifaces = HashSet::new();
        let mut addrs = HashSet::new();
        for ep in self.endpoints() {
            if !ids.contains(ep.host.as_str()) {
                return fail(format!("link endpoint on unknown host `{}`", ep.host));
            }
            if ep.iface.is_empty() || ep.iface.len() > MAX_IFACE_NAME {
                return fail(format!(
                    "interface name `{}` on `{}` must be 1..={MAX_IFACE_NAME} bytes",
                    ep.iface, ep.host
                ));
            }
            if !ifaces.insert((ep.host.as_str(), ep.iface.as_str())) {
                return fail(format!("duplicate interface `{}` on `{}`", ep.iface, ep.host));
            }
            if !addrs.insert(ep.ip()) {
                return fail(format!("duplicate address {}", ep.ip()));
            }
        }

        for seg in &self.segments {
            for end in &seg.ends {
                if !ifaces.contains(&(end.host.as_str(), end.iface.as_str())) {
                    return fail(format!(
                        "WAN segment `{}` references unknown interface {}/{}",
                        seg.name, end.host, end.iface
                    ));
                }
            }
        }

        for host in self
            .routes
            .iter()
            .map(|r| &r.host)
            .chain(self.rules.iter().map(|r| &r.host))
        {
            if !ids.contains(host.as_str()) {
                return fail(format!("route or rule on unknown host `{host}`"));
            }
        }

        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// A host brought up inside its own namespace.
#[derive(Debug)]
pub struct VirtualHost {
    spec: HostSpec,
    ns: Namespace,
    cpu_limit: bool,
}

impl VirtualHost {
    pub fn id(&self) -> &str {
        &self.spec.id
    }

    pub fn role(&self) -> Role {
        self.spec.role
    }

    pub fn namespace(&self) -> &Namespace {
        &self.ns
    }
}

impl Host for VirtualHost {
    fn name(&self) -> &str {
        &self.spec.id
    }

    fn wrap(&self, cmd: Cmd) -> Cmd {
        let cmd = if self.cpu_limit {
            let quota = format!("CPUQuota={}%", (self.spec.cpu_share * 100.0).round() as u32);
            cmd.wrapped_in(Cmd::new("systemd-run").args(["--scope", "--quiet", "-p", &quota]))
        } else {
            cmd
        };
        self.ns.wrap(cmd)
    }
}

/// A running virtual network. Immutable after [`Topology::build`]; dropping
/// it removes every namespace (and with them links, routes and qdiscs).
#[derive(Debug)]
pub struct Topology {
    spec: TopologySpec,
    hosts: Vec<VirtualHost>,
}

impl Topology {
    pub fn build(spec: TopologySpec) -> Result<Self, BenchError> {
        spec.validate()?;
        info!(shape = %spec.shape, prefix = %spec.prefix, "building topology");
        Self::bring_up(spec).map_err(|e| BenchError::TopologyBuild(format!("{e:#}")))
    }

    fn bring_up(spec: TopologySpec) -> Result<Self> {
        let mut hosts = Vec::with_capacity(spec.hosts.len());
        for h in &spec.hosts {
            let ns = Namespace::new(&spec.namespace_name(&h.id), &h.id)?;
            hosts.push(VirtualHost {
                spec: h.clone(),
                ns,
                cpu_limit: spec.enforce_cpu_limits,
            });
        }
        let topo = Self { spec, hosts };

        for l in &topo.spec.links {
            let a = topo.require(&l.a.host)?;
            let b = topo.require(&l.b.host)?;
            a.ns.create_veth(&b.ns, &l.a.iface, &l.b.iface)?;
            for (h, ep) in [(a, &l.a), (b, &l.b)] {
                h.ns.add_address(&ep.iface, &ep.cidr)?;
                h.ns.link_up(&ep.iface)?;
            }
            debug!(a = %l.a.cidr, b = %l.b.cidr, "link up");
        }

        for h in topo.hosts.iter().filter(|h| h.role() == Role::Router) {
            h.ns.sysctl("net.ipv4.ip_forward", "1")?;
        }

        for ep in topo.spec.endpoints() {
            let h = topo.require(&ep.host)?;
            if h.role() != Role::Endpoint {
                continue;
            }
            let out = h.ns.exec(
                Cmd::new("ethtool").args(["-K", &ep.iface, "tx", "off", "sg", "off", "tso", "off"]),
            )?;
            if !out.status.success() {
                warn!(
                    host = h.id(),
                    iface = %ep.iface,
                    stderr = %String::from_utf8_lossy(&out.stderr).trim(),
                    "could not disable offloads"
                );
            }
        }

        for r in &topo.spec.rules {
            topo.require(&r.host)?
                .ns
                .exec_checked(r.to_cmd())
                .with_context(|| format!("policy rule on {}", r.host))?;
        }
        for r in &topo.spec.routes {
            topo.require(&r.host)?
                .ns
                .exec_checked(r.to_cmd())
                .with_context(|| format!("route on {}", r.host))?;
        }

        if topo.spec.ecn {
            topo.set_ecn(true).map_err(anyhow::Error::new)?;
        }

        info!(hosts = topo.hosts.len(), links = topo.spec.links.len(), "topology up");
        Ok(topo)
    }

    fn require(&self, id: &str) -> Result<&VirtualHost> {
        match self.host(id) {
            Some(h) => Ok(h),
            None => bail!("unknown host `{id}`"),
        }
    }

    pub fn spec(&self) -> &TopologySpec {
        &self.spec
    }

    pub fn shape(&self) -> TopologyShape {
        self.spec.shape
    }

    pub fn host(&self, id: &str) -> Option<&VirtualHost> {
        self.hosts.iter().find(|h| h.id() == id)
    }

    pub fn hosts(&self) -> &[VirtualHost] {
        &self.hosts
    }

    pub fn segment(&self, name: &str) -> Option<&WanSegment> {
        self.spec.segments.iter().find(|s| s.name == name)
    }

    /// The host that runs clients and load generators.
    pub fn client(&self) -> &VirtualHost {
        &self.hosts[0]
    }

    /// The host that runs servers and tunnel heads.
    pub fn server(&self) -> &VirtualHost {
        &self.hosts[1]
    }

    pub fn address_of(&self, host: &str) -> Option<&str> {
        self.spec.primary_address(host)
    }

    /// Write `net.ipv4.tcp_ecn` on both endpoints. Idempotent.
    pub fn set_ecn(&self, enabled: bool) -> Result<(), BenchError> {
        let value = if enabled { "1" } else { "0" };
        for h in self.hosts.iter().filter(|h| h.role() == Role::Endpoint) {
            h.ns
                .sysctl("net.ipv4.tcp_ecn", value)
                .map_err(|e| BenchError::command(h.id(), e))?;
        }
        debug!(enabled, "ecn set");
        Ok(())
    }

    /// Ping every ordered host pair; the first unreachable pair fails the build.
    pub fn verify_connectivity(&self) -> Result<(), BenchError> {
        let mut pairs = 0;
        for src in &self.hosts {
            for dst in self.hosts.iter().filter(|d| d.id() != src.id()) {
                let addr = self.address_of(dst.id()).ok_or_else(|| {
                    BenchError::TopologyBuild(format!("host `{}` has no address", dst.id()))
                })?;
                let out = src
                    .exec(Cmd::new("ping").args(["-c", "1", "-W", "2", addr]))
                    .map_err(|e| BenchError::command(src.id(), e))?;
                if !out.status.success() {
                    return Err(BenchError::TopologyBuild(format!(
                        "{} cannot reach {} ({addr})",
                        src.id(),
                        dst.id()
                    )));
                }
                pairs += 1;
            }
        }
        info!(pairs, "connectivity verified");
        Ok(())
    }

    /// Human-readable summary of hosts, addresses and WAN segments.
    pub fn describe(&self) -> String {
        let mut out = format!("topology {} (prefix {})\n", self.spec.shape, self.spec.prefix);
        for h in &self.hosts {
            let addrs: Vec<String> = self
                .spec
                .endpoints()
                .filter(|e| e.host == h.id())
                .map(|e| format!("{}={}", e.iface, e.cidr))
                .collect();
            out.push_str(&format!(
                "  {:<3} {:<8} ns={:<12} cpu={:.1} {}\n",
                h.id(),
                format!("{:?}", h.role()).to_lowercase(),
                h.ns.name(),
                h.spec.cpu_share,
                addrs.join(" ")
            ));
        }
        for s in &self.spec.segments {
            out.push_str(&format!(
                "  wan {:<6} {}/{} <-> {}/{}\n",
                s.name, s.ends[0].host, s.ends[0].iface, s.ends[1].host, s.ends[1].iface
            ));
        }
        out
    }

    /// Explicit teardown; equivalent to dropping.
    pub fn teardown(self) {
        info!(prefix = %self.spec.prefix, "tearing down topology");
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::check_privileges;
    use crate::test_util::unique_prefix;

    #[test]
    fn builtin_shapes_validate() {
        TopologySpec::chain().validate().expect("chain");
        TopologySpec::diamond().validate().expect("diamond");
    }

    #[test]
    fn chain_layout() {
        let spec = TopologySpec::chain();
        assert_eq!(spec.hosts.len(), 4);
        assert_eq!(spec.primary_address("h1"), Some("6.6.6.6"));
        assert_eq!(spec.primary_address("h2"), Some("7.7.7.7"));
        assert_eq!(spec.segments.len(), 1);
        assert_eq!(spec.segments[0].ends[0].iface, "r1-eth1");
        assert_eq!(spec.segments[0].ends[1].iface, "r2-eth0");
        assert_eq!(spec.queue_basis, QueueBasis::RoundTrip);
    }

    #[test]
    fn diamond_layout() {
        let spec = TopologySpec::diamond();
        assert_eq!(spec.hosts.len(), 5);
        assert!(spec.hosts.iter().all(|h| h.cpu_share == 0.2));
        let names: Vec<_> = spec.segments.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["north", "south"]);
        assert_eq!(spec.rules.len(), 2);
        assert_eq!(spec.queue_basis, QueueBasis::Fixed(Duration::from_millis(200)));
    }

    #[test]
    fn route_commands() {
        let spec = TopologySpec::diamond();
        let rendered: Vec<String> = spec
            .routes
            .iter()
            .filter(|r| r.host == "h1")
            .map(|r| r.to_cmd().to_string())
            .collect();
        assert_eq!(
            rendered,
            [
                "ip route add 3.3.3.0/24 scope link dev h1-eth0 table 1",
                "ip route add default via 3.3.3.1 dev h1-eth0 table 1",
                "ip route add 4.4.4.0/24 scope link dev h1-eth1 table 2",
                "ip route add default via 4.4.4.1 dev h1-eth1 table 2",
                "ip route add default scope global nexthop via 3.3.3.1 dev h1-eth0",
            ]
        );
        assert_eq!(
            spec.rules[1].to_cmd().to_string(),
            "ip rule add from 4.4.4.4 table 2"
        );
    }

    #[test]
    fn rejects_duplicate_host() {
        let mut spec = TopologySpec::chain();
        spec.hosts.push(host("r1", Role::Router, 0.1));
        let err = spec.validate().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("duplicate host id `r1`"), "{err}");
    }

    #[test]
    fn rejects_duplicate_address() {
        let mut spec = TopologySpec::chain();
        spec.links[2].b.cidr = "6.6.6.6/24".into();
        assert!(spec.validate().unwrap_err().to_string().contains("duplicate address"));
    }

    #[test]
    fn rejects_duplicate_interface() {
        let mut spec = TopologySpec::chain();
        spec.links[1].a.iface = "r1-eth0".into();
        assert!(spec.validate().unwrap_err().to_string().contains("duplicate interface"));
    }

    #[test]
    fn rejects_long_interface_name() {
        let mut spec = TopologySpec::chain();
        spec.links[0].a.iface = "h1-a-very-long-eth0".into();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn rejects_unknown_endpoint_and_segment() {
        let mut spec = TopologySpec::chain();
        spec.links[0].a.host = "h9".into();
        assert!(spec.validate().unwrap_err().to_string().contains("unknown host"));

        let mut spec = TopologySpec::chain();
        spec.segments[0].ends[1].iface = "r2-eth7".into();
        assert!(spec.validate().unwrap_err().to_string().contains("unknown interface"));
    }

    #[test]
    fn shape_parsing() {
        assert_eq!("chain".parse::<TopologyShape>(), Ok(TopologyShape::Chain));
        assert_eq!("Multipath".parse::<TopologyShape>(), Ok(TopologyShape::Diamond));
        assert!("ring".parse::<TopologyShape>().is_err());
        assert_eq!(TopologyShape::Diamond.to_string(), "diamond");
    }

    #[test]
    fn namespace_names_carry_prefix() {
        let spec = TopologySpec::chain().with_prefix("tbx");
        assert_eq!(spec.namespace_name("r2"), "tbx-r2");
    }

    #[test]
    fn test_create_namespace_pair() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let prefix = unique_prefix("ns");
        let ns1 = Namespace::new(&format!("{prefix}-a"), "a").expect("create ns1");
        let _ns2 = Namespace::new(&format!("{prefix}-b"), "b").expect("create ns2");

        let out = ns1.exec(Cmd::new("ip").arg("link")).expect("ip link");
        assert!(String::from_utf8_lossy(&out.stdout).contains("lo"));
    }

    #[test]
    fn test_chain_builds_and_connects() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let spec = TopologySpec::chain().with_prefix(unique_prefix("tc"));
        let topo = Topology::build(spec).expect("build chain");
        topo.verify_connectivity().expect("full mesh reachable");
        topo.set_ecn(false).expect("disable ecn");
        topo.set_ecn(false).expect("disable ecn again");
        assert!(topo.describe().contains("wan"));
    }
}
