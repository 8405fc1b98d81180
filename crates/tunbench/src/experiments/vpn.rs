//! openvpn and quicvpn tunnels between the two endpoints.
//!
//! Four tunnels run for the whole sweep, each with its own /24:
//! 192.168.0.x openvpn over TCP, 192.168.1.x and 192.168.2.x quicvpn,
//! 192.168.3.x openvpn over UDP. The server side is always `.2`.

use std::time::Duration;

use tracing::{debug, info, warn};
use tunbench_sim::process::wait_fixed;
use tunbench_sim::{BenchError, Cmd, Probe};
use tunbench_sweep::{
    Dimension, Experiment, ExperimentConfig, ExperimentSample, GroupLayout, MetricGroup,
    ParameterSpace, Rounding,
};

use super::{Lab, Side, httpd, measure, profile, repetition};
use crate::prereq::Prerequisite;

struct Tunnel {
    name: &'static str,
    tool: &'static str,
    client_config: &'static str,
    server_config: &'static str,
    peer: &'static str,
}

const TUNNELS: [Tunnel; 4] = [
    Tunnel {
        name: "openvpn-tcp",
        tool: "openvpn",
        client_config: "openvpn_client_192.168.0.1",
        server_config: "openvpn_server_192.168.0.2",
        peer: "192.168.0.2",
    },
    Tunnel {
        name: "quicvpn",
        tool: "quicvpn",
        client_config: "quicvpn_client_192.168.1.1",
        server_config: "quicvpn_server_192.168.1.2",
        peer: "192.168.1.2",
    },
    Tunnel {
        name: "squicvpn",
        tool: "quicvpn",
        client_config: "quicvpn_client_192.168.2.1",
        server_config: "quicvpn_server_192.168.2.2",
        peer: "192.168.2.2",
    },
    Tunnel {
        name: "openvpn-udp",
        tool: "openvpn",
        client_config: "openvpn_client_192.168.3.1",
        server_config: "openvpn_server_192.168.3.2",
        peer: "192.168.3.2",
    },
];

/// Where a measurement goes, and whether the endpoints run with ECN.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    group: String,
    addr: String,
    ecn: bool,
}

impl Target {
    fn new(group: &str, addr: &str, ecn: bool) -> Self {
        Self {
            group: group.into(),
            addr: addr.into(),
            ecn,
        }
    }
}

fn tunnel_prerequisites(cfg: &ExperimentConfig, checks: &mut Vec<Prerequisite>) {
    checks.push(Prerequisite::binary("openvpn", cfg.tool("openvpn")));
    checks.push(Prerequisite::binary("quicvpn", cfg.tool("quicvpn")));
    for t in &TUNNELS {
        for conf in [t.client_config, t.server_config] {
            checks.push(Prerequisite::file(
                conf,
                cfg.asset("configuration").join(conf),
            ));
        }
    }
}

/// Start every tunnel once. A tunnel that never answers pings is logged
/// and left running; samples through it record sentinels.
fn make_tunnels(lab: &mut Lab) -> Result<(), BenchError> {
    lab.kill_leftovers(&["openvpn", "quicvpn"]);
    for t in &TUNNELS {
        let server = Cmd::new(lab.tool(t.tool))
            .arg(lab.asset(format!("configuration/{}", t.server_config)));
        lab.start_unprobed(Side::Server, &format!("{}-server", t.name), server)?;
    }
    for t in &TUNNELS {
        let client = Cmd::new(lab.tool(t.tool))
            .arg(lab.asset(format!("configuration/{}", t.client_config)));
        match lab.start(
            Side::Client,
            &format!("{}-client", t.name),
            client,
            Probe::Ping(t.peer.into()),
        ) {
            Ok(()) => info!(tunnel = t.name, peer = t.peer, "tunnel up"),
            Err(e) if !e.is_fatal() => warn!(tunnel = t.name, error = %e, "tunnel not answering"),
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Large files
// ---------------------------------------------------------------------------

const LARGE_FILE: &str = "2M";
const AB_FIELDS: usize = 5;

pub(super) fn largefiles_spaces() -> Result<Vec<ParameterSpace>, String> {
    Ok(vec![ParameterSpace::new(vec![
        Dimension::continuous("bw", 1000.0, 100000.0, Rounding::Integer),
        Dimension::categorical("fsize", [LARGE_FILE]),
        Dimension::continuous("loss", 0.0, 2.0, Rounding::Hundredths),
        Dimension::continuous("delay", 10.0, 100.0, Rounding::Integer),
    ])?])
}

pub(super) fn largefiles_prerequisites(cfg: &ExperimentConfig, checks: &mut Vec<Prerequisite>) {
    checks.push(Prerequisite::binary("busybox", cfg.tool("busybox")));
    checks.push(Prerequisite::binary("apache benchmark", cfg.tool("ab")));
    checks.push(Prerequisite::file(
        format!("file of size {LARGE_FILE} exists in files"),
        cfg.asset("files").join(LARGE_FILE),
    ));
    tunnel_prerequisites(cfg, checks);
}

pub(super) struct LargeFiles {
    lab: Lab,
    requests: u32,
    targets: Vec<Target>,
}

impl LargeFiles {
    pub(super) fn prepare(mut lab: Lab, requests: u32) -> Result<Self, BenchError> {
        let root = lab.asset("");
        let cmd = httpd(&lab, 80, &root);
        lab.start(Side::Server, "httpd", cmd, Probe::TcpListening(80))?;
        make_tunnels(&mut lab)?;

        let direct = lab.server_addr().to_string();
        let targets = vec![
            Target::new("direct", &direct, false),
            Target::new("openvpn-tcp", "192.168.0.2", false),
            Target::new("openvpn-udp", "192.168.3.2", false),
            Target::new("squicvpn", "192.168.2.2", false),
            Target::new("squicvpn-ecn", "192.168.2.2", true),
        ];
        Ok(Self {
            lab,
            requests,
            targets,
        })
    }
}

impl Experiment for LargeFiles {
    fn name(&self) -> &str {
        "vpn-largefiles"
    }

    fn layout(&self) -> Vec<GroupLayout> {
        self.targets
            .iter()
            .map(|t| GroupLayout::new(t.group.clone(), AB_FIELDS))
            .collect()
    }

    fn configure_impairment(&mut self, sample: &ExperimentSample) -> Result<(), BenchError> {
        self.lab.shape_all(&profile(sample, "")?)
    }

    fn measure(&mut self, sample: &ExperimentSample) -> Result<Vec<MetricGroup>, BenchError> {
        let fsize = sample.get_level("fsize").unwrap_or(LARGE_FILE);
        let mut groups = Vec::with_capacity(self.targets.len());
        for t in &self.targets {
            self.lab.set_ecn(t.ecn)?;
            let group = match self.lab.ab(self.requests, 1, &t.addr, fsize)? {
                Some(total) => total
                    .fields()
                    .into_iter()
                    .fold(MetricGroup::new(t.group.clone()), |g, v| g.with(Some(v))),
                None => MetricGroup::failed(t.group.clone(), AB_FIELDS),
            };
            groups.push(group);
        }
        Ok(groups)
    }

    fn teardown_partial(&mut self, _sample: &ExperimentSample) {
        if let Err(e) = self.lab.set_ecn(false) {
            warn!(error = %e, "could not reset ecn");
        }
    }
}

// ---------------------------------------------------------------------------
// D-ITG one-way delay under load
// ---------------------------------------------------------------------------

const ITG_FLOWS: u32 = 4;
const ITG_RECV_PORT: u16 = 9000;
const IPERF_PORT: u16 = 5201;
/// Background load runs long enough to cover the whole D-ITG exchange.
const LOAD_SECS: u32 = 50;
const LOAD_RAMP: Duration = Duration::from_secs(10);

pub(super) fn ditg_spaces() -> Result<Vec<ParameterSpace>, String> {
    Ok(vec![ParameterSpace::new(vec![
        Dimension::continuous("bw", 10000.0, 10000.0, Rounding::Integer),
        Dimension::continuous("loss", 0.1, 0.1, Rounding::Hundredths),
        Dimension::continuous("delay", 50.0, 50.0, Rounding::Integer),
    ])?])
}

pub(super) fn ditg_prerequisites(cfg: &ExperimentConfig, checks: &mut Vec<Prerequisite>) {
    checks.push(Prerequisite::binary("iperf3", cfg.tool("iperf3")));
    for tool in ["ITGRecv", "ITGSend", "ITGDec"] {
        checks.push(Prerequisite::binary(tool, cfg.tool(tool)));
    }
    tunnel_prerequisites(cfg, checks);
}

/// The D-ITG flow script for `endpoint`: the template with every
/// `ENDPOINT` replaced, or four constant-rate UDP flows.
fn itg_script(template: Option<&str>, endpoint: &str) -> String {
    match template {
        Some(t) => t.replace("ENDPOINT", endpoint),
        None => (1..=ITG_FLOWS)
            .map(|i| format!("-a {endpoint} -rp {} -T UDP -C 100 -c 512 -t 10000\n", 10000 + i))
            .collect(),
    }
}

pub(super) struct Ditg {
    lab: Lab,
    template: Option<String>,
    targets: Vec<Target>,
}

impl Ditg {
    pub(super) fn prepare(mut lab: Lab) -> Result<Self, BenchError> {
        make_tunnels(&mut lab)?;
        let template = std::fs::read_to_string(lab.config().asset("configuration/itg_script")).ok();
        if template.is_none() {
            info!("no itg_script in configuration, using {ITG_FLOWS} default flows");
        }

        let direct = lab.server_addr().to_string();
        let targets = vec![
            Target::new("direct", &direct, false),
            Target::new("openvpn-tcp", "192.168.0.2", false),
            Target::new("openvpn-udp", "192.168.3.2", false),
            Target::new("quicvpn-ecn", "192.168.1.2", true),
            Target::new("squicvpn-ecn", "192.168.2.2", true),
        ];
        Ok(Self {
            lab,
            template,
            targets,
        })
    }

    fn one_way_delays(&mut self, target: &Target) -> Result<Vec<Option<f64>>, BenchError> {
        let script = self.lab.scratch("itg_script");
        let send_log = self.lab.scratch("itg_sendlog");
        let recv_log = self.lab.scratch("itg_recvlog");
        for stale in [&send_log, &recv_log] {
            let _ = std::fs::remove_file(stale);
        }
        std::fs::create_dir_all(&self.lab.config().scratch_dir)
            .and_then(|()| {
                std::fs::write(&script, itg_script(self.template.as_deref(), &target.addr))
            })
            .map_err(|e| BenchError::command("local", anyhow::Error::new(e).context("write itg script")))?;

        let cmd = Cmd::new(self.lab.tool("iperf3")).arg("-s");
        self.lab
            .start(Side::Server, "iperf3", cmd, Probe::TcpListening(IPERF_PORT))?;
        let cmd = Cmd::new(self.lab.tool("iperf3")).args([
            "-c".to_string(),
            target.addr.clone(),
            "-t".into(),
            LOAD_SECS.to_string(),
        ]);
        self.lab.start_unprobed(Side::Client, "iperf3-load", cmd)?;
        wait_fixed("background load ramp-up", LOAD_RAMP);

        let cmd = Cmd::new(self.lab.tool("ITGRecv"));
        self.lab
            .start(Side::Server, "ITGRecv", cmd, Probe::TcpListening(ITG_RECV_PORT))?;
        let cmd = Cmd::new(self.lab.tool("ITGSend")).args([
            script,
            "-l".into(),
            send_log,
            "-x".into(),
            recv_log.clone(),
        ]);
        // a failed sender may still have delivered some flows
        if repetition(self.lab.measure(Side::Client, cmd))?.is_none() {
            warn!(target = %target.group, "ITGSend failed");
        }
        self.lab.settle("receiver log flush");
        self.stop_load();

        let decoded = self
            .lab
            .measure(Side::Client, Cmd::new(self.lab.tool("ITGDec")).arg(recv_log))?;
        let delays = measure::average_delays(&decoded.stdout, ITG_FLOWS);
        debug!(target = %target.group, ?delays, "one-way delays");
        Ok(delays)
    }

    fn stop_load(&mut self) {
        self.lab.stop(Side::Server, "ITGRecv");
        self.lab.stop(Side::Client, "iperf3-load");
        self.lab.stop(Side::Server, "iperf3");
    }
}

impl Experiment for Ditg {
    fn name(&self) -> &str {
        "vpn-ditg"
    }

    fn layout(&self) -> Vec<GroupLayout> {
        self.targets
            .iter()
            .map(|t| GroupLayout::new(t.group.clone(), ITG_FLOWS as usize))
            .collect()
    }

    fn configure_impairment(&mut self, sample: &ExperimentSample) -> Result<(), BenchError> {
        self.lab.shape_all(&profile(sample, "")?)
    }

    fn measure(&mut self, _sample: &ExperimentSample) -> Result<Vec<MetricGroup>, BenchError> {
        let targets = self.targets.clone();
        let mut groups = Vec::with_capacity(targets.len());
        for t in &targets {
            self.lab.set_ecn(t.ecn)?;
            let group = match self.one_way_delays(t) {
                Ok(delays) => MetricGroup {
                    name: t.group.clone(),
                    values: delays,
                },
                Err(e) => {
                    warn!(target = %t.group, error = %e, "d-itg run failed");
                    self.stop_load();
                    MetricGroup::failed(t.group.clone(), ITG_FLOWS as usize)
                }
            };
            groups.push(group);
        }
        Ok(groups)
    }

    fn teardown_partial(&mut self, _sample: &ExperimentSample) {
        self.stop_load();
        if let Err(e) = self.lab.set_ecn(false) {
            warn!(error = %e, "could not reset ecn");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunbench_sweep::SweepPlan;

    #[test]
    fn template_endpoint_is_substituted() {
        let t = "-a ENDPOINT -rp 10001 -T TCP\n-a ENDPOINT -rp 10002 -T UDP\n";
        let s = itg_script(Some(t), "192.168.1.2");
        assert_eq!(s, "-a 192.168.1.2 -rp 10001 -T TCP\n-a 192.168.1.2 -rp 10002 -T UDP\n");
    }

    #[test]
    fn default_script_has_one_line_per_flow() {
        let s = itg_script(None, "7.7.7.7");
        assert_eq!(s.lines().count(), ITG_FLOWS as usize);
        assert!(s.lines().all(|l| l.starts_with("-a 7.7.7.7 ")));
        assert!(s.contains("-rp 10004"));
    }

    #[test]
    fn ditg_space_is_pinned() {
        let plan = SweepPlan::new(ditg_spaces().unwrap(), 100, 9).unwrap();
        for s in plan.iter() {
            assert_eq!(s.get_i64("bw"), Some(10000));
            assert_eq!(s.get_f64("loss"), Some(0.1));
            assert_eq!(s.get_i64("delay"), Some(50));
        }
    }

    #[test]
    fn tunnels_use_distinct_subnets() {
        let mut peers: Vec<&str> = TUNNELS.iter().map(|t| t.peer).collect();
        peers.sort();
        peers.dedup();
        assert_eq!(peers.len(), TUNNELS.len());
        for t in &TUNNELS {
            assert!(t.server_config.ends_with(t.peer), "{}", t.name);
        }
    }

    #[test]
    fn tunnel_prerequisites_cover_both_ends() {
        let mut checks = Vec::new();
        tunnel_prerequisites(&ExperimentConfig::default(), &mut checks);
        // two binaries plus a client and server config per tunnel
        assert_eq!(checks.len(), 2 + 2 * TUNNELS.len());
    }
}
