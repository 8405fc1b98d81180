//! The concrete experiment variants and the lab they run in.
//!
//! A [`Lab`] owns a built topology and the coordinator for every process
//! started inside it. Each variant wraps a `Lab`, prepares its long-lived
//! endpoints once, then implements [`Experiment`] for the sweep loop.

mod forwarding;
pub mod measure;
mod multipath;
mod quic_bench;
mod vpn;

use std::path::Path;
use std::time::Duration;

use clap::ValueEnum;
use tracing::{info, warn};
use tunbench_sim::process::{kill_by_name, wait_fixed};
use tunbench_sim::topology::{TopologySpec, VirtualHost};
use tunbench_sim::{
    Bandwidth, BenchError, Cmd, Coordinator, ForegroundOutput, ImpairmentProfile, Probe,
    Topology, TopologyShape, apply_to_segment,
};
use tunbench_sweep::{Experiment, ExperimentConfig, ExperimentSample, ParameterSpace};

use crate::prereq::Prerequisite;
use measure::AbTotal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Variant {
    /// TCP vs QUIC download time over a single path.
    QuicBench,
    /// quic_ssh / ssh / ssf port forwarders against a direct download.
    PforwSingleDownload,
    /// Large file downloads through openvpn and quicvpn tunnels.
    VpnLargefiles,
    /// One-way delay under background load through each tunnel.
    VpnDitg,
    /// Single-path vs multipath QUIC forwarding on the diamond.
    PforwMultipath,
    /// Build and shape the network, then hand it over interactively.
    EmptyNetwork,
}

/// Knobs from the command line that change a variant's space or workload.
#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    /// Parallel requests per measurement (quic-bench only).
    pub concurrency: u32,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self { concurrency: 1 }
    }
}

impl Variant {
    pub fn name(self) -> &'static str {
        match self {
            Variant::QuicBench => "quic-bench",
            Variant::PforwSingleDownload => "pforw-single-download",
            Variant::VpnLargefiles => "vpn-largefiles",
            Variant::VpnDitg => "vpn-ditg",
            Variant::PforwMultipath => "pforw-multipath",
            Variant::EmptyNetwork => "empty-network",
        }
    }

    pub fn shape(self) -> TopologyShape {
        match self {
            Variant::PforwMultipath => TopologyShape::Diamond,
            _ => TopologyShape::Chain,
        }
    }

    pub fn default_samples(self) -> usize {
        match self {
            Variant::PforwSingleDownload | Variant::PforwMultipath => 200,
            Variant::EmptyNetwork => 0,
            _ => 100,
        }
    }

    /// Whether the variant runs a sweep at all.
    pub fn sweeps(self) -> bool {
        self != Variant::EmptyNetwork
    }

    /// One parameter space per grid, in the order the samples carry them.
    pub fn spaces(self, opts: &RunOptions) -> Result<Vec<ParameterSpace>, String> {
        match self {
            Variant::QuicBench => quic_bench::spaces(opts),
            Variant::PforwSingleDownload => forwarding::spaces(),
            Variant::VpnLargefiles => vpn::largefiles_spaces(),
            Variant::VpnDitg => vpn::ditg_spaces(),
            Variant::PforwMultipath => multipath::spaces(),
            Variant::EmptyNetwork => Ok(Vec::new()),
        }
    }

    pub fn prerequisites(self, cfg: &ExperimentConfig, opts: &RunOptions) -> Vec<Prerequisite> {
        let mut checks = vec![Prerequisite::sysctl(
            "use cubic",
            "net.ipv4.tcp_congestion_control",
            "cubic",
        )];
        match self {
            Variant::QuicBench => quic_bench::prerequisites(cfg, opts, &mut checks),
            Variant::PforwSingleDownload => forwarding::prerequisites(cfg, &mut checks),
            Variant::VpnLargefiles => vpn::largefiles_prerequisites(cfg, &mut checks),
            Variant::VpnDitg => vpn::ditg_prerequisites(cfg, &mut checks),
            Variant::PforwMultipath => multipath::prerequisites(cfg, &mut checks),
            Variant::EmptyNetwork => {}
        }
        checks
    }

    /// Start the variant's long-lived endpoints in `lab` and hand back the
    /// experiment the sweep drives.
    pub fn instantiate(
        self,
        lab: Lab,
        opts: &RunOptions,
    ) -> Result<Box<dyn Experiment>, BenchError> {
        let iterations = lab.config().iterations;
        Ok(match self {
            Variant::QuicBench => Box::new(quic_bench::QuicBench::prepare(
                lab,
                iterations.unwrap_or(5),
                opts.concurrency,
            )?),
            Variant::PforwSingleDownload => Box::new(forwarding::SingleDownload::prepare(lab)?),
            Variant::VpnLargefiles => {
                Box::new(vpn::LargeFiles::prepare(lab, iterations.unwrap_or(4))?)
            }
            Variant::VpnDitg => Box::new(vpn::Ditg::prepare(lab)?),
            Variant::PforwMultipath => Box::new(multipath::Multipath::prepare(lab)?),
            Variant::EmptyNetwork => {
                return Err(BenchError::TopologyBuild(
                    "empty-network has no sweep; use `tunbench shape`".into(),
                ));
            }
        })
    }
}

/// Which end of the topology a process runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// A built topology plus the processes running in it.
///
/// Field order matters: processes are torn down before the namespaces
/// they live in.
pub struct Lab {
    coord: Coordinator,
    topo: Topology,
    cfg: ExperimentConfig,
}

impl Lab {
    pub fn build(shape: TopologyShape, cfg: &ExperimentConfig) -> Result<Self, BenchError> {
        let spec = TopologySpec::for_shape(shape)
            .with_prefix(cfg.namespace_prefix.clone())
            .with_cpu_limits(cfg.enforce_cpu_limits);
        let topo = Topology::build(spec)?;
        topo.verify_connectivity()?;
        Ok(Self {
            coord: Coordinator::new().with_scratch_dir(cfg.scratch_dir.clone()),
            topo,
            cfg: cfg.clone(),
        })
    }

    pub fn topology(&self) -> &Topology {
        &self.topo
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.cfg
    }

    pub fn host(&self, side: Side) -> &VirtualHost {
        match side {
            Side::Client => self.topo.client(),
            Side::Server => self.topo.server(),
        }
    }

    /// Address clients use to reach the server host directly.
    pub fn server_addr(&self) -> &str {
        let server = self.topo.server();
        self.topo.address_of(server.id()).unwrap_or("7.7.7.7")
    }

    /// Configured binary for `name`.
    pub fn tool(&self, name: &str) -> String {
        self.cfg.tool(name)
    }

    pub fn asset(&self, rel: impl AsRef<Path>) -> String {
        self.cfg.asset(rel).display().to_string()
    }

    pub fn scratch(&self, rel: &str) -> String {
        self.cfg.scratch_dir.join(rel).display().to_string()
    }

    /// Start a background process and wait for `probe`.
    pub fn start(&mut self, side: Side, name: &str, cmd: Cmd, probe: Probe) -> Result<(), BenchError> {
        let host = match side {
            Side::Client => self.topo.client(),
            Side::Server => self.topo.server(),
        };
        self.coord.spawn_background(host, name, cmd)?;
        let took = self
            .coord
            .await_ready(host, name, &probe, self.cfg.timeouts.ready, self.cfg.timeouts.poll)?;
        info!(host = host.id(), name, ?took, "endpoint ready");
        Ok(())
    }

    /// Start a background process that offers no readiness signal.
    pub fn start_unprobed(&mut self, side: Side, name: &str, cmd: Cmd) -> Result<(), BenchError> {
        let host = match side {
            Side::Client => self.topo.client(),
            Side::Server => self.topo.server(),
        };
        self.coord.spawn_background(host, name, cmd)?;
        Ok(())
    }

    pub fn stop(&mut self, side: Side, name: &str) {
        let host = self.host(side).id().to_string();
        self.coord.teardown(&host, name);
    }

    /// Run a command on `side` under the measurement timeout.
    pub fn run(&self, side: Side, cmd: Cmd) -> Result<ForegroundOutput, BenchError> {
        self.coord
            .run_foreground(self.host(side), cmd, self.cfg.timeouts.measure)
    }

    /// Run a measurement command on `side`. A timeout is
    /// [`BenchError::MeasurementTimeout`], a non-zero exit
    /// [`BenchError::Measurement`].
    pub fn measure(&self, side: Side, cmd: Cmd) -> Result<ForegroundOutput, BenchError> {
        let shown = cmd.to_string();
        let out = self.run(side, cmd)?;
        check_measurement(out, self.host(side).id(), &shown, self.cfg.timeouts.measure)
    }

    /// Fixed wait where no readiness signal exists.
    pub fn settle(&self, reason: &str) {
        wait_fixed(reason, self.cfg.timeouts.settle);
    }

    pub fn shape_segment(&self, segment: &str, profile: &ImpairmentProfile) -> Result<u32, BenchError> {
        apply_to_segment(&self.topo, segment, profile)
    }

    /// Apply the same profile to every WAN segment.
    pub fn shape_all(&self, profile: &ImpairmentProfile) -> Result<(), BenchError> {
        for seg in &self.topo.spec().segments {
            let queue = apply_to_segment(&self.topo, &seg.name, profile)?;
            info!(segment = %seg.name, %profile, queue, "limit");
        }
        Ok(())
    }

    pub fn set_ecn(&self, enabled: bool) -> Result<(), BenchError> {
        self.topo.set_ecn(enabled)
    }

    /// Kill stray copies of the given tools on both endpoints, e.g. from an
    /// aborted run.
    pub fn kill_leftovers(&self, tools: &[&str]) {
        for tool in tools {
            let name = process_name(&self.tool(tool));
            for side in [Side::Client, Side::Server] {
                let host = self.host(side);
                if let Err(e) = kill_by_name(host, &name) {
                    warn!(host = host.id(), name = %name, error = %e, "pkill failed");
                }
            }
        }
    }

    /// `ab -n <requests> -c <concurrency> http://<endpoint>/files/<file>`
    /// from the client; `None` if it timed out, failed or printed no totals.
    pub fn ab(
        &self,
        requests: u32,
        concurrency: u32,
        endpoint: &str,
        file: &str,
    ) -> Result<Option<AbTotal>, BenchError> {
        let cmd = Cmd::new(self.tool("ab")).args([
            "-n".to_string(),
            requests.to_string(),
            "-c".to_string(),
            concurrency.to_string(),
            format!("http://{endpoint}/files/{file}"),
        ]);
        let Some(out) = repetition(self.measure(Side::Client, cmd))? else {
            return Ok(None);
        };
        let total = measure::parse_ab_total(&out.stdout);
        if total.is_none() {
            warn!(endpoint, file, code = out.exit_code, stderr = %out.stderr.trim(), "ab printed no totals");
        }
        Ok(total)
    }
}

impl Drop for Lab {
    fn drop(&mut self) {
        self.coord.teardown_all();
    }
}

fn check_measurement(
    out: ForegroundOutput,
    host: &str,
    command: &str,
    timeout: Duration,
) -> Result<ForegroundOutput, BenchError> {
    if out.timed_out() {
        return Err(BenchError::MeasurementTimeout {
            host: host.to_string(),
            command: command.to_string(),
            timeout,
        });
    }
    if !out.success() {
        return Err(BenchError::Measurement {
            host: host.to_string(),
            detail: format!("`{command}` exited with {}: {}", out.exit_code, out.stderr.trim()),
        });
    }
    Ok(out)
}

/// One repetition's outcome: measurement failures become `None` (the `-1`
/// sentinel), anything else is passed up.
pub fn repetition<T>(result: Result<T, BenchError>) -> Result<Option<T>, BenchError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_repetition_failure() => {
            warn!(error = %e, "repetition failed");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// The impairment profile named by `bw<suffix>`, `delay<suffix>`,
/// `loss<suffix>` and, if present, `jitter<suffix>`.
pub fn profile(sample: &ExperimentSample, suffix: &str) -> Result<ImpairmentProfile, BenchError> {
    let get = |name: &str| {
        let key = format!("{name}{suffix}");
        sample.get_f64(&key).ok_or_else(|| BenchError::Shaping {
            host: "-".into(),
            iface: "-".into(),
            rule: format!("parameter `{key}`"),
            stderr: "missing from sample".into(),
        })
    };

    let bw = get("bw")?;
    let delay = get("delay")?;
    let loss = get("loss")?;
    let jitter = sample.get_f64(&format!("jitter{suffix}")).unwrap_or(0.0);

    Ok(ImpairmentProfile::new(
        Bandwidth::from_kbit(bw.max(1.0) as u64),
        Duration::from_millis(delay.max(0.0) as u64),
    )
    .with_jitter(Duration::from_millis(jitter.max(0.0) as u64))
    .with_loss(loss))
}

/// The `-L` forwarding spec used by every port forwarder.
pub(crate) fn forward_spec(local_port: u16, target_port: u16) -> String {
    format!("{local_port}:127.0.0.1:{target_port}")
}

/// `busybox httpd` serving `root` on `port` in the foreground.
pub(crate) fn httpd(lab: &Lab, port: u16, root: &str) -> Cmd {
    Cmd::new(lab.tool("busybox")).args(["httpd", "-f", "-p", &port.to_string(), "-h", root])
}

/// The kernel's name for a process started from `binary`: the file name,
/// cut to 15 bytes.
pub(crate) fn process_name(binary: &str) -> String {
    let base = Path::new(binary)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(binary);
    base.chars().take(15).collect()
}

/// Whole milliseconds, as the result stream records them.
pub(crate) fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 1000.0).trunc()
}
