//! TCP (`ab` against `busybox httpd`) vs QUIC (`quicbench`) download time.

use tracing::{debug, warn};
use tunbench_sim::{BenchError, Cmd, Probe};
use tunbench_sweep::{
    Dimension, Experiment, ExperimentConfig, ExperimentSample, GroupLayout, MetricGroup,
    ParameterSpace, Rounding,
};

use super::{Lab, RunOptions, Side, httpd, millis, profile, repetition};
use crate::prereq::Prerequisite;

const QUICBENCH_PORT: u16 = 8989;
const HTTP_PORT: u16 = 80;

fn file_sizes(opts: &RunOptions) -> &'static [&'static str] {
    if opts.concurrency > 1 { &["1024k"] } else { &["4M"] }
}

pub(super) fn spaces(opts: &RunOptions) -> Result<Vec<ParameterSpace>, String> {
    Ok(vec![ParameterSpace::new(vec![
        Dimension::continuous("bw", 1000.0, 100000.0, Rounding::Integer),
        Dimension::categorical("fsize", file_sizes(opts).iter().copied()),
        Dimension::continuous("loss", 0.0, 2.0, Rounding::Hundredths),
        Dimension::continuous("delay", 10.0, 100.0, Rounding::Integer),
        Dimension::continuous("jitter", 0.0, 0.0, Rounding::Integer),
    ])?])
}

pub(super) fn prerequisites(cfg: &ExperimentConfig, opts: &RunOptions, checks: &mut Vec<Prerequisite>) {
    checks.push(Prerequisite::binary("busybox", cfg.tool("busybox")));
    checks.push(Prerequisite::binary("apache benchmark", cfg.tool("ab")));
    checks.push(Prerequisite::binary("quicbench", cfg.tool("quicbench")));
    for f in file_sizes(opts) {
        checks.push(Prerequisite::file(
            format!("file of size {f} exists in files"),
            cfg.asset("files").join(f),
        ));
    }
    checks.push(Prerequisite::file(
        "server key",
        cfg.asset("certificates/server"),
    ));
}

pub(super) struct QuicBench {
    lab: Lab,
    iterations: u32,
    concurrency: u32,
}

impl QuicBench {
    pub(super) fn prepare(mut lab: Lab, iterations: u32, concurrency: u32) -> Result<Self, BenchError> {
        lab.kill_leftovers(&["quicbench"]);
        let root = lab.asset("");
        let cmd = httpd(&lab, HTTP_PORT, &root);
        lab.start(Side::Server, "httpd", cmd, Probe::TcpListening(HTTP_PORT))?;
        Ok(Self {
            lab,
            iterations,
            concurrency,
        })
    }

    fn tcp_once(&self, fsize: &str) -> Result<Option<f64>, BenchError> {
        let endpoint = format!("{}:{HTTP_PORT}", self.lab.server_addr());
        let total = self
            .lab
            .ab(self.concurrency, self.concurrency, &endpoint, fsize)?;
        Ok(total.map(|t| t.mean))
    }

    /// Elapsed wall time of one client download; the server is restarted
    /// for every repetition.
    fn quic_once(&mut self, fsize: &str) -> Result<Option<f64>, BenchError> {
        let server = Cmd::new(self.lab.tool("quicbench")).args([
            "server".to_string(),
            "--pub".into(),
            self.lab.asset("certificates/server.pub"),
            "--priv".into(),
            self.lab.asset("certificates/server"),
        ]);
        if let Err(e) = self.lab.start(
            Side::Server,
            "quicbench",
            server,
            Probe::UdpListening(QUICBENCH_PORT),
        ) {
            warn!(error = %e, "quicbench server did not come up");
            self.lab.stop(Side::Server, "quicbench");
            return Ok(None);
        }

        let client = Cmd::new(self.lab.tool("quicbench")).args([
            "client".to_string(),
            "-c".into(),
            self.lab.server_addr().to_string(),
            "--streams".into(),
            self.concurrency.to_string(),
            "--size".into(),
            fsize.to_string(),
        ]);
        let out = self.lab.measure(Side::Client, client);
        self.lab.stop(Side::Server, "quicbench");
        Ok(repetition(out)?.map(|o| millis(o.elapsed)))
    }
}

impl Experiment for QuicBench {
    fn name(&self) -> &str {
        "quic-bench"
    }

    fn layout(&self) -> Vec<GroupLayout> {
        let n = self.iterations as usize;
        vec![GroupLayout::new("tcp", n), GroupLayout::new("quic", n)]
    }

    fn configure_impairment(&mut self, sample: &ExperimentSample) -> Result<(), BenchError> {
        self.lab.shape_all(&profile(sample, "")?)
    }

    fn measure(&mut self, sample: &ExperimentSample) -> Result<Vec<MetricGroup>, BenchError> {
        let fsize = sample.get_level("fsize").unwrap_or("4M").to_string();
        let mut tcp = MetricGroup::new("tcp");
        let mut quic = MetricGroup::new("quic");

        for i in 0..self.iterations {
            let t = self.tcp_once(&fsize)?;
            let q = self.quic_once(&fsize)?;
            debug!(iteration = i, tcp = ?t, quic = ?q, "iteration done");
            tcp.push(t.map(f64::trunc));
            quic.push(q);
        }
        Ok(vec![tcp, quic])
    }

    fn teardown_partial(&mut self, _sample: &ExperimentSample) {
        self.lab.stop(Side::Server, "quicbench");
    }
}
