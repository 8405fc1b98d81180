//! Single-path vs multipath QUIC forwarding on the diamond.
//!
//! Each sample takes two impairment draws. The single-path forwarder is
//! measured with both segments at the first draw, then at the second; the
//! multipath forwarder is measured with north at the first and south at
//! the second.

use tracing::warn;
use tunbench_sim::{BenchError, ImpairmentProfile, Probe};
use tunbench_sweep::{
    Dimension, Experiment, ExperimentConfig, ExperimentSample, GroupLayout, MetricGroup,
    ParameterSpace, Rounding,
};

use super::forwarding::{
    FILE_SIZES, HTTP_PORT, QUIC_SSH_PORT, REQUESTS, download_prerequisites, quic_ssh_client,
    quic_ssh_server,
};
use super::{Lab, Side, httpd, profile};
use crate::prereq::Prerequisite;

const MULTI_PORT: u16 = 54321;
const SINGLE_LOCAL: u16 = 1111;
const MULTI_LOCAL: u16 = 9999;

const SINGLE: &str = "quic_ssh";
const MULTI: &str = "quic_ssh_multi";

pub(super) fn spaces() -> Result<Vec<ParameterSpace>, String> {
    Ok(vec![
        ParameterSpace::new(vec![
            Dimension::continuous("bw", 1000.0, 100000.0, Rounding::Integer),
            Dimension::categorical("fsize", FILE_SIZES),
            Dimension::continuous("loss", 0.0, 0.0, Rounding::Hundredths),
            Dimension::continuous("delay", 1.0, 25.0, Rounding::Integer),
        ])?,
        ParameterSpace::new(vec![
            Dimension::continuous("bw2", 1000.0, 100000.0, Rounding::Integer),
            Dimension::continuous("loss2", 0.0, 0.0, Rounding::Hundredths),
            Dimension::continuous("delay2", 1.0, 25.0, Rounding::Integer),
        ])?,
    ])
}

pub(super) fn prerequisites(cfg: &ExperimentConfig, checks: &mut Vec<Prerequisite>) {
    download_prerequisites(cfg, checks);
    checks.push(Prerequisite::binary(SINGLE, cfg.tool(SINGLE)));
    checks.push(Prerequisite::binary(MULTI, cfg.tool(MULTI)));
}

pub(super) struct Multipath {
    lab: Lab,
}

impl Multipath {
    pub(super) fn prepare(mut lab: Lab) -> Result<Self, BenchError> {
        let root = lab.asset("");
        let cmd = httpd(&lab, HTTP_PORT, &root);
        lab.start(Side::Server, "httpd", cmd, Probe::TcpListening(HTTP_PORT))?;
        Ok(Self { lab })
    }

    fn shape_both(&self, p: &ImpairmentProfile) -> Result<(), BenchError> {
        self.lab.shape_segment("north", p)?;
        self.lab.shape_segment("south", p)?;
        Ok(())
    }

    fn stop_forwarders(&mut self) {
        for tool in [SINGLE, MULTI] {
            self.lab.stop(Side::Client, tool);
            self.lab.stop(Side::Server, tool);
        }
        self.lab.kill_leftovers(&[SINGLE, MULTI]);
    }

    /// Replace whatever forwarder runs with `tool`, listening on `port`
    /// and forwarding `local` on the client.
    fn start_forwarder(&mut self, tool: &str, port: u16, local: u16) -> Result<(), BenchError> {
        self.stop_forwarders();
        let cmd = quic_ssh_server(&self.lab, tool, port);
        self.lab
            .start(Side::Server, tool, cmd, Probe::UdpListening(port))?;
        let cmd = quic_ssh_client(&self.lab, tool, port, local);
        self.lab
            .start(Side::Client, tool, cmd, Probe::TcpListening(local))
    }

    fn download(&self, local: u16, fsize: &str) -> Result<Option<f64>, BenchError> {
        let total = self
            .lab
            .ab(REQUESTS, 1, &format!("127.0.0.1:{local}"), fsize)?;
        Ok(total.map(|t| t.median))
    }
}

impl Experiment for Multipath {
    fn name(&self) -> &str {
        "pforw-multipath"
    }

    fn layout(&self) -> Vec<GroupLayout> {
        vec![GroupLayout::new("download", 3)]
    }

    fn configure_impairment(&mut self, sample: &ExperimentSample) -> Result<(), BenchError> {
        self.shape_both(&profile(sample, "")?)
    }

    fn setup_endpoints(&mut self, _sample: &ExperimentSample) -> Result<(), BenchError> {
        self.start_forwarder(SINGLE, QUIC_SSH_PORT, SINGLE_LOCAL)
    }

    fn measure(&mut self, sample: &ExperimentSample) -> Result<Vec<MetricGroup>, BenchError> {
        let fsize = sample.get_level("fsize").unwrap_or(FILE_SIZES[0]).to_string();
        let first = profile(sample, "")?;
        let second = profile(sample, "2")?;

        let mut group = MetricGroup::new("download");
        group.push(self.download(SINGLE_LOCAL, &fsize)?);

        self.shape_both(&second)?;
        group.push(self.download(SINGLE_LOCAL, &fsize)?);

        self.lab.shape_segment("north", &first)?;
        let multi = match self.start_forwarder(MULTI, MULTI_PORT, MULTI_LOCAL) {
            Ok(()) => self.download(MULTI_LOCAL, &fsize)?,
            Err(e) if !e.is_fatal() => {
                warn!(error = %e, "multipath forwarder did not come up");
                None
            }
            Err(e) => return Err(e),
        };
        group.push(multi);
        Ok(vec![group])
    }

    fn teardown_partial(&mut self, _sample: &ExperimentSample) {
        self.stop_forwarders();
    }
}
