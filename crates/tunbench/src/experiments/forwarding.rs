//! Port forwarders (quic_ssh, ssh, ssf) against a direct download.
//!
//! Port usage on the chain:
//!
//! ```text
//! h2: 22 sshd, 12345/udp quic_ssh, 8011 ssfd, 8080 httpd
//! h1: 1111 quic_ssh -> 8080, 2222 ssh -> 8080, 3333 ssf -> 8080
//! ```

use tracing::{info, warn};
use tunbench_sim::{BenchError, Cmd, Probe};
use tunbench_sweep::{
    Dimension, Experiment, ExperimentConfig, ExperimentSample, GroupLayout, MetricGroup,
    ParameterSpace, Rounding,
};

use super::{Lab, Side, forward_spec, httpd, profile};
use crate::prereq::Prerequisite;

pub(super) const HTTP_PORT: u16 = 8080;
pub(super) const QUIC_SSH_PORT: u16 = 12345;
const SSH_PORT: u16 = 22;
const SSFD_PORT: u16 = 8011;

pub(super) const FILE_SIZES: [&str; 5] = ["8k", "64k", "256k", "1024k", "8192k"];

/// `ab` requests per endpoint and sample.
pub(super) const REQUESTS: u32 = 30;

pub(super) fn spaces() -> Result<Vec<ParameterSpace>, String> {
    Ok(vec![ParameterSpace::new(vec![
        Dimension::continuous("bw", 1000.0, 100000.0, Rounding::Integer),
        Dimension::categorical("fsize", FILE_SIZES),
        Dimension::continuous("loss", 0.0, 2.0, Rounding::Hundredths),
        Dimension::continuous("delay", 10.0, 100.0, Rounding::Integer),
    ])?])
}

pub(super) fn download_prerequisites(cfg: &ExperimentConfig, checks: &mut Vec<Prerequisite>) {
    checks.push(Prerequisite::binary("busybox", cfg.tool("busybox")));
    checks.push(Prerequisite::binary("apache benchmark", cfg.tool("ab")));
    for f in FILE_SIZES {
        checks.push(Prerequisite::file(
            format!("file of size {f} exists in files"),
            cfg.asset("files").join(f),
        ));
    }
    for key in ["server", "client", "authorized_keys_server", "known_hosts_client"] {
        checks.push(Prerequisite::file(
            format!("certificate {key}"),
            cfg.asset("certificates").join(key),
        ));
    }
}

pub(super) fn prerequisites(cfg: &ExperimentConfig, checks: &mut Vec<Prerequisite>) {
    download_prerequisites(cfg, checks);
    checks.push(Prerequisite::binary("quic_ssh", cfg.tool("quic_ssh")));
    checks.push(Prerequisite::binary("sshd", cfg.tool("sshd")));
    checks.push(Prerequisite::binary("ssh", cfg.tool("ssh")));
    checks.push(Prerequisite::file("ssfd", ssf_binary(cfg, "ssfd")));
    checks.push(Prerequisite::file("ssf", ssf_binary(cfg, "ssf")));
}

/// ssf ships as a directory next to its config; run it from there.
fn ssf_binary(cfg: &ExperimentConfig, name: &str) -> std::path::PathBuf {
    match cfg.tools.get(name) {
        Some(path) => path.into(),
        None => cfg.asset("ssf").join(name),
    }
}

pub(super) fn quic_ssh_server(lab: &Lab, tool: &str, port: u16) -> Cmd {
    Cmd::new(lab.tool(tool)).args([
        "-l".to_string(),
        "--pub".into(),
        lab.asset("certificates/server.pub"),
        "--priv".into(),
        lab.asset("certificates/server"),
        "--req".into(),
        lab.asset("certificates/authorized_keys_server"),
        port.to_string(),
    ])
}

pub(super) fn quic_ssh_client(lab: &Lab, tool: &str, port: u16, local_port: u16) -> Cmd {
    Cmd::new(lab.tool(tool)).args([
        "--pub".to_string(),
        lab.asset("certificates/client.pub"),
        "--priv".into(),
        lab.asset("certificates/client"),
        "--req".into(),
        lab.asset("certificates/known_hosts_client"),
        lab.server_addr().to_string(),
        port.to_string(),
        "-L".into(),
        forward_spec(local_port, HTTP_PORT),
        "-N".into(),
    ])
}

/// Fetch a small file through each endpoint once and log the outcome.
pub(super) fn check_endpoints(lab: &Lab, endpoints: &[String]) {
    for ep in endpoints {
        let cmd = Cmd::new(lab.tool("busybox")).args([
            "wget".to_string(),
            "-q".into(),
            "-O".into(),
            "/dev/null".into(),
            format!("http://{ep}/files/{}", FILE_SIZES[0]),
        ]);
        match lab.run(Side::Client, cmd) {
            Ok(out) if out.success() => info!(endpoint = %ep, "forwarding ok"),
            Ok(out) => warn!(endpoint = %ep, code = out.exit_code, "forwarding ko!"),
            Err(e) => warn!(endpoint = %ep, error = %e, "forwarding ko!"),
        }
    }
}

pub(super) struct SingleDownload {
    lab: Lab,
    endpoints: Vec<String>,
}

impl SingleDownload {
    pub(super) fn prepare(mut lab: Lab) -> Result<Self, BenchError> {
        lab.kill_leftovers(&["quic_ssh", "ssfd", "ssf"]);
        let ssf_dir = lab.config().asset("ssf");

        let cmd = quic_ssh_server(&lab, "quic_ssh", QUIC_SSH_PORT);
        lab.start(Side::Server, "quic_ssh", cmd, Probe::UdpListening(QUIC_SSH_PORT))?;
        let cmd = Cmd::new(lab.tool("sshd")).arg("-D");
        lab.start(Side::Server, "sshd", cmd, Probe::TcpListening(SSH_PORT))?;
        let cmd = Cmd::new(ssf_binary(lab.config(), "ssfd").display().to_string())
            .current_dir(&ssf_dir);
        lab.start(Side::Server, "ssfd", cmd, Probe::TcpListening(SSFD_PORT))?;

        let server = lab.server_addr().to_string();
        let cmd = quic_ssh_client(&lab, "quic_ssh", QUIC_SSH_PORT, 1111);
        lab.start(Side::Client, "quic_ssh", cmd, Probe::TcpListening(1111))?;
        let cmd = Cmd::new(lab.tool("ssh")).args([
            format!("test@{server}"),
            "-o".into(),
            "StrictHostKeyChecking=no".into(),
            "-i".into(),
            lab.asset("certificates/test_user.private"),
            "-L".into(),
            forward_spec(2222, HTTP_PORT),
            "-N".into(),
        ]);
        lab.start(Side::Client, "ssh", cmd, Probe::TcpListening(2222))?;
        let cmd = Cmd::new(ssf_binary(lab.config(), "ssf").display().to_string())
            .args([
                "-L".to_string(),
                format!("127.0.0.1:{}", forward_spec(3333, HTTP_PORT)),
                server.clone(),
            ])
            .current_dir(&ssf_dir);
        lab.start(Side::Client, "ssf", cmd, Probe::TcpListening(3333))?;

        let root = lab.asset("");
        let cmd = httpd(&lab, HTTP_PORT, &root);
        lab.start(Side::Server, "httpd", cmd, Probe::TcpListening(HTTP_PORT))?;

        let endpoints = vec![
            format!("{server}:{HTTP_PORT}"),
            "127.0.0.1:1111".to_string(),
            "127.0.0.1:2222".to_string(),
            "127.0.0.1:3333".to_string(),
        ];
        check_endpoints(&lab, &endpoints);
        Ok(Self { lab, endpoints })
    }
}

impl Experiment for SingleDownload {
    fn name(&self) -> &str {
        "pforw-single-download"
    }

    fn layout(&self) -> Vec<GroupLayout> {
        vec![GroupLayout::new("download", self.endpoints.len())]
    }

    fn configure_impairment(&mut self, sample: &ExperimentSample) -> Result<(), BenchError> {
        self.lab.shape_all(&profile(sample, "")?)
    }

    fn measure(&mut self, sample: &ExperimentSample) -> Result<Vec<MetricGroup>, BenchError> {
        let fsize = sample.get_level("fsize").unwrap_or(FILE_SIZES[0]);
        let mut group = MetricGroup::new("download");
        for ep in &self.endpoints {
            let total = self.lab.ab(REQUESTS, 1, ep, fsize)?;
            group.push(total.map(|t| t.median));
        }
        Ok(vec![group])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tunbench_sweep::SweepPlan;

    #[test]
    fn every_file_size_is_drawn() {
        let plan = SweepPlan::new(spaces().unwrap(), 200, 1).unwrap();
        for f in FILE_SIZES {
            let n = plan
                .iter()
                .filter(|s| s.get_level("fsize") == Some(f))
                .count();
            // 200 strata over 5 levels
            assert_eq!(n, 40, "{f}");
        }
    }

    #[test]
    fn ssf_runs_from_its_directory_unless_configured() {
        let mut cfg = ExperimentConfig::default();
        cfg.assets_dir = "/srv/bench".into();
        assert_eq!(ssf_binary(&cfg, "ssfd"), std::path::Path::new("/srv/bench/ssf/ssfd"));
        cfg.tools.insert("ssfd".into(), "/opt/ssf/ssfd".into());
        assert_eq!(ssf_binary(&cfg, "ssfd"), std::path::Path::new("/opt/ssf/ssfd"));
    }

    #[test]
    fn forwarder_prerequisites() {
        let mut checks = Vec::new();
        prerequisites(&ExperimentConfig::default(), &mut checks);
        let names: Vec<&str> = checks.iter().map(|c| c.name()).collect();
        for n in ["quic_ssh", "sshd", "ssh", "ssfd", "ssf", "apache benchmark"] {
            assert!(names.contains(&n), "{n} missing from {names:?}");
        }
    }
}
