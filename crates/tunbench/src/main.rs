//! tunbench
//!
//! Reproducible tunnel and transport benchmarks over emulated WAN links.
//!
//! - Builds a namespace topology (chain or diamond) on this machine
//! - Shapes the WAN segments with HTB + netem, queue sized from the BDP
//! - Sweeps bandwidth/delay/loss with a Latin hypercube design
//! - Starts tunnels, forwarders and servers, measures, and appends one
//!   `;`-separated record per sample to `<results>/<variant>_<date>_log.csv`

mod experiments;
mod prereq;
mod sysinfo;

use std::io::BufRead;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use tunbench_sim::process::kill_by_name;
use tunbench_sim::topology::remove_stale_namespaces;
use tunbench_sim::{Cmd, Host, ImpairmentProfile, TopologyShape};
use tunbench_sweep::{ExperimentConfig, Recorder, SweepPlan, SweepSummary, run_sweep};

use experiments::{Lab, RunOptions, Variant, process_name};
use prereq::{Prerequisite, run_checks};

/// Tunnel and transport benchmarks over emulated WAN links.
#[derive(Parser, Debug)]
#[command(name = "tunbench", about = "Tunnel benchmarks over emulated WAN links")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a full parameter sweep.
    Run {
        #[arg(value_enum)]
        variant: Variant,

        #[command(flatten)]
        common: CommonArgs,

        /// Number of samples (overrides the variant default and the config).
        #[arg(long)]
        samples: Option<usize>,

        /// Seed of the Latin hypercube design.
        #[arg(long)]
        seed: Option<u64>,

        /// Repetitions per sample, for variants that repeat.
        #[arg(long)]
        iterations: Option<u32>,

        /// Directory receiving the result log and design sidecar.
        #[arg(long)]
        results_dir: Option<PathBuf>,

        /// Parallel requests per measurement (quic-bench).
        #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        concurrency: u32,
    },

    /// Only run the prerequisite checks of a variant.
    Check {
        #[arg(value_enum)]
        variant: Variant,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Remove namespaces and benchmark daemons left behind by a crashed run.
    Cleanup {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Build a topology, shape it once, and keep it up until Enter is pressed.
    Shape {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value = "chain")]
        topology: TopologyShape,

        #[arg(long, default_value = "10Mbit")]
        bandwidth: String,

        #[arg(long, default_value = "50ms")]
        delay: String,

        #[arg(long, default_value = "0ms")]
        jitter: String,

        #[arg(long, default_value = "0%")]
        loss: String,

        /// Netem queue in packets; sized from the bandwidth-delay product if unset.
        #[arg(long)]
        queue: Option<u32>,
    },
}

#[derive(clap::Args, Debug)]
struct CommonArgs {
    /// TOML experiment configuration.
    #[arg(long, short)]
    config: Option<PathBuf>,
}

impl CommonArgs {
    fn load(&self) -> anyhow::Result<ExperimentConfig> {
        match &self.config {
            Some(path) => ExperimentConfig::load(path),
            None => Ok(ExperimentConfig::default()),
        }
    }
}

/// Benchmark daemons `cleanup` may find orphaned.
const DAEMONS: &[&str] = &[
    "quicbench",
    "quic_ssh",
    "quic_ssh_multi",
    "ssfd",
    "ssf",
    "openvpn",
    "quicvpn",
    "iperf3",
    "ITGRecv",
    "ITGSend",
];

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = dispatch(cli.command) {
        tracing::error!(error = %format!("{e:#}"), "tunbench failed");
        std::process::exit(1);
    }
}

fn dispatch(command: Command) -> anyhow::Result<()> {
    match command {
        Command::Run {
            variant,
            common,
            samples,
            seed,
            iterations,
            results_dir,
            concurrency,
        } => {
            let mut cfg = common.load()?;
            if samples.is_some() {
                cfg.samples = samples;
            }
            if iterations.is_some() {
                cfg.iterations = iterations;
            }
            if let Some(seed) = seed {
                cfg.seed = seed;
            }
            if let Some(dir) = results_dir {
                cfg.results_dir = dir;
            }
            if cfg.samples == Some(0) || cfg.iterations == Some(0) {
                anyhow::bail!("samples and iterations must be at least 1");
            }

            if !variant.sweeps() {
                let profile = ImpairmentProfile::parse("10Mbit", "50ms", "0ms", "0%", None)?;
                return shape(&cfg, variant.shape(), &profile);
            }
            run(variant, &cfg, RunOptions { concurrency })
        }
        Command::Check { variant, common } => {
            let cfg = common.load()?;
            let mut rec = Recorder::create(&std::env::temp_dir(), "check")?;
            let mut checks = vec![Prerequisite::privileges(), Prerequisite::netem()];
            checks.extend(variant.prerequisites(&cfg, &RunOptions::default()));
            let result = run_checks(&checks, &mut rec);
            std::fs::remove_file(rec.path()).ok();
            result
        }
        Command::Cleanup { common } => cleanup(&common.load()?),
        Command::Shape {
            common,
            topology,
            bandwidth,
            delay,
            jitter,
            loss,
            queue,
        } => {
            let cfg = common.load()?;
            let profile = ImpairmentProfile::parse(&bandwidth, &delay, &jitter, &loss, queue)?;
            shape(&cfg, topology, &profile)
        }
    }
}

/// `<results>/<variant>_<date>_design.json`, next to the log.
fn design_path(log: &Path) -> PathBuf {
    let name = log
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("sweep_log.csv");
    let stem = name.strip_suffix("_log.csv").unwrap_or(name);
    log.with_file_name(format!("{stem}_design.json"))
}

fn run(variant: Variant, cfg: &ExperimentConfig, opts: RunOptions) -> anyhow::Result<()> {
    let mut rec = Recorder::create(&cfg.results_dir, variant.name())?;
    match sweep(variant, cfg, opts, &mut rec) {
        Ok(summary) => {
            tracing::info!(%summary, log = %rec.path().display(), "sweep finished");
            Ok(())
        }
        Err(e) => {
            rec.banner("FAILED")?;
            rec.line(&format!("{e:#}"))?;
            Err(e)
        }
    }
}

fn sweep(
    variant: Variant,
    cfg: &ExperimentConfig,
    opts: RunOptions,
    rec: &mut Recorder,
) -> anyhow::Result<SweepSummary> {
    let mut spaces = variant.spaces(&opts).map_err(anyhow::Error::msg)?;
    for space in &mut spaces {
        space
            .apply_overrides(&cfg.dimensions)
            .map_err(anyhow::Error::msg)?;
    }
    let plan = SweepPlan::new(spaces, cfg.samples_or(variant.default_samples()), cfg.seed)
        .map_err(anyhow::Error::msg)?;

    rec.banner("system description")?;
    for line in sysinfo::describe_system() {
        rec.line(&line)?;
    }

    rec.banner("prerequisites")?;
    let mut checks = vec![Prerequisite::privileges(), Prerequisite::netem()];
    checks.extend(variant.prerequisites(cfg, &opts));
    run_checks(&checks, rec)?;

    rec.banner("build network")?;
    let lab = Lab::build(variant.shape(), cfg).context("build network")?;
    rec.write(&lab.topology().describe())?;

    let design = design_path(rec.path());
    plan.write_design_json(&design)?;
    tracing::info!(path = %design.display(), samples = plan.samples(), "design written");

    rec.banner("start endpoints")?;
    let mut exp = variant.instantiate(lab, &opts).context("start endpoints")?;

    rec.banner("make experiment")?;
    let summary = run_sweep(exp.as_mut(), &plan, rec)?;

    rec.banner("clean")?;
    drop(exp);
    rec.line(&summary.to_string())?;
    Ok(summary)
}

fn shape(cfg: &ExperimentConfig, topology: TopologyShape, profile: &ImpairmentProfile) -> anyhow::Result<()> {
    let lab = Lab::build(topology, cfg).context("build network")?;
    lab.shape_all(profile).context("shape network")?;

    print!("{}", lab.topology().describe());
    println!("limit {profile}");
    for h in lab.topology().hosts() {
        println!("  sudo ip netns exec {} bash", h.namespace().name());
    }
    println!("press Enter to tear down");

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(())
}

/// Runs commands on this machine through non-interactive sudo.
struct Sudo;

impl Host for Sudo {
    fn name(&self) -> &str {
        "local"
    }

    fn wrap(&self, cmd: Cmd) -> Cmd {
        cmd.wrapped_in(Cmd::new("sudo").arg("-n"))
    }
}

fn cleanup(cfg: &ExperimentConfig) -> anyhow::Result<()> {
    let removed = remove_stale_namespaces(&cfg.namespace_prefix)?;
    println!("removed {removed} namespaces with prefix {}", cfg.namespace_prefix);
    for daemon in DAEMONS {
        let name = process_name(&cfg.tool(daemon));
        if kill_by_name(&Sudo, &name)? {
            println!("killed {name}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn run_arguments() {
        let cli = Cli::try_parse_from([
            "tunbench",
            "run",
            "quic-bench",
            "--samples",
            "20",
            "--seed",
            "7",
            "--concurrency",
            "5",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                variant,
                samples,
                seed,
                concurrency,
                ..
            } => {
                assert_eq!(variant, Variant::QuicBench);
                assert_eq!(samples, Some(20));
                assert_eq!(seed, Some(7));
                assert_eq!(concurrency, 5);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn zero_concurrency_rejected() {
        assert!(Cli::try_parse_from(["tunbench", "run", "quic-bench", "--concurrency", "0"]).is_err());
        assert!(Cli::try_parse_from(["tunbench", "run", "no-such-variant"]).is_err());
    }

    #[test]
    fn shape_defaults() {
        let cli = Cli::try_parse_from(["tunbench", "shape", "--topology", "diamond"]).unwrap();
        match cli.command {
            Command::Shape {
                topology,
                bandwidth,
                delay,
                queue,
                ..
            } => {
                assert_eq!(topology, TopologyShape::Diamond);
                assert_eq!(bandwidth, "10Mbit");
                assert_eq!(delay, "50ms");
                assert_eq!(queue, None);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn design_sidecar_sits_next_to_log() {
        assert_eq!(
            design_path(Path::new("results/quic-bench_2018-05-04_09:03:07_log.csv")),
            Path::new("results/quic-bench_2018-05-04_09:03:07_design.json")
        );
        assert_eq!(design_path(Path::new("odd.txt")), Path::new("odd.txt_design.json"));
    }
}
