//! The per-sample state machine and the sweep loop around it.
//!
//! ```text
//! CONFIGURE_IMPAIRMENT -> SETUP_ENDPOINTS -> WARMUP -> MEASURE -> RECORD -> TEARDOWN_PARTIAL
//! ```
//!
//! A non-fatal error in any stage skips to RECORD with sentinel values;
//! a fatal one records the sample and aborts the sweep.

use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Context;
use tracing::{error, info, warn};
use tunbench_sim::BenchError;

use crate::record::{ExperimentResult, GroupLayout, MetricGroup};
use crate::recorder::Recorder;
use crate::sample::{ExperimentSample, SweepPlan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    ConfigureImpairment,
    SetupEndpoints,
    Warmup,
    Measure,
    Record,
    TeardownPartial,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::ConfigureImpairment => "configure-impairment",
            Stage::SetupEndpoints => "setup-endpoints",
            Stage::Warmup => "warmup",
            Stage::Measure => "measure",
            Stage::Record => "record",
            Stage::TeardownPartial => "teardown-partial",
        })
    }
}

/// One experiment variant, driven sample by sample by [`run_sweep`].
pub trait Experiment {
    fn name(&self) -> &str;

    /// Groups every record carries, in order.
    fn layout(&self) -> Vec<GroupLayout>;

    /// Apply the sample's impairment to the WAN segment(s).
    fn configure_impairment(&mut self, sample: &ExperimentSample) -> Result<(), BenchError>;

    /// Start or restart whatever endpoint processes this sample needs.
    fn setup_endpoints(&mut self, _sample: &ExperimentSample) -> Result<(), BenchError> {
        Ok(())
    }

    fn warmup(&mut self, _sample: &ExperimentSample) -> Result<(), BenchError> {
        Ok(())
    }

    /// Run the repetitions. Failed repetitions are `None` inside a group;
    /// an `Err` fails the whole sample.
    fn measure(&mut self, sample: &ExperimentSample) -> Result<Vec<MetricGroup>, BenchError>;

    /// Stop per-sample processes. Runs after every sample, failed or not,
    /// once its record is written.
    fn teardown_partial(&mut self, _sample: &ExperimentSample) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleFailure {
    pub index: usize,
    pub stage: Stage,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct SweepSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<SampleFailure>,
    pub elapsed: Duration,
}

impl fmt::Display for SweepSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} samples, {} ok, {} failed in {:.1}s",
            self.attempted,
            self.succeeded,
            self.failures.len(),
            self.elapsed.as_secs_f64()
        )
    }
}

fn run_stages<E: Experiment + ?Sized>(
    exp: &mut E,
    sample: &ExperimentSample,
) -> Result<Vec<MetricGroup>, (Stage, BenchError)> {
    exp.configure_impairment(sample)
        .map_err(|e| (Stage::ConfigureImpairment, e))?;
    exp.setup_endpoints(sample)
        .map_err(|e| (Stage::SetupEndpoints, e))?;
    exp.warmup(sample).map_err(|e| (Stage::Warmup, e))?;
    exp.measure(sample).map_err(|e| (Stage::Measure, e))
}

/// Attempt every sample of `plan` exactly once, in index order, writing one
/// record per sample. Returns early only on a fatal error or when the
/// recorder itself fails.
pub fn run_sweep<E: Experiment + ?Sized>(
    exp: &mut E,
    plan: &SweepPlan,
    recorder: &mut Recorder,
) -> anyhow::Result<SweepSummary> {
    let start = Instant::now();
    let layout = exp.layout();
    let mut summary = SweepSummary::default();
    info!(experiment = exp.name(), samples = plan.samples(), seed = plan.seed(), "sweep start");

    for sample in plan.iter() {
        recorder
            .banner(&sample.progress_banner(plan.samples()))
            .context("write banner")?;
        summary.attempted += 1;

        let outcome = run_stages(exp, &sample);

        let (result, fatal) = match outcome {
            Ok(groups) => {
                summary.succeeded += 1;
                (ExperimentResult::measured(&sample, groups), None)
            }
            Err((stage, err)) => {
                let msg = err.to_string();
                summary.failures.push(SampleFailure {
                    index: sample.index,
                    stage,
                    error: msg.clone(),
                });
                let result =
                    ExperimentResult::failed(&sample, &layout, format!("{stage}: {msg}"));
                if err.is_fatal() {
                    error!(index = sample.index, %stage, error = %msg, "fatal, aborting sweep");
                    (result, Some(err))
                } else {
                    warn!(index = sample.index, %stage, error = %msg, "sample failed");
                    (result, None)
                }
            }
        };

        let written = recorder.record(&result).context("write result");
        exp.teardown_partial(&sample);
        written?;

        if let Some(err) = fatal {
            return Err(anyhow::Error::new(err)
                .context(format!("sample {} aborted the sweep", sample.index)));
        }
    }

    summary.elapsed = start.elapsed();
    info!(experiment = exp.name(), %summary, "sweep done");
    Ok(summary)
}
