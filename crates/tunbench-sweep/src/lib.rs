//! Parameter sweeps for tunnel benchmarks.
//!
//! A [`SweepPlan`] draws centred Latin hypercube designs over named
//! parameter spaces; [`run_sweep`] walks the samples in order through an
//! [`Experiment`]'s stages and hands one [`ExperimentResult`] per sample to
//! the [`Recorder`].

pub mod config;
pub mod design;
pub mod pipeline;
pub mod record;
pub mod recorder;
pub mod sample;
pub mod space;

pub use config::{ExperimentConfig, ExperimentConfigInput, Timeouts};
pub use design::Design;
pub use pipeline::{Experiment, SampleFailure, Stage, SweepSummary, run_sweep};
pub use record::{ExperimentResult, GroupLayout, MetricGroup, SENTINEL};
pub use recorder::Recorder;
pub use sample::{ExperimentSample, SweepPlan};
pub use space::{Dimension, DimensionOverride, ParamValue, ParameterSpace, Rounding};
