//! Result records and their `;`-delimited line format.

use chrono::{DateTime, Local};
use serde::Serialize;

use crate::sample::ExperimentSample;
use crate::space::ParamValue;

/// Written in place of a value that could not be measured.
pub const SENTINEL: &str = "-1";

/// Separator between metric groups on a result line.
pub const GROUP_SEPARATOR: &str = ";;;";

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One measured endpoint or protocol: a value per repetition, `None` for a
/// failed or timed-out repetition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricGroup {
    pub name: String,
    pub values: Vec<Option<f64>>,
}

impl MetricGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            values: Vec::new(),
        }
    }

    /// A group of `len` sentinel values.
    pub fn failed(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            values: vec![None; len],
        }
    }

    pub fn push(&mut self, value: Option<f64>) {
        self.values.push(value);
    }

    pub fn with(mut self, value: Option<f64>) -> Self {
        self.push(value);
        self
    }

    pub fn render(&self) -> String {
        self.values
            .iter()
            .map(|v| match v {
                Some(v) if v.is_finite() => v.to_string(),
                _ => SENTINEL.to_string(),
            })
            .collect::<Vec<_>>()
            .join(";")
    }
}

/// Name and width of a group an experiment always emits, used to fill a
/// failed sample with sentinels of the right shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupLayout {
    pub name: String,
    pub len: usize,
}

impl GroupLayout {
    pub fn new(name: impl Into<String>, len: usize) -> Self {
        Self {
            name: name.into(),
            len,
        }
    }
}

/// Exactly one per attempted sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentResult {
    pub index: usize,
    pub timestamp: DateTime<Local>,
    pub params: Vec<ParamValue>,
    pub groups: Vec<MetricGroup>,
    /// Why the sample did not produce measurements, if it didn't.
    pub failure: Option<String>,
}

impl ExperimentResult {
    pub fn measured(sample: &ExperimentSample, groups: Vec<MetricGroup>) -> Self {
        Self {
            index: sample.index,
            timestamp: Local::now(),
            params: sample.values.clone(),
            groups,
            failure: None,
        }
    }

    pub fn failed(sample: &ExperimentSample, layout: &[GroupLayout], reason: impl Into<String>) -> Self {
        Self {
            index: sample.index,
            timestamp: Local::now(),
            params: sample.values.clone(),
            groups: layout
                .iter()
                .map(|g| MetricGroup::failed(g.name.clone(), g.len))
                .collect(),
            failure: Some(reason.into()),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// `<index>;<timestamp>;<params...>` then `;;;<group>` per metric group.
    pub fn to_line(&self) -> String {
        let mut line = format!("{};{}", self.index, self.timestamp.format(TIMESTAMP_FORMAT));
        for p in &self.params {
            line.push(';');
            line.push_str(&p.to_string());
        }
        for g in &self.groups {
            line.push_str(GROUP_SEPARATOR);
            line.push_str(&g.render());
        }
        line
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn sample() -> ExperimentSample {
        ExperimentSample {
            index: 7,
            coords: vec![vec![0.25, 0.75]],
            names: vec!["bw".into(), "loss".into()],
            values: vec![ParamValue::Int(10_000), ParamValue::Float(0.5)],
        }
    }

    fn at_noon(mut r: ExperimentResult) -> ExperimentResult {
        r.timestamp = Local.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        r
    }

    #[test]
    fn measured_line() {
        let groups = vec![
            MetricGroup::new("tcp").with(Some(120.0)).with(None).with(Some(98.5)),
            MetricGroup::new("quic").with(Some(101.0)),
        ];
        let r = at_noon(ExperimentResult::measured(&sample(), groups));
        assert_eq!(r.to_line(), "7;2024-03-01 12:00:00;10000;0.5;;;120;-1;98.5;;;101");
        assert!(!r.is_failed());
    }

    #[test]
    fn failed_line_keeps_layout() {
        let layout = [GroupLayout::new("tcp", 3), GroupLayout::new("quic", 2)];
        let r = at_noon(ExperimentResult::failed(&sample(), &layout, "shaping failed"));
        assert_eq!(r.to_line(), "7;2024-03-01 12:00:00;10000;0.5;;;-1;-1;-1;;;-1;-1");
        assert!(r.is_failed());
    }

    #[test]
    fn non_finite_is_sentinel() {
        let g = MetricGroup::new("x").with(Some(f64::NAN)).with(Some(3.0));
        assert_eq!(g.render(), "-1;3");
    }
}
