//! Sweep plans: one or more design grids drawn over named parameter spaces.

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::Serialize;

use crate::design::Design;
use crate::space::{ParamValue, ParameterSpace};

/// A parameter space paired with the design drawn over it.
#[derive(Debug, Clone)]
pub struct Grid {
    pub space: ParameterSpace,
    pub design: Design,
}

/// Every sample an experiment will run, fixed before the first one starts.
///
/// Experiments with several independent grids (a second path, say) get one
/// [`Grid`] each; all grids have the same sample count and are drawn in
/// order from a single seeded generator.
#[derive(Debug, Clone)]
pub struct SweepPlan {
    grids: Vec<Grid>,
    samples: usize,
    seed: u64,
}

impl SweepPlan {
    pub fn new(spaces: Vec<ParameterSpace>, samples: usize, seed: u64) -> Result<Self, String> {
        if spaces.is_empty() {
            return Err("a sweep needs at least one parameter space".into());
        }
        let mut names = HashSet::new();
        for name in spaces.iter().flat_map(|s| s.names()) {
            if !names.insert(name) {
                return Err(format!("dimension `{name}` appears in more than one grid"));
            }
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let grids = spaces
            .into_iter()
            .map(|space| {
                let design = Design::latin_hypercube_with(samples, space.len(), &mut rng);
                Grid { space, design }
            })
            .collect();
        Ok(Self {
            grids,
            samples,
            seed,
        })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn grids(&self) -> &[Grid] {
        &self.grids
    }

    /// Dimension names across all grids, in record order.
    pub fn names(&self) -> Vec<String> {
        self.grids
            .iter()
            .flat_map(|g| g.space.names().map(str::to_string))
            .collect()
    }

    pub fn sample(&self, index: usize) -> Option<ExperimentSample> {
        if index >= self.samples {
            return None;
        }
        let mut coords = Vec::with_capacity(self.grids.len());
        let mut values = Vec::new();
        for g in &self.grids {
            let row = g.design.row(index)?;
            values.extend(g.space.map(row).ok()?);
            coords.push(row.to_vec());
        }
        Some(ExperimentSample {
            index,
            coords,
            names: self.names(),
            values,
        })
    }

    /// Samples in index order `0..samples`.
    pub fn iter(&self) -> impl Iterator<Item = ExperimentSample> + '_ {
        (0..self.samples).filter_map(|i| self.sample(i))
    }

    /// Write the mapped design (`seed`, `names`, and every sample) as JSON.
    pub fn write_design_json(&self, path: &Path) -> anyhow::Result<()> {
        #[derive(Serialize)]
        struct DesignFile {
            seed: u64,
            samples: usize,
            names: Vec<String>,
            points: Vec<ExperimentSample>,
        }

        let file = DesignFile {
            seed: self.seed,
            samples: self.samples,
            names: self.names(),
            points: self.iter().collect(),
        };
        let json = serde_json::to_string_pretty(&file).context("serialize design")?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }
}

/// One parameter tuple of the sweep.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentSample {
    pub index: usize,
    /// Normalized coordinates, one row per grid.
    pub coords: Vec<Vec<f64>>,
    pub names: Vec<String>,
    pub values: Vec<ParamValue>,
}

impl ExperimentSample {
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.names
            .iter()
            .position(|n| n == name)
            .and_then(|i| self.values.get(i))
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.get(name).and_then(ParamValue::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.get(name).and_then(ParamValue::as_f64)
    }

    pub fn get_level(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(ParamValue::as_level)
    }

    /// `[<pct>%] (<names>) <values>`
    pub fn progress_banner(&self, total: usize) -> String {
        let pct = if total == 0 {
            100.0
        } else {
            self.index as f64 * 100.0 / total as f64
        };
        let values: Vec<String> = self.values.iter().map(ToString::to_string).collect();
        format!("[{pct:.1}%] ({}) {}", self.names.join(", "), values.join(" "))
    }
}
