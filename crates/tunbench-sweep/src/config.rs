use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::space::DimensionOverride;

pub const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExperimentConfigInput {
    pub version: u32,
    pub samples: Option<usize>,
    pub seed: Option<u64>,
    pub iterations: Option<u32>,
    pub results_dir: Option<PathBuf>,
    pub scratch_dir: Option<PathBuf>,
    pub assets_dir: Option<PathBuf>,
    pub namespace_prefix: Option<String>,
    pub enforce_cpu_limits: Option<bool>,
    pub timeouts: TimeoutsInput,
    pub dimensions: HashMap<String, DimensionOverride>,
    /// Tool name -> binary path, e.g. `quicvpn = "/opt/quic/quicvpn"`.
    pub tools: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsInput {
    pub measure_s: Option<u64>,
    pub ready_ms: Option<u64>,
    pub poll_ms: Option<u64>,
    pub settle_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Upper bound for one measurement command.
    pub measure: Duration,
    /// Upper bound for an endpoint to become ready.
    pub ready: Duration,
    pub poll: Duration,
    /// Fixed wait used where no readiness signal exists.
    pub settle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            measure: Duration::from_secs(20),
            ready: Duration::from_secs(10),
            poll: Duration::from_millis(100),
            settle: Duration::from_secs(1),
        }
    }
}

/// Resolved, validated run configuration. Passed explicitly to everything
/// that needs it.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub version: u32,
    /// `None` means the variant's own default.
    pub samples: Option<usize>,
    pub seed: u64,
    pub iterations: Option<u32>,
    pub results_dir: PathBuf,
    pub scratch_dir: PathBuf,
    /// Root for `files/`, `certificates/` and `configuration/`.
    pub assets_dir: PathBuf,
    pub namespace_prefix: String,
    pub enforce_cpu_limits: bool,
    pub timeouts: Timeouts,
    pub dimensions: HashMap<String, DimensionOverride>,
    pub tools: HashMap<String, String>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            samples: None,
            seed: 1,
            iterations: None,
            results_dir: PathBuf::from("results"),
            scratch_dir: std::env::temp_dir().join("tunbench"),
            assets_dir: PathBuf::from("."),
            namespace_prefix: tunbench_sim::topology::DEFAULT_PREFIX.to_string(),
            enforce_cpu_limits: false,
            timeouts: Timeouts::default(),
            dimensions: HashMap::new(),
            tools: HashMap::new(),
        }
    }
}

impl ExperimentConfigInput {
    pub fn resolve(self) -> Result<ExperimentConfig, String> {
        let version = if self.version == 0 {
            CONFIG_VERSION
        } else {
            self.version
        };
        if version != CONFIG_VERSION {
            return Err(format!("Unsupported config version {}", version));
        }

        let defaults = ExperimentConfig::default();

        if self.samples == Some(0) {
            return Err("samples must be at least 1".into());
        }
        if self.iterations == Some(0) {
            return Err("iterations must be at least 1".into());
        }

        let prefix = match self.namespace_prefix {
            Some(p) => {
                let p = p.trim().to_string();
                // `<prefix>-r3` must stay a sensible netns name
                if p.is_empty() || p.len() > 10 || !p.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(format!("namespace_prefix `{p}` must be 1-10 alphanumerics"));
                }
                p
            }
            None => defaults.namespace_prefix,
        };

        let d = Timeouts::default();
        let timeouts = Timeouts {
            measure: self.timeouts.measure_s.map_or(d.measure, Duration::from_secs),
            ready: self.timeouts.ready_ms.map_or(d.ready, Duration::from_millis),
            poll: self
                .timeouts
                .poll_ms
                .map_or(d.poll, Duration::from_millis)
                .max(Duration::from_millis(1)),
            settle: self.timeouts.settle_ms.map_or(d.settle, Duration::from_millis),
        };
        if timeouts.measure.is_zero() || timeouts.ready.is_zero() {
            return Err("timeouts must be non-zero".into());
        }

        let tools = self
            .tools
            .into_iter()
            .filter_map(|(k, v)| {
                let v = v.trim().to_string();
                (!v.is_empty()).then_some((k, v))
            })
            .collect();

        Ok(ExperimentConfig {
            version,
            samples: self.samples,
            seed: self.seed.unwrap_or(defaults.seed),
            iterations: self.iterations,
            results_dir: self.results_dir.unwrap_or(defaults.results_dir),
            scratch_dir: self.scratch_dir.unwrap_or(defaults.scratch_dir),
            assets_dir: self.assets_dir.unwrap_or(defaults.assets_dir),
            namespace_prefix: prefix,
            enforce_cpu_limits: self.enforce_cpu_limits.unwrap_or(false),
            timeouts,
            dimensions: self.dimensions,
            tools,
        })
    }
}

impl ExperimentConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, String> {
        if input.trim().is_empty() {
            return Ok(ExperimentConfig::default());
        }
        let parsed: ExperimentConfigInput =
            toml::from_str(input).map_err(|e| format!("Invalid config TOML: {}", e))?;
        parsed.resolve()
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&text).map_err(anyhow::Error::msg)
    }

    /// Binary to run for `name`: the configured path, or the name itself.
    pub fn tool(&self, name: &str) -> String {
        self.tools.get(name).cloned().unwrap_or_else(|| name.to_string())
    }

    pub fn asset(&self, rel: impl AsRef<Path>) -> PathBuf {
        self.assets_dir.join(rel)
    }

    pub fn samples_or(&self, default: usize) -> usize {
        self.samples.unwrap_or(default)
    }

    pub fn iterations_or(&self, default: u32) -> u32 {
        self.iterations.unwrap_or(default)
    }
}
