use std::time::Duration;

use thiserror::Error;

/// Everything that can go wrong while building a lab or running a sample.
///
/// Fatal kinds abort the whole run; the rest are caught at the sample
/// boundary and turned into sentinel values in the result stream.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("prerequisite missing: {name} ({detail})")]
    PrerequisiteMissing { name: String, detail: String },

    #[error("topology build failed: {0}")]
    TopologyBuild(String),

    #[error("shaping failed on {host}/{iface}: `{rule}`: {stderr}")]
    Shaping {
        host: String,
        iface: String,
        rule: String,
        stderr: String,
    },

    #[error("{process} on {host} not ready after {waited:?}{}", detail_suffix(.detail))]
    ReadinessTimeout {
        host: String,
        process: String,
        waited: Duration,
        detail: Option<String>,
    },

    #[error("`{command}` on {host} exceeded {timeout:?}")]
    MeasurementTimeout {
        host: String,
        command: String,
        timeout: Duration,
    },

    #[error("measurement on {host} produced no result: {detail}")]
    Measurement { host: String, detail: String },

    #[error("command on {host} failed: {source:#}")]
    Command {
        host: String,
        #[source]
        source: anyhow::Error,
    },
}

impl BenchError {
    /// True for the kinds that must abort the run instead of a single sample.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BenchError::PrerequisiteMissing { .. } | BenchError::TopologyBuild(_)
        )
    }

    /// True for a single measurement that timed out or produced nothing;
    /// the repetition records the sentinel and the sample goes on.
    pub fn is_repetition_failure(&self) -> bool {
        matches!(
            self,
            BenchError::MeasurementTimeout { .. } | BenchError::Measurement { .. }
        )
    }

    pub fn command(host: &str, source: anyhow::Error) -> Self {
        BenchError::Command {
            host: host.to_string(),
            source,
        }
    }
}

fn detail_suffix(detail: &Option<String>) -> String {
    match detail {
        Some(d) => format!(": {d}"),
        None => String::new(),
    }
}
