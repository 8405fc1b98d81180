//! Pre-flight checks, printed as `name :....... ok` lines.

use std::path::{Path, PathBuf};

use tunbench_sim::BenchError;
use tunbench_sim::system::{check_binary, check_privileges, netem_available, read_sysctl};
use tunbench_sweep::Recorder;

const DOT_COLUMN: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Check {
    /// Resolvable in `PATH`, or an executable path.
    Binary(String),
    /// The sysctl's value contains the given text.
    Sysctl { key: String, contains: String },
    File(PathBuf),
    Privileges,
    Netem,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prerequisite {
    name: String,
    check: Check,
}

impl Prerequisite {
    pub fn binary(name: impl Into<String>, tool: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            check: Check::Binary(tool.into()),
        }
    }

    pub fn sysctl(name: impl Into<String>, key: &str, contains: &str) -> Self {
        Self {
            name: name.into(),
            check: Check::Sysctl {
                key: key.into(),
                contains: contains.into(),
            },
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            check: Check::File(path.into()),
        }
    }

    /// Namespace management through passwordless sudo.
    pub fn privileges() -> Self {
        Self {
            name: "sudo ip netns".into(),
            check: Check::Privileges,
        }
    }

    pub fn netem() -> Self {
        Self {
            name: "sch_netem module".into(),
            check: Check::Netem,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `Err` carries what was looked for.
    pub fn check(&self) -> Result<(), String> {
        match &self.check {
            Check::Binary(tool) => {
                let found = if tool.contains('/') {
                    is_executable(Path::new(tool))
                } else {
                    check_binary(tool).is_some()
                };
                found.then_some(()).ok_or_else(|| format!("`{tool}` not found"))
            }
            Check::Sysctl { key, contains } => match read_sysctl(key) {
                Some(v) if v.contains(contains.as_str()) => Ok(()),
                Some(v) => Err(format!("{key} = {v}, expected {contains}")),
                None => Err(format!("{key} unreadable")),
            },
            Check::File(path) => {
                if path.exists() {
                    Ok(())
                } else {
                    Err(format!("{} missing", path.display()))
                }
            }
            Check::Privileges => check_privileges()
                .then_some(())
                .ok_or_else(|| "needs `ip netns` and passwordless sudo".to_string()),
            Check::Netem => netem_available()
                .then_some(())
                .ok_or_else(|| "modprobe sch_netem failed".to_string()),
        }
    }
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// `name :<dots> ok` (or `ko!`), dots padding the name to a fixed column.
pub fn status_line(name: &str, ok: bool) -> String {
    let dots = ".".repeat(DOT_COLUMN.saturating_sub(name.chars().count()));
    format!("{name} :{dots} {}", if ok { "ok" } else { "ko!" })
}

/// Run every check, print its status line, and fail with the first
/// missing prerequisite.
pub fn run_checks(checks: &[Prerequisite], rec: &mut Recorder) -> anyhow::Result<()> {
    let mut first_missing = None;
    for c in checks {
        let result = c.check();
        rec.line(&status_line(c.name(), result.is_ok()))?;
        if let Err(detail) = result {
            tracing::warn!(prerequisite = c.name(), %detail, "missing");
            first_missing.get_or_insert(BenchError::PrerequisiteMissing {
                name: c.name().to_string(),
                detail,
            });
        }
    }
    match first_missing {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}
