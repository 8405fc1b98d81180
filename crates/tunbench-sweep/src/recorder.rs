//! Console + append-only log file sink for result lines and banners.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Local};

use crate::record::ExperimentResult;

const BANNER_WIDTH: usize = 60;

/// `<experiment>_<YYYY-MM-DD_HH:MM:SS>_log.csv`
pub fn log_file_name(experiment: &str, at: DateTime<Local>) -> String {
    format!("{experiment}_{}_log.csv", at.format("%Y-%m-%d_%H:%M:%S"))
}

/// Two blank lines, then the title centred in stars.
pub fn banner_text(title: &str) -> String {
    let stars = "*".repeat(BANNER_WIDTH.saturating_sub(title.chars().count()) / 2);
    format!("\n\n{stars} {title} {stars}\n")
}

/// Duplicates everything to the console and the run's log file, flushing
/// both after every write so an interrupted run keeps what it measured.
pub struct Recorder {
    path: PathBuf,
    file: File,
    console: Option<Box<dyn Write + Send>>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("path", &self.path)
            .field("console", &self.console.is_some())
            .finish()
    }
}

impl Recorder {
    /// Open `<dir>/<experiment>_<now>_log.csv` for appending, creating `dir`.
    pub fn create(dir: &Path, experiment: &str) -> anyhow::Result<Self> {
        Self::create_at(dir, experiment, Local::now())
    }

    pub fn create_at(dir: &Path, experiment: &str, at: DateTime<Local>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(log_file_name(experiment, at));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open {}", path.display()))?;
        tracing::info!(path = %path.display(), "recording results");
        Ok(Self {
            path,
            file,
            console: Some(Box::new(io::stdout())),
        })
    }

    /// Replace the console sink (`None` writes to the file only).
    pub fn with_console(mut self, console: Option<Box<dyn Write + Send>>) -> Self {
        self.console = console;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, text: &str) -> io::Result<()> {
        if let Some(console) = self.console.as_mut() {
            console.write_all(text.as_bytes())?;
            console.flush()?;
        }
        self.file.write_all(text.as_bytes())?;
        self.file.flush()
    }

    pub fn line(&mut self, line: &str) -> io::Result<()> {
        self.write(&format!("{line}\n"))
    }

    pub fn banner(&mut self, title: &str) -> io::Result<()> {
        self.write(&banner_text(title))
    }

    pub fn record(&mut self, result: &ExperimentResult) -> io::Result<()> {
        self.line(&result.to_line())
    }
}
