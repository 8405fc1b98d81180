//! Typed command builder.
//!
//! Every kernel or tool invocation is assembled from discrete arguments and
//! executed without a shell, so addresses, rates and paths are never spliced
//! into a command string.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use anyhow::{Context, Result, bail};

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    dir: Option<PathBuf>,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Working directory; survives [`Cmd::wrapped_in`].
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Run `self` through `prefix`, e.g. `sudo ip netns exec <ns>`.
    pub fn wrapped_in(self, prefix: Cmd) -> Cmd {
        let mut args = prefix.args;
        args.push(self.program);
        args.extend(self.args);
        Cmd {
            program: prefix.program,
            args,
            dir: self.dir.or(prefix.dir),
        }
    }

    /// `std::process::Command` with stdin detached.
    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).stdin(Stdio::null());
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run to completion, returning raw output regardless of exit status.
    pub fn output(&self) -> Result<Output> {
        tracing::debug!(cmd = %self, "exec");
        self.to_command()
            .output()
            .with_context(|| format!("spawn `{self}`"))
    }

    /// Run to completion, bailing with stderr when the exit status is non-zero.
    pub fn output_checked(&self) -> Result<Output> {
        let output = self.output()?;
        if !output.status.success() {
            bail!(
                "command failed: {self}\n{}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(output)
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_preserves_argument_boundaries() {
        let inner = Cmd::new("ab").args(["-n", "4"]).arg("7.7.7.7/files/4M");
        let wrapped = inner.wrapped_in(Cmd::new("sudo").args(["ip", "netns", "exec", "tb-h1"]));

        assert_eq!(wrapped.program(), "sudo");
        assert_eq!(
            wrapped.get_args(),
            &["ip", "netns", "exec", "tb-h1", "ab", "-n", "4", "7.7.7.7/files/4M"]
        );
    }

    #[test]
    fn working_directory_survives_wrapping() {
        let cmd = Cmd::new("./ssfd")
            .current_dir("/opt/ssf")
            .wrapped_in(Cmd::new("sudo").args(["ip", "netns", "exec", "tb-h2"]));
        assert_eq!(cmd.get_current_dir(), Some(Path::new("/opt/ssf")));

        let out = Cmd::new("pwd").current_dir("/").output_checked().unwrap();
        assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "/");
    }

    #[test]
    fn display_quotes_whitespace() {
        let cmd = Cmd::new("echo").arg("two words").arg("");
        assert_eq!(cmd.to_string(), "echo 'two words' ''");
    }

    #[test]
    fn checked_output_reports_failure() {
        let err = Cmd::new("false").output_checked().unwrap_err();
        assert!(err.to_string().contains("command failed: false"), "{err}");
    }
}
