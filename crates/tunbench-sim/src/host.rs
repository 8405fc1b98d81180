use std::process::Output;

use anyhow::Result;

use crate::command::Cmd;

/// Somewhere a command can run: a virtual host's namespace, or this machine.
pub trait Host {
    /// Identity used in logs, errors and the process table.
    fn name(&self) -> &str;

    /// The command that actually gets executed for `cmd` on this host.
    fn wrap(&self, cmd: Cmd) -> Cmd;

    /// Run a command on this host, returning raw output.
    fn exec(&self, cmd: Cmd) -> Result<Output> {
        self.wrap(cmd).output()
    }

    /// Run a command on this host, failing if it exits non-zero.
    fn exec_checked(&self, cmd: Cmd) -> Result<Output> {
        self.wrap(cmd).output_checked()
    }
}

/// Runs commands directly on the machine driving the experiment.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHost;

impl Host for LocalHost {
    fn name(&self) -> &str {
        "local"
    }

    fn wrap(&self, cmd: Cmd) -> Cmd {
        cmd
    }
}
