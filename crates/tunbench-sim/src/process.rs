//! Process lifecycle on virtual hosts.
//!
//! The [`Coordinator`] owns every background process it starts (tunnel
//! daemons, forwarders, servers), keyed by host + name. Foreground commands
//! (clients, load generators) run to completion under a hard timeout.
//!
//! Everything runs in its own process group so a timeout or teardown takes
//! down the `sudo ip netns exec` wrapper and whatever it started.

use std::fs::File;
use std::io::Read;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use anyhow::Context;
use crossbeam_channel::{Receiver, unbounded};
use tracing::{debug, info, warn};

use crate::command::Cmd;
use crate::error::BenchError;
use crate::host::Host;

/// Exit code reported for a foreground command killed at its timeout
/// (same convention as coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Time between SIGTERM and SIGKILL, and the upper bound spent reaping a
/// killed process group.
pub const KILL_GRACE: Duration = Duration::from_secs(2);

const EXIT_POLL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Readiness
// ---------------------------------------------------------------------------

/// Poll `ready` until it holds or `max_wait` elapses.
///
/// Checks once immediately, then every `poll_interval`. Returns the time it
/// took, or `None` if the condition never held within `max_wait`.
pub fn wait_ready(
    mut ready: impl FnMut() -> bool,
    max_wait: Duration,
    poll_interval: Duration,
) -> Option<Duration> {
    let start = Instant::now();
    loop {
        if ready() {
            return Some(start.elapsed());
        }
        let elapsed = start.elapsed();
        if elapsed >= max_wait {
            return None;
        }
        std::thread::sleep(poll_interval.min(max_wait - elapsed));
    }
}

/// Last-resort fixed wait for readiness that has no observable signal.
pub fn wait_fixed(reason: &str, duration: Duration) {
    info!(reason, ?duration, "fixed wait (no readiness signal available)");
    std::thread::sleep(duration);
}

/// An observable readiness condition on a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// A TCP socket is listening on the port (`ss -tln`).
    TcpListening(u16),
    /// A UDP socket is bound to the port (`ss -uln`).
    UdpListening(u16),
    /// The file exists and is non-empty.
    FileNonEmpty(PathBuf),
    /// A single ping to the address succeeds.
    Ping(String),
}

impl Probe {
    pub fn check(&self, host: &dyn Host) -> bool {
        match self {
            Probe::TcpListening(port) => socket_listening(host, "-tlnH", *port),
            Probe::UdpListening(port) => socket_listening(host, "-ulnH", *port),
            Probe::FileNonEmpty(path) => std::fs::metadata(path).is_ok_and(|m| m.len() > 0),
            Probe::Ping(addr) => host
                .exec(Cmd::new("ping").args(["-c", "1", "-W", "1", addr]))
                .is_ok_and(|o| o.status.success()),
        }
    }
}

impl std::fmt::Display for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Probe::TcpListening(p) => write!(f, "tcp listener on :{p}"),
            Probe::UdpListening(p) => write!(f, "udp socket on :{p}"),
            Probe::FileNonEmpty(p) => write!(f, "non-empty {}", p.display()),
            Probe::Ping(a) => write!(f, "ping {a}"),
        }
    }
}

fn socket_listening(host: &dyn Host, flags: &str, port: u16) -> bool {
    host.exec(Cmd::new("ss").arg(flags))
        .is_ok_and(|o| o.status.success() && listening_on(&String::from_utf8_lossy(&o.stdout), port))
}

/// True if any socket row in headerless `ss -ln` output has local port `port`.
pub fn listening_on(ss_output: &str, port: u16) -> bool {
    let suffix = format!(":{port}");
    ss_output
        .lines()
        .filter_map(|line| line.split_whitespace().nth(3))
        .any(|local| local.ends_with(&suffix))
}

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// A background process started by the [`Coordinator`].
#[derive(Debug)]
pub struct ProcessHandle {
    host: String,
    name: String,
    command: String,
    child: Child,
    log: Option<PathBuf>,
    started: Instant,
}

impl ProcessHandle {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Also the process group id.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log.as_deref()
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// `Some(status)` once the process has exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.try_wait().ok().flatten()
    }

    pub fn is_running(&mut self) -> bool {
        self.exit_status().is_none()
    }

    fn matches(&self, host: &str, name: &str) -> bool {
        self.host == host && self.name == name
    }
}

/// Result of a foreground command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundOutput {
    pub stdout: String,
    pub stderr: String,
    /// Process exit code, `128 + signal` if it died from a signal, or
    /// [`TIMEOUT_EXIT_CODE`] if it was killed at the timeout.
    pub exit_code: i32,
    pub elapsed: Duration,
}

impl ForegroundOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn timed_out(&self) -> bool {
        self.exit_code == TIMEOUT_EXIT_CODE
    }
}

fn status_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// Signal the whole process group led by `pgid`.
///
/// Groups running under `sudo` belong to root, so a failed `kill(2)` with
/// EPERM falls back to `sudo kill`. An already-gone group is not an error.
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: kill(2) with a negative pid only signals the process group;
    // the worst case for a stale id is ESRCH.
    let rc = unsafe { libc::kill(-pid, signal) };
    if rc == 0 {
        return;
    }
    let err = std::io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return;
    }

    let name = if signal == libc::SIGKILL { "KILL" } else { "TERM" };
    let _ = Cmd::new("sudo")
        .args(["-n", "kill", "-s", name, "--", &format!("-{pgid}")])
        .output();
}

/// Wait for `child` until `deadline`; `None` if it is still running then.
fn wait_until(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        std::thread::sleep(EXIT_POLL.min(deadline - now));
    }
}

/// Forward `pipe` chunk by chunk until EOF, so a reader giving up early
/// still gets everything read so far.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = unbounded();
    std::thread::spawn(move || {
        let mut buf = [0u8; 8192];
        loop {
            match pipe.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

/// Chunks received until EOF or `deadline`, whichever comes first.
fn collect(rx: Option<Receiver<Vec<u8>>>, deadline: Instant) -> String {
    let Some(rx) = rx else {
        return String::new();
    };
    let mut out = Vec::new();
    while let Ok(chunk) = rx.recv_deadline(deadline) {
        out.extend_from_slice(&chunk);
    }
    out.extend(rx.try_iter().flatten());
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

/// Owns the process table for one experiment run.
#[derive(Debug)]
pub struct Coordinator {
    processes: Vec<ProcessHandle>,
    scratch_dir: Option<PathBuf>,
    kill_grace: Duration,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            processes: Vec::new(),
            scratch_dir: None,
            kill_grace: KILL_GRACE,
        }
    }

    /// Send background output to `<dir>/<host>_<name>.log` instead of
    /// discarding it.
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn processes(&self) -> &[ProcessHandle] {
        &self.processes
    }

    pub fn get(&self, host: &str, name: &str) -> Option<&ProcessHandle> {
        self.processes.iter().find(|p| p.matches(host, name))
    }

    /// Start `cmd` on `host` detached in its own process group and return
    /// immediately. A previous process with the same host + name is torn
    /// down first.
    pub fn spawn_background(
        &mut self,
        host: &dyn Host,
        name: &str,
        cmd: Cmd,
    ) -> Result<&ProcessHandle, BenchError> {
        if self.get(host.name(), name).is_some() {
            warn!(host = host.name(), name, "replacing running process");
            self.teardown(host.name(), name);
        }

        let wrapped = host.wrap(cmd);
        let mut command = wrapped.to_command();
        command.process_group(0);

        let log = match &self.scratch_dir {
            Some(dir) => {
                let path = dir.join(format!("{}_{name}.log", host.name()));
                let out = std::fs::create_dir_all(dir)
                    .and_then(|()| File::create(&path))
                    .with_context(|| format!("create log {}", path.display()))
                    .map_err(|e| BenchError::command(host.name(), e))?;
                let err = out
                    .try_clone()
                    .context("clone log handle")
                    .map_err(|e| BenchError::command(host.name(), e))?;
                command.stdout(out).stderr(err);
                Some(path)
            }
            None => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
                None
            }
        };

        let child = command
            .spawn()
            .with_context(|| format!("spawn `{wrapped}`"))
            .map_err(|e| BenchError::command(host.name(), e))?;

        info!(host = host.name(), name, pid = child.id(), "background process started");
        self.processes.push(ProcessHandle {
            host: host.name().to_string(),
            name: name.to_string(),
            command: wrapped.to_string(),
            child,
            log,
            started: Instant::now(),
        });
        Ok(&self.processes[self.processes.len() - 1])
    }

    /// Wait until `probe` holds for the background process `name` on `host`.
    ///
    /// Fails early if the process exits before becoming ready.
    pub fn await_ready(
        &mut self,
        host: &dyn Host,
        name: &str,
        probe: &Probe,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<Duration, BenchError> {
        let mut exited = None;
        let handle = self
            .processes
            .iter_mut()
            .find(|p| p.matches(host.name(), name));

        let waited = match handle {
            Some(handle) => wait_ready(
                || {
                    if let Some(status) = handle.exit_status() {
                        exited = Some(status);
                        return true;
                    }
                    probe.check(host)
                },
                max_wait,
                poll_interval,
            ),
            None => wait_ready(|| probe.check(host), max_wait, poll_interval),
        };

        match (waited, exited) {
            (Some(took), Some(status)) => Err(BenchError::ReadinessTimeout {
                host: host.name().to_string(),
                process: name.to_string(),
                waited: took,
                detail: Some(format!("exited with {status} before {probe}")),
            }),
            (Some(took), None) => {
                debug!(host = host.name(), name, %probe, ?took, "ready");
                Ok(took)
            }
            (None, _) => Err(BenchError::ReadinessTimeout {
                host: host.name().to_string(),
                process: name.to_string(),
                waited: max_wait,
                detail: Some(format!("waiting for {probe}")),
            }),
        }
    }

    /// Run `cmd` on `host` to completion, or kill its process group at
    /// `timeout` and report [`TIMEOUT_EXIT_CODE`].
    ///
    /// Output is collected until both pipes close or `timeout` runs out. A
    /// detached descendant holding a pipe open cuts collection short but
    /// keeps what was written before.
    pub fn run_foreground(
        &self,
        host: &dyn Host,
        cmd: Cmd,
        timeout: Duration,
    ) -> Result<ForegroundOutput, BenchError> {
        let wrapped = host.wrap(cmd);
        let mut command = wrapped.to_command();
        command
            .process_group(0)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let start = Instant::now();
        let mut child = command
            .spawn()
            .with_context(|| format!("spawn `{wrapped}`"))
            .map_err(|e| BenchError::command(host.name(), e))?;

        let stdout_rx = child.stdout.take().map(drain);
        let stderr_rx = child.stderr.take().map(drain);

        let deadline = start + timeout;
        let (exit_code, collect_deadline) = match wait_until(&mut child, deadline) {
            Some(status) => (status_code(status), deadline),
            None => {
                warn!(host = host.name(), cmd = %wrapped, ?timeout, "timed out, killing process group");
                signal_group(child.id(), libc::SIGKILL);
                if wait_until(&mut child, Instant::now() + self.kill_grace).is_none() {
                    let _ = child.kill();
                }
                // pipes of a reaped group close at once; pick up the tail
                (TIMEOUT_EXIT_CODE, Instant::now() + EXIT_POLL)
            }
        };
        let elapsed = start.elapsed();

        let output = ForegroundOutput {
            stdout: collect(stdout_rx, collect_deadline),
            stderr: collect(stderr_rx, collect_deadline),
            exit_code,
            elapsed,
        };
        debug!(host = host.name(), cmd = %wrapped, exit_code, elapsed = ?output.elapsed, "foreground done");
        Ok(output)
    }

    /// Stop the process `name` on `host`, if any.
    pub fn teardown(&mut self, host: &str, name: &str) {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.processes)
            .into_iter()
            .partition(|p| p.matches(host, name));
        self.processes = rest;
        stop_all(matching, self.kill_grace);
    }

    /// Stop every process on `host`.
    pub fn teardown_host(&mut self, host: &str) {
        let (matching, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.processes)
            .into_iter()
            .partition(|p| p.host == host);
        self.processes = rest;
        stop_all(matching, self.kill_grace);
    }

    /// Stop everything this coordinator started.
    pub fn teardown_all(&mut self) {
        let all = std::mem::take(&mut self.processes);
        stop_all(all, self.kill_grace);
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.teardown_all();
    }
}

/// SIGTERM every group, share one grace period, SIGKILL the survivors.
fn stop_all(mut handles: Vec<ProcessHandle>, grace: Duration) {
    if handles.is_empty() {
        return;
    }
    for h in handles.iter_mut() {
        if h.is_running() {
            signal_group(h.pid(), libc::SIGTERM);
        }
    }

    let deadline = Instant::now() + grace;
    for h in &mut handles {
        if wait_until(&mut h.child, deadline).is_some() {
            debug!(host = %h.host, name = %h.name, "stopped");
            continue;
        }
        warn!(host = %h.host, name = %h.name, pid = h.pid(), "did not exit on SIGTERM, killing");
        signal_group(h.pid(), libc::SIGKILL);
        if wait_until(&mut h.child, Instant::now() + grace).is_none() {
            let _ = h.child.kill();
            let _ = h.child.wait();
        }
    }
}

/// Kill processes named exactly `name` on `host` (orphans of a crashed run).
/// Returns whether anything matched.
pub fn kill_by_name(host: &dyn Host, name: &str) -> Result<bool, BenchError> {
    let out = host
        .exec(Cmd::new("pkill").args(["-x", name]))
        .map_err(|e| BenchError::command(host.name(), e))?;
    match out.status.code() {
        Some(0) => {
            info!(host = host.name(), name, "killed leftover processes");
            Ok(true)
        }
        Some(1) => Ok(false),
        _ => Err(BenchError::command(
            host.name(),
            anyhow::anyhow!(
                "pkill -x {name}: {}",
                String::from_utf8_lossy(&out.stderr).trim()
            ),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::LocalHost;

    fn sh(script: &str) -> Cmd {
        Cmd::new("sh").args(["-c", script])
    }

    #[test]
    fn wait_ready_returns_early() {
        let mut calls = 0;
        let took = wait_ready(
            || {
                calls += 1;
                calls >= 3
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .expect("ready");
        assert_eq!(calls, 3);
        assert!(took < Duration::from_secs(1), "{took:?}");
    }

    #[test]
    fn wait_ready_respects_bound() {
        let start = Instant::now();
        let res = wait_ready(|| false, Duration::from_millis(150), Duration::from_millis(40));
        let elapsed = start.elapsed();
        assert!(res.is_none());
        assert!(elapsed >= Duration::from_millis(150), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(400), "{elapsed:?}");
    }

    #[test]
    fn foreground_captures_output() {
        let coord = Coordinator::new();
        let out = coord
            .run_foreground(&LocalHost, sh("echo hello; echo oops >&2"), Duration::from_secs(5))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.stderr, "oops\n");
    }

    #[test]
    fn foreground_exit_code() {
        let coord = Coordinator::new();
        let out = coord
            .run_foreground(&LocalHost, sh("exit 3"), Duration::from_secs(5))
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.timed_out());
    }

    #[test]
    fn foreground_timeout_kills_group() {
        let coord = Coordinator::new().with_kill_grace(Duration::from_millis(500));
        let start = Instant::now();
        let out = coord
            .run_foreground(&LocalHost, sh("sleep 30 & sleep 30"), Duration::from_millis(200))
            .unwrap();
        assert_eq!(out.exit_code, TIMEOUT_EXIT_CODE);
        assert!(out.timed_out());
        assert!(start.elapsed() < Duration::from_secs(3), "{:?}", start.elapsed());
    }

    #[test]
    fn foreground_timeout_keeps_partial_output() {
        let coord = Coordinator::new().with_kill_grace(Duration::from_millis(500));
        let out = coord
            .run_foreground(&LocalHost, sh("echo partial; sleep 30"), Duration::from_millis(300))
            .unwrap();
        assert!(out.timed_out());
        assert_eq!(out.stdout, "partial\n");
    }

    #[test]
    fn held_pipe_does_not_outlast_timeout() {
        // the backgrounded sleep keeps stdout open after the shell exits
        let coord = Coordinator::new();
        let start = Instant::now();
        let out = coord
            .run_foreground(&LocalHost, sh("sleep 3 & echo measured"), Duration::from_millis(300))
            .unwrap();
        let wall = start.elapsed();
        assert!(out.success());
        assert_eq!(out.stdout, "measured\n");
        assert!(wall <= Duration::from_millis(600), "{wall:?}");
    }

    #[test]
    fn background_lifecycle() {
        let mut coord = Coordinator::new().with_kill_grace(Duration::from_millis(500));
        let pid = coord
            .spawn_background(&LocalHost, "sleeper", Cmd::new("sleep").arg("30"))
            .unwrap()
            .pid();
        assert!(pid > 0);
        assert_eq!(coord.processes().len(), 1);
        assert!(coord.get("local", "sleeper").is_some());

        coord.teardown("local", "sleeper");
        assert!(coord.processes().is_empty());

        // already gone: no-op
        coord.teardown("local", "sleeper");
    }

    #[test]
    fn teardown_mixes_exited_and_running() {
        let mut coord = Coordinator::new().with_kill_grace(Duration::from_millis(500));
        coord.spawn_background(&LocalHost, "done", sh("exit 0")).unwrap();
        coord
            .spawn_background(&LocalHost, "sleeper", Cmd::new("sleep").arg("30"))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        coord.teardown_all();
        assert!(coord.processes().is_empty());
        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
    }

    #[test]
    fn background_log_and_file_probe() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("ready");
        let mut coord = Coordinator::new().with_scratch_dir(dir.path());

        let script = format!("echo started; sleep 0.2; echo ok > {}; sleep 30", marker.display());
        coord.spawn_background(&LocalHost, "writer", sh(&script)).unwrap();

        let took = coord
            .await_ready(
                &LocalHost,
                "writer",
                &Probe::FileNonEmpty(marker),
                Duration::from_secs(5),
                Duration::from_millis(20),
            )
            .unwrap();
        assert!(took >= Duration::from_millis(150), "{took:?}");

        let log = coord.get("local", "writer").unwrap().log_path().unwrap().to_path_buf();
        coord.teardown_all();
        assert_eq!(std::fs::read_to_string(log).unwrap(), "started\n");
    }

    #[test]
    fn early_exit_is_reported() {
        let mut coord = Coordinator::new();
        coord.spawn_background(&LocalHost, "crasher", sh("exit 1")).unwrap();

        let err = coord
            .await_ready(
                &LocalHost,
                "crasher",
                &Probe::TcpListening(1),
                Duration::from_secs(5),
                Duration::from_millis(20),
            )
            .unwrap_err();
        assert!(!err.is_fatal());
        let msg = err.to_string();
        assert!(msg.contains("crasher on local"), "{msg}");
        assert!(msg.contains("exited"), "{msg}");
        match err {
            BenchError::ReadinessTimeout { waited, .. } => {
                assert!(waited < Duration::from_secs(5), "{waited:?}")
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn ss_output_parsing() {
        let ss = "LISTEN 0      128          0.0.0.0:1111       0.0.0.0:*\n\
                  LISTEN 0      128             [::]:2222          [::]:*\n\
                  UNCONN 0      0          127.0.0.1:33330      0.0.0.0:*\n";
        assert!(listening_on(ss, 1111));
        assert!(listening_on(ss, 2222));
        assert!(!listening_on(ss, 3333));
        assert!(listening_on(ss, 33330));
        assert!(!listening_on("", 80));
    }
}
