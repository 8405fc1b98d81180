//! Host capability discovery: privileges, tools, kernel modules.

use std::path::PathBuf;
use std::process::Command;

use crate::command::Cmd;

/// Returns `true` if the environment supports namespace-based labs
/// (requires the `ip` tool and passwordless `sudo`).
pub fn check_privileges() -> bool {
    let has_ip = Command::new("ip")
        .arg("netns")
        .output()
        .is_ok_and(|o| o.status.success());

    has_ip
        && Command::new("sudo")
            .args(["-n", "ip", "netns", "list"])
            .output()
            .is_ok_and(|o| o.status.success())
}

/// Locate a binary in `PATH`.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &std::path::Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Try to load `sch_netem`; `false` when the module is unavailable.
pub fn netem_available() -> bool {
    Cmd::new("sudo")
        .args(["-n", "modprobe", "sch_netem"])
        .output()
        .is_ok_and(|o| o.status.success())
}

/// Read a sysctl value as the driving host sees it.
pub fn read_sysctl(key: &str) -> Option<String> {
    let path = PathBuf::from("/proc/sys").join(key.replace('.', "/"));
    std::fs::read_to_string(path)
        .ok()
        .map(|v| v.trim().to_string())
}
