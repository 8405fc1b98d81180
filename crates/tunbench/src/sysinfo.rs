//! The "system description" block at the top of every result log.

use std::path::Path;

use chrono::Local;
use tunbench_sim::{Cmd, Host, LocalHost};

const TCP_SYSCTL_DIR: &str = "/proc/sys/net/ipv4";
const TCP_PREFIX: &str = "tcp_";

/// Date, kernel, and every `net.ipv4.tcp_*` sysctl (prefix stripped).
pub fn describe_system() -> Vec<String> {
    let mut lines = vec![format!("date: {}", Local::now().format("%Y-%m-%d %H:%M:%S%.6f"))];

    let kernel = LocalHost
        .exec(Cmd::new("uname").arg("-sr"))
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .unwrap_or_else(|| "unknown".into());
    lines.push(format!("system information: {kernel}"));
    lines.push(String::new());

    lines.push("sysctl TCP: ".into());
    lines.extend(tcp_sysctls(Path::new(TCP_SYSCTL_DIR)));
    lines.push(String::new());
    lines
}

/// `name = value` for every `tcp_*` entry under `dir`, sorted by name.
fn tcp_sysctls(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut out: Vec<(String, String)> = entries
        .filter_map(Result::ok)
        .filter_map(|e| {
            let name = e.file_name().to_str()?.strip_prefix(TCP_PREFIX)?.to_string();
            let value = std::fs::read_to_string(e.path()).ok()?;
            Some((name, value.split_whitespace().collect::<Vec<_>>().join("\t")))
        })
        .collect();
    out.sort();
    out.into_iter().map(|(k, v)| format!("{k} = {v}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_prefix_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("tcp_rmem"), "4096\t131072  6291456\n").unwrap();
        std::fs::write(dir.path().join("tcp_ecn"), "2\n").unwrap();
        std::fs::write(dir.path().join("ip_forward"), "1\n").unwrap();

        assert_eq!(
            tcp_sysctls(dir.path()),
            ["ecn = 2", "rmem = 4096\t131072\t6291456"]
        );
    }

    #[test]
    fn missing_dir_is_empty() {
        assert!(tcp_sysctls(Path::new("/no/such/sysctl/dir")).is_empty());
    }

    #[test]
    fn description_has_header_lines() {
        let lines = describe_system();
        assert!(lines[0].starts_with("date: "));
        assert!(lines[1].starts_with("system information: "));
        assert!(lines.iter().any(|l| l == "sysctl TCP: "));
    }
}
