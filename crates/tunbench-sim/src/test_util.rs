use std::sync::atomic::{AtomicU32, Ordering};

static PREFIX_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Generate a namespace prefix that is unique across parallel tests.
///
/// Combines prefix + PID + atomic counter and stays short enough that
/// `<prefix>-<host>` fits the 15-char netdev/netns naming limit. The
/// caller's prefix is shortened first; the PID and counter always survive.
pub fn unique_prefix(prefix: &str) -> String {
    let seq = PREFIX_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id() % 0xfff;
    let suffix = format!("{pid:x}{seq}");
    let keep = 10usize.saturating_sub(suffix.len());
    let head: String = prefix.chars().take(keep).collect();
    format!("{head}{suffix}")
}
