//! End-to-end check on a real chain topology: an HTTP transfer from h2 to
//! h1 across the WAN segment shaped at 10000kbit / 50ms must arrive
//! byte-identical and measurably slower than the same transfer unshaped,
//! and re-applying the profile must install the same queue.
//!
//! Needs passwordless sudo, `ip`, `tc` and `busybox`; skipped otherwise.

use std::time::Duration;

use tunbench_sim::test_util::unique_prefix;
use tunbench_sim::{
    Cmd, Coordinator, ForegroundOutput, ImpairmentProfile, Probe, Topology, TopologySpec,
    apply_to_segment, check_binary, check_privileges,
};

const PAYLOAD_LEN: usize = 256 * 1024;

fn skip_reason() -> Option<&'static str> {
    if !check_privileges() {
        return Some("insufficient privileges");
    }
    if check_binary("busybox").is_none() {
        return Some("busybox not in PATH");
    }
    if !tunbench_sim::system::netem_available() {
        return Some("sch_netem not available");
    }
    None
}

fn fetch(coord: &Coordinator, topo: &Topology) -> ForegroundOutput {
    coord
        .run_foreground(
            topo.client(),
            Cmd::new("busybox").args(["wget", "-q", "-O", "-", "http://7.7.7.7:8080/blob"]),
            Duration::from_secs(30),
        )
        .expect("run wget")
}

#[test]
fn chain_transfer_matches_baseline() {
    if let Some(reason) = skip_reason() {
        eprintln!("Skipping: {reason}");
        return;
    }
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let www = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..PAYLOAD_LEN).map(|i| b'a' + (i % 26) as u8).collect();
    std::fs::write(www.path().join("blob"), &payload).unwrap();

    let spec = TopologySpec::chain().with_prefix(unique_prefix("e2e"));
    let topo = Topology::build(spec).expect("build chain");
    topo.verify_connectivity().expect("connectivity");

    let mut coord = Coordinator::new();
    let server = topo.server();
    let www_dir = www.path().to_string_lossy().into_owned();
    coord
        .spawn_background(
            server,
            "httpd",
            Cmd::new("busybox").args(["httpd", "-f", "-p", "8080", "-h", &www_dir]),
        )
        .expect("start httpd");
    coord
        .await_ready(
            server,
            "httpd",
            &Probe::TcpListening(8080),
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .expect("httpd ready");

    let baseline = fetch(&coord, &topo);
    assert!(baseline.success(), "unshaped wget failed: {}", baseline.stderr);
    assert_eq!(baseline.stdout.as_bytes(), &payload[..]);

    let profile = ImpairmentProfile::parse("10000kbit", "50ms", "0ms", "0%", None).unwrap();
    let queue = apply_to_segment(&topo, "wan", &profile).expect("shape wan");
    assert_eq!(queue, 125);
    let again = apply_to_segment(&topo, "wan", &profile).expect("reshape wan");
    assert_eq!(again, queue);

    let shaped = fetch(&coord, &topo);
    assert!(shaped.success(), "shaped wget failed: {}", shaped.stderr);
    assert_eq!(shaped.stdout.len(), PAYLOAD_LEN);
    assert_eq!(shaped.stdout.as_bytes(), &payload[..]);
    // at least one 100 ms round trip, and 2 Mbit of payload at 10 Mbit/s
    assert!(shaped.elapsed >= Duration::from_millis(200), "{:?}", shaped.elapsed);
    assert!(
        shaped.elapsed > baseline.elapsed,
        "shaped {:?} vs unshaped {:?}",
        shaped.elapsed,
        baseline.elapsed
    );

    coord.teardown_all();
    topo.teardown();
}
