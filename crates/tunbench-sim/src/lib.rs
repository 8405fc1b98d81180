//! Network emulation toolkit for tunnel and transport benchmarks.
//!
//! Builds isolated virtual networks out of Linux network namespaces, shapes
//! the WAN segments with an HTB + `tc netem` hierarchy, and manages the
//! processes (tunnel endpoints, forwarders, load generators) that run on the
//! virtual hosts.
//!
//! # Modules
//!
//! - [`command`]: Typed command builder (no shell interpolation)
//! - [`host`]: The [`Host`] seam: where a command actually runs
//! - [`topology`]: Namespace management, chain/diamond topologies, connectivity check
//! - [`impairment`]: Bandwidth/delay/loss parsing, queue sizing, HTB + netem application
//! - [`process`]: Background/foreground process lifecycle and readiness polling
//! - [`system`]: Privilege and tool discovery
//! - [`error`]: Error taxonomy shared by the sweep driver

pub mod command;
pub mod error;
pub mod host;
pub mod impairment;
pub mod process;
pub mod system;
pub mod test_util;
pub mod topology;

pub use command::Cmd;
pub use error::BenchError;
pub use host::{Host, LocalHost};
pub use impairment::{
    Bandwidth, ImpairmentProfile, QueueBasis, QueueSize, apply_impairment, apply_to_segment,
    auto_queue_packets,
};
pub use process::{
    Coordinator, ForegroundOutput, ProcessHandle, Probe, TIMEOUT_EXIT_CODE, wait_ready,
};
pub use system::{check_binary, check_privileges};
pub use topology::{Namespace, Topology, TopologyShape, TopologySpec};
