//! Health probes
//!
//! - [`hysteresis`]: pure failure/recovery counters
//! - [`task`]: one probe's periodic scheduler and runtime state
//! - [`engine`]: owns every task and fans their failure notices into one channel

pub mod engine;
pub mod hysteresis;
pub mod task;

pub use engine::{CommandProbeEngine, ProbeEngine};
pub use hysteresis::{Hysteresis, Transition};
pub use task::{ProbeRuntime, ProbeTask};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Emitted once per failure streak when a probe crosses its allowance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureNotice {
    pub probe: String,
    pub exit_code: i32,
    pub failures_since_recovery: u32,
}

/// Point-in-time view of a probe for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatus {
    pub name: String,
    pub description: String,
    /// -1 until the first run.
    pub last_exit_code: i32,
    pub last_run_time: Option<DateTime<Utc>>,
    pub failure_count: u64,
    pub failures_since_last_recovery: u32,
    pub recovery_attempt: u32,
    pub interval_seconds: u64,
    pub allowed_failures: u32,
    pub recovery_successes_required: u32,
    pub grace_mode: bool,
    pub running: bool,
}
