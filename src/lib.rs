//! ASG Health Agent: sidecar health checks for auto scaling group instances
//!
//! Runs external probe commands on independent schedules, turns their exit
//! codes into a single stable-failure signal, and runs ordered remediation
//! commands before the instance is replaced.
//!
//! ## Architecture
//!
//! - **Process Runner**: spawns one command, logs its output, returns the exit code
//! - **Probe Engine**: one scheduler per probe with failure/recovery hysteresis
//! - **Remediation Engine**: ordered actions with bounded retry
//! - **State Manager**: grace period, one-way healthy flag, heartbeat
//! - **Lifecycle Orchestrator**: signal / failure / fault driven shutdown
//! - **Status Server**: `/_status` and `/metrics`

pub mod api;
pub mod config;
pub mod lifecycle;
pub mod probe;
pub mod process;
pub mod remediation;
pub mod state;
pub mod telemetry;

pub use config::AgentConfig;
pub use lifecycle::{Orchestrator, ShutdownCause};
pub use probe::{CommandProbeEngine, FailureNotice, ProbeEngine, ProbeStatus};
pub use remediation::{CommandRemediationEngine, RemediationEngine, RemediationStatus};
pub use state::{AgentStatus, RemediationPolicy, StateManager};
