//! System-wide default constants.
//!
//! Grouped by subsystem for easy discovery.

// ============================================================================
// Config Loading
// ============================================================================

/// Environment variable naming the config file when `--config` is absent.
pub const CONFIG_ENV_VAR: &str = "ASG_AGENT_CONFIG";

/// Config path used when neither `--config` nor the env var is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/asg-health-agent/config.toml";

// ============================================================================
// Probes
// ============================================================================

/// Probe run interval when `interval_seconds` is omitted (seconds).
pub const PROBE_INTERVAL_SECS: u64 = 10;

/// Shortest tick period a probe loop accepts (milliseconds). A zero
/// `interval_seconds` from an unvalidated config is raised to this.
pub const MIN_PROBE_PERIOD_MS: u64 = 1;

/// Consecutive successes needed to declare a stable recovery.
pub const PROBE_RECOVERY_SUCCESSES: u32 = 1;

/// `last_exit_code` reported for a probe or action that has never run.
pub const NEVER_RUN_EXIT_CODE: i32 = -1;

/// Exit code reported for a child that died without a usable status,
/// or whose run could not be started or awaited.
pub const FAULT_EXIT_CODE: i32 = 1;

/// Per-task stable-failure channel depth.
///
/// At most one notice is outstanding per failure streak.
pub const PROBE_NOTICE_CHANNEL_CAPACITY: usize = 1;

/// Outward stable-failure channel depth (engine to state manager).
pub const FAILURE_CHANNEL_CAPACITY: usize = 16;

/// How long to keep draining child output after the child has exited
/// (milliseconds). Grandchildren holding the pipe open are not waited on
/// past this bound.
pub const OUTPUT_DRAIN_TIMEOUT_MS: u64 = 1_000;

// ============================================================================
// State Manager
// ============================================================================

/// Liveness heartbeat gauge interval (seconds).
pub const HEARTBEAT_INTERVAL_SECS: u64 = 5;

/// Upper bound (exclusive) of the random heartbeat gauge value.
pub const HEARTBEAT_VALUE_MAX: i64 = 100;

// ============================================================================
// Status Server
// ============================================================================

pub const SERVER_ADDRESS: &str = "0.0.0.0";

pub const SERVER_PORT: u16 = 8011;

/// Graceful shutdown bound before the server task is aborted (seconds).
pub const SERVER_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Namespace prepended to every series on `/metrics`.
pub const PROMETHEUS_NAMESPACE: &str = "asg_healthcheck";

// ============================================================================
// StatsD
// ============================================================================

pub const STATSD_ADDRESS: &str = "127.0.0.1";

pub const STATSD_PORT: u16 = 8125;

pub const STATSD_PREFIX: &str = "asg_healthcheck";
