//! Legacy JSON config format
//!
//! Deployments that predate the TOML layout ship a `config.json` with
//! `health_checks`, `failure_hooks` and a `webserver` section. Such a
//! document is read into [`LegacyConfig`] and converted, so the same probes
//! and actions run whichever layout the file uses.

use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};

use super::agent_config::{
    AgentConfig, LogFormat, LoggingConfig, ProbeConfig, RemediationConfig, ServerConfig,
    StatsdConfig,
};
use super::defaults;
use super::validation::{self, ValidationWarning};

/// Top-level keys that only exist in the legacy layout.
const LEGACY_MARKERS: &[&str] = &[
    "health_checks",
    "failure_hooks",
    "webserver",
    "run_failure_hooks",
    "run_failure_hooks_on_term_signal",
    "exit_after_failure_hooks",
    "pretty_logs",
    "debug_logging",
    "logging_attributes",
];

/// True when a parsed JSON document uses the legacy layout.
pub fn is_legacy(raw: &serde_json::Value) -> bool {
    raw.as_object()
        .is_some_and(|map| LEGACY_MARKERS.iter().any(|k| map.contains_key(*k)))
}

/// Valid dotted key paths of the legacy layout.
pub fn legacy_config_keys() -> HashSet<&'static str> {
    let keys: &[&str] = &[
        "health_checks",
        "health_checks.name",
        "health_checks.description",
        "health_checks.command",
        "health_checks.arguments",
        "health_checks.frequency_in_seconds",
        "health_checks.allowed_failures",
        "health_checks.recovery_success_count",
        "failure_hooks",
        "failure_hooks.name",
        "failure_hooks.description",
        "failure_hooks.command",
        "failure_hooks.arguments",
        "failure_hooks.max_retry",
        "failure_hooks.seconds_between_retries",
        "startup_grace_seconds",
        "run_failure_hooks_on_term_signal",
        "run_failure_hooks",
        "exit_after_failure_hooks",
        "pretty_logs",
        "debug_logging",
        "logging_attributes",
        "webserver",
        "webserver.enabled",
        "webserver.address",
        "webserver.port",
        "webserver.use_tls",
        "webserver.cert_path",
        "webserver.key_path",
        "webserver.pretty_json_responses",
        "statsd",
        "statsd.enabled",
        "statsd.address",
        "statsd.port",
        "statsd.prefix",
        "statsd.default_tags",
    ];
    keys.iter().copied().collect()
}

// ============================================================================
// Legacy Structures
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LegacyConfig {
    pub health_checks: Vec<LegacyHealthCheck>,
    pub failure_hooks: Vec<LegacyFailureHook>,
    pub startup_grace_seconds: u64,
    pub run_failure_hooks_on_term_signal: bool,
    pub run_failure_hooks: bool,
    pub exit_after_failure_hooks: bool,
    pub pretty_logs: bool,
    pub debug_logging: bool,
    pub logging_attributes: BTreeMap<String, String>,
    pub webserver: LegacyWebServer,
    pub statsd: StatsdConfig,
}

impl Default for LegacyConfig {
    fn default() -> Self {
        Self {
            health_checks: Vec::new(),
            failure_hooks: Vec::new(),
            startup_grace_seconds: 0,
            run_failure_hooks_on_term_signal: false,
            run_failure_hooks: true,
            exit_after_failure_hooks: false,
            pretty_logs: false,
            debug_logging: false,
            logging_attributes: BTreeMap::new(),
            webserver: LegacyWebServer::default(),
            statsd: StatsdConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LegacyWebServer {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub use_tls: bool,
    pub cert_path: String,
    pub key_path: String,
    pub pretty_json_responses: bool,
}

impl Default for LegacyWebServer {
    fn default() -> Self {
        let server = ServerConfig::default();
        Self {
            enabled: server.enabled,
            address: server.address,
            port: server.port,
            use_tls: false,
            cert_path: String::new(),
            key_path: String::new(),
            pretty_json_responses: server.pretty_json,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LegacyHealthCheck {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default = "default_frequency")]
    pub frequency_in_seconds: u64,
    #[serde(default)]
    pub allowed_failures: u32,
    #[serde(default = "default_recovery_success_count")]
    pub recovery_success_count: u32,
}

fn default_frequency() -> u64 {
    defaults::PROBE_INTERVAL_SECS
}

fn default_recovery_success_count() -> u32 {
    defaults::PROBE_RECOVERY_SUCCESSES
}

#[derive(Debug, Deserialize)]
pub struct LegacyFailureHook {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub max_retry: u32,
    #[serde(default)]
    pub seconds_between_retries: u64,
}

// ============================================================================
// Conversion
// ============================================================================

impl From<LegacyConfig> for AgentConfig {
    fn from(legacy: LegacyConfig) -> Self {
        Self {
            startup_grace_seconds: legacy.startup_grace_seconds,
            run_remediation_on_signal: legacy.run_failure_hooks_on_term_signal,
            run_remediation_on_failure: legacy.run_failure_hooks,
            exit_after_remediation: legacy.exit_after_failure_hooks,
            logging: LoggingConfig {
                format: if legacy.pretty_logs {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                },
                debug: legacy.debug_logging,
                attributes: legacy.logging_attributes,
            },
            server: ServerConfig {
                enabled: legacy.webserver.enabled,
                address: legacy.webserver.address,
                port: legacy.webserver.port,
                pretty_json: legacy.webserver.pretty_json_responses,
            },
            statsd: legacy.statsd,
            probes: legacy
                .health_checks
                .into_iter()
                .map(|c| ProbeConfig {
                    name: c.name,
                    description: c.description,
                    command: c.command,
                    arguments: c.arguments,
                    interval_seconds: c.frequency_in_seconds,
                    allowed_failures: c.allowed_failures,
                    recovery_successes: c.recovery_success_count,
                })
                .collect(),
            remediations: legacy
                .failure_hooks
                .into_iter()
                .map(|h| RemediationConfig {
                    name: h.name,
                    description: h.description,
                    command: h.command,
                    arguments: h.arguments,
                    max_retry: h.max_retry,
                    retry_delay_seconds: h.seconds_between_retries,
                })
                .collect(),
        }
    }
}

/// Convert a legacy document, returning unknown-key warnings plus notes
/// for settings that no longer have an effect.
pub fn convert(
    raw: serde_json::Value,
) -> Result<(AgentConfig, Vec<ValidationWarning>), serde_json::Error> {
    let mut warnings = toml::Value::try_from(&raw)
        .map(|v| validation::unknown_key_warnings_for(&v, &legacy_config_keys()))
        .unwrap_or_default();

    let legacy: LegacyConfig = serde_json::from_value(raw)?;
    if legacy.webserver.use_tls {
        warnings.push(ValidationWarning {
            field: "webserver.use_tls".to_string(),
            message: "TLS is not supported, the status server serves plain HTTP".to_string(),
            suggestion: None,
        });
    }
    warnings.push(ValidationWarning {
        field: "health_checks".to_string(),
        message: "Legacy JSON layout in use, print the TOML equivalent with --show-config"
            .to_string(),
        suggestion: None,
    });

    Ok((legacy.into(), warnings))
}
