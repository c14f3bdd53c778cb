//! Agent Configuration - probes, remediations and the ambient services
//!
//! Every section is optional. Each struct implements `Default` with the
//! documented values so an empty file yields a runnable (if idle) agent.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::defaults;
use super::legacy;
use super::validation::{self, ValidationWarning};

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration of the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Seconds after start during which probe results are recorded but
    /// never evaluated. 0 disables the grace window.
    #[serde(default)]
    pub startup_grace_seconds: u64,

    /// Run the remediation sequence when stopped by a termination signal.
    #[serde(default)]
    pub run_remediation_on_signal: bool,

    /// Run the remediation sequence on the healthy to unhealthy transition.
    #[serde(default = "default_true")]
    pub run_remediation_on_failure: bool,

    /// Exit with a failure status once remediation after a stable failure
    /// has completed. When false the agent idles, reporting unhealthy.
    #[serde(default)]
    pub exit_after_remediation: bool,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub statsd: StatsdConfig,

    #[serde(default)]
    pub probes: Vec<ProbeConfig>,

    #[serde(default)]
    pub remediations: Vec<RemediationConfig>,
}

fn default_true() -> bool {
    true
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            startup_grace_seconds: 0,
            run_remediation_on_signal: false,
            run_remediation_on_failure: true,
            exit_after_remediation: false,
            logging: LoggingConfig::default(),
            server: ServerConfig::default(),
            statsd: StatsdConfig::default(),
            probes: Vec::new(),
            remediations: Vec::new(),
        }
    }
}

impl AgentConfig {
    pub fn startup_grace(&self) -> Duration {
        Duration::from_secs(self.startup_grace_seconds)
    }

    /// Load from a specific file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let (config, _warnings) = Self::load_from_file_with_warnings(path)?;
        Ok(config)
    }

    /// Load from a specific file path, also returning unknown-key warnings.
    ///
    /// Paths ending in `.json` are parsed as JSON, everything else as TOML.
    /// The result is validated before it is returned.
    pub fn load_from_file_with_warnings(
        path: &Path,
    ) -> Result<(Self, Vec<ValidationWarning>), ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        let (config, warnings) = if is_json {
            Self::from_json_str(&contents).map_err(|e| ConfigError::Json(path.to_path_buf(), e))?
        } else {
            Self::from_toml_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?
        };

        config.validate()?;
        Ok((config, warnings))
    }

    /// Parse a TOML document without validating it.
    pub fn from_toml_str(
        contents: &str,
    ) -> Result<(Self, Vec<ValidationWarning>), toml::de::Error> {
        let warnings = validation::validate_unknown_keys(contents);
        let config: Self = toml::from_str(contents)?;
        Ok((config, warnings))
    }

    /// Parse a JSON document without validating it.
    ///
    /// Documents in the legacy layout (`health_checks`, `failure_hooks`,
    /// `webserver`) are converted.
    pub fn from_json_str(
        contents: &str,
    ) -> Result<(Self, Vec<ValidationWarning>), serde_json::Error> {
        let raw: serde_json::Value = serde_json::from_str(contents)?;
        if legacy::is_legacy(&raw) {
            return legacy::convert(raw);
        }
        // JSON nulls have no TOML form; skip key checks rather than fail.
        let warnings = toml::Value::try_from(&raw)
            .map(|v| validation::unknown_key_warnings(&v))
            .unwrap_or_default();
        let config: Self = serde_json::from_value(raw)?;
        Ok((config, warnings))
    }

    /// Fill host-derived defaults: a `hostname` log attribute and a
    /// `source` statsd tag, each only when its map was left empty.
    pub fn apply_host_defaults(&mut self, hostname: &str) {
        if self.logging.attributes.is_empty() {
            self.logging
                .attributes
                .insert("hostname".to_string(), hostname.to_string());
        }
        if self.statsd.default_tags.is_empty() {
            self.statsd
                .default_tags
                .insert("source".to_string(), hostname.to_string());
        }
    }

    /// Serialize config to a TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate the config, collecting every problem before failing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let mut seen = HashSet::new();
        for (i, probe) in self.probes.iter().enumerate() {
            if probe.name.trim().is_empty() {
                errors.push(format!("probes[{i}].name must not be empty"));
            } else if !seen.insert(probe.name.as_str()) {
                errors.push(format!("probes[{i}].name '{}' is not unique", probe.name));
            }
            if probe.command.trim().is_empty() {
                errors.push(format!("probes[{i}].command must not be empty"));
            }
            if probe.interval_seconds == 0 {
                errors.push(format!("probes[{i}].interval_seconds must be > 0"));
            }
        }

        let mut seen = HashSet::new();
        for (i, action) in self.remediations.iter().enumerate() {
            if action.name.trim().is_empty() {
                errors.push(format!("remediations[{i}].name must not be empty"));
            } else if !seen.insert(action.name.as_str()) {
                errors.push(format!(
                    "remediations[{i}].name '{}' is not unique",
                    action.name
                ));
            }
            if action.command.trim().is_empty() {
                errors.push(format!("remediations[{i}].command must not be empty"));
            }
        }

        if self.server.enabled && self.server.port == 0 {
            errors.push("server.port must be > 0".to_string());
        }

        if self.statsd.enabled {
            if self.statsd.port == 0 {
                errors.push("statsd.port must be > 0".to_string());
            }
            if self.statsd.prefix.trim().is_empty() {
                errors.push("statsd.prefix must not be empty when statsd is enabled".to_string());
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Output format of the `tracing` subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
    Compact,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Lower the default filter to `debug` (RUST_LOG still wins).
    #[serde(default)]
    pub debug: bool,

    /// Attributes attached to every log event.
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

// ============================================================================
// Status Server
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_server_address")]
    pub address: String,

    #[serde(default = "default_server_port")]
    pub port: u16,

    /// Indent the `/_status` JSON body.
    #[serde(default = "default_true")]
    pub pretty_json: bool,
}

fn default_server_address() -> String {
    defaults::SERVER_ADDRESS.to_string()
}

fn default_server_port() -> u16 {
    defaults::SERVER_PORT
}

impl ServerConfig {
    /// `address:port` as passed to the listener.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_server_address(),
            port: default_server_port(),
            pretty_json: true,
        }
    }
}

// ============================================================================
// StatsD
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsdConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_statsd_address")]
    pub address: String,

    #[serde(default = "default_statsd_port")]
    pub port: u16,

    #[serde(default = "default_statsd_prefix")]
    pub prefix: String,

    /// Tags appended to every metric.
    #[serde(default)]
    pub default_tags: BTreeMap<String, String>,
}

fn default_statsd_address() -> String {
    defaults::STATSD_ADDRESS.to_string()
}

fn default_statsd_port() -> u16 {
    defaults::STATSD_PORT
}

fn default_statsd_prefix() -> String {
    defaults::STATSD_PREFIX.to_string()
}

impl StatsdConfig {
    pub fn target_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_statsd_address(),
            port: default_statsd_port(),
            prefix: default_statsd_prefix(),
            default_tags: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Probes
// ============================================================================

/// One periodic health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Executable path (resolved through `PATH` when not absolute).
    pub command: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    #[serde(default = "default_probe_interval")]
    pub interval_seconds: u64,

    /// Failures tolerated in a streak; one more is a stable failure.
    #[serde(default)]
    pub allowed_failures: u32,

    /// Consecutive successes that end a failure streak.
    #[serde(default = "default_recovery_successes")]
    pub recovery_successes: u32,
}

fn default_probe_interval() -> u64 {
    defaults::PROBE_INTERVAL_SECS
}

fn default_recovery_successes() -> u32 {
    defaults::PROBE_RECOVERY_SUCCESSES
}

impl ProbeConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            arguments: Vec::new(),
            interval_seconds: defaults::PROBE_INTERVAL_SECS,
            allowed_failures: 0,
            recovery_successes: defaults::PROBE_RECOVERY_SUCCESSES,
        }
    }

    #[must_use]
    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_thresholds(mut self, allowed_failures: u32, recovery_successes: u32) -> Self {
        self.allowed_failures = allowed_failures;
        self.recovery_successes = recovery_successes;
        self
    }

    #[must_use]
    pub fn with_interval_seconds(mut self, interval_seconds: u64) -> Self {
        self.interval_seconds = interval_seconds;
        self
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

// ============================================================================
// Remediations
// ============================================================================

/// One ordered remediation action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    pub command: String,

    #[serde(default)]
    pub arguments: Vec<String>,

    /// Extra attempts after the first failure.
    #[serde(default)]
    pub max_retry: u32,

    /// Pause before each retry (never before the first attempt).
    #[serde(default)]
    pub retry_delay_seconds: u64,
}

impl RemediationConfig {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            command: command.into(),
            arguments: Vec::new(),
            max_retry: 0,
            retry_delay_seconds: 0,
        }
    }

    #[must_use]
    pub fn with_arguments<I, S>(mut self, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.arguments = arguments.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_retry(mut self, max_retry: u32, retry_delay_seconds: u64) -> Self {
        self.max_retry = max_retry;
        self.retry_delay_seconds = retry_delay_seconds;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_seconds)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Config I/O error ({}): {}", .0.display(), .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Config parse error ({}): {}", .0.display(), .1)]
    Parse(PathBuf, #[source] toml::de::Error),

    #[error("Config JSON parse error ({}): {}", .0.display(), .1)]
    Json(PathBuf, #[source] serde_json::Error),

    #[error("Config serialization error: {0}")]
    Serialize(#[source] toml::ser::Error),

    #[error("Config validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// Tests
// ============================================================================
