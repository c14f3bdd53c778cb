//! Agent Configuration Module
//!
//! Probes, remediation actions and the ambient services are described in
//! one TOML file. `.json` paths are read as JSON, in either the current
//! layout or the legacy `health_checks` / `failure_hooks` layout.
//!
//! ## Loading Order
//!
//! 1. `--config` CLI flag
//! 2. `ASG_AGENT_CONFIG` environment variable
//! 3. `/etc/asg-health-agent/config.toml`
//!
//! Unlike most settings files a missing config is fatal: an agent without
//! probes would report healthy forever.

mod agent_config;
pub mod defaults;
pub mod legacy;
pub mod validation;

pub use agent_config::*;
pub use validation::ValidationWarning;

use std::path::{Path, PathBuf};

/// Resolve the config path from the CLI flag, then the env var, then the
/// built-in default.
pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
    if let Some(p) = cli_path {
        return p.to_path_buf();
    }
    match std::env::var(defaults::CONFIG_ENV_VAR) {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => PathBuf::from(defaults::DEFAULT_CONFIG_PATH),
    }
}

/// Load, validate and fill host defaults.
///
/// Returns the config with any unknown-key warnings so the caller can log
/// them once logging is up.
pub fn load(path: &Path) -> Result<(AgentConfig, Vec<ValidationWarning>), ConfigError> {
    let (mut config, warnings) = AgentConfig::load_from_file_with_warnings(path)?;
    config.apply_host_defaults(&hostname());
    Ok((config, warnings))
}

/// Local hostname, or `"unknown"` when the OS cannot report one.
pub fn hostname() -> String {
    ::hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_path_wins() {
        let path = resolve_path(Some(Path::new("/tmp/agent.toml")));
        assert_eq!(path, PathBuf::from("/tmp/agent.toml"));
    }

    #[test]
    fn test_hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn test_hostname_matches_os_name() {
        let os_name = ::hostname::get().unwrap().to_string_lossy().into_owned();
        assert_eq!(hostname(), os_name);
    }
}
