//! ASG Health Agent
//!
//! Sidecar that probes instance health and prepares a failed instance for
//! replacement by its auto scaling group.
//!
//! # Usage
//!
//! ```bash
//! # Run with the default config search order
//! asg-health-agent
//!
//! # Run with an explicit config file
//! asg-health-agent --config /etc/asg-health-agent/config.toml
//!
//! # Print the effective configuration and exit
//! asg-health-agent --config ./agent.toml --show-config
//! ```
//!
//! # Environment Variables
//!
//! - `ASG_AGENT_CONFIG`: config path when `--config` is not given
//! - `RUST_LOG`: log filter (default: info, or debug with `logging.debug`)

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use asg_health_agent::config::{self, AgentConfig};
use asg_health_agent::lifecycle::{shutdown_signal, Orchestrator};
use asg_health_agent::telemetry::{
    self, Attributes, FanoutMetrics, MetricsRegistry, SharedLogSink, SharedMetrics, StatsdSink,
    TracingLogSink,
};

// ============================================================================
// CLI Arguments
// ============================================================================

#[derive(Parser, Debug)]
#[command(name = "asg-health-agent")]
#[command(about = "Sidecar health-check agent for auto scaling group instances")]
#[command(version)]
struct CliArgs {
    /// Path to the config file (TOML, or JSON when the name ends in .json)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Print the effective configuration as TOML and exit
    #[arg(short, long)]
    show_config: bool,
}

// ============================================================================
// Telemetry Wiring
// ============================================================================

fn build_metrics(config: &AgentConfig, registry: &Arc<MetricsRegistry>) -> SharedMetrics {
    let mut fanout = FanoutMetrics::new(vec![registry.clone() as SharedMetrics]);

    if config.statsd.enabled {
        let target = config.statsd.target_addr();
        match StatsdSink::connect(
            &target,
            &config.statsd.prefix,
            config.statsd.default_tags.clone(),
        ) {
            Ok(sink) => {
                info!(target = %target, prefix = %config.statsd.prefix, "StatsD metrics enabled");
                fanout.push(Arc::new(sink));
            }
            Err(e) => warn!(target = %target, error = %e, "StatsD unavailable, metrics stay local"),
        }
    }

    Arc::new(fanout)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = CliArgs::parse();

    let path = config::resolve_path(args.config.as_deref());
    let (config, warnings) = config::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    if args.show_config {
        print!("{}", config.to_toml().context("Failed to render config")?);
        return Ok(ExitCode::SUCCESS);
    }

    telemetry::init_tracing(&config.logging);
    for warning in &warnings {
        warn!(field = %warning.field, "{}", warning);
    }
    info!(
        config = %path.display(),
        probes = config.probes.len(),
        remediations = config.remediations.len(),
        "Configuration loaded"
    );

    let registry = Arc::new(MetricsRegistry::new());
    let metrics = build_metrics(&config, &registry);
    let log: SharedLogSink = Arc::new(TracingLogSink::new(
        config.logging.attributes.iter().collect::<Attributes>(),
    ));

    let orchestrator = Orchestrator::from_config(&config, log, metrics, registry);
    let cause = orchestrator.run(shutdown_signal()).await;

    Ok(ExitCode::from(cause.exit_code()))
}
