//! Lifecycle orchestrator
//!
//! Starts the state manager and the status server, then waits for the
//! first of three terminal conditions and drives one shutdown sequence:
//!
//! - termination signal: stop with signal remediation, exit 0
//! - stable failure completed: stop probes, then exit 1 or idle unhealthy
//! - infrastructure fault (status server bind/serve): stop, exit 1

mod signals;

pub use signals::shutdown_signal;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::api::{create_app, ApiState, StatusServer};
use crate::config::defaults::SERVER_SHUTDOWN_GRACE_SECS;
use crate::config::{AgentConfig, ServerConfig};
use crate::probe::CommandProbeEngine;
use crate::process::CommandRunner;
use crate::remediation::CommandRemediationEngine;
use crate::state::{RemediationPolicy, StateManager};
use crate::telemetry::{Attributes, MetricsRegistry, SharedLogSink, SharedMetrics, Tags};

/// Why the agent stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownCause {
    Signal,
    StableFailure { probe: String },
    InfrastructureFault(String),
}

impl ShutdownCause {
    /// Process exit status: 0 for a signal, 1 otherwise.
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownCause::Signal => 0,
            ShutdownCause::StableFailure { .. } | ShutdownCause::InfrastructureFault(_) => 1,
        }
    }
}

/// Orchestrator knobs taken from the config.
#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub startup_grace: Duration,
    pub exit_after_remediation: bool,
    pub server: ServerConfig,
    pub server_shutdown_grace: Duration,
}

impl From<&AgentConfig> for LifecycleSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            startup_grace: config.startup_grace(),
            exit_after_remediation: config.exit_after_remediation,
            server: config.server.clone(),
            server_shutdown_grace: Duration::from_secs(SERVER_SHUTDOWN_GRACE_SECS),
        }
    }
}

pub struct Orchestrator {
    settings: LifecycleSettings,
    state: Arc<StateManager>,
    registry: Arc<MetricsRegistry>,
    log: SharedLogSink,
    metrics: SharedMetrics,
}

impl Orchestrator {
    pub fn new(
        settings: LifecycleSettings,
        state: Arc<StateManager>,
        registry: Arc<MetricsRegistry>,
        log: SharedLogSink,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            settings,
            state,
            registry,
            log,
            metrics,
        }
    }

    /// Wire command-backed engines from the config.
    pub fn from_config(
        config: &AgentConfig,
        log: SharedLogSink,
        metrics: SharedMetrics,
        registry: Arc<MetricsRegistry>,
    ) -> Self {
        let runner = CommandRunner::new(Arc::clone(&log));
        let probes = CommandProbeEngine::new(&config.probes, &runner, Arc::clone(&log), &metrics);
        let remediation = CommandRemediationEngine::new(
            &config.remediations,
            runner,
            Arc::clone(&log),
            Arc::clone(&metrics),
        );
        let state = StateManager::new(
            Arc::new(probes),
            Arc::new(remediation),
            RemediationPolicy::from(config),
            Arc::clone(&log),
            Arc::clone(&metrics),
        );
        Self::new(
            LifecycleSettings::from(config),
            Arc::new(state),
            registry,
            log,
            metrics,
        )
    }

    pub fn state(&self) -> Arc<StateManager> {
        Arc::clone(&self.state)
    }

    /// Run until a terminal condition and return what ended the run.
    ///
    /// `shutdown` resolves on an OS termination signal.
    pub async fn run<F>(self, shutdown: F) -> ShutdownCause
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        self.metrics.incr("starting", 1, &Tags::new());

        let mut completion = self.state.start(self.settings.startup_grace);
        let mut server = match self.start_server().await {
            Ok(server) => server,
            Err(e) => {
                return self.finish(None, ShutdownCause::InfrastructureFault(e)).await;
            }
        };

        self.log.info(
            "Agent started",
            Attributes::new()
                .with("grace_seconds", self.settings.startup_grace.as_secs())
                .with("server_enabled", server.is_some()),
        );

        let cause = tokio::select! {
            biased;
            () = &mut shutdown => {
                self.state.stop(true).await;
                ShutdownCause::Signal
            }
            Ok(notice) = &mut completion => {
                self.state.stop(false).await;
                if self.settings.exit_after_remediation {
                    ShutdownCause::StableFailure { probe: notice.probe }
                } else {
                    self.log.warn(
                        "Stable failure handled, idling until terminated",
                        Attributes::new().with("probe", &notice.probe),
                    );
                    tokio::select! {
                        biased;
                        () = &mut shutdown => {
                            self.state.stop(true).await;
                            ShutdownCause::Signal
                        }
                        reason = server_exit(&mut server) => ShutdownCause::InfrastructureFault(reason),
                    }
                }
            }
            reason = server_exit(&mut server) => ShutdownCause::InfrastructureFault(reason),
        };

        self.finish(server, cause).await
    }

    async fn start_server(&self) -> Result<Option<StatusServer>, String> {
        if !self.settings.server.enabled {
            self.log.info("Status server disabled", Attributes::new());
            return Ok(None);
        }
        let app = create_app(ApiState::new(
            Arc::clone(&self.state),
            Arc::clone(&self.registry),
            self.settings.server.pretty_json,
        ));
        StatusServer::start(&self.settings.server.bind_addr(), app)
            .await
            .map(Some)
            .map_err(|e| e.to_string())
    }

    async fn finish(&self, server: Option<StatusServer>, cause: ShutdownCause) -> ShutdownCause {
        if let ShutdownCause::InfrastructureFault(reason) = &cause {
            self.log.error(
                "Infrastructure fault",
                Attributes::new().with("error", reason),
            );
            self.state.stop(false).await;
        }
        if let Some(server) = server {
            server.stop(self.settings.server_shutdown_grace).await;
        }

        self.metrics.incr("stopping", 1, &Tags::new());
        self.log.info(
            "Agent stopped",
            Attributes::new()
                .with("cause", format!("{cause:?}"))
                .with("exit_code", cause.exit_code()),
        );
        cause
    }
}

async fn server_exit(server: &mut Option<StatusServer>) -> String {
    match server {
        Some(server) => server.exited().await,
        None => std::future::pending().await,
    }
}
