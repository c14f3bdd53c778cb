//! Remediation engine
//!
//! Runs the configured actions strictly in order, one at a time. An action
//! that exhausts its retries is logged and skipped; the sequence always runs
//! to the end and never reports an error to the caller.

mod action;

pub use action::{ActionOutcome, Outcome, RemediationAction, RemediationStatus};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::config::RemediationConfig;
use crate::process::CommandRunner;
use crate::telemetry::{Attributes, SharedLogSink, SharedMetrics};

/// Per-action results of one sequence run, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemediationReport {
    pub outcomes: Vec<ActionOutcome>,
}

impl RemediationReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.succeeded)
    }

    pub fn failed(&self) -> impl Iterator<Item = &ActionOutcome> {
        self.outcomes.iter().filter(|o| !o.succeeded)
    }
}

/// Ordered remediation sequence.
#[async_trait]
pub trait RemediationEngine: Send + Sync {
    /// Run every action in order. Concurrent calls are serialized.
    async fn run_all(&self) -> RemediationReport;

    fn snapshot(&self) -> Vec<RemediationStatus>;
}

/// [`RemediationEngine`] running each action as an external command.
pub struct CommandRemediationEngine {
    actions: Vec<RemediationAction>,
    runner: CommandRunner,
    log: SharedLogSink,
    metrics: SharedMetrics,
    run_lock: Mutex<()>,
}

impl CommandRemediationEngine {
    pub fn new(
        remediations: &[RemediationConfig],
        runner: CommandRunner,
        log: SharedLogSink,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            actions: remediations
                .iter()
                .cloned()
                .map(RemediationAction::new)
                .collect(),
            runner,
            log,
            metrics,
            run_lock: Mutex::new(()),
        }
    }
}

#[async_trait]
impl RemediationEngine for CommandRemediationEngine {
    async fn run_all(&self) -> RemediationReport {
        let _running = self.run_lock.lock().await;

        self.log.info(
            "Starting remediation sequence",
            Attributes::new().with("actions", self.actions.len()),
        );

        let mut report = RemediationReport::default();
        for action in &self.actions {
            report
                .outcomes
                .push(action.execute(&self.runner, &self.log, &self.metrics).await);
        }

        let failed = report.failed().count();
        let attrs = Attributes::new()
            .with("actions", report.outcomes.len())
            .with("failed", failed);
        if failed == 0 {
            self.log.info("Remediation sequence complete", attrs);
        } else {
            self.log
                .warn("Remediation sequence complete with failures", attrs);
        }
        report
    }

    fn snapshot(&self) -> Vec<RemediationStatus> {
        self.actions.iter().map(RemediationAction::status).collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
