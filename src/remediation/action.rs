//! One remediation action with bounded retry

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::defaults::{FAULT_EXIT_CODE, NEVER_RUN_EXIT_CODE};
use crate::config::RemediationConfig;
use crate::process::CommandRunner;
use crate::telemetry::{tags, Attributes, SharedLogSink, SharedMetrics};

/// Final result of an action in the most recent sequence run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    #[default]
    Pending,
    Succeeded,
    Failed,
}

/// Point-in-time view of an action for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RemediationStatus {
    pub name: String,
    pub description: String,
    pub max_retry: u32,
    pub retry_delay_seconds: u64,
    pub attempts: u32,
    pub last_exit_code: i32,
    pub last_run_time: Option<DateTime<Utc>>,
    pub outcome: Outcome,
}

/// Result of [`RemediationAction::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionOutcome {
    pub name: String,
    pub attempts: u32,
    pub succeeded: bool,
}

#[derive(Debug)]
struct ActionState {
    attempts: u32,
    last_exit_code: i32,
    last_run_time: Option<DateTime<Utc>>,
    outcome: Outcome,
}

impl Default for ActionState {
    fn default() -> Self {
        Self {
            attempts: 0,
            last_exit_code: NEVER_RUN_EXIT_CODE,
            last_run_time: None,
            outcome: Outcome::Pending,
        }
    }
}

pub struct RemediationAction {
    config: RemediationConfig,
    state: Mutex<ActionState>,
}

impl RemediationAction {
    pub fn new(config: RemediationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(ActionState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Attempt the action up to `max_retry + 1` times, sleeping the retry
    /// delay before every attempt but the first. Never fails.
    pub async fn execute(
        &self,
        runner: &CommandRunner,
        log: &SharedLogSink,
        metrics: &SharedMetrics,
    ) -> ActionOutcome {
        let name = self.config.name.as_str();
        let max_attempts = self.config.max_retry.saturating_add(1);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = ActionState::default();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry_delay()).await;
            }

            log.info(
                "Running remediation attempt",
                Attributes::new()
                    .with("remediation", name)
                    .with("attempt", attempt)
                    .with("max_attempts", max_attempts),
            );

            let exit_code = match runner
                .run(name, &self.config.command, &self.config.arguments)
                .await
            {
                Ok(code) => code,
                Err(e) => {
                    log.error(
                        "Remediation run failed",
                        Attributes::new().with("remediation", name).with("error", e),
                    );
                    FAULT_EXIT_CODE
                }
            };
            let successful = exit_code == 0;

            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.attempts = attempt;
                state.last_exit_code = exit_code;
                state.last_run_time = Some(Utc::now());
                if successful {
                    state.outcome = Outcome::Succeeded;
                }
            }

            metrics.incr(
                "remediation_run",
                1,
                &tags(&[("name", name), ("successful", if successful { "true" } else { "false" })]),
            );

            let attrs = Attributes::new()
                .with("remediation", name)
                .with("attempt", attempt)
                .with("exit_code", exit_code);
            if successful {
                log.info("Remediation succeeded", attrs);
                return ActionOutcome {
                    name: name.to_string(),
                    attempts: attempt,
                    succeeded: true,
                };
            }
            log.warn("Remediation attempt failed", attrs);
        }

        self.state.lock().unwrap_or_else(|e| e.into_inner()).outcome = Outcome::Failed;
        log.warn(
            "Remediation exhausted all attempts",
            Attributes::new()
                .with("remediation", name)
                .with("attempts", max_attempts),
        );
        ActionOutcome {
            name: name.to_string(),
            attempts: max_attempts,
            succeeded: false,
        }
    }

    pub fn status(&self) -> RemediationStatus {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        RemediationStatus {
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            max_retry: self.config.max_retry,
            retry_delay_seconds: self.config.retry_delay_seconds,
            attempts: state.attempts,
            last_exit_code: state.last_exit_code,
            last_run_time: state.last_run_time,
            outcome: state.outcome,
        }
    }
}
