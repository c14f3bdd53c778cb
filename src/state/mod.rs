//! State manager
//!
//! Owns the probe and remediation engines and the single `healthy` flag.
//! The flag only ever goes from `true` to `false`, on the first stable
//! failure notice; later notices are ignored.
//!
//! Background activities:
//! - grace timer: takes the probes out of grace mode after the startup window
//! - failure listener: applies the healthy to unhealthy transition
//! - heartbeat: a liveness gauge on a fixed interval

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::defaults::{FAILURE_CHANNEL_CAPACITY, HEARTBEAT_INTERVAL_SECS, HEARTBEAT_VALUE_MAX};
use crate::config::AgentConfig;
use crate::probe::{FailureNotice, ProbeEngine, ProbeStatus};
use crate::remediation::{RemediationEngine, RemediationStatus};
use crate::telemetry::{tags, Attributes, SharedLogSink, SharedMetrics};

/// When the remediation sequence runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemediationPolicy {
    pub on_failure: bool,
    pub on_signal: bool,
}

impl From<&AgentConfig> for RemediationPolicy {
    fn from(config: &AgentConfig) -> Self {
        Self {
            on_failure: config.run_remediation_on_failure,
            on_signal: config.run_remediation_on_signal,
        }
    }
}

/// Body of the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub healthy: bool,
    pub probes: Vec<ProbeStatus>,
    pub remediations: Vec<RemediationStatus>,
}

/// Shared by the manager and its listener task.
struct StateCore {
    healthy: AtomicBool,
    probes: Arc<dyn ProbeEngine>,
    remediation: Arc<dyn RemediationEngine>,
    policy: RemediationPolicy,
    remediated: AtomicBool,
    cause: Mutex<Option<FailureNotice>>,
    log: SharedLogSink,
    metrics: SharedMetrics,
}

impl StateCore {
    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Healthy to unhealthy, at most once.
    async fn transition(&self, notice: FailureNotice, done: &mut Option<oneshot::Sender<FailureNotice>>) {
        if !self.healthy.swap(false, Ordering::SeqCst) {
            self.log.debug(
                "Already unhealthy, ignoring failure notice",
                Attributes::new().with("probe", &notice.probe),
            );
            return;
        }

        *self.cause.lock().unwrap_or_else(|e| e.into_inner()) = Some(notice.clone());
        self.log.warn(
            "Instance marked unhealthy",
            Attributes::new()
                .with("probe", &notice.probe)
                .with("exit_code", notice.exit_code)
                .with("failures_since_recovery", notice.failures_since_recovery),
        );

        self.probes.stop().await;

        if self.policy.on_failure {
            self.remediate("failure").await;
        }

        if let Some(done) = done.take() {
            // Receiver gone means nobody is waiting for the outcome.
            let _ = done.send(notice);
        }
    }

    /// Run the remediation sequence unless it already ran.
    async fn remediate(&self, trigger: &str) {
        if self.remediated.swap(true, Ordering::SeqCst) {
            self.log.info(
                "Remediation already ran, skipping",
                Attributes::new().with("trigger", trigger),
            );
            return;
        }
        self.log.info(
            "Running remediation",
            Attributes::new().with("trigger", trigger),
        );
        let report = self.remediation.run_all().await;
        self.log.info(
            "Remediation finished",
            Attributes::new()
                .with("trigger", trigger)
                .with("all_succeeded", report.all_succeeded()),
        );
    }
}

pub struct StateManager {
    core: Arc<StateCore>,
    heartbeat_interval: Duration,
    started: AtomicBool,
    background: CancellationToken,
    heartbeat: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl StateManager {
    pub fn new(
        probes: Arc<dyn ProbeEngine>,
        remediation: Arc<dyn RemediationEngine>,
        policy: RemediationPolicy,
        log: SharedLogSink,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            core: Arc::new(StateCore {
                healthy: AtomicBool::new(true),
                probes,
                remediation,
                policy,
                remediated: AtomicBool::new(false),
                cause: Mutex::new(None),
                log,
                metrics,
            }),
            heartbeat_interval: Duration::from_secs(HEARTBEAT_INTERVAL_SECS),
            started: AtomicBool::new(false),
            background: CancellationToken::new(),
            heartbeat: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            heartbeat_task: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn is_healthy(&self) -> bool {
        self.core.is_healthy()
    }

    /// The notice that caused the transition, once unhealthy.
    pub fn failure_cause(&self) -> Option<FailureNotice> {
        self.core
            .cause
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            healthy: self.core.is_healthy(),
            probes: self.core.probes.snapshot(),
            remediations: self.core.remediation.snapshot(),
        }
    }

    /// Start probes in grace mode and the background activities.
    ///
    /// The returned receiver resolves once, with the triggering notice,
    /// when the failure transition (including remediation) has completed.
    /// It errors if the manager stops without a transition. Only the first
    /// call starts anything.
    pub fn start(&self, grace: Duration) -> oneshot::Receiver<FailureNotice> {
        let (done_tx, done_rx) = oneshot::channel();
        if self.started.swap(true, Ordering::SeqCst) {
            self.core
                .log
                .warn("State manager already started", Attributes::new());
            return done_rx;
        }

        let core = &self.core;
        let (tx, rx) = mpsc::channel(FAILURE_CHANNEL_CAPACITY);
        core.probes.set_grace_mode(true);
        core.probes.start(tx);

        let mut tasks = Vec::with_capacity(2);
        if grace.is_zero() {
            core.probes.set_grace_mode(false);
        } else {
            core.log.info(
                "Startup grace period started",
                Attributes::new().with("grace_seconds", grace.as_secs_f64()),
            );
            tasks.push(tokio::spawn(grace_timer(
                Arc::clone(core),
                grace,
                self.background.clone(),
            )));
        }
        tasks.push(tokio::spawn(failure_listener(
            Arc::clone(core),
            rx,
            done_tx,
            self.background.clone(),
        )));
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        let heartbeat = tokio::spawn(heartbeat(
            Arc::clone(core),
            self.heartbeat_interval,
            self.heartbeat.clone(),
        ));
        *self.heartbeat_task.lock().unwrap_or_else(|e| e.into_inner()) = Some(heartbeat);

        done_rx
    }

    /// Stop probes and background activities.
    ///
    /// With `via_signal` and remediation-on-signal enabled the remediation
    /// sequence runs, unless the failure transition already ran it. Never
    /// changes `healthy`. Safe to call more than once.
    pub async fn stop(&self, via_signal: bool) {
        let core = &self.core;
        core.probes.stop().await;

        self.background.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                core.log.error(
                    "State manager task ended abnormally",
                    Attributes::new().with("error", e),
                );
            }
        }

        if via_signal && core.policy.on_signal {
            core.remediate("signal").await;
        }

        self.heartbeat.cancel();
        let heartbeat = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.await;
        }

        core.log.info(
            "State manager stopped",
            Attributes::new()
                .with("via_signal", via_signal)
                .with("healthy", core.is_healthy()),
        );
    }
}

async fn grace_timer(core: Arc<StateCore>, grace: Duration, cancel: CancellationToken) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = tokio::time::sleep(grace) => {
            core.probes.set_grace_mode(false);
            core.log.info("Startup grace period over", Attributes::new());
        }
    }
}

async fn failure_listener(
    core: Arc<StateCore>,
    mut notices: mpsc::Receiver<FailureNotice>,
    done: oneshot::Sender<FailureNotice>,
    cancel: CancellationToken,
) {
    let mut done = Some(done);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            notice = notices.recv() => match notice {
                Some(notice) => core.transition(notice, &mut done).await,
                None => break,
            },
        }
    }
}

async fn heartbeat(core: Arc<StateCore>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let value = rand::thread_rng().gen_range(0..HEARTBEAT_VALUE_MAX);
                let healthy = if core.is_healthy() { "true" } else { "false" };
                core.metrics.gauge("heartbeat", value, &tags(&[("healthy", healthy)]));
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remediation::RemediationReport;
    use crate::telemetry::{MemoryLogSink, MetricsRegistry};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct StubProbes {
        sender: Mutex<Option<mpsc::Sender<FailureNotice>>>,
        grace: Mutex<Vec<bool>>,
        stops: AtomicUsize,
    }

    impl StubProbes {
        async fn fail(&self, probe: &str) {
            let sender = self.sender.lock().unwrap().clone();
            sender
                .unwrap()
                .send(FailureNotice {
                    probe: probe.to_string(),
                    exit_code: 1,
                    failures_since_recovery: 1,
                })
                .await
                .unwrap();
        }

        fn grace_calls(&self) -> Vec<bool> {
            self.grace.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProbeEngine for StubProbes {
        fn start(&self, notices: mpsc::Sender<FailureNotice>) {
            *self.sender.lock().unwrap() = Some(notices);
        }

        fn set_grace_mode(&self, enabled: bool) {
            self.grace.lock().unwrap().push(enabled);
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        fn snapshot(&self) -> Vec<ProbeStatus> {
            Vec::new()
        }
    }

    #[derive(Default)]
    struct StubRemediation {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl RemediationEngine for StubRemediation {
        async fn run_all(&self) -> RemediationReport {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.runs.fetch_add(1, Ordering::SeqCst);
            RemediationReport::default()
        }

        fn snapshot(&self) -> Vec<RemediationStatus> {
            Vec::new()
        }
    }

    struct Fixture {
        probes: Arc<StubProbes>,
        remediation: Arc<StubRemediation>,
        metrics: Arc<MetricsRegistry>,
        manager: StateManager,
    }

    fn fixture(on_failure: bool, on_signal: bool) -> Fixture {
        let probes = Arc::new(StubProbes::default());
        let remediation = Arc::new(StubRemediation::default());
        let metrics = Arc::new(MetricsRegistry::new());
        let manager = StateManager::new(
            probes.clone(),
            remediation.clone(),
            RemediationPolicy {
                on_failure,
                on_signal,
            },
            Arc::new(MemoryLogSink::new()),
            metrics.clone(),
        )
        .with_heartbeat_interval(Duration::from_millis(20));
        Fixture {
            probes,
            remediation,
            metrics,
            manager,
        }
    }

    #[tokio::test]
    async fn test_many_notices_transition_once() {
        let fx = fixture(true, false);
        let done = fx.manager.start(Duration::ZERO);
        assert!(fx.manager.is_healthy());

        for name in ["a", "b", "c", "a"] {
            fx.probes.fail(name).await;
        }

        let notice = tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.probe, "a");
        assert!(!fx.manager.is_healthy());
        assert_eq!(fx.manager.failure_cause().unwrap().probe, "a");

        fx.manager.stop(false).await;
        assert_eq!(fx.remediation.runs.load(Ordering::SeqCst), 1);
        assert!(!fx.manager.is_healthy());
    }

    #[tokio::test]
    async fn test_completion_without_remediation_on_failure() {
        let fx = fixture(false, false);
        let done = fx.manager.start(Duration::ZERO);
        fx.probes.fail("disk").await;

        tokio::time::timeout(Duration::from_secs(5), done)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fx.remediation.runs.load(Ordering::SeqCst), 0);
        assert!(fx.probes.stops.load(Ordering::SeqCst) >= 1);
        fx.manager.stop(false).await;
    }

    #[tokio::test]
    async fn test_signal_stop_runs_remediation_when_enabled() {
        let fx = fixture(true, true);
        let done = fx.manager.start(Duration::ZERO);

        fx.manager.stop(true).await;
        fx.manager.stop(true).await;

        assert_eq!(fx.remediation.runs.load(Ordering::SeqCst), 1);
        assert!(fx.manager.is_healthy());
        assert!(done.await.is_err(), "completion must not fire on stop");
    }

    #[tokio::test]
    async fn test_signal_stop_skips_remediation_when_disabled() {
        let fx = fixture(true, false);
        let _done = fx.manager.start(Duration::ZERO);
        fx.manager.stop(true).await;
        assert_eq!(fx.remediation.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_signal_after_failure_does_not_repeat_remediation() {
        let fx = fixture(true, true);
        let done = fx.manager.start(Duration::ZERO);
        fx.probes.fail("nginx").await;
        done.await.unwrap();

        fx.manager.stop(false).await;
        fx.manager.stop(true).await;
        assert_eq!(fx.remediation.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_grace_disables_immediately() {
        let fx = fixture(true, false);
        let _done = fx.manager.start(Duration::ZERO);
        assert_eq!(fx.probes.grace_calls(), vec![true, false]);
        fx.manager.stop(false).await;
    }

    #[tokio::test]
    async fn test_grace_period_ends_after_delay() {
        let fx = fixture(true, false);
        let _done = fx.manager.start(Duration::from_millis(200));
        assert_eq!(fx.probes.grace_calls(), vec![true]);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fx.probes.grace_calls(), vec![true, false]);
        fx.manager.stop(false).await;
    }

    #[tokio::test]
    async fn test_stop_during_grace_cancels_timer() {
        let fx = fixture(true, false);
        let _done = fx.manager.start(Duration::from_secs(60));
        fx.manager.stop(false).await;
        assert_eq!(fx.probes.grace_calls(), vec![true]);
    }

    #[tokio::test]
    async fn test_heartbeat_reports_health() {
        let fx = fixture(true, false);
        let done = fx.manager.start(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let value = fx
            .metrics
            .gauge_value("heartbeat", &tags(&[("healthy", "true")]))
            .expect("heartbeat emitted while healthy");
        assert!((0..100).contains(&value));

        fx.probes.fail("x").await;
        done.await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(fx
            .metrics
            .gauge_value("heartbeat", &tags(&[("healthy", "false")]))
            .is_some());
        fx.manager.stop(false).await;
    }
}
