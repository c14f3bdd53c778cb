//! Probe task: one probe's fixed-interval scheduler
//!
//! Each tick runs the probe command once, records the result, and (outside
//! grace mode) feeds it to the hysteresis counters. Ticks missed while a
//! run is in flight are skipped, so a probe never overlaps itself.
//!
//! Runtime counters live in atomics written only by the task's own loop.
//! Readers (status endpoint) get possibly stale values without locking.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::hysteresis::{Hysteresis, Transition};
use super::{FailureNotice, ProbeStatus};
use crate::config::defaults::{FAULT_EXIT_CODE, MIN_PROBE_PERIOD_MS, NEVER_RUN_EXIT_CODE};
use crate::config::ProbeConfig;
use crate::process::CommandRunner;
use crate::telemetry::{tags, Attributes, SharedLogSink, SharedMetrics};

// ============================================================================
// Runtime State
// ============================================================================

/// Lock-free runtime state of one probe.
#[derive(Debug)]
pub struct ProbeRuntime {
    last_exit_code: AtomicI32,
    /// Unix millis of the last run, 0 when never run.
    last_run_ms: AtomicI64,
    failure_count: AtomicU64,
    failures_since_recovery: AtomicU32,
    recovery_attempt: AtomicU32,
    grace_mode: AtomicBool,
    running: AtomicBool,
}

impl Default for ProbeRuntime {
    fn default() -> Self {
        Self {
            last_exit_code: AtomicI32::new(NEVER_RUN_EXIT_CODE),
            last_run_ms: AtomicI64::new(0),
            failure_count: AtomicU64::new(0),
            failures_since_recovery: AtomicU32::new(0),
            recovery_attempt: AtomicU32::new(0),
            // Probes start in grace mode until the state manager says otherwise.
            grace_mode: AtomicBool::new(true),
            running: AtomicBool::new(false),
        }
    }
}

impl ProbeRuntime {
    fn record_run(&self, exit_code: i32, at: DateTime<Utc>) {
        self.last_exit_code.store(exit_code, Ordering::Relaxed);
        self.last_run_ms
            .store(at.timestamp_millis(), Ordering::Relaxed);
    }

    fn publish(&self, counters: &Hysteresis) {
        self.failure_count
            .store(counters.total_failures(), Ordering::Relaxed);
        self.failures_since_recovery
            .store(counters.failures_since_recovery(), Ordering::Relaxed);
        self.recovery_attempt
            .store(counters.recovery_attempt(), Ordering::Relaxed);
    }

    pub fn last_exit_code(&self) -> i32 {
        self.last_exit_code.load(Ordering::Relaxed)
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        match self.last_run_ms.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Relaxed)
    }

    pub fn failures_since_recovery(&self) -> u32 {
        self.failures_since_recovery.load(Ordering::Relaxed)
    }

    pub fn recovery_attempt(&self) -> u32 {
        self.recovery_attempt.load(Ordering::Relaxed)
    }

    pub fn grace_mode(&self) -> bool {
        self.grace_mode.load(Ordering::Relaxed)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Probe Task
// ============================================================================

pub struct ProbeTask {
    config: Arc<ProbeConfig>,
    period: Duration,
    runtime: Arc<ProbeRuntime>,
    runner: CommandRunner,
    log: SharedLogSink,
    metrics: SharedMetrics,
    cancel: CancellationToken,
    started: AtomicBool,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProbeTask {
    pub fn new(
        config: ProbeConfig,
        runner: CommandRunner,
        log: SharedLogSink,
        metrics: SharedMetrics,
    ) -> Self {
        let period = config.interval();
        Self {
            config: Arc::new(config),
            period,
            runtime: Arc::new(ProbeRuntime::default()),
            runner,
            log,
            metrics,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            handle: Mutex::new(None),
        }
    }

    /// Override the tick period (sub-second periods for tests).
    #[must_use]
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn runtime(&self) -> &ProbeRuntime {
        &self.runtime
    }

    /// Advisory flag: a run already in flight may still see the old value.
    pub fn set_grace_mode(&self, enabled: bool) {
        self.runtime.grace_mode.store(enabled, Ordering::Relaxed);
    }

    /// Spawn the scheduling loop. Stable failures are sent on `notices`.
    ///
    /// Only the first call starts the loop, and never after `stop`.
    pub fn start(&self, notices: mpsc::Sender<FailureNotice>) {
        if self.cancel.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let probe_loop = ProbeLoop {
            hysteresis: Hysteresis::new(self.config.allowed_failures, self.config.recovery_successes),
            config: Arc::clone(&self.config),
            runtime: Arc::clone(&self.runtime),
            runner: self.runner.clone(),
            log: Arc::clone(&self.log),
            metrics: Arc::clone(&self.metrics),
            cancel: self.cancel.clone(),
        };
        let handle = tokio::spawn(probe_loop.run(self.period, notices));
        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop the loop, waiting for an in-flight run to finish. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                self.log.error(
                    "Probe task ended abnormally",
                    Attributes::new().with("probe", self.name()).with("error", e),
                );
            }
        }
    }

    pub fn status(&self) -> ProbeStatus {
        let rt = &self.runtime;
        ProbeStatus {
            name: self.config.name.clone(),
            description: self.config.description.clone(),
            last_exit_code: rt.last_exit_code(),
            last_run_time: rt.last_run_time(),
            failure_count: rt.failure_count(),
            failures_since_last_recovery: rt.failures_since_recovery(),
            recovery_attempt: rt.recovery_attempt(),
            interval_seconds: self.config.interval_seconds,
            allowed_failures: self.config.allowed_failures,
            recovery_successes_required: self.config.recovery_successes,
            grace_mode: rt.grace_mode(),
            running: rt.running(),
        }
    }
}

// ============================================================================
// Scheduling Loop
// ============================================================================

/// State moved into the spawned loop. Sole writer of the runtime counters.
struct ProbeLoop {
    config: Arc<ProbeConfig>,
    runtime: Arc<ProbeRuntime>,
    hysteresis: Hysteresis,
    runner: CommandRunner,
    log: SharedLogSink,
    metrics: SharedMetrics,
    cancel: CancellationToken,
}

impl ProbeLoop {
    async fn run(mut self, period: Duration, notices: mpsc::Sender<FailureNotice>) {
        let period = period.max(Duration::from_millis(MIN_PROBE_PERIOD_MS));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(notice) = self.tick().await else {
                continue;
            };

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                sent = notices.send(notice) => {
                    if sent.is_err() {
                        self.log.debug(
                            "Failure notice dropped, receiver closed",
                            Attributes::new().with("probe", &self.config.name),
                        );
                    }
                }
            }
        }

        self.log.debug(
            "Probe stopped",
            Attributes::new().with("probe", &self.config.name),
        );
    }

    async fn tick(&mut self) -> Option<FailureNotice> {
        let name = self.config.name.as_str();
        self.runtime.running.store(true, Ordering::Relaxed);
        self.log.debug(
            "Running probe",
            Attributes::new()
                .with("probe", name)
                .with("command", &self.config.command),
        );

        let exit_code = match self
            .runner
            .run(name, &self.config.command, &self.config.arguments)
            .await
        {
            Ok(code) => code,
            Err(e) => {
                self.log.error(
                    "Probe run failed",
                    Attributes::new().with("probe", name).with("error", e),
                );
                FAULT_EXIT_CODE
            }
        };

        self.runtime.record_run(exit_code, Utc::now());
        self.runtime.running.store(false, Ordering::Relaxed);

        if self.runtime.grace_mode() {
            self.log.debug(
                "Grace mode active, result not evaluated",
                Attributes::new()
                    .with("probe", name)
                    .with("exit_code", exit_code),
            );
            return None;
        }

        let transition = self.hysteresis.observe(exit_code);
        self.runtime.publish(&self.hysteresis);

        let successful = exit_code == 0;
        self.metrics.incr(
            "probe_run",
            1,
            &tags(&[("name", name), ("successful", if successful { "true" } else { "false" })]),
        );

        let attrs = Attributes::new()
            .with("probe", name)
            .with("exit_code", exit_code)
            .with("failures_since_recovery", self.hysteresis.failures_since_recovery())
            .with("allowed_failures", self.hysteresis.allowed_failures())
            .with("recovery_attempt", self.hysteresis.recovery_attempt());

        if successful {
            self.log.debug("Probe succeeded", attrs.clone());
        } else {
            self.log.warn("Probe failed", attrs.clone());
        }

        match transition {
            Some(Transition::StableFailure) => {
                self.log.error("Probe reached stable failure", attrs);
                Some(FailureNotice {
                    probe: self.config.name.clone(),
                    exit_code,
                    failures_since_recovery: self.hysteresis.failures_since_recovery(),
                })
            }
            Some(Transition::StableRecovery) => {
                self.log.info("Probe recovered", attrs);
                None
            }
            None => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{MemoryLogSink, MetricsRegistry};

    const TICK: Duration = Duration::from_millis(50);

    struct Fixture {
        log: Arc<MemoryLogSink>,
        metrics: Arc<MetricsRegistry>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                log: Arc::new(MemoryLogSink::new()),
                metrics: Arc::new(MetricsRegistry::new()),
            }
        }

        fn task(&self, config: ProbeConfig) -> ProbeTask {
            ProbeTask::new(
                config,
                CommandRunner::new(self.log.clone()),
                self.log.clone(),
                self.metrics.clone(),
            )
            .with_period(TICK)
        }
    }

    /// Probe whose exit codes follow `codes` (one per run, last repeats).
    fn scripted(name: &str, dir: &tempfile::TempDir, codes: &[i32]) -> ProbeConfig {
        let counter = dir.path().join(format!("{name}.count"));
        let cases = codes
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{i}) exit {c};;"))
            .collect::<Vec<_>>()
            .join(" ");
        let last = codes.last().copied().unwrap_or(0);
        let script = format!(
            "n=$(cat {p} 2>/dev/null || echo 0); echo $((n+1)) > {p}; case $n in {cases} *) exit {last};; esac",
            p = counter.display()
        );
        ProbeConfig::new(name, "sh").with_arguments(["-c".to_string(), script])
    }

    async fn wait_for_runs(task: &ProbeTask, runs: u64, metrics: &MetricsRegistry) {
        for _ in 0..200 {
            if metrics.counter_total("probe_run") as u64 >= runs {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("probe {} did not reach {runs} runs", task.name());
    }

    #[tokio::test]
    async fn test_status_before_first_run() {
        let fx = Fixture::new();
        let task = fx.task(ProbeConfig::new("idle", "true"));
        let status = task.status();
        assert_eq!(status.last_exit_code, -1);
        assert!(status.last_run_time.is_none());
        assert!(status.grace_mode);
        assert!(!status.running);
    }

    #[tokio::test]
    async fn test_failure_notifies_once_per_streak() {
        let fx = Fixture::new();
        let task = fx.task(ProbeConfig::new("always-fails", "false"));
        task.set_grace_mode(false);

        let (tx, mut rx) = mpsc::channel(4);
        task.start(tx);

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.probe, "always-fails");
        assert_eq!(notice.exit_code, 1);

        wait_for_runs(&task, 4, &fx.metrics).await;
        task.stop().await;

        assert!(rx.try_recv().is_err(), "second notice in the same streak");
        let status = task.status();
        assert!(status.failure_count >= 4);
        assert_eq!(status.last_exit_code, 1);
        assert!(status.last_run_time.is_some());
        let failed = tags(&[("name", "always-fails"), ("successful", "false")]);
        assert_eq!(
            fx.metrics.counter_total("probe_run"),
            fx.metrics.counter("probe_run", &failed)
        );
    }

    #[tokio::test]
    async fn test_allowance_of_one_needs_two_failures() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new();
        let task = fx
            .task(scripted("b", &dir, &[1, 1, 0]).with_thresholds(1, 1))
            .with_period(Duration::from_millis(300));
        task.set_grace_mode(false);

        let (tx, mut rx) = mpsc::channel(4);
        task.start(tx);

        wait_for_runs(&task, 1, &fx.metrics).await;
        assert!(rx.try_recv().is_err(), "notified after a single failure");

        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(notice.failures_since_recovery, 2);
        task.stop().await;
    }

    #[tokio::test]
    async fn test_failure_then_success_recovers_quietly() {
        let dir = tempfile::tempdir().unwrap();
        let fx = Fixture::new();
        let task = fx.task(scripted("c", &dir, &[1, 0]).with_thresholds(2, 1));
        task.set_grace_mode(false);

        let (tx, mut rx) = mpsc::channel(4);
        task.start(tx);
        wait_for_runs(&task, 3, &fx.metrics).await;
        task.stop().await;

        assert!(rx.try_recv().is_err());
        let status = task.status();
        assert_eq!(status.failures_since_last_recovery, 0);
        assert_eq!(status.recovery_attempt, 0);
        assert_eq!(status.failure_count, 1);
        assert_eq!(fx.log.find("Probe recovered").len(), 1);
    }

    #[tokio::test]
    async fn test_grace_mode_suppresses_evaluation() {
        let fx = Fixture::new();
        let task = fx.task(ProbeConfig::new("graced", "false"));

        let (tx, mut rx) = mpsc::channel(4);
        task.start(tx);

        for _ in 0..200 {
            if fx.log.find("Grace mode active, result not evaluated").len() >= 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.stop().await;

        assert!(rx.try_recv().is_err());
        assert_eq!(fx.metrics.counter_total("probe_run"), 0);
        let status = task.status();
        assert_eq!(status.last_exit_code, 1);
        assert_eq!(status.failure_count, 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_counts_as_failure() {
        let fx = Fixture::new();
        let task = fx.task(ProbeConfig::new("ghost", "/nonexistent/probe-binary"));
        task.set_grace_mode(false);

        let (tx, mut rx) = mpsc::channel(4);
        task.start(tx);
        let notice = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        task.stop().await;

        assert_eq!(notice.exit_code, 1);
        assert!(!fx.log.find("Probe run failed").is_empty());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_final() {
        let fx = Fixture::new();
        let task = fx.task(ProbeConfig::new("quick", "true"));
        task.set_grace_mode(false);

        let (tx, _rx) = mpsc::channel(4);
        task.start(tx);
        wait_for_runs(&task, 2, &fx.metrics).await;

        task.stop().await;
        task.stop().await;
        let runs = fx.metrics.counter_total("probe_run");
        tokio::time::sleep(TICK * 4).await;
        assert_eq!(fx.metrics.counter_total("probe_run"), runs);
    }

    #[tokio::test]
    async fn test_zero_interval_runs_without_panicking() {
        let fx = Fixture::new();
        let task = ProbeTask::new(
            ProbeConfig::new("zero", "true").with_interval_seconds(0),
            CommandRunner::new(fx.log.clone()),
            fx.log.clone(),
            fx.metrics.clone(),
        );

        let (tx, _rx) = mpsc::channel(4);
        task.start(tx);
        for _ in 0..200 {
            if task.status().last_exit_code == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        task.stop().await;

        assert_eq!(task.status().last_exit_code, 0);
        assert!(fx.log.find("Probe task ended abnormally").is_empty());
    }

    #[tokio::test]
    async fn test_start_after_stop_does_nothing() {
        let fx = Fixture::new();
        let task = fx.task(ProbeConfig::new("late", "true"));
        task.stop().await;

        let (tx, _rx) = mpsc::channel(4);
        task.start(tx);
        tokio::time::sleep(TICK * 4).await;
        assert!(task.status().last_run_time.is_none());
    }
}
