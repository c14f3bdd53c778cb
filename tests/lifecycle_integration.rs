//! Lifecycle Integration Tests
//!
//! Runs the full orchestrator against real `sh` commands and checks how
//! each terminal condition ends the run. Remediation commands append to a
//! marker file so each test can count how often the sequence ran.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use asg_health_agent::config::{AgentConfig, ProbeConfig, RemediationConfig};
use asg_health_agent::telemetry::{MemoryLogSink, MetricsRegistry, SharedMetrics};
use asg_health_agent::{Orchestrator, ShutdownCause};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;

const RUN_TIMEOUT: Duration = Duration::from_secs(15);

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn base_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.server.enabled = false;
    config
}

fn failing_probe(name: &str) -> ProbeConfig {
    ProbeConfig::new(name, "sh")
        .with_arguments(["-c", "exit 1"])
        .with_interval_seconds(1)
}

fn marker_remediation(marker: &Path) -> RemediationConfig {
    RemediationConfig::new("mark", "sh")
        .with_arguments(["-c".to_string(), format!("echo ran >> '{}'", marker.display())])
}

fn marker_runs(marker: &Path) -> usize {
    std::fs::read_to_string(marker)
        .map(|s| s.lines().count())
        .unwrap_or(0)
}

fn orchestrator(config: &AgentConfig) -> (Orchestrator, Arc<MemoryLogSink>, Arc<MetricsRegistry>) {
    let log = Arc::new(MemoryLogSink::new());
    let registry = Arc::new(MetricsRegistry::new());
    let metrics: SharedMetrics = registry.clone();
    let orchestrator = Orchestrator::from_config(config, log.clone(), metrics, registry.clone());
    (orchestrator, log, registry)
}

/// Shutdown future driven by the returned sender.
fn manual_signal() -> (oneshot::Sender<()>, impl std::future::Future<Output = ()>) {
    let (tx, rx) = oneshot::channel::<()>();
    (tx, async move {
        let _ = rx.await;
    })
}

// ============================================================================
// Termination Signal
// ============================================================================

#[tokio::test]
async fn signal_stops_agent_with_exit_zero_and_remediates() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut config = base_config();
    config.run_remediation_on_signal = true;
    config.probes = vec![ProbeConfig::new("ok", "true").with_interval_seconds(1)];
    config.remediations = vec![marker_remediation(&marker)];

    let (orchestrator, log, registry) = orchestrator(&config);
    let (tx, shutdown) = manual_signal();
    let run = tokio::spawn(orchestrator.run(shutdown));

    tokio::time::sleep(Duration::from_millis(200)).await;
    tx.send(()).unwrap();

    let cause = tokio::time::timeout(RUN_TIMEOUT, run).await.unwrap().unwrap();
    assert_eq!(cause, ShutdownCause::Signal);
    assert_eq!(cause.exit_code(), 0);
    assert_eq!(marker_runs(&marker), 1);
    assert_eq!(registry.counter_total("starting"), 1);
    assert_eq!(registry.counter_total("stopping"), 1);
    assert_eq!(log.find("Agent stopped").len(), 1);
}

#[tokio::test]
async fn signal_skips_remediation_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut config = base_config();
    config.probes = vec![ProbeConfig::new("ok", "true")];
    config.remediations = vec![marker_remediation(&marker)];

    let (orchestrator, _log, _registry) = orchestrator(&config);
    let (tx, shutdown) = manual_signal();
    let run = tokio::spawn(orchestrator.run(shutdown));

    tokio::time::sleep(Duration::from_millis(100)).await;
    tx.send(()).unwrap();

    let cause = tokio::time::timeout(RUN_TIMEOUT, run).await.unwrap().unwrap();
    assert_eq!(cause, ShutdownCause::Signal);
    assert_eq!(marker_runs(&marker), 0);
}

// ============================================================================
// Stable Failure
// ============================================================================

#[tokio::test]
async fn stable_failure_remediates_and_exits_one() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut config = base_config();
    config.exit_after_remediation = true;
    config.probes = vec![failing_probe("always-fails")];
    config.remediations = vec![marker_remediation(&marker)];

    let (orchestrator, _log, _registry) = orchestrator(&config);
    let state = orchestrator.state();

    let cause = tokio::time::timeout(RUN_TIMEOUT, orchestrator.run(std::future::pending()))
        .await
        .unwrap();

    assert_eq!(
        cause,
        ShutdownCause::StableFailure {
            probe: "always-fails".to_string()
        }
    );
    assert_eq!(cause.exit_code(), 1);
    assert!(!state.is_healthy());
    assert_eq!(marker_runs(&marker), 1);
}

#[tokio::test]
async fn two_failing_probes_remediate_once() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut config = base_config();
    config.exit_after_remediation = true;
    config.probes = vec![failing_probe("first"), failing_probe("second")];
    config.remediations = vec![marker_remediation(&marker)];

    let (orchestrator, log, _registry) = orchestrator(&config);
    let state = orchestrator.state();

    let cause = tokio::time::timeout(RUN_TIMEOUT, orchestrator.run(std::future::pending()))
        .await
        .unwrap();

    match cause {
        ShutdownCause::StableFailure { probe } => {
            assert!(probe == "first" || probe == "second", "unexpected probe {probe}");
            assert_eq!(state.failure_cause().map(|n| n.probe), Some(probe));
        }
        other => panic!("expected stable failure, got {other:?}"),
    }
    assert_eq!(marker_runs(&marker), 1);
    assert_eq!(log.find("Instance marked unhealthy").len(), 1);
}

#[tokio::test]
async fn stable_failure_without_exit_idles_until_signal() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");

    let mut config = base_config();
    config.run_remediation_on_signal = true;
    config.probes = vec![failing_probe("always-fails")];
    config.remediations = vec![marker_remediation(&marker)];

    let (orchestrator, _log, _registry) = orchestrator(&config);
    let state = orchestrator.state();
    let (tx, shutdown) = manual_signal();
    let run = tokio::spawn(orchestrator.run(shutdown));

    // Wait for the failure path to finish remediating, then stay idle.
    let deadline = tokio::time::Instant::now() + RUN_TIMEOUT;
    while marker_runs(&marker) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "remediation never ran");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!run.is_finished());
    assert!(!state.is_healthy());

    tx.send(()).unwrap();
    let cause = tokio::time::timeout(RUN_TIMEOUT, run).await.unwrap().unwrap();
    assert_eq!(cause, ShutdownCause::Signal);
    assert_eq!(marker_runs(&marker), 1, "remediation must not repeat on signal");
}

// ============================================================================
// Status Server
// ============================================================================

#[tokio::test]
async fn status_server_answers_while_running() {
    let port = free_port();
    let mut config = base_config();
    config.server.enabled = true;
    config.server.address = "127.0.0.1".to_string();
    config.server.port = port;
    config.probes = vec![ProbeConfig::new("ok", "true")];

    let (orchestrator, _log, _registry) = orchestrator(&config);
    let (tx, shutdown) = manual_signal();
    let run = tokio::spawn(orchestrator.run(shutdown));

    let mut stream = None;
    for _ in 0..50 {
        match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
            Ok(s) => {
                stream = Some(s);
                break;
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    let mut stream = stream.expect("status server never listened");
    stream
        .write_all(b"GET /_status HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    assert!(response.contains("\"healthy\""));

    tx.send(()).unwrap();
    let cause = tokio::time::timeout(RUN_TIMEOUT, run).await.unwrap().unwrap();
    assert_eq!(cause, ShutdownCause::Signal);
}

#[tokio::test]
async fn bind_conflict_is_an_infrastructure_fault() {
    let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = held.local_addr().unwrap().port();

    let mut config = base_config();
    config.server.enabled = true;
    config.server.address = "127.0.0.1".to_string();
    config.server.port = port;
    config.probes = vec![ProbeConfig::new("ok", "true")];

    let (orchestrator, log, _registry) = orchestrator(&config);
    let cause = tokio::time::timeout(RUN_TIMEOUT, orchestrator.run(std::future::pending()))
        .await
        .unwrap();

    match &cause {
        ShutdownCause::InfrastructureFault(reason) => {
            assert!(reason.contains(&port.to_string()), "reason: {reason}");
        }
        other => panic!("expected infrastructure fault, got {other:?}"),
    }
    assert_eq!(cause.exit_code(), 1);
    assert!(!log.find("Infrastructure fault").is_empty());
    drop(held);
}
