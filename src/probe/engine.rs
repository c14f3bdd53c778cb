//! Probe engine: owns every probe task and merges their failure notices
//!
//! Each task gets its own bounded channel. A single forwarder drains all of
//! them and relays every notice to the outward channel until the engine is
//! stopped, so no task is ever left blocked on a send.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::task::ProbeTask;
use super::{FailureNotice, ProbeStatus};
use crate::config::defaults::PROBE_NOTICE_CHANNEL_CAPACITY;
use crate::config::ProbeConfig;
use crate::process::CommandRunner;
use crate::telemetry::{Attributes, SharedLogSink, SharedMetrics};

/// Set of probes driven as one unit by the state manager.
#[async_trait]
pub trait ProbeEngine: Send + Sync {
    /// Start every probe. Stable-failure notices are relayed to `notices`.
    fn start(&self, notices: mpsc::Sender<FailureNotice>);

    /// Broadcast grace mode to every probe.
    fn set_grace_mode(&self, enabled: bool);

    /// Stop every probe and the relay. Idempotent.
    async fn stop(&self);

    fn snapshot(&self) -> Vec<ProbeStatus>;
}

/// [`ProbeEngine`] running each probe as an external command.
pub struct CommandProbeEngine {
    tasks: Vec<ProbeTask>,
    log: SharedLogSink,
    cancel: CancellationToken,
    forwarder: Mutex<Option<JoinHandle<()>>>,
}

impl CommandProbeEngine {
    pub fn new(
        probes: &[ProbeConfig],
        runner: &CommandRunner,
        log: SharedLogSink,
        metrics: &SharedMetrics,
    ) -> Self {
        let tasks = probes
            .iter()
            .map(|p| ProbeTask::new(p.clone(), runner.clone(), Arc::clone(&log), Arc::clone(metrics)))
            .collect();
        Self::from_tasks(tasks, log)
    }

    /// Build from pre-configured tasks.
    pub fn from_tasks(tasks: Vec<ProbeTask>, log: SharedLogSink) -> Self {
        Self {
            tasks,
            log,
            cancel: CancellationToken::new(),
            forwarder: Mutex::new(None),
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[async_trait]
impl ProbeEngine for CommandProbeEngine {
    fn start(&self, notices: mpsc::Sender<FailureNotice>) {
        let mut inbound = Vec::with_capacity(self.tasks.len());
        for task in &self.tasks {
            let (tx, rx) = mpsc::channel(PROBE_NOTICE_CHANNEL_CAPACITY);
            task.start(tx);
            inbound.push(rx);
        }

        self.log.info(
            "Probes started",
            Attributes::new().with("count", self.tasks.len()),
        );

        let forwarder = tokio::spawn(forward_notices(
            inbound,
            notices,
            self.cancel.clone(),
            Arc::clone(&self.log),
        ));
        let previous = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(forwarder);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn set_grace_mode(&self, enabled: bool) {
        for task in &self.tasks {
            task.set_grace_mode(enabled);
        }
        self.log.info(
            "Grace mode changed",
            Attributes::new().with("grace_mode", enabled),
        );
    }

    async fn stop(&self) {
        futures::future::join_all(self.tasks.iter().map(|task| task.stop())).await;

        self.cancel.cancel();
        let forwarder = self
            .forwarder
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(forwarder) = forwarder {
            if let Err(e) = forwarder.await {
                self.log.error(
                    "Failure relay ended abnormally",
                    Attributes::new().with("error", e),
                );
            }
            self.log.info("Probes stopped", Attributes::new());
        }
    }

    fn snapshot(&self) -> Vec<ProbeStatus> {
        self.tasks.iter().map(ProbeTask::status).collect()
    }
}

/// Relay every notice from every task until cancelled or all tasks are gone.
async fn forward_notices(
    inbound: Vec<mpsc::Receiver<FailureNotice>>,
    outward: mpsc::Sender<FailureNotice>,
    cancel: CancellationToken,
    log: SharedLogSink,
) {
    let streams = inbound.into_iter().map(|rx| {
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|n| (n, rx)) }).boxed()
    });
    let mut merged = stream::select_all(streams);

    loop {
        let notice = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            next = merged.next() => match next {
                Some(notice) => notice,
                None => break,
            },
        };

        log.debug(
            "Relaying failure notice",
            Attributes::new().with("probe", &notice.probe),
        );

        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            sent = outward.send(notice) => {
                // Keep draining so task senders never block.
                if sent.is_err() {
                    log.debug("Failure notice dropped, receiver closed", Attributes::new());
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
