//! Process runner
//!
//! Launches one external command, forwards each stdout/stderr line to the
//! log sink as soon as it is read, and returns the normalized exit code.

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::defaults::{FAULT_EXIT_CODE, OUTPUT_DRAIN_TIMEOUT_MS};
use crate::telemetry::{Attributes, LogLevel, SharedLogSink};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("Failed to spawn '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for '{command}': {source}")]
    Wait {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Child {0} pipe was not captured")]
    Pipe(OutputPipe),
}

/// Originating stream of an output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPipe {
    Stdout,
    Stderr,
}

impl OutputPipe {
    /// Stdout lines are logged at warn and stderr lines at error.
    pub fn level(self) -> LogLevel {
        match self {
            OutputPipe::Stdout => LogLevel::Warn,
            OutputPipe::Stderr => LogLevel::Error,
        }
    }
}

impl fmt::Display for OutputPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputPipe::Stdout => write!(f, "stdout"),
            OutputPipe::Stderr => write!(f, "stderr"),
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Runs commands on behalf of probes and remediation actions.
#[derive(Clone)]
pub struct CommandRunner {
    log: SharedLogSink,
}

impl CommandRunner {
    pub fn new(log: SharedLogSink) -> Self {
        Self { log }
    }

    /// Run `command` with `args` to completion and return its exit code.
    ///
    /// A child killed by a signal reports [`FAULT_EXIT_CODE`]. Output lines
    /// are tagged with `pipe` and `process_name` (the probe or action name).
    /// The child is never killed by the runner.
    pub async fn run(&self, name: &str, command: &str, args: &[String]) -> Result<i32, ProcessError> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                command: command.to_string(),
                source,
            })?;

        let stdout = child.stdout.take().ok_or(ProcessError::Pipe(OutputPipe::Stdout))?;
        let stderr = child.stderr.take().ok_or(ProcessError::Pipe(OutputPipe::Stderr))?;

        let mut pumps = [
            self.spawn_pump(stdout, OutputPipe::Stdout, name),
            self.spawn_pump(stderr, OutputPipe::Stderr, name),
        ];

        let status = child.wait().await;

        // Background grandchildren can hold the pipes open after the child exits.
        let drain = futures::future::join_all(pumps.iter_mut());
        if tokio::time::timeout(Duration::from_millis(OUTPUT_DRAIN_TIMEOUT_MS), drain)
            .await
            .is_err()
        {
            for pump in &pumps {
                pump.abort();
            }
            self.log.debug(
                "Stopped reading output still open after exit",
                Attributes::new().with("process_name", name),
            );
        }

        let status = status.map_err(|source| ProcessError::Wait {
            command: command.to_string(),
            source,
        })?;
        Ok(normalize_exit(status))
    }

    fn spawn_pump<R>(&self, reader: R, pipe: OutputPipe, name: &str) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let log = self.log.clone();
        let name = name.to_string();
        tokio::spawn(async move {
            let mut segments = BufReader::new(reader).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(raw)) => {
                        let line = String::from_utf8_lossy(&raw);
                        log.log(
                            pipe.level(),
                            line.trim_end_matches('\r'),
                            Attributes::new()
                                .with("pipe", pipe)
                                .with("process_name", &name),
                        );
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log.error(
                            "Failed reading process output",
                            Attributes::new()
                                .with("pipe", pipe)
                                .with("process_name", &name)
                                .with("error", e),
                        );
                        break;
                    }
                }
            }
        })
    }
}

/// Exit code as reported by the OS, or [`FAULT_EXIT_CODE`] when the child
/// was terminated by a signal.
pub fn normalize_exit(status: ExitStatus) -> i32 {
    status.code().unwrap_or(FAULT_EXIT_CODE)
}

// ============================================================================
// Tests
// ============================================================================
