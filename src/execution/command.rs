//! The `nmap` process runner.
//!
//! [`CommandRunner`] spawns `<program> <arguments...> -oX - <target>`,
//! captures stdout and stderr, and emits a heartbeat on a fixed timer for
//! as long as the child is alive. The child is killed when the attempt
//! times out or is cancelled.
//!
//! ```rust
//! use scanward::CommandRunner;
//! use std::time::Duration;
//!
//! let runner = CommandRunner::builder("nmap")
//!     .timeout(Duration::from_secs(3600))
//!     .heartbeat_interval(Duration::from_secs(10))
//!     .build();
//! assert_eq!(runner.program(), "nmap");
//! ```

use async_trait::async_trait;
use chrono::Utc;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Heartbeat, RunOutcome, RunRequest, ScanRunner};

/// Default ceiling for one attempt.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(4 * 60 * 60);

/// Default time between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Runs scans as child processes.
#[derive(Debug, Clone)]
pub struct CommandRunner {
    program: String,
    output_args: Vec<String>,
    timeout: Duration,
    heartbeat_interval: Duration,
}

impl CommandRunner {
    /// Create a new builder for a runner of `program`.
    pub fn builder(program: impl Into<String>) -> CommandRunnerBuilder {
        CommandRunnerBuilder::new(program)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat_interval
    }

    /// Full argument vector (without the program) for a request.
    pub fn command_args(&self, request: &RunRequest) -> Vec<String> {
        request
            .arguments
            .iter()
            .chain(self.output_args.iter())
            .cloned()
            .chain(std::iter::once(request.target.clone()))
            .collect()
    }
}

impl Default for CommandRunner {
    fn default() -> Self {
        CommandRunnerBuilder::new("nmap").build()
    }
}

#[async_trait]
impl ScanRunner for CommandRunner {
    async fn run(
        &self,
        request: &RunRequest,
        heartbeats: mpsc::Sender<Heartbeat>,
        cancel: CancellationToken,
    ) -> RunOutcome {
        let args = self.command_args(request);
        debug!(
            task_id = %request.task_id,
            attempt = request.attempt,
            program = %self.program,
            args = ?args,
            "Spawning scan process"
        );

        let mut cmd = Command::new(&self.program);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %request.task_id, error = %e, "Failed to spawn scan process");
                return RunOutcome::Crash(format!("failed to start {}: {}", self.program, e));
            }
        };

        // Dropping this future drops the child, which kills it.
        let output = child.wait_with_output();
        tokio::pin!(output);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                result = &mut output => {
                    return match result {
                        Ok(output) => {
                            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                            if output.status.success() {
                                RunOutcome::Success { stdout, stderr }
                            } else if let Some(code) = output.status.code() {
                                RunOutcome::ProcessError { exit_code: Some(code), stderr }
                            } else {
                                RunOutcome::Crash(format!("process terminated abnormally ({})", output.status))
                            }
                        }
                        Err(e) => RunOutcome::Crash(format!("failed to wait for process: {}", e)),
                    };
                }
                _ = ticker.tick() => {
                    let beat = Heartbeat { attempt: request.attempt, at: Utc::now() };
                    // A full or closed channel only loses a beat.
                    let _ = heartbeats.try_send(beat);
                }
                _ = &mut deadline => {
                    warn!(
                        task_id = %request.task_id,
                        attempt = request.attempt,
                        timeout = ?self.timeout,
                        "Scan process exceeded its ceiling, killing it"
                    );
                    return RunOutcome::Timeout(self.timeout);
                }
                _ = cancel.cancelled() => {
                    debug!(task_id = %request.task_id, attempt = request.attempt, "Scan process cancelled");
                    return RunOutcome::Cancelled;
                }
            }
        }
    }
}

/// Builder for creating `CommandRunner` instances.
#[derive(Debug, Clone)]
pub struct CommandRunnerBuilder {
    program: String,
    output_args: Vec<String>,
    timeout: Duration,
    heartbeat_interval: Duration,
}

impl CommandRunnerBuilder {
    /// Create a new builder with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            output_args: vec!["-oX".to_string(), "-".to_string()],
            timeout: DEFAULT_ATTEMPT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Replace the arguments that request machine-readable output.
    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set the per-attempt ceiling.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = duration;
        self
    }

    /// Set the heartbeat period.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Build the `CommandRunner`.
    pub fn build(self) -> CommandRunner {
        CommandRunner {
            program: self.program,
            output_args: self.output_args,
            timeout: self.timeout,
            heartbeat_interval: self.heartbeat_interval,
        }
    }
}
