//! Command executor
//!
//! Probes are read-only diagnostic CLI tools. Each invocation is an explicit
//! argv (never a shell), bounded by a timeout, with stdout/stderr/exit status
//! captured into a `ProbeOutput`. A failing command is represented in the
//! output, not raised; only a missing binary or a spawn failure is an error.
//! No retries: a transient probe failure is itself diagnostically
//! significant and must not be masked.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::CheckError;

/// Default per-probe timeout, matching the source tooling
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// One external probe invocation
#[derive(Debug, Clone)]
pub struct ProbeCommand {
    /// Program name or path
    pub program: String,
    /// Arguments, passed verbatim (no shell interpretation)
    pub args: Vec<String>,
    /// Hard upper bound on execution time
    pub timeout: Duration,
}

impl ProbeCommand {
    /// Create a command with the default timeout
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Override the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Captured result of one probe invocation
#[derive(Debug, Clone)]
pub struct ProbeOutput {
    /// Raw stdout
    pub stdout: String,
    /// Raw stderr
    pub stderr: String,
    /// Exit code, if the process exited normally
    pub exit_code: Option<i32>,
    /// Wall-clock duration of the invocation
    pub duration: Duration,
    /// Whether the probe hit its timeout
    pub timed_out: bool,
}

impl ProbeOutput {
    /// Whether the probe completed with exit code 0
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Non-empty, trimmed stdout lines
    pub fn lines(&self) -> Vec<&str> {
        self.stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect()
    }

    /// Build an output representing a timeout
    pub fn timeout(timeout: Duration) -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            duration: timeout,
            timed_out: true,
        }
    }

    /// Build a successful output from raw stdout (test helper)
    pub fn from_stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
            duration: Duration::from_millis(1),
            timed_out: false,
        }
    }

    /// Build a failed output with the given exit code (test helper)
    pub fn from_failure(stderr: impl Into<String>, exit_code: i32) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
            duration: Duration::from_millis(1),
            timed_out: false,
        }
    }
}

/// Seam between checks and the operating system.
///
/// Production code uses `SystemRunner`; tests inject a `MockRunner` so no
/// real hardware tools are required.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run one probe to completion or timeout
    async fn run(&self, cmd: &ProbeCommand) -> Result<ProbeOutput, CheckError>;
}

/// Runs probes as real child processes via tokio
#[derive(Debug, Default)]
pub struct SystemRunner;

impl SystemRunner {
    /// Create a new system runner
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &ProbeCommand) -> Result<ProbeOutput, CheckError> {
        debug!(program = %cmd.program, args = ?cmd.args, "Running probe");
        let start = std::time::Instant::now();

        // kill_on_drop so a probe that hits its timeout does not outlive the
        // run and hold the device open
        let mut command = tokio::process::Command::new(&cmd.program);
        command.args(&cmd.args).kill_on_drop(true);

        let result = tokio::time::timeout(cmd.timeout, command.output()).await;

        match result {
            Ok(Ok(output)) => {
                let probe = ProbeOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code(),
                    duration: start.elapsed(),
                    timed_out: false,
                };
                if !probe.success() {
                    debug!(
                        program = %cmd.program,
                        exit_code = ?probe.exit_code,
                        "Probe exited non-zero"
                    );
                }
                Ok(probe)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CheckError::BinaryMissing(cmd.program.clone()))
            }
            Ok(Err(e)) => Err(CheckError::Spawn {
                program: cmd.program.clone(),
                source: e,
            }),
            Err(_) => {
                warn!(program = %cmd.program, timeout = ?cmd.timeout, "Probe timed out");
                Ok(ProbeOutput::timeout(cmd.timeout))
            }
        }
    }
}

/// In-memory runner for tests.
///
/// Responses are queued per program name and consumed in order; a program
/// with no queued response is reported as a missing binary.
#[derive(Debug, Default)]
pub struct MockRunner {
    responses: Mutex<HashMap<String, VecDeque<ProbeOutput>>>,
    calls: Mutex<Vec<ProbeCommand>>,
}

impl MockRunner {
    /// Create an empty mock runner
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an output for the given program
    pub fn enqueue(&self, program: impl Into<String>, output: ProbeOutput) {
        self.responses
            .lock()
            .expect("mock runner lock poisoned")
            .entry(program.into())
            .or_default()
            .push_back(output);
    }

    /// Queue the same stdout for every invocation of the given program
    pub fn enqueue_stdout(&self, program: impl Into<String>, stdout: impl Into<String>) {
        self.enqueue(program, ProbeOutput::from_stdout(stdout));
    }

    /// Commands observed so far, in invocation order
    pub fn calls(&self) -> Vec<ProbeCommand> {
        self.calls
            .lock()
            .expect("mock runner lock poisoned")
            .clone()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn run(&self, cmd: &ProbeCommand) -> Result<ProbeOutput, CheckError> {
        self.calls
            .lock()
            .expect("mock runner lock poisoned")
            .push(cmd.clone());

        let mut responses = self.responses.lock().expect("mock runner lock poisoned");
        match responses.get_mut(&cmd.program).and_then(VecDeque::pop_front) {
            Some(output) => Ok(output),
            None => Err(CheckError::BinaryMissing(cmd.program.clone())),
        }
    }
}
