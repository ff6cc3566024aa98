// ABOUTME: Core type definitions for sandbox runs
// ABOUTME: Execution context, command outcomes, output chunks, progress log, and the run report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

/// Fixed mount target for the caller-supplied project inside the container.
pub const WORKSPACE_DIR: &str = "/workspace";

/// Build-configuration file the mounted project must carry.
pub const BUILD_CONFIG_FILE: &str = "package.json";

/// Dependency-library directory ensured inside the container before installs.
pub const NODE_MODULES_DIR: &str = "node_modules";

/// Handle to the ephemeral container backing one workflow run.
///
/// Exactly one exists per run. The orchestration driver keeps it in an
/// `Option` slot and cleanup consumes it, so a removed context cannot be
/// reused.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Unique container name (`testbox-{millis}-{suffix}`).
    pub name: String,
    /// Host directory bind-mounted at [`WORKSPACE_DIR`].
    pub host_dir: PathBuf,
    /// Working directory for commands executed in the container.
    pub workdir: String,
}

/// Result of running one command inside the container.
#[derive(Debug)]
pub struct ExecOutcome {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// Exit code of the command; `-1` means the exec inspect call failed
    /// rather than a real process outcome.
    pub exit_code: i64,
}

/// One demultiplexed piece of command output.
#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// PASS/FAIL classification of the executed test command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
}

/// Final report for one workflow run, consumed by the protocol layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub verdict: Verdict,
    /// Best-effort failure reason extracted from the output; present only on
    /// a `Fail` verdict.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Raw stdout + stderr of the test command.
    pub raw_output: String,
    pub progress_log: Vec<String>,
    pub elapsed_ms: u64,
}

/// Aggregate dependency-install counters. Install failures are counted here,
/// never raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReport {
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
}

/// Ordered, append-only log of timestamped progress entries for one run.
///
/// Cloning shares the underlying log, so spawned tasks (the live output
/// forwarder, the image-build streamer) can append while the run is in
/// flight.
#[derive(Debug, Clone, Default)]
pub struct ProgressLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: impl AsRef<str>) {
        let entry = format!("[{}] {}", Utc::now().format("%H:%M:%S"), message.as_ref());
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
