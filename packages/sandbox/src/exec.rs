// ABOUTME: Command execution inside a running container with demultiplexed streaming output
// ABOUTME: Defines the CommandRunner seam plus the bollard-backed DockerRunner implementation

use crate::error::{Result, SandboxError};
use crate::types::{ExecOutcome, ExecutionContext, OutputChunk, StreamType};
use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use chrono::Utc;
use futures::StreamExt;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Bounded wait for the output reader to finish flushing after the stream
/// completes, and before the exit code is inspected.
const FLUSH_GRACE: Duration = Duration::from_secs(2);

/// Seam for running a command inside an execution context.
///
/// The dependency installer and the driver only depend on this trait, so
/// tests can substitute a stub without a Docker daemon.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `command` in the container, enforcing `timeout`.
    ///
    /// Each demultiplexed output chunk is accumulated into the returned
    /// buffers and, when `progress` is given, simultaneously forwarded to it
    /// so a caller can observe output before the command finishes. Chunk
    /// order is preserved per stream; no ordering holds between the two
    /// streams.
    async fn exec(
        &self,
        context: &ExecutionContext,
        command: Vec<String>,
        timeout: Duration,
        progress: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutcome>;
}

/// bollard-backed command runner.
pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl CommandRunner for DockerRunner {
    async fn exec(
        &self,
        context: &ExecutionContext,
        command: Vec<String>,
        timeout: Duration,
        progress: Option<mpsc::UnboundedSender<OutputChunk>>,
    ) -> Result<ExecOutcome> {
        debug!(
            "executing in container {}: {}",
            context.name,
            command.join(" ")
        );

        let exec = self
            .docker
            .create_exec(
                &context.name,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    working_dir: Some(context.workdir.clone()),
                    ..Default::default()
                },
            )
            .await?;

        let started = self.docker.start_exec(&exec.id, None).await?;
        let mut output = match started {
            StartExecResults::Attached { output, .. } => output,
            StartExecResults::Detached => {
                return Err(SandboxError::ContainerLifecycle(
                    "exec was detached unexpectedly".to_string(),
                ))
            }
        };

        // Reader task demultiplexes the combined stream into chunks; the
        // loop below is the single consumer feeding both the accumulating
        // buffers and the live progress sink.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<OutputChunk>();
        let reader = tokio::spawn(async move {
            while let Some(msg) = output.next().await {
                let chunk = match msg {
                    Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                        OutputChunk {
                            timestamp: Utc::now(),
                            stream: StreamType::Stdout,
                            data: message.to_vec(),
                        }
                    }
                    Ok(LogOutput::StdErr { message }) => OutputChunk {
                        timestamp: Utc::now(),
                        stream: StreamType::Stderr,
                        data: message.to_vec(),
                    },
                    Ok(_) => continue,
                    Err(e) => {
                        warn!("error reading exec output stream: {}", e);
                        break;
                    }
                };
                if chunk_tx.send(chunk).is_err() {
                    break;
                }
            }
        });

        let mut stdout: Vec<u8> = Vec::new();
        let mut stderr: Vec<u8> = Vec::new();
        let drain = async {
            while let Some(chunk) = chunk_rx.recv().await {
                match chunk.stream {
                    StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
                    StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
                }
                if let Some(sink) = &progress {
                    let _ = sink.send(chunk);
                }
            }
        };

        if tokio::time::timeout(timeout, drain).await.is_err() {
            // Tear the stream down; the container stays usable for cleanup.
            // The buffers filled so far travel with the error so the caller
            // can still report what the command printed before the kill.
            reader.abort();
            return Err(SandboxError::Timeout {
                ms: timeout.as_millis() as u64,
                output: combine_output(&stdout, &stderr),
            });
        }

        if tokio::time::timeout(FLUSH_GRACE, reader).await.is_err() {
            warn!("exec output reader did not flush within the grace period");
        }

        let exit_code = match self.docker.inspect_exec(&exec.id).await {
            Ok(inspect) => inspect.exit_code.unwrap_or(-1),
            Err(e) => {
                warn!("exec inspect failed, reporting exit code -1: {}", e);
                -1
            }
        };

        Ok(ExecOutcome {
            stdout,
            stderr,
            exit_code,
        })
    }
}

/// Lossy stdout followed by stderr when the latter carries anything.
pub(crate) fn combine_output(stdout: &[u8], stderr: &[u8]) -> String {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if stderr.trim().is_empty() {
        stdout.into_owned()
    } else if stdout.is_empty() {
        stderr.into_owned()
    } else {
        format!("{}\n{}", stdout, stderr)
    }
}
