// ABOUTME: Image provisioner ensuring the sandbox runner image exists
// ABOUTME: Inspect-then-build with a process-wide build lock and streamed docker build output

use crate::error::{Result, SandboxError};
use crate::types::ProgressLog;
use bollard::errors::Error as BollardError;
use bollard::Docker;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

/// Environment variable overriding the build-context search.
pub const BUILD_DIR_ENV: &str = "TESTBOX_DOCKER_DIR";

const DOCKERFILE: &str = "Dockerfile";
const COMPOSE_FILE: &str = "docker-compose.yml";
const BUILD_TAIL_LINES: usize = 40;

/// Outcome of [`ImageProvisioner::ensure_image`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    AlreadyPresent,
    BuiltNow,
}

/// Ensures the named execution image exists, building it at most once per tag.
///
/// Callers share one provisioner instance per process; the owned lock
/// serializes builds so concurrent "image missing" detections cannot race two
/// builds of the same tag.
pub struct ImageProvisioner {
    docker: Docker,
    build_dir: Option<PathBuf>,
    build_lock: Mutex<()>,
}

impl ImageProvisioner {
    pub fn new(docker: Docker, build_dir: Option<PathBuf>) -> Self {
        Self {
            docker,
            build_dir,
            build_lock: Mutex::new(()),
        }
    }

    /// Idempotent: returns immediately when the tag is already present.
    pub async fn ensure_image(&self, tag: &str, log: &ProgressLog) -> Result<ImageStatus> {
        if self.image_exists(tag).await? {
            debug!("image {} already present, skipping build", tag);
            return Ok(ImageStatus::AlreadyPresent);
        }

        let _guard = self.build_lock.lock().await;
        // Re-check under the lock: a concurrent run may have finished the
        // build while we were waiting.
        if self.image_exists(tag).await? {
            debug!("image {} built by a concurrent run", tag);
            return Ok(ImageStatus::AlreadyPresent);
        }

        let context = find_build_context(self.build_dir.as_deref())?;
        info!("building image {} from {}", tag, context.display());
        log.push(format!("building image {} from {}", tag, context.display()));
        self.build_image(tag, &context, log).await?;
        Ok(ImageStatus::BuiltNow)
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn build_image(&self, tag: &str, context: &Path, log: &ProgressLog) -> Result<()> {
        let mut child = Command::new("docker")
            .args(["build", "-t", tag, "."])
            .current_dir(context)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let (line_tx, mut line_rx) = mpsc::unbounded_channel::<String>();
        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, line_tx.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, line_tx.clone());
        }
        drop(line_tx);

        let mut tail: VecDeque<String> = VecDeque::with_capacity(BUILD_TAIL_LINES);
        while let Some(line) = line_rx.recv().await {
            if tail.len() == BUILD_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
            if !is_build_noise(&line) {
                log.push(format!("build: {}", line));
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            return Err(SandboxError::ImageBuild {
                tail: tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }

        info!("image {} built", tag);
        log.push(format!("image {} built", tag));
        Ok(())
    }
}

/// Ordered search for a build context holding both descriptor files:
/// configured path → env var → next to the executable → cwd → common
/// relative fallbacks. First full match wins.
pub(crate) fn find_build_context(configured: Option<&Path>) -> Result<PathBuf> {
    let candidates = candidate_dirs(configured);
    if let Some(found) = first_with_descriptors(&candidates) {
        return Ok(found);
    }

    let tried = candidates
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ");
    Err(SandboxError::Configuration(format!(
        "no build context containing both {} and {}; searched: {}",
        DOCKERFILE, COMPOSE_FILE, tried
    )))
}

fn candidate_dirs(configured: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = configured {
        candidates.push(dir.to_path_buf());
    }
    if let Ok(dir) = std::env::var(BUILD_DIR_ENV) {
        candidates.push(PathBuf::from(dir));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            candidates.push(dir.join("docker"));
        }
    }
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd);
    }
    for fallback in ["docker", "../docker", "deploy/docker"] {
        candidates.push(PathBuf::from(fallback));
    }
    candidates
}

fn first_with_descriptors(candidates: &[PathBuf]) -> Option<PathBuf> {
    candidates
        .iter()
        .find(|c| c.join(DOCKERFILE).is_file() && c.join(COMPOSE_FILE).is_file())
        .cloned()
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });
}

/// High-volume, low-information build output (layer download/extract progress).
fn is_build_noise(line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }
    const NOISE: &[&str] = &[
        "Downloading",
        "Extracting",
        "Pulling fs layer",
        "Waiting",
        "Verifying Checksum",
        "Download complete",
        "Pull complete",
    ];
    NOISE.iter().any(|marker| line.contains(marker))
}
