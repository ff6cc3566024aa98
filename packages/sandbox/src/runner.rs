// ABOUTME: Orchestration driver sequencing image, container, install, and exec into one run
// ABOUTME: Cleanup is unconditional on every exit path; builds the final PASS/FAIL run report

use crate::container::{ContainerManager, MANAGED_LABEL};
use crate::error::{Result, SandboxError};
use crate::exec::{combine_output, CommandRunner, DockerRunner};
use crate::image::{ImageProvisioner, ImageStatus};
use crate::installer::DependencyInstaller;
use crate::manifest::{DependencyManifest, NormalizedManifest};
use crate::types::{
    ExecOutcome, ExecutionContext, OutputChunk, ProgressLog, RunReport, Verdict, BUILD_CONFIG_FILE,
};
use bollard::container::PruneContainersOptions;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Substrings scanned for in the combined output to extract a failure reason.
const FAILURE_KEYWORDS: &[&str] = &[
    "Revert",
    "AssertionError",
    "npm ERR!",
    "Error:",
    "FAILED",
    "failing",
    "timed out",
    "Timeout",
    "ETIMEDOUT",
];

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Tag of the reusable execution image.
    pub image_tag: String,
    /// Explicit build-context override; when unset the ordered search in the
    /// image provisioner applies.
    pub build_dir: Option<PathBuf>,
    /// Budget for the test command itself.
    pub command_timeout: Duration,
    /// Budget per dependency-install command.
    pub install_timeout: Duration,
    /// Opt-in: prune stopped managed containers after cleanup.
    pub prune_after_run: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            image_tag: "testbox-runner:latest".to_string(),
            build_dir: None,
            command_timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(300),
            prune_after_run: false,
        }
    }
}

/// One workflow invocation.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub project_root: PathBuf,
    /// Test file/pattern forwarded to the test command.
    pub test_selector: Option<String>,
    pub dependency_manifest: PathBuf,
    pub extra_args: Vec<String>,
}

/// Drives one run end to end:
/// ensure image → create container → install dependencies → run the test
/// command → remove the container. Removal happens on every exit path; it is
/// the only way a run reaches a terminal state.
pub struct SandboxRunner<R: CommandRunner = DockerRunner> {
    provisioner: ImageProvisioner,
    manager: ContainerManager,
    runner: R,
    config: RunnerConfig,
}

impl SandboxRunner<DockerRunner> {
    /// Connect to the Docker daemon and assemble the engine. Fails fast with
    /// `DockerUnavailable` when the daemon is unreachable.
    pub async fn connect(config: RunnerConfig) -> Result<Self> {
        let manager = ContainerManager::new().await?;
        let docker = manager.docker().clone();
        let provisioner = ImageProvisioner::new(docker.clone(), config.build_dir.clone());
        let runner = DockerRunner::new(docker);
        Ok(Self::with_parts(provisioner, manager, runner, config))
    }
}

impl<R: CommandRunner> SandboxRunner<R> {
    /// Assemble the engine from its parts. The runner is generic over the
    /// command seam so tests can substitute a scripted implementation.
    pub fn with_parts(
        provisioner: ImageProvisioner,
        manager: ContainerManager,
        runner: R,
        config: RunnerConfig,
    ) -> Self {
        Self {
            provisioner,
            manager,
            runner,
            config,
        }
    }

    /// Run the project's test command in a disposable container.
    ///
    /// Engine failures (configuration, daemon, image build, container
    /// lifecycle) return `Err`; a failing or timed-out test command is a
    /// normal `Ok` report with a `Fail` verdict, so callers can tell "the
    /// sandbox failed" apart from "the sandboxed test failed".
    pub async fn run(&self, request: RunRequest) -> Result<RunReport> {
        let started = Instant::now();
        let log = ProgressLog::new();

        // Cheap validations first: nothing below touches the image or the
        // daemon until these pass.
        validate_request(&request)?;
        let manifest = DependencyManifest::load(&request.dependency_manifest)?.normalize();
        if manifest.is_empty() {
            return Err(SandboxError::Configuration(format!(
                "dependency manifest {} has no entries",
                request.dependency_manifest.display()
            )));
        }

        info!("sandbox run started for {}", request.project_root.display());
        log.push(format!(
            "run started for {}",
            request.project_root.display()
        ));

        let step = Instant::now();
        let status = self
            .provisioner
            .ensure_image(&self.config.image_tag, &log)
            .await?;
        log.push(format!(
            "image {} {} ({} ms)",
            self.config.image_tag,
            match status {
                ImageStatus::AlreadyPresent => "already present",
                ImageStatus::BuiltNow => "built",
            },
            step.elapsed().as_millis()
        ));

        // The one context slot for this run. Cleanup below is the only exit.
        let mut slot: Option<ExecutionContext> = None;
        let outcome = self
            .execute_steps(&request, &manifest, &mut slot, &log)
            .await;

        if let Some(context) = slot.take() {
            let step = Instant::now();
            self.manager.remove(context).await;
            log.push(format!("container removed ({} ms)", step.elapsed().as_millis()));
        }
        if self.config.prune_after_run {
            self.prune(&log).await;
        }

        let report = finalize(outcome, &log, started)?;

        info!(
            "sandbox run finished: {:?} in {} ms",
            report.verdict, report.elapsed_ms
        );
        Ok(report)
    }

    async fn execute_steps(
        &self,
        request: &RunRequest,
        manifest: &NormalizedManifest,
        slot: &mut Option<ExecutionContext>,
        log: &ProgressLog,
    ) -> Result<ExecOutcome> {
        log.push("creating execution container");
        let step = Instant::now();
        let context = self
            .manager
            .create(&self.config.image_tag, &request.project_root)
            .await?;
        log.push(format!(
            "container {} running ({} ms)",
            context.name,
            step.elapsed().as_millis()
        ));
        let context = slot.insert(context);

        log.push("installing dependencies");
        let step = Instant::now();
        let installer = DependencyInstaller::new(&self.runner, self.config.install_timeout);
        let install = installer
            .install_all(context, &request.project_root, manifest, log)
            .await;
        log.push(format!(
            "dependencies: {} attempted, {} succeeded, {} failed ({} ms)",
            install.attempted,
            install.succeeded,
            install.failed,
            step.elapsed().as_millis()
        ));

        let command = test_command(request);
        log.push(format!("running `{}`", command.join(" ")));

        // Live sink: forward output lines into the progress log as they
        // arrive, ahead of command completion.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<OutputChunk>();
        let forward_log = log.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                let text = String::from_utf8_lossy(&chunk.data);
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    forward_log.push(line);
                }
            }
        });

        let step = Instant::now();
        let outcome = self
            .runner
            .exec(
                context,
                command,
                self.config.command_timeout,
                Some(chunk_tx),
            )
            .await;
        let _ = forwarder.await;
        let outcome = outcome?;

        log.push(format!(
            "command finished with exit code {} ({} ms)",
            outcome.exit_code,
            step.elapsed().as_millis()
        ));
        Ok(outcome)
    }

    /// Best-effort, never fatal.
    async fn prune(&self, log: &ProgressLog) {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );
        match self
            .manager
            .docker()
            .prune_containers(Some(PruneContainersOptions { filters }))
            .await
        {
            Ok(result) => {
                let pruned = result.containers_deleted.map(|c| c.len()).unwrap_or(0);
                debug!("pruned {} stopped containers", pruned);
                log.push(format!("pruned {} stopped containers", pruned));
            }
            Err(e) => warn!("container prune failed: {}", e),
        }
    }
}

pub(crate) fn validate_request(request: &RunRequest) -> Result<()> {
    if !request.project_root.is_dir() {
        return Err(SandboxError::Configuration(format!(
            "project directory {} does not exist",
            request.project_root.display()
        )));
    }
    if !request.project_root.join(BUILD_CONFIG_FILE).is_file() {
        return Err(SandboxError::Configuration(format!(
            "project {} is missing {}",
            request.project_root.display(),
            BUILD_CONFIG_FILE
        )));
    }
    Ok(())
}

fn test_command(request: &RunRequest) -> Vec<String> {
    let mut command = vec!["npm".to_string(), "test".to_string()];
    let mut forwarded: Vec<String> = Vec::new();
    if let Some(selector) = &request.test_selector {
        forwarded.push(selector.clone());
    }
    forwarded.extend(request.extra_args.iter().cloned());
    if !forwarded.is_empty() {
        command.push("--".to_string());
        command.extend(forwarded);
    }
    command
}

/// Turn the step outcome into the caller-visible result: a completed command
/// becomes a PASS/FAIL report, a timed-out command becomes a `Fail` report
/// carrying the output seen before the kill, and engine errors stay errors.
pub(crate) fn finalize(
    outcome: Result<ExecOutcome>,
    log: &ProgressLog,
    started: Instant,
) -> Result<RunReport> {
    match outcome {
        Ok(outcome) => Ok(build_report(outcome, log, started)),
        Err(SandboxError::Timeout { ms, output }) => {
            log.push(format!("test command timed out after {} ms", ms));
            Ok(RunReport {
                verdict: Verdict::Fail,
                reason: Some(format!("test command timed out after {} ms", ms)),
                raw_output: output,
                progress_log: log.entries(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            })
        }
        Err(e) => Err(e),
    }
}

fn build_report(outcome: ExecOutcome, log: &ProgressLog, started: Instant) -> RunReport {
    let raw_output = combine_output(&outcome.stdout, &outcome.stderr);

    let (verdict, reason) = if outcome.exit_code == 0 {
        (Verdict::Pass, None)
    } else {
        (
            Verdict::Fail,
            Some(extract_failure_reason(&raw_output, outcome.exit_code)),
        )
    };

    RunReport {
        verdict,
        reason,
        raw_output,
        progress_log: log.entries(),
        elapsed_ms: started.elapsed().as_millis() as u64,
    }
}

/// First output line carrying a known failure keyword; generic fallback when
/// nothing matches.
pub(crate) fn extract_failure_reason(output: &str, exit_code: i64) -> String {
    const MAX_REASON_CHARS: usize = 200;
    for line in output.lines() {
        if FAILURE_KEYWORDS.iter().any(|kw| line.contains(kw)) {
            let line = line.trim();
            if line.chars().count() > MAX_REASON_CHARS {
                let truncated: String = line.chars().take(MAX_REASON_CHARS).collect();
                return format!("{}...", truncated);
            }
            return line.to_string();
        }
    }
    if exit_code == 137 {
        "execution killed (exit code 137), likely hit the time budget".to_string()
    } else {
        format!("execution failed (exit code {})", exit_code)
    }
}
