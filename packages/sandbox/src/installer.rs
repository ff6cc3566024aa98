// ABOUTME: Dependency installer running ecosystem installs inside the execution container
// ABOUTME: Per-dependency failures are logged and counted, never raised — the workflow always proceeds

use crate::exec::CommandRunner;
use crate::manifest::NormalizedManifest;
use crate::types::{
    ExecutionContext, InstallReport, ProgressLog, BUILD_CONFIG_FILE, NODE_MODULES_DIR,
};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Installs manifest dependencies inside a running container.
///
/// Rationale for the never-fail policy: a broken dependency should surface
/// later as a clear compile/test error, not silently abort the whole run.
pub struct DependencyInstaller<'a> {
    runner: &'a dyn CommandRunner,
    timeout: Duration,
}

impl<'a> DependencyInstaller<'a> {
    pub fn new(runner: &'a dyn CommandRunner, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    /// Install everything the manifest declares. Always completes and returns
    /// aggregate counters.
    pub async fn install_all(
        &self,
        context: &ExecutionContext,
        project_root: &Path,
        manifest: &NormalizedManifest,
        log: &ProgressLog,
    ) -> InstallReport {
        let mut report = InstallReport::default();

        self.ensure_lib_dirs(context).await;

        // Whole-project install first, when the mounted project declares one.
        if project_root.join(BUILD_CONFIG_FILE).is_file() {
            let (label, command) = if project_root.join("yarn.lock").is_file() {
                (
                    "project dependencies (yarn)",
                    vec!["yarn", "install", "--frozen-lockfile"],
                )
            } else {
                ("project dependencies (npm)", vec!["npm", "install"])
            };
            let command = command.into_iter().map(str::to_string).collect();
            self.attempt(context, label, command, &mut report, log).await;
        }

        for token in &manifest.npm {
            let command = vec!["npm".to_string(), "install".to_string(), token.clone()];
            self.attempt(context, token, command, &mut report, log).await;
        }

        for token in &manifest.yarn {
            let command = vec!["yarn".to_string(), "add".to_string(), token.clone()];
            self.attempt(context, token, command, &mut report, log).await;
        }

        // Git libraries one at a time. npm fetches these as tarballs, so no
        // version-control working tree is needed inside the container.
        for token in &manifest.git {
            let command = vec![
                "npm".to_string(),
                "install".to_string(),
                "--no-save".to_string(),
                git_install_url(token),
            ];
            self.attempt(context, token, command, &mut report, log).await;
        }

        info!(
            "dependency install finished: {} attempted, {} succeeded, {} failed",
            report.attempted, report.succeeded, report.failed
        );
        report
    }

    /// Idempotent create of the target library directory before any install.
    async fn ensure_lib_dirs(&self, context: &ExecutionContext) {
        let command = vec![
            "mkdir".to_string(),
            "-p".to_string(),
            NODE_MODULES_DIR.to_string(),
        ];
        if let Err(e) = self.runner.exec(context, command, self.timeout, None).await {
            warn!("failed to ensure library directories: {}", e);
        }
    }

    async fn attempt(
        &self,
        context: &ExecutionContext,
        label: &str,
        command: Vec<String>,
        report: &mut InstallReport,
        log: &ProgressLog,
    ) {
        report.attempted += 1;
        match self.runner.exec(context, command, self.timeout, None).await {
            Ok(outcome) if outcome.exit_code == 0 => {
                report.succeeded += 1;
                debug!("installed {}", label);
                log.push(format!("installed {}", label));
            }
            Ok(outcome) => {
                report.failed += 1;
                let tail = output_tail(&outcome.stderr);
                warn!(
                    "install failed for {} (exit {}): {}",
                    label, outcome.exit_code, tail
                );
                log.push(format!("install failed for {}: {}", label, tail));
            }
            Err(e) => {
                report.failed += 1;
                warn!("install failed for {}: {}", label, e);
                log.push(format!("install failed for {}: {}", label, e));
            }
        }
    }
}

/// `owner/repo[@ref]` token → a git URL npm can install without a working
/// tree in the container.
pub(crate) fn git_install_url(token: &str) -> String {
    match token.rsplit_once('@') {
        Some((name, reference)) if !name.is_empty() => {
            format!("git+https://github.com/{}.git#{}", name, reference)
        }
        _ => format!("git+https://github.com/{}.git", token),
    }
}

fn output_tail(bytes: &[u8]) -> String {
    const TAIL_CHARS: usize = 300;
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    let count = text.chars().count();
    if count <= TAIL_CHARS {
        text.to_string()
    } else {
        text.chars().skip(count - TAIL_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, SandboxError};
    use crate::types::{ExecOutcome, OutputChunk};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    /// Scripted CommandRunner: pops one outcome per exec call and records the
    /// commands it saw.
    struct StubRunner {
        outcomes: Mutex<VecDeque<Result<ExecOutcome>>>,
        commands: Mutex<Vec<Vec<String>>>,
    }

    impl StubRunner {
        fn new(outcomes: Vec<Result<ExecOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                commands: Mutex::new(Vec::new()),
            }
        }

        fn commands(&self) -> Vec<Vec<String>> {
            self.commands.lock().unwrap().clone()
        }
    }

    fn ok(exit_code: i64) -> Result<ExecOutcome> {
        Ok(ExecOutcome {
            stdout: Vec::new(),
            stderr: Vec::new(),
            exit_code,
        })
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn exec(
            &self,
            _context: &ExecutionContext,
            command: Vec<String>,
            _timeout: Duration,
            _progress: Option<mpsc::UnboundedSender<OutputChunk>>,
        ) -> Result<ExecOutcome> {
            self.commands.lock().unwrap().push(command);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| ok(0))
        }
    }

    fn context() -> ExecutionContext {
        ExecutionContext {
            name: "testbox-test".to_string(),
            host_dir: "/tmp/project".into(),
            workdir: "/workspace".to_string(),
        }
    }

    #[tokio::test]
    async fn first_failure_does_not_stop_the_second_install() {
        // mkdir ok, first npm install exits 1, second succeeds.
        let stub = StubRunner::new(vec![ok(0), ok(1), ok(0)]);
        let installer = DependencyInstaller::new(&stub, Duration::from_secs(60));
        let project = tempfile::tempdir().unwrap(); // no package.json

        let manifest = NormalizedManifest {
            npm: vec!["broken-pkg".to_string(), "mocha@10.2.0".to_string()],
            ..Default::default()
        };
        let log = ProgressLog::new();
        let report = installer
            .install_all(&context(), project.path(), &manifest, &log)
            .await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn runner_errors_count_as_failures_and_never_propagate() {
        let stub = StubRunner::new(vec![
            ok(0),
            Err(SandboxError::Timeout {
                ms: 1000,
                output: String::new(),
            }),
        ]);
        let installer = DependencyInstaller::new(&stub, Duration::from_secs(60));
        let project = tempfile::tempdir().unwrap();

        let manifest = NormalizedManifest {
            git: vec!["a/b".to_string()],
            ..Default::default()
        };
        let log = ProgressLog::new();
        let report = installer
            .install_all(&context(), project.path(), &manifest, &log)
            .await;

        assert_eq!(report.attempted, 1);
        assert_eq!(report.failed, 1);
        assert!(log.entries().iter().any(|e| e.contains("install failed")));
    }

    #[tokio::test]
    async fn project_manifest_triggers_whole_project_install_first() {
        let stub = StubRunner::new(vec![]);
        let installer = DependencyInstaller::new(&stub, Duration::from_secs(60));
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(BUILD_CONFIG_FILE), "{}").unwrap();

        let manifest = NormalizedManifest {
            npm: vec!["mocha".to_string()],
            ..Default::default()
        };
        let log = ProgressLog::new();
        let report = installer
            .install_all(&context(), project.path(), &manifest, &log)
            .await;

        let commands = stub.commands();
        // mkdir, npm install (whole project), npm install mocha
        assert_eq!(commands.len(), 3);
        assert_eq!(commands[0][0], "mkdir");
        assert_eq!(commands[1], vec!["npm", "install"]);
        assert_eq!(commands[2], vec!["npm", "install", "mocha"]);
        assert_eq!(report.attempted, 2);
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test]
    async fn yarn_lock_switches_the_project_install_to_yarn() {
        let stub = StubRunner::new(vec![]);
        let installer = DependencyInstaller::new(&stub, Duration::from_secs(60));
        let project = tempfile::tempdir().unwrap();
        std::fs::write(project.path().join(BUILD_CONFIG_FILE), "{}").unwrap();
        std::fs::write(project.path().join("yarn.lock"), "").unwrap();

        let log = ProgressLog::new();
        installer
            .install_all(
                &context(),
                project.path(),
                &NormalizedManifest {
                    yarn: vec!["chai".to_string()],
                    ..Default::default()
                },
                &log,
            )
            .await;

        let commands = stub.commands();
        assert_eq!(commands[1], vec!["yarn", "install", "--frozen-lockfile"]);
        assert_eq!(commands[2], vec!["yarn", "add", "chai"]);
    }

    #[test]
    fn git_tokens_map_to_tarball_install_urls() {
        assert_eq!(
            git_install_url("a/b"),
            "git+https://github.com/a/b.git"
        );
        assert_eq!(
            git_install_url("a/b@v1.2.0"),
            "git+https://github.com/a/b.git#v1.2.0"
        );
    }

    #[test]
    fn output_tail_keeps_the_last_characters() {
        let long = "x".repeat(400) + "tail end";
        assert!(output_tail(long.as_bytes()).ends_with("tail end"));
        assert_eq!(output_tail(b"short"), "short");
    }
}
