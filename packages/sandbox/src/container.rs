// ABOUTME: Docker container lifecycle management via bollard
// ABOUTME: Creates the per-run execution container and guarantees best-effort idempotent removal

use crate::error::{Result, SandboxError};
use crate::types::{ExecutionContext, WORKSPACE_DIR};
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::models::HostConfig;
use bollard::Docker;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Label applied to every container this engine creates.
pub const MANAGED_LABEL: &str = "testbox.managed";

/// Environment contract passed into every execution container: test profile
/// selector plus warning/noise suppression for the package managers.
const CONTAINER_ENV: &[(&str, &str)] = &[
    ("NODE_ENV", "test"),
    ("CI", "true"),
    ("NO_UPDATE_NOTIFIER", "1"),
    ("NPM_CONFIG_FUND", "false"),
    ("NPM_CONFIG_AUDIT", "false"),
];

const START_PROBE_DELAY: Duration = Duration::from_millis(500);
const STOP_GRACE_SECS: i64 = 5;

/// Container manager for the per-run execution context.
pub struct ContainerManager {
    docker: Docker,
}

impl ContainerManager {
    /// Connect with platform defaults and verify the daemon responds before
    /// anything is created.
    pub async fn new() -> Result<Self> {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| SandboxError::DockerUnavailable(e.to_string()))?;
        docker.ping().await.map_err(|e| {
            SandboxError::DockerUnavailable(format!(
                "daemon did not respond to ping (is Docker running?): {}",
                e
            ))
        })?;
        debug!("connected to Docker daemon");
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    /// Create and start the execution container for one run.
    ///
    /// The image must already be confirmed present (the provisioner's job).
    /// The container runs a no-op foreground process so it stays alive for
    /// subsequent exec calls, binds `host_dir` read-write at
    /// [`WORKSPACE_DIR`], and has the engine's auto-removal disabled: this
    /// manager owns removal explicitly.
    pub async fn create(&self, image: &str, host_dir: &Path) -> Result<ExecutionContext> {
        let name = unique_name();
        debug!("creating container {} from image {}", name, image);

        let env: Vec<String> = CONTAINER_ENV
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            binds: Some(vec![format!(
                "{}:{}:rw",
                host_dir.display(),
                WORKSPACE_DIR
            )]),
            auto_remove: Some(false),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.to_string()),
            cmd: Some(vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ]),
            env: Some(env),
            working_dir: Some(WORKSPACE_DIR.to_string()),
            labels: Some(HashMap::from([(
                MANAGED_LABEL.to_string(),
                "true".to_string(),
            )])),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| SandboxError::ContainerLifecycle(format!("create failed: {}", e)))?;

        if let Err(e) = self.start_and_confirm(&name).await {
            // Partially created container: clean it up before reporting.
            self.force_remove(&name).await;
            return Err(e);
        }

        info!("container {} running", name);
        Ok(ExecutionContext {
            name,
            host_dir: host_dir.to_path_buf(),
            workdir: WORKSPACE_DIR.to_string(),
        })
    }

    async fn start_and_confirm(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::ContainerLifecycle(format!("start failed: {}", e)))?;

        tokio::time::sleep(START_PROBE_DELAY).await;

        let inspect = self.docker.inspect_container(name, None).await.map_err(|e| {
            SandboxError::ContainerLifecycle(format!("inspect after start failed: {}", e))
        })?;
        let running = inspect
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        if !running {
            return Err(SandboxError::ContainerLifecycle(format!(
                "container {} did not reach running state",
                name
            )));
        }
        Ok(())
    }

    /// Remove the execution container. Consumes the context, never fails:
    /// an already-gone container is success, anything else is logged and
    /// swallowed so cleanup is a true finalizer.
    pub async fn remove(&self, context: ExecutionContext) {
        let name = context.name;
        debug!("removing container {}", name);

        match self
            .docker
            .stop_container(&name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(_) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => debug!("container {} already stopped", name),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!("container {} already gone", name);
                return;
            }
            Err(e) => warn!("failed to stop container {}: {}", name, e),
        }

        self.force_remove(&name).await;
    }

    async fn force_remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(_) => info!("removed container {}", name),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => debug!("container {} already removed", name),
            Err(e) => warn!("failed to remove container {}: {}", name, e),
        }
    }

    /// Count live containers carrying the managed label, stopped included.
    pub async fn count_managed(&self) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}=true", MANAGED_LABEL)],
        );
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;
        Ok(containers.len())
    }
}

/// Globally unique per run: monotonic millisecond reading plus a random
/// suffix, so concurrent runs never collide.
fn unique_name() -> String {
    let suffix: String = Uuid::new_v4().simple().to_string().chars().take(8).collect();
    format!("testbox-{}-{}", Utc::now().timestamp_millis(), suffix)
}
