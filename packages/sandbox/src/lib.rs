// ABOUTME: Sandbox orchestration engine for running test commands in disposable Docker containers
// ABOUTME: Provisions the runner image, manages container lifecycle, installs dependencies, reports verdicts

pub mod container;
pub mod error;
pub mod exec;
pub mod image;
pub mod installer;
pub mod manifest;
pub mod runner;
pub mod types;

// Re-export commonly used types
pub use container::ContainerManager;
pub use error::{Result, SandboxError};
pub use exec::{CommandRunner, DockerRunner};
pub use image::{ImageProvisioner, ImageStatus};
pub use installer::DependencyInstaller;
pub use manifest::{DependencyManifest, NormalizedManifest, SectionSpec};
pub use runner::{RunRequest, RunnerConfig, SandboxRunner};
pub use types::{
    ExecOutcome, ExecutionContext, InstallReport, OutputChunk, ProgressLog, RunReport, StreamType,
    Verdict, BUILD_CONFIG_FILE, WORKSPACE_DIR,
};
