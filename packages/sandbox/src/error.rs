// ABOUTME: Error types for sandbox orchestration
// ABOUTME: Distinguishes engine failures (config, daemon, image, lifecycle) from test outcomes

use thiserror::Error;

/// Main error type for sandbox operations.
///
/// A failed test command is not an error: it surfaces as a `Fail` verdict in
/// the run report. Likewise, individual dependency-install failures are
/// aggregated into counters and never raised through this type.
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Missing or invalid caller-supplied configuration (project dir,
    /// build-configuration file, dependency manifest, build descriptor).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Docker daemon unreachable.
    #[error("Docker daemon unavailable: {0}")]
    DockerUnavailable(String),

    /// `docker build` exited nonzero; carries the tail of the build output.
    #[error("image build failed:\n{tail}")]
    ImageBuild { tail: String },

    /// Container create/start failed, or the container never reached the
    /// running state.
    #[error("container lifecycle error: {0}")]
    ContainerLifecycle(String),

    /// A command exceeded its time budget. Carries whatever output the
    /// command produced before the deadline expired.
    #[error("command timed out after {ms} ms")]
    Timeout { ms: u64, output: String },

    /// Docker API errors not covered by a more specific variant.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;
