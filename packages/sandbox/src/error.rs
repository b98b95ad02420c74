// ABOUTME: Error taxonomy for sandbox orchestration
// ABOUTME: Build failures are fatal; a failing sandboxed command is an exit code, not an error

use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// The engine reported an error event during an image build, or the
    /// build stream ended without producing an image.
    #[error("image build failed: {0}")]
    Build(String),

    /// Docker transport/API failures (connect, create, start).
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Host filesystem access during mount resolution, or sink writes.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
