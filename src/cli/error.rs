//! CLI error types and conversions

use crate::checkpoint::CheckpointError;
use crate::dispatcher::DispatchError;
use crate::invoker::SetupError;
use crate::source::SourceError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Work source error
    #[error("input error: {0}")]
    SourceError(#[from] SourceError),

    /// Checkpoint error
    #[error("checkpoint error: {0}")]
    CheckpointError(#[from] CheckpointError),

    /// Dispatch error
    #[error("dispatch error: {0}")]
    DispatchError(#[from] DispatchError),

    /// Invoker setup error
    #[error("invoker setup error: {0}")]
    SetupError(#[from] SetupError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),
}
