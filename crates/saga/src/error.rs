//! Saga error types.

use command_bus::BusError;
use message_store::{OrchestrationId, RepositoryError};
use thiserror::Error;

/// Errors that can occur during orchestration operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The orchestration has no fallback step. An empty one is allowed.
    #[error("Orchestration '{0}' has no fallback step")]
    MissingFallback(String),

    /// A command is not linked to the step it was placed in.
    #[error("Command {method} in step '{step}' is not linked to orchestration {orchestration_id}")]
    MissingLinkage {
        orchestration_id: OrchestrationId,
        step: String,
        method: String,
    },

    /// Orchestration has already been started.
    #[error("Orchestration {0} is already running")]
    AlreadyRunning(OrchestrationId),

    /// Every command of the orchestration is already terminal.
    #[error("Orchestration {0} has already finished")]
    AlreadyFinished(OrchestrationId),

    /// No commands are stored for the orchestration.
    #[error("Orchestration not found: {0}")]
    OrchestrationNotFound(OrchestrationId),

    /// Repository error.
    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    /// Command bus error.
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
