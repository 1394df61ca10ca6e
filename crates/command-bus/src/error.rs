//! Command bus error types.

use message_store::{MessageError, RepositoryError};
use thiserror::Error;

use crate::registry::DependencyKey;

/// Boxed error returned by registered factories.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors that can occur during bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Ack(String),

    /// The message was never persisted, so it has no ID to travel by.
    #[error("Message has no identity; persist it before publishing")]
    MissingIdentity,

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors returned by the dependency registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("No method registered for `{0}`")]
    MethodNotRegistered(DependencyKey),

    #[error("Dependency `{key}` is not a {expected}")]
    TypeMismatch {
        key: DependencyKey,
        expected: &'static str,
    },

    #[error("Method `{key}` failed: {reason}")]
    MethodFailed { key: DependencyKey, reason: String },

    #[error("Method `{0}` panicked")]
    MethodPanicked(DependencyKey),
}

/// Errors reported by external collaborators (storage, container engine).
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),
}

/// Errors a command handler can return.
///
/// A handler error never escapes the bus: its text is attached to the
/// message's `Complete` status, where it triggers saga compensation.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
}

impl HandlerError {
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        HandlerError::Failed(reason.to_string())
    }
}
