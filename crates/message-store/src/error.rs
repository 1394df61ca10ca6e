use thiserror::Error;

use crate::MessageId;

/// Errors raised while building or reading a message.
#[derive(Debug, Error)]
pub enum MessageError {
    /// The payload could not be encoded.
    #[error("Payload encoding error: {0}")]
    Encoding(#[source] serde_json::Error),

    /// The payload does not match the requested shape.
    #[error("Payload decoding error: {0}")]
    Decoding(#[source] serde_json::Error),

    /// The wire record could not be parsed.
    #[error("Malformed wire message: {0}")]
    Wire(#[source] serde_json::Error),
}

/// Errors that can occur when interacting with the message repository.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The message does not exist.
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    /// A stored status value is not one of the known statuses.
    #[error("Unknown message status: {0}")]
    UnknownStatus(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A change notification could not be decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepositoryError>;
