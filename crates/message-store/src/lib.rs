//! Message persistence for the saga orchestration engine.
//!
//! A [`Message`] is the unit of work moved by the command bus. Its state lives
//! here: every status change is appended to an immutable history, and all
//! orchestration progress is derived from that history on demand.

pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod repository;
pub mod status;

pub use common::{MessageId, OrchestrationId};
pub use error::{MessageError, RepositoryError, Result};
pub use memory::InMemoryMessageRepository;
pub use message::{Message, OrchestrationLink};
pub use postgres::{PostgresMessageRepository, StatusChange, StatusChangeStream};
pub use repository::{MessageRepository, MessageRepositoryExt, OrchestrationSummary};
pub use status::{MessageStatus, StatusEntry};
