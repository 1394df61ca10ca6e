//! Shared identifier types for the orchestration workspace.

pub mod types;

pub use types::{MessageId, OrchestrationId};
