//! Handler traits for commands and completion events.

use std::future::Future;

use async_trait::async_trait;
use message_store::Message;

use crate::error::HandlerError;
use crate::registry::Dependencies;

/// Does the work a command asks for.
///
/// Returning an error, or panicking, completes the command with that error
/// recorded; either way the bus publishes the completion event.
#[async_trait]
pub trait CommandHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message, dependencies: Dependencies) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> CommandHandler for F
where
    F: Fn(Message, Dependencies) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message, dependencies: Dependencies) -> Result<(), HandlerError> {
        (self)(message, dependencies).await
    }
}

/// Reacts to completion events.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> Result<(), HandlerError>;
}

#[async_trait]
impl<F, Fut> EventHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> Result<(), HandlerError> {
        (self)(message).await
    }
}
