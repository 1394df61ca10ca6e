//! Orchestration runner: advances sagas as their commands complete.

use std::sync::Arc;

use async_trait::async_trait;
use command_bus::{EventHandler, HandlerError, Topic, Transport};
use message_store::{Message, MessageRepository, OrchestrationId, OrchestrationSummary};
use tracing::{debug, info, warn};

use crate::engine::OrchestrationEngine;
use crate::error::Result;

/// Listens to every completion event in the bus namespace and decides,
/// from the stored command statuses, whether to advance, compensate or
/// wait.
///
/// Safe to run in several processes at once: dispatch goes through the
/// repository's claim, which hands each command out only once.
pub struct OrchestrationRunner<R, T> {
    engine: Arc<OrchestrationEngine<R, T>>,
}

impl<R, T> Clone for OrchestrationRunner<R, T> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<R, T> OrchestrationRunner<R, T>
where
    R: MessageRepository + Clone + 'static,
    T: Transport,
{
    pub fn new(engine: Arc<OrchestrationEngine<R, T>>) -> Self {
        Self { engine }
    }

    /// Subscribes to `<namespace>.*.*.*.event`.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let bus = self.engine.bus();
        let pattern = Topic::event_wildcard(&bus.config().namespace);
        bus.event_subscriber(&pattern, self.clone()).await?;
        info!(%pattern, "Orchestration runner started");
        Ok(())
    }

    /// Reacts to one completion event.
    pub async fn handle_event(&self, event: &Message) -> Result<()> {
        let Some(id) = event.id else {
            debug!("Event without message ID ignored");
            return Ok(());
        };

        let repository = self.engine.repository();
        let Some(message) = repository.get_message(id).await? else {
            warn!(message_id = %id, "Event for unknown message ignored");
            return Ok(());
        };
        let Some(link) = message.orchestration.as_ref() else {
            return Ok(());
        };
        let orchestration_id = link.orchestration_id;

        if link.fallback {
            // Nothing follows a compensation command.
            let summary = repository.orchestration_summary(orchestration_id).await?;
            if summary.is_complete() && summary.fallback_pending == 0 {
                repository.mark_all_created_as_canceled(orchestration_id).await?;
                metrics::counter!("orchestrations_completed_total", "outcome" => "compensated")
                    .increment(1);
                info!(%orchestration_id, "Orchestration compensated");
            }
            return Ok(());
        }

        let summary = repository.orchestration_summary(orchestration_id).await?;
        if summary.is_complete() && !summary.has_error() {
            self.engine.finish_if_complete(orchestration_id).await?;
            return Ok(());
        }

        if !summary.is_complete()
            && let Some(step) = link.step_number
            && !repository
                .orchestration_step_is_complete(orchestration_id, step)
                .await?
        {
            debug!(%orchestration_id, step, "Step still in flight");
            return Ok(());
        }

        let claimed = repository
            .get_latest_unpublished_orchestration_step_commands(orchestration_id, link.step_number)
            .await?;
        if claimed.is_empty() {
            if summary.has_error() {
                // Empty fallback, or another runner claimed it already.
                self.cancel_remaining(orchestration_id, &summary, &link.step_name)
                    .await?;
            }
            return Ok(());
        }

        if claimed.iter().any(Message::is_fallback) {
            let canceled = repository.mark_all_created_as_canceled(orchestration_id).await?;
            metrics::counter!("orchestration_compensations_total").increment(1);
            warn!(
                %orchestration_id,
                step = link.step_name.as_str(),
                canceled,
                "Orchestration failed, compensating"
            );
        }

        self.engine.dispatch(&claimed).await
    }

    /// Cancels what is left of a failed orchestration that has no fallback
    /// command to run.
    async fn cancel_remaining(
        &self,
        orchestration_id: OrchestrationId,
        summary: &OrchestrationSummary,
        step: &str,
    ) -> Result<()> {
        let canceled = self
            .engine
            .repository()
            .mark_all_created_as_canceled(orchestration_id)
            .await?;

        if summary.fallback_pending == 0 && (canceled > 0 || summary.is_complete()) {
            metrics::counter!("orchestration_compensations_total").increment(1);
            metrics::counter!("orchestrations_completed_total", "outcome" => "compensated")
                .increment(1);
            warn!(%orchestration_id, step, canceled, "Orchestration failed without fallback commands");
        }
        Ok(())
    }
}

#[async_trait]
impl<R, T> EventHandler for OrchestrationRunner<R, T>
where
    R: MessageRepository + Clone + 'static,
    T: Transport,
{
    async fn handle(&self, message: Message) -> std::result::Result<(), HandlerError> {
        self.handle_event(&message).await.map_err(HandlerError::failed)
    }
}
