//! Orchestration engine: persists sagas and dispatches their steps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use command_bus::{CommandBus, Transport};
use message_store::{Message, MessageRepository, OrchestrationId};
use tracing::{debug, info, warn};

use crate::error::{Result, SagaError};
use crate::orchestration::MessageOrchestration;
use crate::state::OrchestrationState;

/// Creates and starts orchestrations.
///
/// Progress after the first step is driven by
/// [`OrchestrationRunner`](crate::runner::OrchestrationRunner), which reacts
/// to completion events; the engine itself holds no per-saga state.
pub struct OrchestrationEngine<R, T> {
    bus: Arc<CommandBus<R, T>>,
}

impl<R, T> OrchestrationEngine<R, T>
where
    R: MessageRepository + Clone + 'static,
    T: Transport,
{
    pub fn new(bus: Arc<CommandBus<R, T>>) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &Arc<CommandBus<R, T>> {
        &self.bus
    }

    pub(crate) fn repository(&self) -> &R {
        self.bus.repository()
    }

    /// Validates and persists every command of the orchestration in one batch.
    ///
    /// Nothing is stored when validation fails. The returned orchestration
    /// carries the assigned message IDs.
    #[tracing::instrument(skip(self, orchestration), fields(orchestration_id = %orchestration.id, name = %orchestration.name))]
    pub async fn create_orchestration(
        &self,
        mut orchestration: MessageOrchestration,
    ) -> Result<MessageOrchestration> {
        orchestration.validate()?;

        let messages: Vec<Message> = orchestration.messages().cloned().collect();
        let ids = self.repository().create_messages(&messages).await?;
        orchestration.assign_ids(&ids);

        info!(
            steps = orchestration.steps.len(),
            commands = ids.len(),
            "Orchestration created"
        );
        Ok(orchestration)
    }

    /// Dispatches the first step.
    ///
    /// Only an orchestration whose commands are all still CREATED can be
    /// run. When two callers race, the one that loses the claim gets
    /// [`SagaError::AlreadyRunning`].
    #[tracing::instrument(skip(self))]
    pub async fn run_orchestration(&self, id: OrchestrationId) -> Result<()> {
        let summary = self.repository().orchestration_summary(id).await?;
        if !summary.exists() {
            return Err(SagaError::OrchestrationNotFound(id));
        }
        if summary.is_running() {
            return Err(SagaError::AlreadyRunning(id));
        }
        if summary.created != summary.total {
            return Err(SagaError::AlreadyFinished(id));
        }

        let claimed = self
            .repository()
            .get_latest_unpublished_orchestration_step_commands(id, None)
            .await?;

        if claimed.is_empty() {
            if self.repository().orchestration_summary(id).await?.normal_pending > 0 {
                return Err(SagaError::AlreadyRunning(id));
            }
            // No normal step to run: only the fallback is left to settle.
            self.finish_if_complete(id).await?;
            return Ok(());
        }

        self.dispatch(&claimed).await?;
        info!(commands = claimed.len(), "Orchestration started");
        Ok(())
    }

    /// Current derived state.
    pub async fn orchestration_state(&self, id: OrchestrationId) -> Result<OrchestrationState> {
        let summary = self.repository().orchestration_summary(id).await?;
        if !summary.exists() {
            return Err(SagaError::OrchestrationNotFound(id));
        }
        Ok(OrchestrationState::from_summary(&summary))
    }

    /// True once every command is terminal: nothing will run any more.
    pub async fn orchestration_is_settled(&self, id: OrchestrationId) -> Result<bool> {
        let summary = self.repository().orchestration_summary(id).await?;
        Ok(summary.exists() && summary.terminal == summary.total)
    }

    /// Every command of the orchestration with its history, by step.
    pub async fn get_orchestration_messages(&self, id: OrchestrationId) -> Result<Vec<Message>> {
        Ok(self.repository().get_orchestration_messages(id).await?)
    }

    /// Re-sends commands stuck in PUBLISHED since before `published_before`.
    ///
    /// Covers a crash between claiming a command and handing it to the
    /// broker. If the original did reach the bus, only one of the two
    /// deliveries wins the PUBLISHED to RECEIVED transition.
    #[tracing::instrument(skip(self))]
    pub async fn recover_stale(&self, published_before: DateTime<Utc>) -> Result<usize> {
        let stale = self.repository().find_stale_published(published_before).await?;
        for message in &stale {
            warn!(message_id = ?message.id, method = %message.method, "Re-sending stale command");
            self.bus.send(message).await?;
        }
        Ok(stale.len())
    }

    /// Sends commands the repository already claimed as PUBLISHED.
    pub(crate) async fn dispatch(&self, claimed: &[Message]) -> Result<()> {
        for message in claimed {
            self.bus.send(message).await?;
            debug!(message_id = ?message.id, step = ?message.step_number(), "Step command dispatched");
        }
        metrics::counter!("orchestration_steps_dispatched_total").increment(claimed.len() as u64);
        Ok(())
    }

    /// Cancels the unused fallback of a successfully completed orchestration.
    ///
    /// Returns true if this call performed the cancellation.
    pub(crate) async fn finish_if_complete(&self, id: OrchestrationId) -> Result<bool> {
        let summary = self.repository().orchestration_summary(id).await?;
        if !summary.is_complete() || summary.has_error() {
            return Ok(false);
        }

        let canceled = self.repository().mark_all_created_as_canceled(id).await?;
        if canceled == 0 {
            return Ok(false);
        }

        metrics::counter!("orchestrations_completed_total", "outcome" => "success").increment(1);
        info!(orchestration_id = %id, "Orchestration completed");
        Ok(true)
    }
}
