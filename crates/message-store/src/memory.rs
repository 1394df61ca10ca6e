use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    Message, MessageId, MessageStatus, OrchestrationId, RepositoryError, Result, StatusEntry,
    repository::{ClaimCandidate, MessageRepository, OrchestrationSummary, plan_claim},
};

#[derive(Debug, Clone)]
struct StoredMessage {
    message: Message,
    error: Option<String>,
    seq: u64,
}

impl StoredMessage {
    fn status(&self) -> MessageStatus {
        self.message.status().unwrap_or(MessageStatus::Created)
    }

    fn belongs_to(&self, id: OrchestrationId) -> bool {
        self.message.orchestration_id() == Some(id)
    }

    fn set_status(&mut self, status: MessageStatus, error: Option<&str>) {
        if let Some(error) = error {
            self.error = Some(error.to_string());
        }
        if self.message.status() != Some(status) {
            self.message
                .history
                .insert(0, StatusEntry::new(status, self.error.clone()));
        }
    }

    fn candidate(&self, id: MessageId) -> ClaimCandidate {
        let link = self.message.orchestration.as_ref();
        ClaimCandidate {
            id,
            status: self.status(),
            has_error: self.error.is_some(),
            step_number: link.and_then(|l| l.step_number),
            fallback: link.is_some_and(|l| l.fallback),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    messages: HashMap<MessageId, StoredMessage>,
    next_seq: u64,
}

impl State {
    fn insert(&mut self, message: &Message) -> MessageId {
        let id = MessageId::new();
        let mut stored = message.clone();
        stored.id = Some(id);
        stored.history = vec![StatusEntry::new(MessageStatus::Created, None)];
        self.next_seq += 1;
        self.messages.insert(
            id,
            StoredMessage {
                message: stored,
                error: None,
                seq: self.next_seq,
            },
        );
        id
    }

    fn orchestration(&self, id: OrchestrationId) -> impl Iterator<Item = (&MessageId, &StoredMessage)> {
        self.messages.iter().filter(move |(_, m)| m.belongs_to(id))
    }
}

/// In-memory message repository for testing and standalone runs.
///
/// Provides the same semantics as the PostgreSQL implementation; a single
/// write lock stands in for the per-orchestration advisory lock.
#[derive(Clone, Default)]
pub struct InMemoryMessageRepository {
    state: Arc<RwLock<State>>,
}

impl InMemoryMessageRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of stored messages.
    pub async fn message_count(&self) -> usize {
        self.state.read().await.messages.len()
    }

    /// Returns the total number of status log entries across all messages.
    pub async fn status_log_count(&self) -> usize {
        self.state
            .read()
            .await
            .messages
            .values()
            .map(|m| m.message.history.len())
            .sum()
    }

    /// Clears all messages.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.messages.clear();
        state.next_seq = 0;
    }
}

#[async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn create_message(&self, message: &Message) -> Result<MessageId> {
        Ok(self.state.write().await.insert(message))
    }

    async fn create_messages(&self, messages: &[Message]) -> Result<Vec<MessageId>> {
        let mut state = self.state.write().await;
        Ok(messages.iter().map(|m| state.insert(m)).collect())
    }

    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state
            .messages
            .get_mut(&id)
            .ok_or(RepositoryError::MessageNotFound(id))?;
        stored.set_status(status, error);
        Ok(())
    }

    async fn mark_received(&self, id: MessageId) -> Result<bool> {
        let mut state = self.state.write().await;
        match state.messages.get_mut(&id) {
            Some(stored) if stored.status() == MessageStatus::Published => {
                stored.set_status(MessageStatus::Received, None);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let state = self.state.read().await;
        Ok(state.messages.get(&id).map(|m| m.message.clone()))
    }

    async fn get_orchestration_messages(&self, id: OrchestrationId) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let mut stored: Vec<&StoredMessage> = state.orchestration(id).map(|(_, m)| m).collect();
        stored.sort_by_key(|m| {
            (
                m.message.is_fallback(),
                m.message.step_number().unwrap_or(i32::MAX),
                m.seq,
            )
        });
        Ok(stored.into_iter().map(|m| m.message.clone()).collect())
    }

    async fn orchestration_summary(&self, id: OrchestrationId) -> Result<OrchestrationSummary> {
        let state = self.state.read().await;
        Ok(OrchestrationSummary::from_commands(state.orchestration(id).map(
            |(_, m)| (m.status(), m.error.is_some(), m.message.is_fallback()),
        )))
    }

    async fn orchestration_step_is_complete(
        &self,
        id: OrchestrationId,
        step: i32,
    ) -> Result<bool> {
        let state = self.state.read().await;
        Ok(!state.orchestration(id).any(|(_, m)| {
            !m.message.is_fallback()
                && m.message.step_number() == Some(step)
                && m.status().is_pending()
        }))
    }

    async fn get_latest_unpublished_orchestration_step_commands(
        &self,
        id: OrchestrationId,
        current_step: Option<i32>,
    ) -> Result<Vec<Message>> {
        let mut state = self.state.write().await;
        let candidates: Vec<ClaimCandidate> = state
            .orchestration(id)
            .map(|(message_id, m)| m.candidate(*message_id))
            .collect();

        let mut claimed = Vec::new();
        for message_id in plan_claim(&candidates, current_step) {
            if let Some(stored) = state.messages.get_mut(&message_id) {
                stored.set_status(MessageStatus::Published, None);
                claimed.push((stored.seq, stored.message.clone()));
            }
        }
        claimed.sort_by_key(|(seq, _)| *seq);
        Ok(claimed.into_iter().map(|(_, m)| m).collect())
    }

    async fn mark_all_created_as_canceled(&self, id: OrchestrationId) -> Result<u64> {
        let mut state = self.state.write().await;
        let mut canceled = 0;
        for stored in state.messages.values_mut() {
            if stored.belongs_to(id) && stored.status() == MessageStatus::Created {
                stored.set_status(MessageStatus::Canceled, None);
                canceled += 1;
            }
        }
        Ok(canceled)
    }

    async fn find_stale_published(
        &self,
        published_before: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let state = self.state.read().await;
        let mut stale: Vec<&StoredMessage> = state
            .messages
            .values()
            .filter(|m| {
                m.message.latest().is_some_and(|entry| {
                    entry.status == MessageStatus::Published && entry.occurred_at < published_before
                })
            })
            .collect();
        stale.sort_by_key(|m| m.seq);
        Ok(stale.into_iter().map(|m| m.message.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MessageRepositoryExt, OrchestrationLink};

    fn command(method: &str) -> Message {
        Message::from_raw("backtest", "engine", method, b"{}".to_vec())
    }

    fn step_command(id: OrchestrationId, step: i32) -> Message {
        command("run").with_orchestration(OrchestrationLink::step(id, "saga", "step", step))
    }

    fn fallback_command(id: OrchestrationId) -> Message {
        command("cleanup").with_orchestration(OrchestrationLink::fallback(id, "saga", "fallback"))
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let repo = InMemoryMessageRepository::new();
        let id = repo.create_message(&command("run")).await.unwrap();

        let message = repo.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.id, Some(id));
        assert_eq!(message.status(), Some(MessageStatus::Created));
        assert_eq!(message.history().len(), 1);
    }

    #[tokio::test]
    async fn get_missing_message_returns_none() {
        let repo = InMemoryMessageRepository::new();
        assert!(repo.get_message(MessageId::new()).await.unwrap().is_none());
        let err = repo.require_message(MessageId::new()).await.unwrap_err();
        assert!(matches!(err, RepositoryError::MessageNotFound(_)));
    }

    #[tokio::test]
    async fn history_is_newest_first_and_skips_no_op_updates() {
        let repo = InMemoryMessageRepository::new();
        let id = repo.create_message(&command("run")).await.unwrap();

        repo.update_message_status(id, MessageStatus::Published, None)
            .await
            .unwrap();
        repo.update_message_status(id, MessageStatus::Published, None)
            .await
            .unwrap();
        repo.update_message_status(id, MessageStatus::Received, None)
            .await
            .unwrap();

        let message = repo.get_message(id).await.unwrap().unwrap();
        let statuses: Vec<_> = message.history().iter().map(|e| e.status).collect();
        assert_eq!(
            statuses,
            vec![
                MessageStatus::Received,
                MessageStatus::Published,
                MessageStatus::Created
            ]
        );
    }

    #[tokio::test]
    async fn update_unknown_message_fails() {
        let repo = InMemoryMessageRepository::new();
        let result = repo
            .update_message_status(MessageId::new(), MessageStatus::Published, None)
            .await;
        assert!(matches!(result, Err(RepositoryError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn error_text_is_recorded_on_complete() {
        let repo = InMemoryMessageRepository::new();
        let id = repo.create_message(&command("run")).await.unwrap();
        repo.update_message_status(id, MessageStatus::Complete, Some("boom"))
            .await
            .unwrap();

        let message = repo.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.status(), Some(MessageStatus::Complete));
        assert_eq!(message.error(), Some("boom"));
    }

    #[tokio::test]
    async fn claim_marks_commands_published_once() {
        let repo = InMemoryMessageRepository::new();
        let saga = OrchestrationId::new();
        repo.create_messages(&[step_command(saga, 0), step_command(saga, 0), fallback_command(saga)])
            .await
            .unwrap();

        let first = repo
            .get_latest_unpublished_orchestration_step_commands(saga, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 2);
        assert!(first.iter().all(|m| m.status() == Some(MessageStatus::Published)));

        let second = repo
            .get_latest_unpublished_orchestration_step_commands(saga, None)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn predicates_follow_command_statuses() {
        let repo = InMemoryMessageRepository::new();
        let saga = OrchestrationId::new();
        let ids = repo
            .create_messages(&[step_command(saga, 0), step_command(saga, 1), fallback_command(saga)])
            .await
            .unwrap();

        assert!(!repo.orchestration_is_running(saga).await.unwrap());
        assert!(!repo.orchestration_step_is_complete(saga, 0).await.unwrap());

        repo.update_message_status(ids[0], MessageStatus::Complete, None)
            .await
            .unwrap();
        assert!(repo.orchestration_is_running(saga).await.unwrap());
        assert!(repo.orchestration_step_is_complete(saga, 0).await.unwrap());
        assert!(!repo.orchestration_is_complete(saga).await.unwrap());

        repo.update_message_status(ids[1], MessageStatus::Complete, Some("failed"))
            .await
            .unwrap();
        assert!(repo.orchestration_is_complete(saga).await.unwrap());
        assert!(repo.orchestration_has_error(saga).await.unwrap());
    }

    #[tokio::test]
    async fn cancel_only_touches_created_commands() {
        let repo = InMemoryMessageRepository::new();
        let saga = OrchestrationId::new();
        let ids = repo
            .create_messages(&[step_command(saga, 0), step_command(saga, 1)])
            .await
            .unwrap();
        repo.update_message_status(ids[0], MessageStatus::Received, None)
            .await
            .unwrap();

        assert_eq!(repo.mark_all_created_as_canceled(saga).await.unwrap(), 1);

        let first = repo.get_message(ids[0]).await.unwrap().unwrap();
        let second = repo.get_message(ids[1]).await.unwrap().unwrap();
        assert_eq!(first.status(), Some(MessageStatus::Received));
        assert_eq!(second.status(), Some(MessageStatus::Canceled));
    }

    #[tokio::test]
    async fn orchestration_messages_put_fallback_last() {
        let repo = InMemoryMessageRepository::new();
        let saga = OrchestrationId::new();
        repo.create_messages(&[fallback_command(saga), step_command(saga, 1), step_command(saga, 0)])
            .await
            .unwrap();

        let messages = repo.get_orchestration_messages(saga).await.unwrap();
        let steps: Vec<_> = messages.iter().map(|m| m.step_number()).collect();
        assert_eq!(steps, vec![Some(0), Some(1), None]);
    }

    #[tokio::test]
    async fn stale_published_messages_are_found() {
        let repo = InMemoryMessageRepository::new();
        let id = repo.create_message(&command("run")).await.unwrap();
        repo.create_message(&command("other")).await.unwrap();
        repo.update_message_status(id, MessageStatus::Published, None)
            .await
            .unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let stale = repo.find_stale_published(cutoff).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, Some(id));

        let earlier = Utc::now() - chrono::Duration::minutes(5);
        assert!(repo.find_stale_published(earlier).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_received_only_from_published() {
        let repo = InMemoryMessageRepository::new();
        let id = repo.create_message(&command("start")).await.unwrap();

        assert!(!repo.mark_received(id).await.unwrap());
        assert!(!repo.mark_received(MessageId::new()).await.unwrap());

        repo.update_message_status(id, MessageStatus::Published, None)
            .await
            .unwrap();
        assert!(repo.mark_received(id).await.unwrap());
        assert!(!repo.mark_received(id).await.unwrap());

        let stored = repo.require_message(id).await.unwrap();
        assert_eq!(stored.status(), Some(MessageStatus::Received));
        assert_eq!(stored.history().len(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_mark_received_has_one_winner() {
        let repo = InMemoryMessageRepository::new();
        let id = repo.create_message(&command("start")).await.unwrap();
        repo.update_message_status(id, MessageStatus::Published, None)
            .await
            .unwrap();

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                tokio::spawn(async move { repo.mark_received(id).await.unwrap() })
            })
            .collect();

        let mut winners = 0;
        for attempt in attempts {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        assert_eq!(repo.status_log_count().await, 3);
    }
}
