use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{Message, MessageId, MessageStatus, OrchestrationId, RepositoryError, Result};

/// Per-status counts for the commands of one orchestration.
///
/// Every orchestration predicate is derived from these counts, so all
/// repository backends agree on what "running" or "complete" means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestrationSummary {
    pub total: u64,
    pub created: u64,
    pub terminal: u64,
    pub errored: u64,
    /// Non-fallback commands still in `Created`, `Published` or `Received`.
    pub normal_pending: u64,
    /// Fallback commands still in `Created`, `Published` or `Received`.
    pub fallback_pending: u64,
}

impl OrchestrationSummary {
    /// Accumulates counts from `(status, has_error, is_fallback)` triples.
    pub fn from_commands(commands: impl IntoIterator<Item = (MessageStatus, bool, bool)>) -> Self {
        let mut summary = Self::default();
        for (status, has_error, fallback) in commands {
            summary.total += 1;
            if status == MessageStatus::Created {
                summary.created += 1;
            }
            if status.is_terminal() {
                summary.terminal += 1;
            }
            if has_error {
                summary.errored += 1;
            }
            if status.is_pending() {
                if fallback {
                    summary.fallback_pending += 1;
                } else {
                    summary.normal_pending += 1;
                }
            }
        }
        summary
    }

    pub fn exists(&self) -> bool {
        self.total > 0
    }

    /// True strictly while work is in flight: something was dispatched and
    /// not everything is terminal.
    pub fn is_running(&self) -> bool {
        self.created != self.total && self.terminal != self.total
    }

    /// True once every normal-step command is terminal. Fallback commands do
    /// not count.
    pub fn is_complete(&self) -> bool {
        self.normal_pending == 0
    }

    pub fn has_error(&self) -> bool {
        self.errored > 0
    }
}

/// The columns of a command the claim planner looks at.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClaimCandidate {
    pub id: MessageId,
    pub status: MessageStatus,
    pub has_error: bool,
    pub step_number: Option<i32>,
    pub fallback: bool,
}

/// Chooses which commands to dispatch after `current_step`.
///
/// - any errored command: the still-`Created` fallback commands;
/// - current step still pending: nothing;
/// - otherwise: the still-`Created` commands of the lowest normal step
///   number above `current_step` (`None` means "before step 0").
pub(crate) fn plan_claim(
    candidates: &[ClaimCandidate],
    current_step: Option<i32>,
) -> Vec<MessageId> {
    if candidates.iter().any(|c| c.has_error) {
        return candidates
            .iter()
            .filter(|c| c.fallback && c.status == MessageStatus::Created)
            .map(|c| c.id)
            .collect();
    }

    let normal = candidates.iter().filter(|c| !c.fallback);

    if let Some(current) = current_step
        && normal
            .clone()
            .any(|c| c.step_number == Some(current) && c.status.is_pending())
    {
        return Vec::new();
    }

    let next_step = normal
        .clone()
        .filter_map(|c| c.step_number)
        .filter(|step| current_step.is_none_or(|current| *step > current))
        .min();

    match next_step {
        Some(next) => normal
            .filter(|c| c.step_number == Some(next) && c.status == MessageStatus::Created)
            .map(|c| c.id)
            .collect(),
        None => Vec::new(),
    }
}

/// Core trait for message persistence.
///
/// The repository is the single source of truth for message state. Every
/// status change is appended to the message's history; nothing is ever
/// overwritten or deleted. All implementations must be thread-safe.
#[async_trait]
pub trait MessageRepository: Send + Sync {
    /// Inserts a message and returns its assigned ID.
    ///
    /// The first history entry (`Created`) is written atomically with the row.
    async fn create_message(&self, message: &Message) -> Result<MessageId>;

    /// Inserts a batch of messages atomically: either all are stored or none.
    async fn create_messages(&self, messages: &[Message]) -> Result<Vec<MessageId>>;

    /// Sets the current status and, when given, the error text.
    ///
    /// A history entry is appended only when the status actually changes.
    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<()>;

    /// Moves a message from `Published` to `Received` if, and only if, it is
    /// currently `Published`.
    ///
    /// Returns false when the message is unknown or in any other status.
    /// Concurrent callers for the same message: exactly one gets true.
    async fn mark_received(&self, id: MessageId) -> Result<bool>;

    /// Loads a message together with its history (newest first).
    async fn get_message(&self, id: MessageId) -> Result<Option<Message>>;

    /// All messages of an orchestration, ordered by step with the fallback last.
    async fn get_orchestration_messages(&self, id: OrchestrationId) -> Result<Vec<Message>>;

    /// Per-status counts for the orchestration's commands.
    async fn orchestration_summary(&self, id: OrchestrationId) -> Result<OrchestrationSummary>;

    /// True iff no command of `step` is still pending.
    async fn orchestration_step_is_complete(&self, id: OrchestrationId, step: i32)
    -> Result<bool>;

    /// Returns, and claims, the commands to dispatch after `current_step`.
    ///
    /// Returned commands have already been marked `Published` within the same
    /// atomic unit that selected them, so concurrent callers can never both
    /// receive the same command. See [`plan_claim`] for the selection rules.
    async fn get_latest_unpublished_orchestration_step_commands(
        &self,
        id: OrchestrationId,
        current_step: Option<i32>,
    ) -> Result<Vec<Message>>;

    /// Marks every still-`Created` command of the orchestration `Canceled`.
    ///
    /// Returns the number of commands canceled.
    async fn mark_all_created_as_canceled(&self, id: OrchestrationId) -> Result<u64>;

    /// Messages whose latest status is `Published` and was reached before
    /// `published_before`.
    async fn find_stale_published(&self, published_before: DateTime<Utc>)
    -> Result<Vec<Message>>;
}

/// Extension trait providing the derived orchestration predicates.
#[async_trait]
pub trait MessageRepositoryExt: MessageRepository {
    /// Loads a message, failing if it does not exist.
    async fn require_message(&self, id: MessageId) -> Result<Message> {
        self.get_message(id)
            .await?
            .ok_or(RepositoryError::MessageNotFound(id))
    }

    async fn orchestration_is_running(&self, id: OrchestrationId) -> Result<bool> {
        Ok(self.orchestration_summary(id).await?.is_running())
    }

    async fn orchestration_is_complete(&self, id: OrchestrationId) -> Result<bool> {
        Ok(self.orchestration_summary(id).await?.is_complete())
    }

    async fn orchestration_has_error(&self, id: OrchestrationId) -> Result<bool> {
        Ok(self.orchestration_summary(id).await?.has_error())
    }
}

// Blanket implementation for all MessageRepository implementations
impl<T: MessageRepository + ?Sized> MessageRepositoryExt for T {}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(step: Option<i32>, status: MessageStatus) -> ClaimCandidate {
        ClaimCandidate {
            id: MessageId::new(),
            status,
            has_error: false,
            step_number: step,
            fallback: step.is_none(),
        }
    }

    #[test]
    fn summary_of_fresh_orchestration_is_not_running() {
        let summary = OrchestrationSummary::from_commands([
            (MessageStatus::Created, false, false),
            (MessageStatus::Created, false, true),
        ]);
        assert!(summary.exists());
        assert!(!summary.is_running());
        assert!(!summary.is_complete());
        assert!(!summary.has_error());
    }

    #[test]
    fn summary_ignores_fallback_for_completion() {
        let summary = OrchestrationSummary::from_commands([
            (MessageStatus::Complete, false, false),
            (MessageStatus::Created, false, true),
        ]);
        assert!(summary.is_complete());
        assert_eq!(summary.fallback_pending, 1);
        // Fallback still CREATED, so not everything is terminal yet.
        assert!(summary.is_running());
    }

    #[test]
    fn empty_summary() {
        let summary = OrchestrationSummary::default();
        assert!(!summary.exists());
        assert!(!summary.is_running());
    }

    #[test]
    fn plan_starts_at_lowest_step() {
        let first = candidate(Some(0), MessageStatus::Created);
        let second = candidate(Some(1), MessageStatus::Created);
        let fallback = candidate(None, MessageStatus::Created);
        let planned = plan_claim(&[second, fallback, first], None);
        assert_eq!(planned, vec![first.id]);
    }

    #[test]
    fn plan_waits_for_pending_step() {
        let done = candidate(Some(0), MessageStatus::Complete);
        let running = candidate(Some(0), MessageStatus::Received);
        let next = candidate(Some(1), MessageStatus::Created);
        assert!(plan_claim(&[done, running, next], Some(0)).is_empty());
    }

    #[test]
    fn plan_skips_already_claimed_step() {
        let done = candidate(Some(0), MessageStatus::Complete);
        let claimed = candidate(Some(1), MessageStatus::Published);
        let later = candidate(Some(2), MessageStatus::Created);
        assert!(plan_claim(&[done, claimed, later], Some(0)).is_empty());
    }

    #[test]
    fn plan_switches_to_fallback_on_error() {
        let mut failed = candidate(Some(0), MessageStatus::Complete);
        failed.has_error = true;
        let next = candidate(Some(1), MessageStatus::Created);
        let fallback = candidate(None, MessageStatus::Created);
        assert_eq!(plan_claim(&[failed, next, fallback], Some(0)), vec![fallback.id]);
    }

    #[test]
    fn plan_returns_nothing_after_last_step() {
        let done = candidate(Some(0), MessageStatus::Complete);
        let fallback = candidate(None, MessageStatus::Created);
        assert!(plan_claim(&[done, fallback], Some(0)).is_empty());
    }
}
