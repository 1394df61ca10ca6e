use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_core::Stream;
use serde::Deserialize;
use sqlx::{PgExecutor, PgPool, Row, postgres::PgListener, postgres::PgRow};
use uuid::Uuid;

use crate::{
    Message, MessageId, MessageStatus, OrchestrationId, OrchestrationLink, RepositoryError, Result,
    StatusEntry,
    repository::{ClaimCandidate, MessageRepository, OrchestrationSummary, plan_claim},
};

/// Channel the status trigger notifies on.
pub const STATUS_CHANNEL: &str = "message_status";

/// Message columns joined with one status log row.
const MESSAGE_WITH_LOG: &str = r#"
    SELECT m.id, m.orchestration_name, m.orchestration_id, m.orchestration_step,
           m.orchestration_step_number, m.orchestration_fallback_step,
           m.module, m.component, m.method, m.payload,
           s.status AS log_status, s.error AS log_error, s.occurred_at
    FROM message m
    JOIN message_status s ON s.message_id = m.id
"#;

/// A decoded `message_status` notification.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusChange {
    pub message_id: MessageId,
    pub orchestration_id: Option<OrchestrationId>,
    pub status: MessageStatus,
    pub error: Option<String>,
}

/// A stream of status change notifications.
pub type StatusChangeStream = Pin<Box<dyn Stream<Item = Result<StatusChange>> + Send>>;

/// PostgreSQL-backed message repository.
///
/// Status history is written by the `message_status_log` trigger, never by
/// this code, so a row and its first log entry are always inserted together.
#[derive(Clone)]
pub struct PostgresMessageRepository {
    pool: PgPool,
}

impl PostgresMessageRepository {
    /// Creates a new PostgreSQL message repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    /// Subscribes to the notifications emitted by the status trigger.
    pub async fn status_changes(&self) -> Result<StatusChangeStream> {
        use futures_util::StreamExt;

        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(STATUS_CHANNEL).await?;

        let stream = listener.into_stream().map(|result| match result {
            Ok(notification) => {
                serde_json::from_str::<StatusChange>(notification.payload()).map_err(Into::into)
            }
            Err(e) => Err(RepositoryError::Database(e)),
        });

        Ok(Box::pin(stream))
    }

    async fn insert<'e>(executor: impl PgExecutor<'e>, message: &Message) -> Result<MessageId> {
        let link = message.orchestration.as_ref();
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO message (orchestration_name, orchestration_id, orchestration_step,
                                 orchestration_step_number, orchestration_fallback_step,
                                 module, component, method, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(link.map(|l| l.orchestration_name.as_str()))
        .bind(link.map(|l| l.orchestration_id.as_uuid()))
        .bind(link.map(|l| l.step_name.as_str()))
        .bind(link.and_then(|l| l.step_number))
        .bind(link.is_some_and(|l| l.fallback))
        .bind(&message.module)
        .bind(&message.component)
        .bind(&message.method)
        .bind(&message.payload)
        .fetch_one(executor)
        .await?;

        Ok(MessageId::from_uuid(id))
    }

    async fn load_by_ids<'e>(executor: impl PgExecutor<'e>, ids: &[Uuid]) -> Result<Vec<Message>> {
        let sql = format!(
            "{MESSAGE_WITH_LOG} WHERE m.id = ANY($1) ORDER BY m.created_at ASC, m.id ASC, s.seq DESC"
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(executor).await?;
        Self::fold_rows(rows)
    }

    /// Folds joined rows (grouped by message, log rows newest first) into messages.
    fn fold_rows(rows: Vec<PgRow>) -> Result<Vec<Message>> {
        let mut messages: Vec<Message> = Vec::new();

        for row in rows {
            let id = MessageId::from_uuid(row.try_get::<Uuid, _>("id")?);
            let entry = StatusEntry {
                status: row.try_get::<String, _>("log_status")?.parse()?,
                error: row.try_get("log_error")?,
                occurred_at: row.try_get::<DateTime<Utc>, _>("occurred_at")?,
            };

            match messages.last_mut() {
                Some(last) if last.id == Some(id) => last.history.push(entry),
                _ => {
                    let mut message = Self::row_to_message(&row)?;
                    message.history.push(entry);
                    messages.push(message);
                }
            }
        }

        Ok(messages)
    }

    fn row_to_message(row: &PgRow) -> Result<Message> {
        let orchestration = match row.try_get::<Option<Uuid>, _>("orchestration_id")? {
            Some(orchestration_id) => Some(OrchestrationLink {
                orchestration_id: OrchestrationId::from_uuid(orchestration_id),
                orchestration_name: row
                    .try_get::<Option<String>, _>("orchestration_name")?
                    .unwrap_or_default(),
                step_name: row
                    .try_get::<Option<String>, _>("orchestration_step")?
                    .unwrap_or_default(),
                step_number: row.try_get("orchestration_step_number")?,
                fallback: row.try_get("orchestration_fallback_step")?,
            }),
            None => None,
        };

        Ok(Message {
            id: Some(MessageId::from_uuid(row.try_get::<Uuid, _>("id")?)),
            orchestration,
            module: row.try_get("module")?,
            component: row.try_get("component")?,
            method: row.try_get("method")?,
            payload: row.try_get("payload")?,
            history: Vec::new(),
        })
    }
}

#[async_trait]
impl MessageRepository for PostgresMessageRepository {
    async fn create_message(&self, message: &Message) -> Result<MessageId> {
        Self::insert(&self.pool, message).await
    }

    async fn create_messages(&self, messages: &[Message]) -> Result<Vec<MessageId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(messages.len());
        for message in messages {
            ids.push(Self::insert(&mut *tx, message).await?);
        }
        tx.commit().await?;
        Ok(ids)
    }

    async fn update_message_status(
        &self,
        id: MessageId,
        status: MessageStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE message
            SET status = $2, error = COALESCE($3, error)
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::MessageNotFound(id));
        }
        Ok(())
    }

    async fn mark_received(&self, id: MessageId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE message
            SET status = 'RECEIVED'
            WHERE id = $1 AND status = 'PUBLISHED'
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_message(&self, id: MessageId) -> Result<Option<Message>> {
        let messages = Self::load_by_ids(&self.pool, &[id.as_uuid()]).await?;
        Ok(messages.into_iter().next())
    }

    async fn get_orchestration_messages(&self, id: OrchestrationId) -> Result<Vec<Message>> {
        let sql = format!(
            r#"{MESSAGE_WITH_LOG}
            WHERE m.orchestration_id = $1
            ORDER BY m.orchestration_fallback_step ASC,
                     m.orchestration_step_number ASC NULLS LAST,
                     m.created_at ASC, m.id ASC, s.seq DESC"#
        );
        let rows = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        Self::fold_rows(rows)
    }

    async fn orchestration_summary(&self, id: OrchestrationId) -> Result<OrchestrationSummary> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total,
                   COUNT(*) FILTER (WHERE status = 'CREATED') AS created,
                   COUNT(*) FILTER (WHERE status IN ('COMPLETE', 'CANCELED')) AS terminal,
                   COUNT(*) FILTER (WHERE error IS NOT NULL) AS errored,
                   COUNT(*) FILTER (
                       WHERE NOT orchestration_fallback_step
                         AND status IN ('CREATED', 'PUBLISHED', 'RECEIVED')
                   ) AS normal_pending,
                   COUNT(*) FILTER (
                       WHERE orchestration_fallback_step
                         AND status IN ('CREATED', 'PUBLISHED', 'RECEIVED')
                   ) AS fallback_pending
            FROM message
            WHERE orchestration_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_one(&self.pool)
        .await?;

        Ok(OrchestrationSummary {
            total: row.try_get::<i64, _>("total")? as u64,
            created: row.try_get::<i64, _>("created")? as u64,
            terminal: row.try_get::<i64, _>("terminal")? as u64,
            errored: row.try_get::<i64, _>("errored")? as u64,
            normal_pending: row.try_get::<i64, _>("normal_pending")? as u64,
            fallback_pending: row.try_get::<i64, _>("fallback_pending")? as u64,
        })
    }

    async fn orchestration_step_is_complete(
        &self,
        id: OrchestrationId,
        step: i32,
    ) -> Result<bool> {
        let complete: bool = sqlx::query_scalar(
            r#"
            SELECT NOT EXISTS (
                SELECT 1 FROM message
                WHERE orchestration_id = $1
                  AND NOT orchestration_fallback_step
                  AND orchestration_step_number = $2
                  AND status IN ('CREATED', 'PUBLISHED', 'RECEIVED')
            )
            "#,
        )
        .bind(id.as_uuid())
        .bind(step)
        .fetch_one(&self.pool)
        .await?;

        Ok(complete)
    }

    #[tracing::instrument(skip(self))]
    async fn get_latest_unpublished_orchestration_step_commands(
        &self,
        id: OrchestrationId,
        current_step: Option<i32>,
    ) -> Result<Vec<Message>> {
        let mut tx = self.pool.begin().await?;

        // Serializes check-and-claim per orchestration until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            r#"
            SELECT id, status, error IS NOT NULL AS has_error,
                   orchestration_step_number, orchestration_fallback_step
            FROM message
            WHERE orchestration_id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_all(&mut *tx)
        .await?;

        let candidates = rows
            .iter()
            .map(|row| -> Result<ClaimCandidate> {
                Ok(ClaimCandidate {
                    id: MessageId::from_uuid(row.try_get::<Uuid, _>("id")?),
                    status: row.try_get::<String, _>("status")?.parse()?,
                    has_error: row.try_get("has_error")?,
                    step_number: row.try_get("orchestration_step_number")?,
                    fallback: row.try_get("orchestration_fallback_step")?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let ids: Vec<Uuid> = plan_claim(&candidates, current_step)
            .into_iter()
            .map(|id| id.as_uuid())
            .collect();

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        sqlx::query(
            "UPDATE message SET status = 'PUBLISHED' WHERE id = ANY($1) AND status = 'CREATED'",
        )
        .bind(&ids)
        .execute(&mut *tx)
        .await?;

        let claimed = Self::load_by_ids(&mut *tx, &ids).await?;
        tx.commit().await?;

        tracing::debug!(claimed = claimed.len(), ?current_step, "claimed orchestration commands");
        Ok(claimed)
    }

    async fn mark_all_created_as_canceled(&self, id: OrchestrationId) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE message SET status = 'CANCELED' WHERE orchestration_id = $1 AND status = 'CREATED'",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find_stale_published(
        &self,
        published_before: DateTime<Utc>,
    ) -> Result<Vec<Message>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT m.id
            FROM message m
            WHERE m.status = 'PUBLISHED'
              AND (SELECT MAX(s.occurred_at) FROM message_status s WHERE s.message_id = m.id) < $1
            "#,
        )
        .bind(published_before)
        .fetch_all(&self.pool)
        .await?;

        if ids.is_empty() {
            return Ok(Vec::new());
        }
        Self::load_by_ids(&self.pool, &ids).await
    }
}
