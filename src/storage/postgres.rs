use crate::domain::conversation::{self, ConversationSummary};
use crate::domain::message::{self, Message};
use crate::error::{AppError, Result};
use crate::storage::records::message::MessageRow;
use crate::storage::{DbPool, MessageStore};
use async_trait::async_trait;
use uuid::Uuid;

/// Postgres-backed message store.
///
/// The relationship check for "may sender message recipient" is enforced by
/// the database's row policy, not here; a rejected insert surfaces as a
/// generic `Write` error.
#[derive(Debug, Clone)]
pub struct PgMessageStore {
    pool: DbPool,
}

impl PgMessageStore {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    #[tracing::instrument(err(level = "warn"), skip(self, content), fields(recipient_id = %recipient_id))]
    async fn send(&self, sender_id: Uuid, recipient_id: Uuid, content: &str) -> Result<Message> {
        let content = message::validate_outgoing(sender_id, recipient_id, content)?;

        let row = sqlx::query_as::<_, MessageRow>(
            r"
            INSERT INTO messages (id, sender_id, recipient_id, content)
            VALUES ($1, $2, $3, $4)
            RETURNING id, sender_id, recipient_id, content, created_at, read_at
            ",
        )
        .bind(Uuid::now_v7())
        .bind(sender_id)
        .bind(recipient_id)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::write)?;

        tracing::debug!("Message stored");
        Ok(row.into())
    }

    #[tracing::instrument(err(level = "warn"), skip(self))]
    async fn fetch_thread(&self, me: Uuid, counterpart: Uuid) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r"
            SELECT id, sender_id, recipient_id, content, created_at, read_at
            FROM messages
            WHERE (sender_id = $1 AND recipient_id = $2)
               OR (sender_id = $2 AND recipient_id = $1)
            ORDER BY created_at ASC
            ",
        )
        .bind(me)
        .bind(counterpart)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::read)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[tracing::instrument(err(level = "warn"), skip(self))]
    async fn mark_thread_read(&self, me: Uuid, counterpart: Uuid) -> Result<()> {
        sqlx::query(
            r"
            UPDATE messages
            SET read_at = NOW()
            WHERE recipient_id = $1 AND sender_id = $2 AND read_at IS NULL
            ",
        )
        .bind(me)
        .bind(counterpart)
        .execute(&self.pool)
        .await
        .map_err(AppError::write)?;

        Ok(())
    }

    #[tracing::instrument(err(level = "warn"), skip(self))]
    async fn fetch_conversations(&self, me: Uuid) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            r"
            SELECT id, sender_id, recipient_id, content, created_at, read_at
            FROM messages
            WHERE sender_id = $1 OR recipient_id = $1
            ORDER BY created_at DESC
            ",
        )
        .bind(me)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::read)?;

        let messages: Vec<Message> = rows.into_iter().map(Into::into).collect();
        Ok(conversation::summarize(me, &messages))
    }
}
