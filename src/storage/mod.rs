use crate::domain::conversation::ConversationSummary;
use crate::domain::message::Message;
use crate::error::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

pub mod feed;
pub mod memory;
pub mod postgres;
pub mod profile_repo;
pub mod records;

pub type DbPool = Pool<Postgres>;

/// Initializes the database connection pool.
///
/// # Errors
/// Returns `sqlx::Error` if the connection fails.
pub async fn init_pool(database_url: &str) -> std::result::Result<DbPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(20).connect(database_url).await
}

/// Durable message operations plus conversation aggregation.
///
/// Implementations own no concurrency control beyond what the store itself
/// guarantees (serialized single-row writes, filtered ordered reads) and
/// never notify anyone of a write; delivery notification is the change
/// feed's job. Callers never retry automatically; a retry is always an
/// explicit user re-action.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// Durably inserts one message and returns the stored row (with its
    /// server-assigned id and timestamp).
    ///
    /// # Errors
    /// `AppError::Validation` for blank content or self-messaging, before
    /// any network call. `AppError::Write` for store failure, including a
    /// policy-layer rejection of an unauthorized recipient.
    async fn send(&self, sender_id: Uuid, recipient_id: Uuid, content: &str) -> Result<Message>;

    /// Complete snapshot of the thread between `me` and `counterpart`, both
    /// directions, ascending by `created_at`.
    async fn fetch_thread(&self, me: Uuid, counterpart: Uuid) -> Result<Vec<Message>>;

    /// Sets `read_at` on every unread message from `counterpart` to `me`.
    /// Idempotent.
    async fn mark_thread_read(&self, me: Uuid, counterpart: Uuid) -> Result<()>;

    /// Full conversation aggregation for `me`, sorted most-recent-first.
    /// Used for cold load and reconnect resync only.
    async fn fetch_conversations(&self, me: Uuid) -> Result<Vec<ConversationSummary>>;
}
