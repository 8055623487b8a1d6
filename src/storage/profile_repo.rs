use crate::domain::profile::{ProfileCard, ProfileDirectory};
use crate::error::{AppError, Result};
use crate::storage::DbPool;
use crate::storage::records::profile::ProfileRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Profile directory backed by the `profiles` table.
#[derive(Debug, Clone)]
pub struct PgProfileDirectory {
    pool: DbPool,
}

impl PgProfileDirectory {
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProfileDirectory for PgProfileDirectory {
    #[tracing::instrument(err(level = "debug"), skip(self), fields(count = ids.len()))]
    async fn lookup(&self, ids: &[Uuid]) -> Result<Vec<ProfileCard>> {
        let rows = sqlx::query_as::<_, ProfileRow>(
            r"
            SELECT id, display_name, avatar_ref
            FROM profiles
            WHERE id = ANY($1)
            ",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::read)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}
